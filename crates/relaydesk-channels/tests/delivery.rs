use relaydesk_channels::{
    ChannelAdapter, MessengerAdapter, RetryPolicy, SendOptions, TelegramAdapter, WhatsAppAdapter,
    send_with_retry,
};
use relaydesk_common::{Error, NormalizedMessage, ChannelType};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn whatsapp_send_posts_to_graph_and_returns_wamid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1055/messages"))
        .and(header("authorization", "Bearer wa-token"))
        .and(body_partial_json(json!({
            "messaging_product": "whatsapp",
            "to": "5511999",
            "type": "text",
            "text": {"body": "Olá!"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messaging_product": "whatsapp",
            "messages": [{"id": "wamid.OUT"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter =
        WhatsAppAdapter::new("wa-token".into(), "1055".into()).with_api_base(&server.uri());
    let result = adapter
        .send("5511999", "Olá!", &SendOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.provider_message_id.as_deref(), Some("wamid.OUT"));
}

#[tokio::test]
async fn whatsapp_acknowledge_marks_message_read() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1055/messages"))
        .and(body_partial_json(json!({"status": "read", "message_id": "wamid.IN"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let adapter =
        WhatsAppAdapter::new("wa-token".into(), "1055".into()).with_api_base(&server.uri());
    let inbound = NormalizedMessage::text(ChannelType::WhatsApp, "5511999", "hi")
        .with_native_id("wamid.IN")
        .with_recipient_account("1055");
    adapter.acknowledge(&inbound).await.unwrap();
}

#[tokio::test]
async fn client_errors_are_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "Invalid parameter", "code": 100}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = WhatsAppAdapter::new("t".into(), "1055".into()).with_api_base(&server.uri());
    let err = send_with_retry(&adapter, "5511999", "x", &SendOptions::default(), &fast_retries(3))
        .await
        .unwrap_err();

    match err {
        Error::Delivery {
            channel,
            detail,
            transient,
        } => {
            assert_eq!(channel, "whatsapp");
            assert!(detail.contains("Invalid parameter"));
            assert!(!transient);
        }
        other => panic!("expected delivery error, got {other:?}"),
    }
}

#[tokio::test]
async fn telegram_rate_limit_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bot1:abc/sendMessage"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false, "error_code": 429, "description": "Too Many Requests"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bot1:abc/sendMessage"))
        .and(body_partial_json(json!({"chat_id": "4242", "text": "hello"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true, "result": {"message_id": 991}
        })))
        .mount(&server)
        .await;

    let adapter = TelegramAdapter::new("1:abc".into()).with_api_base(&server.uri());
    let options = SendOptions::default();
    let result = send_with_retry(&adapter, "4242", "hello", &options, &fast_retries(2))
        .await
        .unwrap();
    assert_eq!(result.provider_message_id.as_deref(), Some("991"));
}

#[tokio::test]
async fn server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/messages"))
        .and(query_param("access_token", "page-token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let adapter = MessengerAdapter::new("page-token".into()).with_api_base(&server.uri());
    let err = send_with_retry(&adapter, "PSID9", "hi", &SendOptions::default(), &fast_retries(2))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}
