mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use relaydesk_gateway::router::build_router;
use relaydesk_security::hub_signature;
use tower::ServiceExt;

use common::{APP_SECRET, Harness, whatsapp_payload};

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn subscription_challenge_is_echoed() {
    let harness = Harness::new();
    let app = build_router(harness.state.clone());

    let response = app
        .oneshot(
            Request::get(concat!(
                "/webhooks/whatsapp?hub.mode=subscribe",
                "&hub.verify_token=verify-me&hub.challenge=1158201444",
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "1158201444");
}

#[tokio::test]
async fn wrong_verify_token_is_forbidden_and_audited() {
    let harness = Harness::new();
    let app = build_router(harness.state.clone());

    let response = app
        .oneshot(
            Request::get(concat!(
                "/webhooks/whatsapp?hub.mode=subscribe",
                "&hub.verify_token=nope&hub.challenge=1",
            ))
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let audit = harness.state.router.shared().list_audit(10).unwrap();
    assert_eq!(audit[0].action, "webhook_verification_failed");
    assert_eq!(audit[0].ip_address.as_deref(), Some("198.51.100.4"));
}

#[tokio::test]
async fn unconfigured_channel_is_not_found() {
    let harness = Harness::new();
    let app = build_router(harness.state.clone());

    for uri in ["/webhooks/telegram", "/webhooks/sms"] {
        let response = app
            .clone()
            .oneshot(
                Request::post(uri)
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn bad_signature_is_rejected_before_processing() {
    let harness = Harness::new();
    let app = build_router(harness.state.clone());
    let body = whatsapp_payload("15550001", "hello", "wamid.1").to_string();

    let response = app
        .oneshot(
            Request::post("/webhooks/whatsapp")
                .header("content-type", "application/json")
                .header("x-hub-signature-256", hub_signature("wrong-secret", body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let shared = harness.state.router.shared();
    let alerts = shared.list_alerts(true, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "webhook_verification_failed");
    assert_eq!(shared.count_routes().unwrap(), 0);
}

#[tokio::test]
async fn invalid_json_with_valid_signature_is_acknowledged() {
    let harness = Harness::new();
    let app = build_router(harness.state.clone());
    let body = "not json at all";

    let response = app
        .oneshot(
            Request::post("/webhooks/whatsapp")
                .header("x-hub-signature-256", hub_signature(APP_SECRET, body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(harness.state.router.shared().list_alerts(false, 10).unwrap().is_empty());
}

#[tokio::test]
async fn signed_delivery_is_processed_in_background() {
    let harness = Harness::new();
    let app = build_router(harness.state.clone());
    let body = whatsapp_payload("15550001", "where is my order?", "wamid.42").to_string();

    let response = app
        .oneshot(
            Request::post("/webhooks/whatsapp")
                .header("x-hub-signature-256", hub_signature(APP_SECRET, body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut replies = Vec::new();
    for _ in 0..50 {
        replies = harness.adapter.sent_to("15550001");
        if !replies.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(replies, vec!["Happy to help!".to_string()]);
}
