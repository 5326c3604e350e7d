mod common;

use relaydesk_common::SenderRole;
use relaydesk_db::Severity;
use relaydesk_gateway::ingest::{IngestOutcome, process, process_batch};
use serde_json::Value;
use tokio::sync::mpsc;

use common::{Harness, ScriptedProvider, drain, inbound, inbound_to};

#[tokio::test]
async fn inbound_message_is_answered_and_delivered() {
    let harness = Harness::new();

    let message = inbound("15550001", "where is my order?", "wamid.1");
    let outcome = process(&harness.state, message).await;
    assert_eq!(outcome, IngestOutcome::Replied { delivered: true });
    assert_eq!(harness.adapter.sent_to("15550001"), vec!["Happy to help!"]);

    let db = harness.state.router.route(harness.tenant.id).unwrap();
    let conversations = db.list_conversations(None, 10).unwrap();
    assert_eq!(conversations.len(), 1);
    let messages = db.list_messages(conversations[0].id, 10).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender, SenderRole::Customer);
    assert_eq!(messages[1].sender, SenderRole::Agent);
    assert!(messages[1].response_time_ms.is_some());
}

#[tokio::test]
async fn redelivered_webhook_is_stored_once() {
    let harness = Harness::new();

    let first = process(&harness.state, inbound("15550001", "hi", "wamid.dup")).await;
    let second = process(&harness.state, inbound("15550001", "hi", "wamid.dup")).await;
    assert_eq!(first, IngestOutcome::Replied { delivered: true });
    assert_eq!(second, IngestOutcome::Duplicate);

    let db = harness.state.router.route(harness.tenant.id).unwrap();
    let conversation = &db.list_conversations(None, 10).unwrap()[0];
    let messages = db.list_messages(conversation.id, 10).unwrap();
    let customer: Vec<_> = messages.iter().filter(|m| m.sender == SenderRole::Customer).collect();
    assert_eq!(customer.len(), 1);
    assert_eq!(harness.adapter.sent_to("15550001").len(), 1);
}

#[tokio::test]
async fn delivery_failure_does_not_affect_other_messages() {
    let harness = Harness::new();
    harness.adapter.fail_for("15550002");

    let outcomes = process_batch(
        harness.state.clone(),
        vec![
            inbound("15550001", "first", "wamid.a"),
            inbound("15550002", "second", "wamid.b"),
            inbound("15550003", "third", "wamid.c"),
        ],
    )
    .await;

    assert_eq!(outcomes[0], IngestOutcome::Replied { delivered: true });
    assert_eq!(outcomes[1], IngestOutcome::Replied { delivered: false });
    assert_eq!(outcomes[2], IngestOutcome::Replied { delivered: true });
    assert_eq!(harness.adapter.sent_to("15550001").len(), 1);
    assert_eq!(harness.adapter.sent_to("15550003").len(), 1);

    // The failed reply is still stored.
    let db = harness.state.router.route(harness.tenant.id).unwrap();
    assert_eq!(db.list_conversations(None, 10).unwrap().len(), 3);
}

#[tokio::test]
async fn one_tenants_delivery_failure_leaves_another_tenant_untouched() {
    let harness = Harness::new();
    let hub = &harness.state.hub;
    let (other, _) = harness.add_tenant("other@example.com", "2066");

    let hello = inbound_to("2066", "15560001", "hello", "wamid.b1");
    let first = process(&harness.state, hello).await;
    assert_eq!(first, IngestOutcome::Replied { delivered: true });
    let other_db = harness.state.router.route(other.id).unwrap();
    let conversation = other_db.list_conversations(None, 10).unwrap()[0].id;

    let (tx, mut other_rx) = mpsc::channel(32);
    let other_conn = hub.register(tx);
    hub.bind_tenant(&other_conn, other.id);
    assert!(hub.join(&other_conn, conversation));
    let (tx, mut shop_rx) = mpsc::channel(32);
    let shop_conn = hub.register(tx);
    hub.bind_tenant(&shop_conn, harness.tenant.id);

    harness.adapter.fail_for("15550002");
    let outcomes = process_batch(
        harness.state.clone(),
        vec![
            inbound("15550002", "are you there?", "wamid.a1"),
            inbound_to("2066", "15560001", "one more thing", "wamid.b2"),
        ],
    )
    .await;
    assert_eq!(
        outcomes,
        vec![
            IngestOutcome::Replied { delivered: false },
            IngestOutcome::Replied { delivered: true },
        ]
    );

    let stored = other_db.list_messages(conversation, 10).unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[2].content, "one more thing");
    assert_eq!(harness.adapter.sent_to("15560001").len(), 2);

    let frames = drain(&mut other_rx);
    let new_messages: Vec<&Value> = frames
        .iter()
        .filter(|f| f["event"] == "new_message")
        .collect();
    assert_eq!(new_messages.len(), 2);
    assert_eq!(new_messages[0]["data"]["message"]["content"], "one more thing");
    assert_eq!(new_messages[1]["data"]["message"]["sender"], "agent");
    assert!(frames.iter().all(|f| f["event"] != "notification"));

    // The failing tenant still stored its reply and saw only its own activity.
    let shop_db = harness.state.router.route(harness.tenant.id).unwrap();
    let shop_conversation = shop_db.list_conversations(None, 10).unwrap()[0].id;
    assert_eq!(shop_db.list_messages(shop_conversation, 10).unwrap().len(), 2);
    let shop_frames = drain(&mut shop_rx);
    assert_eq!(shop_frames.len(), 2);
    assert!(shop_frames.iter().all(|f| f["event"] == "conversation_updated"));
    assert!(
        shop_frames
            .iter()
            .all(|f| f["data"]["changes"]["last_message"] != "one more thing")
    );
}

#[tokio::test]
async fn three_delivery_failures_raise_exactly_one_alert() {
    let harness = Harness::new();
    harness.adapter.fail_for("15550009");

    for i in 0..4 {
        let message = inbound("15550009", "ping", &format!("wamid.f{i}"));
        let outcome = process(&harness.state, message).await;
        assert_eq!(outcome, IngestOutcome::Replied { delivered: false });
    }

    let alerts = harness.state.router.shared().list_alerts(false, 10).unwrap();
    let delivery: Vec<_> = alerts
        .iter()
        .filter(|a| a.alert_type == "delivery_failure")
        .collect();
    assert_eq!(delivery.len(), 1);
    assert_eq!(delivery[0].severity, Severity::Error);
}

#[tokio::test]
async fn generation_failure_without_fallback_stays_silent() {
    let harness = Harness::with_provider(ScriptedProvider::failing());

    let outcome = process(&harness.state, inbound("15550001", "hello?", "wamid.g1")).await;
    assert_eq!(outcome, IngestOutcome::Stored);
    assert!(harness.adapter.sent_to("15550001").is_empty());

    let alerts = harness.state.router.shared().list_alerts(false, 10).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "generation_failure");
    assert_eq!(alerts[0].severity, Severity::Warning);
}

#[tokio::test]
async fn unknown_recipient_account_is_dropped() {
    let harness = Harness::new();
    let message = relaydesk_common::NormalizedMessage::text(
        relaydesk_common::ChannelType::WhatsApp,
        "15550001",
        "hi",
    )
    .with_native_id("wamid.x")
    .with_recipient_account("9999");

    assert_eq!(process(&harness.state, message).await, IngestOutcome::Dropped);
    assert_eq!(harness.state.router.shared().count_routes().unwrap(), 0);
}
