// gatewally/tests/webhooks.rs
//
// Webhook delivery against a real HTTP listener: signature over the exact
// body, event headers, retry-with-backoff, and event filtering.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gatewally::config::WebhooksConfig;
use gatewally::store::MemoryStore;
use gatewally::types::WebhookSubscription;
use gatewally::webhooks::{sign, WebhookDispatcher, WebhookPayload};

fn subscription(url: String, events: Vec<&str>, secret: &str) -> WebhookSubscription {
    WebhookSubscription {
        id:           Uuid::new_v4(),
        principal_id: Uuid::new_v4(),
        url,
        events:       events.into_iter().map(String::from).collect(),
        secret:       secret.to_string(),
        active:       true,
        created_at:   Utc::now(),
    }
}

fn dispatcher(store: Arc<MemoryStore>, max_retries: u32) -> WebhookDispatcher {
    WebhookDispatcher::new(
        &WebhooksConfig {
            enabled: true,
            timeout: 2,
            max_retries,
            retry_delay: 0.05,
        },
        store,
    )
}

#[tokio::test]
async fn delivers_the_signed_body_with_event_headers() {
    let server = MockServer::start().await;
    let store  = Arc::new(MemoryStore::new());
    store.add_webhook(subscription(
        format!("{}/hook", server.uri()),
        vec!["request.completed"],
        "s3cret",
    ));

    // The dispatcher signs exactly what it sends; reconstruct the body the
    // same way and pin both it and the signature in the matcher.
    let data = serde_json::json!({
        "timestamp": 1700000000.0,
        "user_id": "u1",
    });
    let expected_body = serde_json::to_string(&WebhookPayload {
        event:     "request.completed".to_string(),
        timestamp: 1700000000.0,
        data:      data.clone(),
    })
    .unwrap();
    let expected_signature = sign("s3cret", &expected_body);

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("X-Webhook-Event", "request.completed"))
        .and(header("X-Webhook-Signature", expected_signature.as_str()))
        .and(header("Content-Type", "application/json"))
        .and(body_string(expected_body))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    dispatcher(store, 1).trigger("request.completed", data).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.verify().await;
}

#[tokio::test]
async fn non_2xx_responses_are_retried_with_backoff() {
    let server = MockServer::start().await;
    let store  = Arc::new(MemoryStore::new());
    store.add_webhook(subscription(
        format!("{}/hook", server.uri()),
        vec!["request.failed"],
        "s3cret",
    ));

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    dispatcher(store, 3)
        .trigger("request.failed", serde_json::json!({ "timestamp": 1.0 }))
        .await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    server.verify().await;
}

#[tokio::test]
async fn subscriptions_only_see_their_events() {
    let server = MockServer::start().await;
    let store  = Arc::new(MemoryStore::new());
    store.add_webhook(subscription(
        format!("{}/completed", server.uri()),
        vec!["request.completed"],
        "a",
    ));
    store.add_webhook(subscription(
        format!("{}/failed", server.uri()),
        vec!["request.failed"],
        "b",
    ));

    Mock::given(method("POST"))
        .and(path("/completed"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/failed"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    dispatcher(store, 1)
        .trigger("request.completed", serde_json::json!({ "timestamp": 2.0 }))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.verify().await;
}

#[tokio::test]
async fn failing_receiver_does_not_starve_the_healthy_one() {
    let server = MockServer::start().await;
    let store  = Arc::new(MemoryStore::new());
    store.add_webhook(subscription(
        format!("{}/dead", server.uri()),
        vec!["request.completed"],
        "a",
    ));
    store.add_webhook(subscription(
        format!("{}/alive", server.uri()),
        vec!["request.completed"],
        "b",
    ));

    Mock::given(method("POST"))
        .and(path("/dead"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/alive"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    dispatcher(store, 2)
        .trigger("request.completed", serde_json::json!({ "timestamp": 3.0 }))
        .await;
    tokio::time::sleep(Duration::from_millis(900)).await;
    server.verify().await;
}
