// gatewally/src/webhooks.rs
//
// Webhook dispatcher — HMAC-signed, retrying, at-least-once.
//
// Each matching subscription gets its own delivery task, so a slow or dead
// receiver never delays another. A delivery attempt POSTs the exact JSON
// body that was signed; receivers verify X-Webhook-Signature =
// hex(HMAC-SHA256(secret, body)) and must be idempotent — retries redeliver
// the same payload, and the embedded timestamp supports replay-window
// checks on the receiving side.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::config::WebhooksConfig;
use crate::store::Store;
use crate::types::WebhookSubscription;

type HmacSha256 = Hmac<Sha256>;

/// Field order is the wire order — the signature covers this exact shape.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event:     String,
    pub timestamp: f64,
    pub data:      serde_json::Value,
}

pub struct WebhookDispatcher {
    store:       Arc<dyn Store>,
    client:      reqwest::Client,
    enabled:     bool,
    timeout:     Duration,
    max_retries: u32,
    retry_delay: f64,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhooksConfig, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            client:      reqwest::Client::new(),
            enabled:     config.enabled,
            timeout:     Duration::from_secs(config.timeout),
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay,
        }
    }

    /// Fan an event out to every active subscription that wants it. Each
    /// delivery runs on its own task; this call returns once they are
    /// spawned.
    pub async fn trigger(&self, event: &str, data: serde_json::Value) {
        if !self.enabled {
            return;
        }

        let subscriptions = match self.store.active_webhooks_for_event(event).await {
            Ok(subs) => subs,
            Err(e) => {
                error!("Webhook lookup failed for {event}: {e}");
                return;
            }
        };

        let timestamp = data
            .get("timestamp")
            .and_then(|v| v.as_f64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp() as f64);
        let payload = WebhookPayload {
            event:     event.to_string(),
            timestamp,
            data,
        };

        for subscription in subscriptions {
            let client      = self.client.clone();
            let payload     = payload.clone();
            let timeout     = self.timeout;
            let max_retries = self.max_retries;
            let retry_delay = self.retry_delay;
            tokio::spawn(async move {
                deliver(client, subscription, payload, timeout, max_retries, retry_delay).await;
            });
        }
    }
}

async fn deliver(
    client: reqwest::Client,
    subscription: WebhookSubscription,
    payload: WebhookPayload,
    timeout: Duration,
    max_retries: u32,
    retry_delay: f64,
) {
    let body = match serde_json::to_string(&payload) {
        Ok(b) => b,
        Err(e) => {
            error!("Webhook payload serialize failed: {e}");
            return;
        }
    };
    let signature = sign(&subscription.secret, &body);

    for attempt in 0..max_retries {
        let sent = client
            .post(&subscription.url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", &signature)
            .header("X-Webhook-Event", &payload.event)
            .body(body.clone())
            .send()
            .await;

        match sent {
            Ok(resp) if resp.status().is_success() => {
                info!("Webhook delivered: {} (event: {})", subscription.url, payload.event);
                return;
            }
            Ok(resp) => warn!(
                "Webhook delivery failed (attempt {}/{max_retries}): {} returned {}",
                attempt + 1,
                subscription.url,
                resp.status()
            ),
            Err(e) => warn!(
                "Webhook delivery failed (attempt {}/{max_retries}): {e}",
                attempt + 1
            ),
        }

        if attempt + 1 < max_retries {
            let backoff = retry_delay * 2f64.powi(attempt as i32);
            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
        }
    }

    error!(
        "Webhook delivery failed after {max_retries} attempts: {}",
        subscription.url
    );
}

/// hex(HMAC-SHA256(secret, payload)) — deterministic for a fixed pair.
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Receiver-side check, constant time over the hex strings.
pub fn verify_signature(secret: &str, payload: &str, signature: &str) -> bool {
    let expected = sign(secret, payload);
    let (a, b) = (expected.as_bytes(), signature.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_are_deterministic_and_verifiable() {
        let payload = r#"{"event":"request.completed","timestamp":1700000000.0,"data":{}}"#;
        let first  = sign("s3cret", payload);
        let second = sign("s3cret", payload);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64); // hex SHA-256

        assert!(verify_signature("s3cret", payload, &first));
        assert!(!verify_signature("other", payload, &first));
        assert!(!verify_signature("s3cret", payload, "deadbeef"));
    }

    #[test]
    fn payload_serializes_in_wire_order() {
        let payload = WebhookPayload {
            event:     "request.completed".to_string(),
            timestamp: 1700000000.0,
            data:      serde_json::json!({ "cost": 0.01 }),
        };
        let body = serde_json::to_string(&payload).unwrap();
        assert!(body.starts_with(r#"{"event":"request.completed","timestamp":"#));
    }
}
