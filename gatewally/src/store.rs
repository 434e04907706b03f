// gatewally/src/store.rs
//
// Storage seam — exactly the persistence operations the pipeline invokes.
//
// The schema itself (users, api_keys, request_logs, budgets, webhooks,
// guardrail_logs) lives outside the core; the core talks to it through this
// trait. Fire-and-forget writers (audit, budget tracking, webhook lookup)
// each hold their own Arc handle, so a background failure can never poison
// the request path.
//
// MemoryStore is the in-process implementation: it backs the CLI feed modes
// and the test suite, and is the reference for what a SQL-backed
// implementation must do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::errors::{GatewayError, Result};
use crate::types::{
    ApiKeyRecord, BudgetRecord, GuardrailRecord, RequestRecord, WebhookSubscription,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// All active credentials — the authenticator bcrypt-scans these.
    async fn active_api_keys(&self) -> Result<Vec<ApiKeyRecord>>;

    async fn get_budget(&self, principal_id: Uuid) -> Result<Option<BudgetRecord>>;

    /// Insert or replace a principal's budget row (unique per principal).
    async fn put_budget(&self, budget: BudgetRecord) -> Result<()>;

    /// Add realised cost to the principal's current spend. Returns the
    /// updated row; the budget must already exist.
    async fn add_spend(&self, principal_id: Uuid, amount: f64) -> Result<BudgetRecord>;

    /// Append-only request log.
    async fn insert_request_log(&self, record: RequestRecord) -> Result<()>;

    async fn insert_guardrail_logs(&self, records: Vec<GuardrailRecord>) -> Result<()>;

    /// Set `request_id` on this principal's guardrail rows that have none
    /// and were written at or after `since`. Returns rows touched.
    async fn backfill_guardrail_request_ids(
        &self,
        principal_id: Uuid,
        request_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Active subscriptions whose event set contains `event`.
    async fn active_webhooks_for_event(&self, event: &str) -> Result<Vec<WebhookSubscription>>;
}

// ── In-memory implementation ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    api_keys:       RwLock<Vec<ApiKeyRecord>>,
    budgets:        DashMap<Uuid, BudgetRecord>,
    request_logs:   RwLock<Vec<RequestRecord>>,
    guardrail_logs: RwLock<Vec<GuardrailRecord>>,
    webhooks:       RwLock<Vec<WebhookSubscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Provisioning — the admin surface calls these; tests and the CLI seed
    // through them as well.

    pub fn add_api_key(&self, record: ApiKeyRecord) {
        self.api_keys.write().push(record);
    }

    pub fn add_webhook(&self, subscription: WebhookSubscription) {
        self.webhooks.write().push(subscription);
    }

    pub fn remove_webhook(&self, id: Uuid) -> bool {
        let mut hooks = self.webhooks.write();
        let before = hooks.len();
        hooks.retain(|w| w.id != id);
        hooks.len() != before
    }

    // Snapshots — used by the stats loop and assertions.

    pub fn request_logs(&self) -> Vec<RequestRecord> {
        self.request_logs.read().clone()
    }

    pub fn guardrail_logs(&self) -> Vec<GuardrailRecord> {
        self.guardrail_logs.read().clone()
    }

    pub fn n_request_logs(&self) -> usize {
        self.request_logs.read().len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn active_api_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        Ok(self.api_keys.read().iter().filter(|k| k.active).cloned().collect())
    }

    async fn get_budget(&self, principal_id: Uuid) -> Result<Option<BudgetRecord>> {
        Ok(self.budgets.get(&principal_id).map(|b| b.clone()))
    }

    async fn put_budget(&self, budget: BudgetRecord) -> Result<()> {
        self.budgets.insert(budget.principal_id, budget);
        Ok(())
    }

    async fn add_spend(&self, principal_id: Uuid, amount: f64) -> Result<BudgetRecord> {
        let mut entry = self
            .budgets
            .get_mut(&principal_id)
            .ok_or_else(|| GatewayError::Storage(format!("no budget for {principal_id}")))?;
        entry.current_spend_usd += amount;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn insert_request_log(&self, record: RequestRecord) -> Result<()> {
        self.request_logs.write().push(record);
        Ok(())
    }

    async fn insert_guardrail_logs(&self, records: Vec<GuardrailRecord>) -> Result<()> {
        self.guardrail_logs.write().extend(records);
        Ok(())
    }

    async fn backfill_guardrail_request_ids(
        &self,
        principal_id: Uuid,
        request_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let mut touched = 0;
        for row in self.guardrail_logs.write().iter_mut() {
            if row.principal_id == principal_id
                && row.request_id.is_none()
                && row.timestamp >= since
            {
                row.request_id = Some(request_id);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn active_webhooks_for_event(&self, event: &str) -> Result<Vec<WebhookSubscription>> {
        Ok(self
            .webhooks
            .read()
            .iter()
            .filter(|w| w.active && w.events.iter().any(|e| e == event))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BudgetPeriod, RuleAction, Severity};
    use chrono::Duration;

    fn guardrail_row(principal: Uuid, ts: DateTime<Utc>) -> GuardrailRecord {
        GuardrailRecord {
            id:           Uuid::new_v4(),
            principal_id: principal,
            request_id:   None,
            rule_name:    "no-pii".to_string(),
            severity:     Severity::Error,
            action:       RuleAction::Block,
            details:      serde_json::json!({}),
            timestamp:    ts,
        }
    }

    #[tokio::test]
    async fn backfill_only_touches_recent_null_rows() {
        let store = MemoryStore::new();
        let principal = Uuid::new_v4();
        let other     = Uuid::new_v4();
        let now       = Utc::now();

        store
            .insert_guardrail_logs(vec![
                guardrail_row(principal, now),
                guardrail_row(principal, now - Duration::seconds(120)), // stale
                guardrail_row(other, now),                              // other principal
            ])
            .await
            .unwrap();

        let request_id = Uuid::new_v4();
        let touched = store
            .backfill_guardrail_request_ids(principal, request_id, now - Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let rows = store.guardrail_logs();
        assert_eq!(
            rows.iter().filter(|r| r.request_id == Some(request_id)).count(),
            1
        );
    }

    #[tokio::test]
    async fn add_spend_requires_existing_budget() {
        let store = MemoryStore::new();
        let principal = Uuid::new_v4();
        assert!(store.add_spend(principal, 0.5).await.is_err());

        store
            .put_budget(BudgetRecord {
                principal_id:      principal,
                limit_usd:         10.0,
                period:            BudgetPeriod::Monthly,
                current_spend_usd: 1.0,
                reset_at:          Utc::now() + Duration::days(10),
                updated_at:        Utc::now(),
            })
            .await
            .unwrap();

        let updated = store.add_spend(principal, 0.5).await.unwrap();
        assert!((updated.current_spend_usd - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn webhook_lookup_filters_event_and_active() {
        let store = MemoryStore::new();
        let make = |events: Vec<&str>, active| WebhookSubscription {
            id:           Uuid::new_v4(),
            principal_id: Uuid::new_v4(),
            url:          "http://localhost/hook".to_string(),
            events:       events.into_iter().map(String::from).collect(),
            secret:       "s3cret".to_string(),
            active,
            created_at:   Utc::now(),
        };
        store.add_webhook(make(vec!["request.completed"], true));
        store.add_webhook(make(vec!["request.failed"], true));
        store.add_webhook(make(vec!["request.completed"], false));

        let hooks = store.active_webhooks_for_event("request.completed").await.unwrap();
        assert_eq!(hooks.len(), 1);
    }
}
