// gatewally/src/audit.rs
//
// Fire-and-forget audit persistence.
//
// The writer owns its storage handle; the request path spawns these calls
// and never awaits them. Failures are swallowed and logged — an audit
// outage must not change a user-visible result.
//
// Guardrail rows can land before their request row exists (blocking
// violations are persisted immediately, the request row arrives later).
// After the request row is written, rows for the same principal with a
// null request_id from the last 60 seconds are back-filled with the id.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use crate::store::Store;
use crate::types::{GuardrailRecord, RequestRecord, Violation};

/// Back-fill window: how far back a null-request_id guardrail row can be
/// claimed by a freshly written request row.
const BACKFILL_WINDOW_SECS: i64 = 60;

pub struct AuditWriter {
    store: Arc<dyn Store>,
}

impl AuditWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persist one request row, then claim this principal's recent orphan
    /// guardrail rows. Returns the request id on success.
    pub async fn log_request(&self, record: RequestRecord) -> Option<Uuid> {
        let request_id     = record.id;
        let principal_id   = record.principal_id;
        let had_violations = !record.guardrail_violations.is_empty();

        if let Err(e) = self.store.insert_request_log(record).await {
            error!("Audit write failed: {e}");
            return None;
        }

        if had_violations {
            let since = Utc::now() - Duration::seconds(BACKFILL_WINDOW_SECS);
            match self
                .store
                .backfill_guardrail_request_ids(principal_id, request_id, since)
                .await
            {
                Ok(n) if n > 0 => debug!("Back-filled {n} guardrail rows for {request_id}"),
                Ok(_)  => {}
                Err(e) => error!("Guardrail back-fill failed: {e}"),
            }
        }

        Some(request_id)
    }

    /// Persist guardrail violations, optionally already bound to a request.
    pub async fn log_violations(
        &self,
        principal_id: Uuid,
        violations: &[Violation],
        request_id: Option<Uuid>,
    ) {
        if violations.is_empty() {
            return;
        }

        let now = Utc::now();
        let records: Vec<GuardrailRecord> = violations
            .iter()
            .map(|v| GuardrailRecord {
                id: Uuid::new_v4(),
                principal_id,
                request_id,
                rule_name: v.rule_name.clone(),
                severity:  v.severity,
                action:    v.action,
                details:   serde_json::json!({
                    "message": v.message,
                    "details": v.details,
                }),
                timestamp: now,
            })
            .collect();

        if let Err(e) = self.store.insert_guardrail_logs(records).await {
            error!("Guardrail write failed: {e}");
        }
    }
}
