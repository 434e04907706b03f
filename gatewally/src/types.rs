// gatewally/src/types.rs
//
// Shared domain types flowing through Gatewally.
// Everything the pipeline passes between gates lives here: chat payloads,
// PII entities, guardrail verdicts, completion envelopes, and the records
// handed to the storage seam.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Chat payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role:    String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// One gateway request as seen by the pipeline — the HTTP layer has already
/// validated the schema by the time this exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages:       Vec<ChatMessage>,
    #[serde(default)]
    pub model:          Option<String>,
    #[serde(default)]
    pub provider:       Option<String>,
    #[serde(default)]
    pub detection_mode: DetectionMode,
    #[serde(default)]
    pub max_tokens:     Option<u32>,
    #[serde(default)]
    pub temperature:    Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenUsage {
    pub prompt:     u32,
    pub completion: u32,
    pub total:      u32,
}

/// Final pipeline output returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub completion:   String,
    pub tokens:       TokenUsage,
    pub cost:         f64,
    pub cache_hit:    bool,
    pub pii_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pii_entities: Option<Vec<PiiEntity>>,
    pub duration_ms:  u64,
    pub model:        String,
    pub provider:     String,
    pub request_id:   Uuid,
}

// ── PII ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiKind {
    Tckn,
    Phone,
    Email,
    Iban,
    CreditCard,
    Address,
    Amount,
    Person,
    Organization,
    Location,
    Date,
}

impl PiiKind {
    /// Canonical upper-snake name — used in sentinels and stored records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tckn         => "TCKN",
            Self::Phone        => "PHONE",
            Self::Email        => "EMAIL",
            Self::Iban         => "IBAN",
            Self::CreditCard   => "CREDIT_CARD",
            Self::Address      => "ADDRESS",
            Self::Amount       => "AMOUNT",
            Self::Person       => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Location     => "LOCATION",
            Self::Date         => "DATE",
        }
    }
}

impl std::fmt::Display for PiiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected PII span. Offsets are byte positions into the source string,
/// `0 <= start < end <= text.len()`, always on UTF-8 boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiEntity {
    pub kind:       PiiKind,
    pub text:       String,
    pub start:      usize,
    pub end:        usize,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    #[default]
    Fast,
    Detailed,
}

impl std::fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast     => write!(f, "fast"),
            Self::Detailed => write!(f, "detailed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub entities:           Vec<PiiEntity>,
    pub mode:               DetectionMode,
    pub processing_time_ms: f64,
}

// ── Guardrails ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity { Error, Warning, Info }

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error   => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info    => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction { Block, Log, Alert }

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Log   => write!(f, "log"),
            Self::Alert => write!(f, "alert"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_name: String,
    pub severity:  Severity,
    pub action:    RuleAction,
    pub message:   String,
    pub details:   serde_json::Value,
}

// ── Completion envelope ───────────────────────────────────────────────────────

/// Normalised provider result — identical shape regardless of upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    pub completion:        String,
    pub prompt_tokens:     u32,
    pub completion_tokens: u32,
    pub total_tokens:      u32,
    pub model:             String,
    pub cost_usd:          f64,
    pub provider:          String,
}

// ── Principals & credentials ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id:       Uuid,
    pub name:     String,
    pub is_admin: bool,
    /// Rate-limit tier this principal belongs to.
    pub tier:     String,
}

impl Principal {
    pub fn admin() -> Self {
        Self {
            id:       Uuid::nil(),
            name:     "admin".to_string(),
            is_admin: true,
            tier:     "premium".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id:        Uuid,
    pub principal: Principal,
    pub key_hash:  String,
    pub active:    bool,
}

// ── Budgets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod { Daily, Weekly, Monthly }

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily   => write!(f, "daily"),
            Self::Weekly  => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub principal_id:      Uuid,
    pub limit_usd:         f64,
    pub period:            BudgetPeriod,
    pub current_spend_usd: f64,
    pub reset_at:          DateTime<Utc>,
    pub updated_at:        DateTime<Utc>,
}

// ── Audit records ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus { Completed, Failed, Blocked, BudgetExceeded }

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed      => write!(f, "completed"),
            Self::Failed         => write!(f, "failed"),
            Self::Blocked        => write!(f, "blocked"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
        }
    }
}

/// Immutable request-log row. `(id, request_timestamp)` is the composite key
/// so storage can time-partition; `id` alone is not globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id:                   Uuid,
    pub principal_id:         Uuid,
    pub request_timestamp:    DateTime<Utc>,
    pub provider:             String,
    pub model:                String,
    pub messages:             Vec<ChatMessage>,
    pub completion:           String,
    pub prompt_tokens:        u32,
    pub completion_tokens:    u32,
    pub total_tokens:         u32,
    pub cost_usd:             f64,
    pub duration_ms:          u64,
    pub cache_hit:            bool,
    pub pii_detected:         bool,
    pub pii_entities:         Vec<PiiEntity>,
    pub status:               RequestStatus,
    pub error_message:        Option<String>,
    pub guardrail_violations: Vec<Violation>,
}

/// Guardrail-violation row. `request_id` is nullable — violations can land
/// before the parent request row exists and are back-filled afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailRecord {
    pub id:           Uuid,
    pub principal_id: Uuid,
    pub request_id:   Option<Uuid>,
    pub rule_name:    String,
    pub severity:     Severity,
    pub action:       RuleAction,
    pub details:      serde_json::Value,
    pub timestamp:    DateTime<Utc>,
}

// ── Webhooks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id:           Uuid,
    pub principal_id: Uuid,
    pub url:          String,
    pub events:       Vec<String>,
    /// Plaintext HMAC secret — opaque to the delivery path.
    pub secret:       String,
    pub active:       bool,
    pub created_at:   DateTime<Utc>,
}
