// gatewally/src/config.rs
//
// YAML configuration with an environment-keyed overlay.
//
// Load order:
//   1. base file        (e.g. config.yaml)
//   2. overlay file     (config.<env>.yaml next to the base, env from GATEWALLY_ENV)
//   3. ${NAME} substitution — string leaves of the exact form "${NAME}" are
//      replaced by the process environment variable, left untouched if unset
//   4. typed deserialization — every missing section falls back to defaults
//
// Secrets (provider keys, admin key, webhook secrets) arrive exclusively via
// the ${NAME} substitution path; the files themselves stay checked in.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::types::BudgetPeriod;

// ── Top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub redis:         RedisConfig,
    pub auth:          AuthConfig,
    pub cache:         CacheConfig,
    pub rate_limiting: RateLimitConfig,
    pub guardrails:    GuardrailsConfig,
    pub fallback:      FallbackConfig,
    pub providers:     HashMap<String, ProviderConfig>,
    pub ab_testing:    AbTestingConfig,
    pub budget:        BudgetConfig,
    pub pii:           PiiConfig,
    pub webhooks:      WebhooksConfig,
    pub timeout:       TimeoutConfig,
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// None — run every Redis-backed subsystem on its in-process fallback.
    pub url: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub admin_api_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { admin_api_key: "dev-admin-key-change-in-production".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled:              bool,
    pub ttl:                  u64,
    pub similarity_threshold: f32,
    pub vector_dimension:     usize,
    pub embedding_model:      String,
    pub embedding_provider:   String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled:              true,
            ttl:                  3600,
            similarity_threshold: 0.95,
            vector_dimension:     1536,
            embedding_model:      "text-embedding-3-small".to_string(),
            embedding_provider:   "hashing".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub tiers:   HashMap<String, TierLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert("default".to_string(), TierLimits { requests_per_minute: 60, requests_per_hour: 1000 });
        tiers.insert("premium".to_string(), TierLimits { requests_per_minute: 600, requests_per_hour: 10_000 });
        Self { enabled: true, tiers }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour:   u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub enabled:            bool,
    pub block_on_violation: bool,
    pub rules:              Vec<RuleConfig>,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self { enabled: true, block_on_violation: true, rules: Vec::new() }
    }
}

/// One configured guardrail rule. `kind` selects the rule family; the
/// family-specific fields are optional and default sensibly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name:    String,
    #[serde(rename = "type")]
    pub kind:    String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_severity")]
    pub severity: crate::types::Severity,
    #[serde(default = "default_action")]
    pub action:  crate::types::RuleAction,
    #[serde(default)]
    pub threshold:    Option<f64>,
    /// "tokens" or "cost" for threshold rules; sniffed from the name if unset.
    #[serde(default)]
    pub metric:       Option<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub patterns:     Vec<String>,
}

fn default_true() -> bool { true }
fn default_severity() -> crate::types::Severity { crate::types::Severity::Warning }
fn default_action() -> crate::types::RuleAction { crate::types::RuleAction::Log }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub order:   Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { enabled: true, order: vec!["openai".to_string(), "gemini".to_string()] }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled:       bool,
    pub api_key:       String,
    pub default_model: String,
    pub models:        Vec<String>,
    /// model → per-1K-token prices
    pub pricing:       HashMap<String, ModelPricing>,
    pub max_retries:   u32,
    pub retry_delay:   f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled:       true,
            api_key:       String::new(),
            default_model: String::new(),
            models:        Vec::new(),
            pricing:       HashMap::new(),
            max_retries:   3,
            retry_delay:   1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    /// USD per 1K prompt tokens
    pub prompt:     f64,
    /// USD per 1K completion tokens
    pub completion: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestingConfig {
    pub enabled:  bool,
    pub variants: Vec<AbVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbVariant {
    pub provider:   String,
    pub model:      String,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub enabled:          bool,
    pub default_limit:    f64,
    pub default_period:   BudgetPeriod,
    pub alert_thresholds: Vec<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled:          true,
            default_limit:    1000.0,
            default_period:   BudgetPeriod::Monthly,
            alert_thresholds: vec![0.5, 0.75, 0.9],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PiiConfig {
    pub masking: MaskingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    pub enabled:     bool,
    pub session_ttl: u64,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self { enabled: true, session_ttl: 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhooksConfig {
    pub enabled:     bool,
    pub timeout:     u64,
    pub max_retries: u32,
    pub retry_delay: f64,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self { enabled: true, timeout: 5, max_retries: 3, retry_delay: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Provider-call deadline in seconds.
    pub default: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { default: 30 }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Load from a YAML file, merging the environment overlay if present.
    pub fn load(path: &Path) -> Result<Self> {
        let base = read_yaml(path)?;

        let environment = std::env::var("GATEWALLY_ENV")
            .unwrap_or_else(|_| "development".to_string());
        let overlay_path = overlay_path_for(path, &environment);
        let merged = match overlay_path.as_deref().filter(|p| p.exists()) {
            Some(p) => deep_merge(base, read_yaml(p)?),
            None    => base,
        };

        Self::from_value(merged)
    }

    /// Deserialize from an already-merged YAML value (tests use this).
    pub fn from_value(mut value: Value) -> Result<Self> {
        substitute_env(&mut value);
        serde_yaml::from_value(value).context("invalid gateway configuration")
    }
}

fn read_yaml(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let value: Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(value)
}

fn overlay_path_for(base: &Path, environment: &str) -> Option<std::path::PathBuf> {
    let stem = base.file_stem()?.to_str()?;
    let ext  = base.extension()?.to_str()?;
    Some(base.with_file_name(format!("{stem}.{environment}.{ext}")))
}

/// Overlay wins; mappings merge recursively, everything else replaces.
fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut b), Value::Mapping(o)) => {
            for (key, o_val) in o {
                let merged = match b.remove(&key) {
                    Some(b_val) => deep_merge(b_val, o_val),
                    None        => o_val,
                };
                b.insert(key, merged);
            }
            Value::Mapping(b)
        }
        (_, overlay) => overlay,
    }
}

/// Replace string leaves of the exact form "${NAME}" with the environment
/// variable NAME. Unset variables leave the literal in place.
fn substitute_env(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v);
            }
        }
        Value::Sequence(seq) => {
            for v in seq.iter_mut() {
                substitute_env(v);
            }
        }
        Value::String(s) => {
            if let Some(name) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
                if let Ok(resolved) = std::env::var(name) {
                    *s = resolved;
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_on_empty_config() {
        let cfg = GatewayConfig::from_value(Value::Mapping(Default::default())).unwrap();
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.cache.ttl, 3600);
        assert!((cfg.cache.similarity_threshold - 0.95).abs() < 1e-6);
        assert_eq!(cfg.timeout.default, 30);
        assert_eq!(cfg.rate_limiting.tiers["default"].requests_per_minute, 60);
        assert_eq!(cfg.budget.default_period, BudgetPeriod::Monthly);
    }

    #[test]
    fn overlay_merges_deeply() {
        let base: Value = serde_yaml::from_str(
            "cache:\n  enabled: true\n  ttl: 3600\nfallback:\n  order: [openai, gemini]\n",
        )
        .unwrap();
        let overlay: Value = serde_yaml::from_str("cache:\n  ttl: 60\n").unwrap();
        let cfg = GatewayConfig::from_value(deep_merge(base, overlay)).unwrap();
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.cache.ttl, 60);
        assert_eq!(cfg.fallback.order, vec!["openai", "gemini"]);
    }

    #[test]
    fn env_substitution_replaces_whole_string_leaves() {
        std::env::set_var("GW_TEST_KEY", "sk-resolved");
        let mut value: Value = serde_yaml::from_str(
            "providers:\n  openai:\n    api_key: ${GW_TEST_KEY}\n    default_model: gpt-4o-mini\n",
        )
        .unwrap();
        substitute_env(&mut value);
        let cfg: GatewayConfig = serde_yaml::from_value(value).unwrap();
        assert_eq!(cfg.providers["openai"].api_key, "sk-resolved");
    }

    #[test]
    fn unset_variables_are_left_verbatim() {
        let mut value: Value =
            serde_yaml::from_str("auth:\n  admin_api_key: ${GW_DEFINITELY_UNSET}\n").unwrap();
        substitute_env(&mut value);
        let cfg: GatewayConfig = serde_yaml::from_value(value).unwrap();
        assert_eq!(cfg.auth.admin_api_key, "${GW_DEFINITELY_UNSET}");
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut f = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(f, "cache:\n  ttl: 120\nwebhooks:\n  max_retries: 5").unwrap();
        let cfg = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(cfg.cache.ttl, 120);
        assert_eq!(cfg.webhooks.max_retries, 5);
    }
}
