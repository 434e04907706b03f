// gatewally/src/guardrails.rs
//
// Guardrail engine: an ordered list of configured rules, each one of three
// families:
//
//   Threshold — tokens or cost above a bound
//   NoPii     — any detected entity of a listed kind (or any kind at all)
//   Content   — any case-insensitive regex match
//
// The engine runs every enabled rule even after a blocking hit so the
// caller sees the complete violation set. `should_block` is raised only by
// an error-severity violation while the engine-level `block_on_violation`
// flag is set.

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::config::{GuardrailsConfig, RuleConfig};
use crate::types::{PiiEntity, RuleAction, Severity, Violation};

// ── Rules ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMetric { Tokens, Cost }

pub enum RuleKind {
    Threshold { metric: ThresholdMetric, bound: f64 },
    NoPii     { kinds: Vec<String> },
    Content   { patterns: Vec<Regex> },
}

pub struct Rule {
    pub name:     String,
    pub enabled:  bool,
    pub severity: Severity,
    pub action:   RuleAction,
    pub kind:     RuleKind,
}

/// What a single check sees. Gates pass only what they have: the input gate
/// has text + entities, the metering gate has tokens + cost.
#[derive(Default, Clone, Copy)]
pub struct CheckInput<'a> {
    pub text:     Option<&'a str>,
    pub entities: Option<&'a [PiiEntity]>,
    pub tokens:   Option<u32>,
    pub cost:     Option<f64>,
}

impl Rule {
    fn from_config(config: &RuleConfig) -> Option<Self> {
        let kind = match config.kind.as_str() {
            "threshold" => {
                let metric = match config.metric.as_deref() {
                    Some("cost")   => ThresholdMetric::Cost,
                    Some("tokens") => ThresholdMetric::Tokens,
                    // Sniff the name when the metric is not spelled out.
                    _ if config.name.to_lowercase().contains("cost") => ThresholdMetric::Cost,
                    _ => ThresholdMetric::Tokens,
                };
                RuleKind::Threshold { metric, bound: config.threshold.unwrap_or(0.0) }
            }
            "pii" => RuleKind::NoPii { kinds: config.entity_types.clone() },
            "content" => {
                let patterns: Vec<Regex> = config
                    .patterns
                    .iter()
                    .filter_map(|p| {
                        RegexBuilder::new(p)
                            .case_insensitive(true)
                            .build()
                            .map_err(|e| warn!("Guardrail pattern '{p}' invalid: {e}"))
                            .ok()
                    })
                    .collect();
                RuleKind::Content { patterns }
            }
            other => {
                warn!("Unknown guardrail rule type '{other}' — skipping {}", config.name);
                return None;
            }
        };

        Some(Self {
            name:     config.name.clone(),
            enabled:  config.enabled,
            severity: config.severity,
            action:   config.action,
            kind,
        })
    }

    fn check(&self, input: &CheckInput<'_>) -> Option<Violation> {
        match &self.kind {
            RuleKind::Threshold { metric, bound } => {
                let value = match metric {
                    ThresholdMetric::Tokens => input.tokens.map(f64::from),
                    ThresholdMetric::Cost   => input.cost,
                }?;
                if value > *bound {
                    let label = match metric {
                        ThresholdMetric::Tokens => "tokens",
                        ThresholdMetric::Cost   => "cost",
                    };
                    return Some(self.violation(
                        format!("{label} {value} exceeds threshold {bound}"),
                        serde_json::json!({ label: value, "threshold": bound }),
                    ));
                }
                None
            }

            RuleKind::NoPii { kinds } => {
                let entities = input.entities?;
                let matched: Vec<&PiiEntity> = entities
                    .iter()
                    .filter(|e| kinds.is_empty() || kinds.iter().any(|k| k == e.kind.as_str()))
                    .collect();
                if matched.is_empty() {
                    return None;
                }
                let kind_names: Vec<&str> = matched.iter().map(|e| e.kind.as_str()).collect();
                Some(self.violation(
                    format!("PII detected: {kind_names:?}"),
                    serde_json::json!({ "entities": matched }),
                ))
            }

            RuleKind::Content { patterns } => {
                let text = input.text?;
                if patterns.iter().any(|re| re.is_match(text)) {
                    return Some(self.violation(
                        "content matches filtered patterns".to_string(),
                        serde_json::json!({
                            "patterns": patterns.iter().map(|p| p.as_str()).collect::<Vec<_>>()
                        }),
                    ));
                }
                None
            }
        }
    }

    fn violation(&self, message: String, details: serde_json::Value) -> Violation {
        Violation {
            rule_name: self.name.clone(),
            severity:  self.severity,
            action:    self.action,
            message,
            details,
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct GuardrailResult {
    pub passed:       bool,
    pub violations:   Vec<Violation>,
    pub should_block: bool,
}

pub struct GuardrailEngine {
    enabled:            bool,
    block_on_violation: bool,
    rules:              Vec<Rule>,
}

impl GuardrailEngine {
    pub fn new(config: &GuardrailsConfig) -> Self {
        let rules = config.rules.iter().filter_map(Rule::from_config).collect();
        Self {
            enabled:            config.enabled,
            block_on_violation: config.block_on_violation,
            rules,
        }
    }

    pub fn check(&self, input: CheckInput<'_>) -> GuardrailResult {
        if !self.enabled {
            return GuardrailResult { passed: true, violations: Vec::new(), should_block: false };
        }

        let mut violations = Vec::new();
        let mut should_block = false;

        for rule in self.rules.iter().filter(|r| r.enabled) {
            if let Some(violation) = rule.check(&input) {
                if violation.severity == Severity::Error && self.block_on_violation {
                    should_block = true;
                }
                violations.push(violation);
            }
        }

        GuardrailResult { passed: violations.is_empty(), violations, should_block }
    }

    pub fn n_rules(&self) -> usize {
        self.rules.len()
    }
}
