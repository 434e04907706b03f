// gatewally/src/providers/failover.rs
//
// Ordered provider failover.
//
// The try-chain is the caller's primary followed by the configured order
// minus the primary. Each candidate re-selects its model: the primary gets
// the caller's model, a fallback gets the caller's model only if it is in
// that provider's allowlist, otherwise its own default. First success wins.
// Every failed candidate lands in the error counter before the chain moves
// on — a request that ultimately succeeds still shows where it limped.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::FallbackConfig;
use crate::errors::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::providers::ProviderRegistry;
use crate::types::{ChatMessage, CompletionEnvelope};

pub struct FailoverManager {
    enabled:  bool,
    order:    Vec<String>,
    registry: Arc<ProviderRegistry>,
    metrics:  Arc<GatewayMetrics>,
}

impl FailoverManager {
    pub fn new(
        config: &FallbackConfig,
        registry: Arc<ProviderRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            enabled:  config.enabled,
            order:    config.order.clone(),
            registry,
            metrics,
        }
    }

    pub async fn execute(
        &self,
        messages: &[ChatMessage],
        primary: &str,
        model: Option<&str>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<CompletionEnvelope> {
        if !self.enabled {
            let provider = self.registry.get(primary)?;
            let model = model.unwrap_or(provider.default_model()).to_string();
            return provider.complete(messages, &model, max_tokens, temperature).await;
        }

        let mut chain: Vec<&str> = vec![primary];
        chain.extend(self.order.iter().map(String::as_str).filter(|p| *p != primary));

        let mut last_error: Option<GatewayError> = None;
        for candidate in chain {
            let provider = match self.registry.get(candidate) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Provider {candidate} not configured: {e}");
                    last_error = Some(e);
                    continue;
                }
            };

            let candidate_model = if candidate == primary {
                model.unwrap_or(provider.default_model()).to_string()
            } else if model.map(|m| provider.models().iter().any(|pm| pm.as_str() == m)).unwrap_or(false) {
                model.unwrap().to_string()
            } else {
                provider.default_model().to_string()
            };

            match provider
                .complete(messages, &candidate_model, max_tokens, temperature)
                .await
            {
                Ok(envelope) => {
                    if candidate != primary {
                        info!("Failover succeeded on {candidate} with {candidate_model}");
                    }
                    return Ok(envelope);
                }
                Err(e) => {
                    self.metrics.record_error(e.kind(), candidate);
                    warn!("Provider {candidate} failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(GatewayError::Provider {
            provider: "fallback".to_string(),
            status:   None,
            message:  format!(
                "all providers failed, last error: {}",
                last_error.map(|e| e.to_string()).unwrap_or_else(|| "none tried".to_string())
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Provider, StubBehavior, StubProvider};
    use crate::types::ChatMessage;

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", "hello there")]
    }

    fn manager(registry: ProviderRegistry, order: &[&str], enabled: bool) -> (FailoverManager, Arc<GatewayMetrics>) {
        let metrics = GatewayMetrics::new();
        let manager = FailoverManager::new(
            &FallbackConfig {
                enabled,
                order: order.iter().map(|s| s.to_string()).collect(),
            },
            Arc::new(registry),
            metrics.clone(),
        );
        (manager, metrics)
    }

    #[tokio::test]
    async fn failing_primary_falls_over_to_secondary() {
        let registry = ProviderRegistry::default()
            .with("primary", Provider::Stub(StubProvider::new("primary", StubBehavior::Fail)))
            .with("secondary", Provider::Stub(StubProvider::new("secondary", StubBehavior::Echo)));
        let (manager, metrics) = manager(registry, &["primary", "secondary"], true);

        let envelope = manager
            .execute(&messages(), "primary", None, None, None)
            .await
            .unwrap();
        assert_eq!(envelope.provider, "secondary");
        assert_eq!(metrics.error_count("ProviderError", "primary"), 1);
        assert_eq!(metrics.error_count("ProviderError", "secondary"), 0);
    }

    #[tokio::test]
    async fn fallback_keeps_the_model_only_when_allowlisted() {
        let mut secondary = StubProvider::new("secondary", StubBehavior::Echo);
        secondary.models = vec!["shared-model".to_string(), "stub-1".to_string()];
        let registry = ProviderRegistry::default()
            .with("primary", Provider::Stub(StubProvider::new("primary", StubBehavior::Fail)))
            .with("secondary", Provider::Stub(secondary));
        let (manager, _) = manager(registry, &["primary", "secondary"], true);

        let envelope = manager
            .execute(&messages(), "primary", Some("shared-model"), None, None)
            .await
            .unwrap();
        assert_eq!(envelope.model, "shared-model");

        let envelope = manager
            .execute(&messages(), "primary", Some("primary-only-model"), None, None)
            .await
            .unwrap();
        assert_eq!(envelope.model, "stub-1"); // secondary's default
    }

    #[tokio::test]
    async fn all_failing_raises_one_aggregate_error() {
        let registry = ProviderRegistry::default()
            .with("primary", Provider::Stub(StubProvider::new("primary", StubBehavior::Fail)))
            .with("secondary", Provider::Stub(StubProvider::new("secondary", StubBehavior::Fail)));
        let (manager, metrics) = manager(registry, &["primary", "secondary"], true);

        let err = manager
            .execute(&messages(), "primary", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderError");
        assert!(err.to_string().contains("all providers failed"));
        assert_eq!(metrics.error_count("ProviderError", "primary"), 1);
        assert_eq!(metrics.error_count("ProviderError", "secondary"), 1);
    }

    #[tokio::test]
    async fn disabled_failover_calls_the_primary_directly() {
        let registry = ProviderRegistry::default()
            .with("primary", Provider::Stub(StubProvider::new("primary", StubBehavior::Fail)))
            .with("secondary", Provider::Stub(StubProvider::new("secondary", StubBehavior::Echo)));
        let (manager, _) = manager(registry, &["primary", "secondary"], false);

        let err = manager
            .execute(&messages(), "primary", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderError"); // no fallback attempted
    }

    #[tokio::test]
    async fn primary_not_in_configured_order_still_tries_the_chain() {
        let registry = ProviderRegistry::default()
            .with("adhoc", Provider::Stub(StubProvider::new("adhoc", StubBehavior::Fail)))
            .with("secondary", Provider::Stub(StubProvider::new("secondary", StubBehavior::Echo)));
        let (manager, _) = manager(registry, &["secondary"], true);

        let envelope = manager
            .execute(&messages(), "adhoc", None, None, None)
            .await
            .unwrap();
        assert_eq!(envelope.provider, "secondary");
    }
}
