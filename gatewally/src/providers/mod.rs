// gatewally/src/providers/mod.rs
//
// Provider abstraction: one sum type per remote backend, all normalised to
// the same complete / stream / cost operations and the same envelope.
//
// The stub backend is first-class, not test scaffolding: replay mode and
// offline deployments run against it, and it is the deterministic upstream
// the scenario suite drives.

pub mod failover;
pub mod gemini;
pub mod openai;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{ModelPricing, ProviderConfig};
use crate::errors::{GatewayError, Result};
use crate::types::{ChatMessage, CompletionEnvelope};

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// `(pt · P_in + ct · P_out) / 1000` from the per-model pricing table.
/// Unknown models price at zero.
pub fn cost_from_pricing(
    pricing: &HashMap<String, ModelPricing>,
    prompt_tokens: u32,
    completion_tokens: u32,
    model: &str,
) -> f64 {
    let Some(p) = pricing.get(model) else { return 0.0 };
    (prompt_tokens as f64 * p.prompt + completion_tokens as f64 * p.completion) / 1000.0
}

// ── Stub backend ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Reply with the last user message verbatim.
    Echo,
    /// Reply with a fixed string.
    Fixed(String),
    /// Fail every call — exercises failover and error paths.
    Fail,
}

pub struct StubProvider {
    pub name:          String,
    pub default_model: String,
    pub models:        Vec<String>,
    pricing:           HashMap<String, ModelPricing>,
    behavior:          StubBehavior,
}

impl StubProvider {
    pub fn new(name: impl Into<String>, behavior: StubBehavior) -> Self {
        Self {
            name:          name.into(),
            default_model: "stub-1".to_string(),
            models:        vec!["stub-1".to_string()],
            pricing:       HashMap::new(),
            behavior,
        }
    }

    pub fn from_config(name: &str, config: &ProviderConfig) -> Self {
        Self {
            name:          name.to_string(),
            default_model: if config.default_model.is_empty() {
                "stub-1".to_string()
            } else {
                config.default_model.clone()
            },
            models:        config.models.clone(),
            pricing:       config.pricing.clone(),
            behavior:      StubBehavior::Echo,
        }
    }

    pub fn with_pricing(mut self, model: &str, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.to_string(), pricing);
        self
    }

    fn reply_for(&self, messages: &[ChatMessage]) -> Result<String> {
        match &self.behavior {
            StubBehavior::Echo => Ok(messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default()),
            StubBehavior::Fixed(reply) => Ok(reply.clone()),
            StubBehavior::Fail => Err(GatewayError::Provider {
                provider: self.name.clone(),
                status:   Some(503),
                message:  "stub configured to fail".to_string(),
            }),
        }
    }

    fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<CompletionEnvelope> {
        let completion = self.reply_for(messages)?;
        // ~4 bytes per token, floor 1 — close enough for a stub.
        let prompt_bytes: usize = messages.iter().map(|m| m.content.len()).sum();
        let prompt_tokens     = (prompt_bytes / 4).max(1) as u32;
        let completion_tokens = (completion.len() / 4).max(1) as u32;

        Ok(CompletionEnvelope {
            completion,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            model:    model.to_string(),
            cost_usd: cost_from_pricing(&self.pricing, prompt_tokens, completion_tokens, model),
            provider: self.name.clone(),
        })
    }

    fn stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let reply = self.reply_for(messages)?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Word-sized chunks mimic upstream delta frames.
            let words: Vec<String> = reply.split_inclusive(' ').map(String::from).collect();
            for word in words {
                if tx.send(Ok(word)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

// ── Sum type ──────────────────────────────────────────────────────────────────

pub enum Provider {
    OpenAi(OpenAiProvider),
    Gemini(GeminiProvider),
    Stub(StubProvider),
}

impl Provider {
    pub fn name(&self) -> &str {
        match self {
            Self::OpenAi(_)  => "openai",
            Self::Gemini(_)  => "gemini",
            Self::Stub(s)    => &s.name,
        }
    }

    pub fn default_model(&self) -> &str {
        match self {
            Self::OpenAi(p) => &p.default_model,
            Self::Gemini(p) => &p.default_model,
            Self::Stub(p)   => &p.default_model,
        }
    }

    pub fn models(&self) -> &[String] {
        match self {
            Self::OpenAi(p) => &p.models,
            Self::Gemini(p) => &p.models,
            Self::Stub(p)   => &p.models,
        }
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<CompletionEnvelope> {
        match self {
            Self::OpenAi(p) => p.complete(messages, model, max_tokens, temperature).await,
            Self::Gemini(p) => p.complete(messages, model, max_tokens, temperature).await,
            Self::Stub(p)   => p.complete(messages, model),
        }
    }

    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        match self {
            Self::OpenAi(p) => p.stream(messages, model, max_tokens, temperature).await,
            Self::Gemini(p) => p.stream(messages, model, max_tokens, temperature).await,
            Self::Stub(p)   => p.stream(messages),
        }
    }

    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32, model: &str) -> f64 {
        match self {
            Self::OpenAi(p) => p.cost(prompt_tokens, completion_tokens, model),
            Self::Gemini(p) => p.cost(prompt_tokens, completion_tokens, model),
            Self::Stub(p)   => cost_from_pricing(&p.pricing, prompt_tokens, completion_tokens, model),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Name → provider map, built once at process start and shared.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<Provider>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &HashMap<String, ProviderConfig>) -> Self {
        let mut providers: HashMap<String, Arc<Provider>> = HashMap::new();

        for (name, provider_config) in config.iter().filter(|(_, c)| c.enabled) {
            let provider = match name.as_str() {
                "openai" => Provider::OpenAi(OpenAiProvider::new(provider_config)),
                "gemini" => Provider::Gemini(GeminiProvider::new(provider_config)),
                "stub"   => Provider::Stub(StubProvider::from_config(name, provider_config)),
                other => {
                    warn!("Unknown provider '{other}' — wiring an echo stub in its place");
                    Provider::Stub(StubProvider::from_config(other, provider_config))
                }
            };
            providers.insert(name.clone(), Arc::new(provider));
        }

        if providers.is_empty() {
            providers.insert(
                "stub".to_string(),
                Arc::new(Provider::Stub(StubProvider::new("stub", StubBehavior::Echo))),
            );
        }

        Self { providers }
    }

    /// Test / replay construction.
    pub fn with(mut self, name: impl Into<String>, provider: Provider) -> Self {
        self.providers.insert(name.into(), Arc::new(provider));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<Provider>> {
        self.providers.get(name).cloned().ok_or_else(|| GatewayError::Provider {
            provider: name.to_string(),
            status:   None,
            message:  "unknown provider".to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// System default route: openai, then gemini, then anything configured.
    pub fn default_route(&self) -> (String, String) {
        for preferred in ["openai", "gemini"] {
            if let Some(p) = self.providers.get(preferred) {
                return (preferred.to_string(), p.default_model().to_string());
            }
        }
        self.providers
            .iter()
            .next()
            .map(|(name, p)| (name.clone(), p.default_model().to_string()))
            .unwrap_or_else(|| ("stub".to_string(), "stub-1".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_stub_replays_the_last_user_message() {
        let p = Provider::Stub(StubProvider::new("stub", StubBehavior::Echo));
        let messages = vec![
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "first"),
            ChatMessage::new("assistant", "ok"),
            ChatMessage::new("user", "echo me"),
        ];
        let envelope = p.complete(&messages, "stub-1", None, None).await.unwrap();
        assert_eq!(envelope.completion, "echo me");
        assert_eq!(envelope.provider, "stub");
        assert!(envelope.total_tokens > 0);
    }

    #[tokio::test]
    async fn failing_stub_surfaces_a_provider_error() {
        let p = Provider::Stub(StubProvider::new("primary", StubBehavior::Fail));
        let err = p
            .complete(&[ChatMessage::new("user", "hi")], "stub-1", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderError");
    }

    #[tokio::test]
    async fn stub_stream_reassembles_to_the_full_reply() {
        let p = Provider::Stub(StubProvider::new(
            "stub",
            StubBehavior::Fixed("three word reply".to_string()),
        ));
        let mut rx = p
            .stream(&[ChatMessage::new("user", "go")], "stub-1", None, None)
            .await
            .unwrap();

        let mut assembled = String::new();
        while let Some(chunk) = rx.recv().await {
            assembled.push_str(&chunk.unwrap());
        }
        assert_eq!(assembled, "three word reply");
    }

    #[test]
    fn pricing_math_is_per_thousand_tokens() {
        let mut pricing = HashMap::new();
        pricing.insert(
            "gpt-4o-mini".to_string(),
            ModelPricing { prompt: 0.15, completion: 0.6 },
        );
        let cost = cost_from_pricing(&pricing, 1000, 500, "gpt-4o-mini");
        assert!((cost - (0.15 + 0.3)).abs() < 1e-9);
        assert_eq!(cost_from_pricing(&pricing, 1000, 500, "unknown"), 0.0);
    }

    #[test]
    fn registry_defaults_prefer_openai() {
        let registry = ProviderRegistry::default()
            .with("gemini", Provider::Stub(StubProvider::new("gemini", StubBehavior::Echo)))
            .with("openai", Provider::Stub(StubProvider::new("openai", StubBehavior::Echo)));
        let (provider, _) = registry.default_route();
        assert_eq!(provider, "openai");

        let registry = ProviderRegistry::default()
            .with("stub", Provider::Stub(StubProvider::new("stub", StubBehavior::Echo)));
        let (provider, model) = registry.default_route();
        assert_eq!(provider, "stub");
        assert_eq!(model, "stub-1");
    }

    #[test]
    fn empty_config_still_yields_a_backend() {
        let registry = ProviderRegistry::from_config(&HashMap::new());
        assert!(registry.contains("stub"));
    }
}
