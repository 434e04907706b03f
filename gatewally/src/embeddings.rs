// gatewally/src/embeddings.rs
//
// Embedding capability for the semantic cache.
//
// Three backends behind one sum type, dispatched by configured name:
//
//   openai   — POST /v1/embeddings
//   gemini   — POST models/{model}:embedContent
//   hashing  — deterministic random-feature-hashing, no network, no model
//              weights. Word n-grams (n=1..3) are hashed into ±1 feature
//              vectors via SHA-256, summed and L2-normalized. Paraphrase
//              sensitivity is limited, but identical and near-identical
//              prompts land within the cache threshold, which is what the
//              cache needs in environments without an embedding endpoint.
//
// Embedding failures never fail a request — the cache treats them as a miss.

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::{CacheConfig, ProviderConfig};
use crate::errors::{GatewayError, Result};

pub enum Embedder {
    OpenAi {
        client:  reqwest::Client,
        api_key: String,
        model:   String,
    },
    Gemini {
        client:  reqwest::Client,
        api_key: String,
        model:   String,
    },
    Hashing {
        dimension: usize,
    },
}

impl Embedder {
    /// Build the configured backend. Unknown provider names fall back to
    /// the hashing backend with a warning rather than disabling the cache.
    pub fn from_config(
        cache: &CacheConfig,
        providers: &std::collections::HashMap<String, ProviderConfig>,
    ) -> Self {
        let api_key = |name: &str| {
            providers.get(name).map(|p| p.api_key.clone()).unwrap_or_default()
        };
        match cache.embedding_provider.as_str() {
            "openai" => Self::OpenAi {
                client:  reqwest::Client::new(),
                api_key: api_key("openai"),
                model:   cache.embedding_model.clone(),
            },
            "gemini" => Self::Gemini {
                client:  reqwest::Client::new(),
                api_key: api_key("gemini"),
                model:   cache.embedding_model.clone(),
            },
            "hashing" => Self::Hashing { dimension: cache.vector_dimension },
            other => {
                warn!("Unknown embedding provider '{other}' — using hashing backend");
                Self::Hashing { dimension: cache.vector_dimension }
            }
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            Self::OpenAi { client, api_key, model } => {
                let body = serde_json::json!({ "model": model, "input": text });
                let resp = client
                    .post("https://api.openai.com/v1/embeddings")
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| GatewayError::Cache(format!("openai embed: {e}")))?;
                if !resp.status().is_success() {
                    return Err(GatewayError::Cache(format!(
                        "openai embed: status {}",
                        resp.status()
                    )));
                }
                let value: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| GatewayError::Cache(format!("openai embed: {e}")))?;
                parse_floats(&value["data"][0]["embedding"])
            }

            Self::Gemini { client, api_key, model } => {
                let url = format!(
                    "https://generativelanguage.googleapis.com/v1beta/models/{model}:embedContent?key={api_key}"
                );
                let body = serde_json::json!({
                    "content": { "parts": [ { "text": text } ] }
                });
                let resp = client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| GatewayError::Cache(format!("gemini embed: {e}")))?;
                if !resp.status().is_success() {
                    return Err(GatewayError::Cache(format!(
                        "gemini embed: status {}",
                        resp.status()
                    )));
                }
                let value: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| GatewayError::Cache(format!("gemini embed: {e}")))?;
                parse_floats(&value["embedding"]["values"])
            }

            Self::Hashing { dimension } => Ok(hashing_embed(text, *dimension)),
        }
    }

    /// Output dimension, where known ahead of the first call.
    pub fn dimension_hint(&self) -> Option<usize> {
        match self {
            Self::Hashing { dimension } => Some(*dimension),
            _ => None,
        }
    }
}

fn parse_floats(value: &serde_json::Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect())
        .filter(|v: &Vec<f32>| !v.is_empty())
        .ok_or_else(|| GatewayError::Cache("embedding response missing vector".to_string()))
}

// ── Hashing backend ───────────────────────────────────────────────────────────

/// Deterministic ±1 feature vector for one token.
fn token_feature(token: &str, dimension: usize, out: &mut [f32]) {
    let mut h = Sha256::new();
    h.update(b"gw_rfh_v1:");
    h.update(token.as_bytes());
    let digest = h.finalize();

    for (i, slot) in out.iter_mut().enumerate().take(dimension) {
        // Spread the 32 digest bytes across the vector, one bit per dim.
        let byte = digest[(i / 8) % digest.len()];
        let bit  = (byte >> (i % 8)) & 1;
        *slot += if bit == 1 { 1.0 } else { -1.0 };
    }
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn hashing_embed(text: &str, dimension: usize) -> Vec<f32> {
    let normalized = normalize_text(text);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let mut vec = vec![0.0f32; dimension];

    for n in 1..=3usize {
        for window in tokens.windows(n) {
            let gram = window.join(" ");
            token_feature(&gram, dimension, &mut vec);
        }
    }

    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-8 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
    vec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::similarity::cosine;

    #[test]
    fn hashing_backend_is_deterministic_and_normalized() {
        let a = hashing_embed("what is the capital of France", 512);
        let b = hashing_embed("what is the capital of France", 512);
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn identical_texts_hit_the_cache_threshold() {
        let a = hashing_embed("Reset my password please", 512);
        let b = hashing_embed("reset my password please!", 512); // normalizes equal
        assert!(cosine(&a, &b) > 0.999);
    }

    #[test]
    fn unrelated_texts_stay_apart() {
        let a = hashing_embed("what is the capital of France", 512);
        let b = hashing_embed("compile error in tokio spawn lifetime bound", 512);
        assert!(cosine(&a, &b) < 0.5);
    }

    #[tokio::test]
    async fn embed_dispatches_to_hashing() {
        let e = Embedder::Hashing { dimension: 64 };
        let v = e.embed("hello world").await.unwrap();
        assert_eq!(v.len(), 64);
        assert_eq!(e.dimension_hint(), Some(64));
    }
}
