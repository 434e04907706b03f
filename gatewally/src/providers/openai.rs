// gatewally/src/providers/openai.rs
//
// OpenAI chat-completions backend.
//
// Retry policy: transient failures (HTTP 429, 5xx, transport errors) retry
// up to max_retries with exponential backoff retry_delay · 2^attempt.
// Anything else surfaces immediately as a provider error with the status.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{ModelPricing, ProviderConfig};
use crate::errors::{GatewayError, Result};
use crate::providers::cost_from_pricing;
use crate::types::{ChatMessage, CompletionEnvelope};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    client:            reqwest::Client,
    api_key:           String,
    pub default_model: String,
    pub models:        Vec<String>,
    pricing:           HashMap<String, ModelPricing>,
    max_retries:       u32,
    retry_delay:       f64,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client:        reqwest::Client::new(),
            api_key:       config.api_key.clone(),
            default_model: if config.default_model.is_empty() {
                "gpt-4o-mini".to_string()
            } else {
                config.default_model.clone()
            },
            models:        config.models.clone(),
            pricing:       config.pricing.clone(),
            max_retries:   config.max_retries.max(1),
            retry_delay:   config.retry_delay,
        }
    }

    fn request_body(
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        if let Some(mt) = max_tokens {
            body["max_tokens"] = mt.into();
        }
        if let Some(t) = temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if stream {
            body["stream"] = true.into();
        }
        body
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<CompletionEnvelope> {
        let body = Self::request_body(messages, model, max_tokens, temperature, false);

        let mut last_error = None;
        for attempt in 0..self.max_retries {
            let sent = self
                .client
                .post(API_URL)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match sent {
                Ok(resp) if resp.status().is_success() => {
                    let value: serde_json::Value = resp.json().await.map_err(|e| {
                        GatewayError::Provider {
                            provider: "openai".to_string(),
                            status:   None,
                            message:  format!("malformed response: {e}"),
                        }
                    })?;
                    return self.parse_completion(value, model);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let transient = status == 429 || status >= 500;
                    if !transient {
                        return Err(GatewayError::Provider {
                            provider: "openai".to_string(),
                            status:   Some(status),
                            message:  resp.text().await.unwrap_or_default(),
                        });
                    }
                    last_error = Some(GatewayError::Provider {
                        provider: "openai".to_string(),
                        status:   Some(status),
                        message:  "transient API error".to_string(),
                    });
                }
                Err(e) => {
                    last_error = Some(GatewayError::Provider {
                        provider: "openai".to_string(),
                        status:   None,
                        message:  e.to_string(),
                    });
                }
            }

            if attempt + 1 < self.max_retries {
                let backoff = self.retry_delay * 2f64.powi(attempt as i32);
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Provider {
            provider: "openai".to_string(),
            status:   None,
            message:  "retries exhausted".to_string(),
        }))
    }

    fn parse_completion(
        &self,
        value: serde_json::Value,
        model: &str,
    ) -> Result<CompletionEnvelope> {
        let completion = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let prompt_tokens     = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
        let total_tokens      = value["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or((prompt_tokens + completion_tokens) as u64) as u32;

        Ok(CompletionEnvelope {
            completion,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            model:    model.to_string(),
            cost_usd: self.cost(prompt_tokens, completion_tokens, model),
            provider: "openai".to_string(),
        })
    }

    /// Stream completion chunks into a channel. The receiver yields text
    /// deltas in arrival order; the task ends with the upstream stream.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        use futures_util::StreamExt;

        let body = Self::request_body(messages, model, max_tokens, temperature, true);
        let resp = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider {
                provider: "openai".to_string(),
                status:   None,
                message:  e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(GatewayError::Provider {
                provider: "openai".to_string(),
                status:   Some(resp.status().as_u16()),
                message:  "stream request rejected".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::Provider {
                                provider: "openai".to_string(),
                                status:   None,
                                message:  e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are newline-delimited `data: {json}` lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<serde_json::Value>(data) {
                        Ok(v) => {
                            if let Some(delta) = v["choices"][0]["delta"]["content"].as_str() {
                                if !delta.is_empty() && tx.send(Ok(delta.to_string())).await.is_err() {
                                    return; // receiver dropped
                                }
                            }
                        }
                        Err(e) => warn!("Unparseable stream frame: {e}"),
                    }
                }
            }
        });

        Ok(rx)
    }

    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32, model: &str) -> f64 {
        cost_from_pricing(&self.pricing, prompt_tokens, completion_tokens, model)
    }
}
