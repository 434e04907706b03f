// gatewally/src/providers/gemini.rs
//
// Google Gemini backend.
//
// Gemini has no system role: system content is prepended to the first user
// message. Role names remap assistant → model. Token counts come from
// usageMetadata; the envelope shape is identical to every other backend.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{ModelPricing, ProviderConfig};
use crate::errors::{GatewayError, Result};
use crate::providers::cost_from_pricing;
use crate::types::{ChatMessage, CompletionEnvelope};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiProvider {
    client:            reqwest::Client,
    api_key:           String,
    pub default_model: String,
    pub models:        Vec<String>,
    pricing:           HashMap<String, ModelPricing>,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client:        reqwest::Client::new(),
            api_key:       config.api_key.clone(),
            default_model: if config.default_model.is_empty() {
                "gemini-1.5-flash".to_string()
            } else {
                config.default_model.clone()
            },
            models:        config.models.clone(),
            pricing:       config.pricing.clone(),
        }
    }

    /// Fold the OpenAI-style message list into Gemini contents.
    fn convert_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut contents = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system_parts.push(&msg.content),
                role => {
                    let gemini_role = if role == "assistant" { "model" } else { "user" };
                    let mut text = msg.content.clone();
                    if gemini_role == "user" && !system_parts.is_empty() {
                        let prefix = system_parts.join("\n");
                        text = format!("{prefix}\n{text}");
                        system_parts.clear();
                    }
                    contents.push(serde_json::json!({
                        "role": gemini_role,
                        "parts": [ { "text": text } ],
                    }));
                }
            }
        }

        // System-only input still has to reach the model.
        if !system_parts.is_empty() {
            contents.push(serde_json::json!({
                "role": "user",
                "parts": [ { "text": system_parts.join("\n") } ],
            }));
        }
        contents
    }

    fn request_body(
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> serde_json::Value {
        let mut generation_config = serde_json::Map::new();
        if let Some(mt) = max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), mt.into());
        }
        if let Some(t) = temperature {
            generation_config.insert("temperature".to_string(), serde_json::json!(t));
        }

        serde_json::json!({
            "contents": Self::convert_messages(messages),
            "generationConfig": generation_config,
        })
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<CompletionEnvelope> {
        let url = format!("{API_BASE}/{model}:generateContent?key={}", self.api_key);
        let body = Self::request_body(messages, max_tokens, temperature);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider {
                provider: "gemini".to_string(),
                status:   None,
                message:  e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(GatewayError::Provider {
                provider: "gemini".to_string(),
                status:   Some(resp.status().as_u16()),
                message:  resp.text().await.unwrap_or_default(),
            });
        }

        let value: serde_json::Value = resp.json().await.map_err(|e| GatewayError::Provider {
            provider: "gemini".to_string(),
            status:   None,
            message:  format!("malformed response: {e}"),
        })?;

        let completion = value["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let prompt_tokens =
            value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32;
        let completion_tokens =
            value["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;

        Ok(CompletionEnvelope {
            completion,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            model:    model.to_string(),
            cost_usd: self.cost(prompt_tokens, completion_tokens, model),
            provider: "gemini".to_string(),
        })
    }

    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        use futures_util::StreamExt;

        let url = format!(
            "{API_BASE}/{model}:streamGenerateContent?alt=sse&key={}",
            self.api_key
        );
        let body = Self::request_body(messages, max_tokens, temperature);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Provider {
                provider: "gemini".to_string(),
                status:   None,
                message:  e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(GatewayError::Provider {
                provider: "gemini".to_string(),
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
                                provider: "gemini".to_string(),
                                status:   None,
                                message:  e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    match serde_json::from_str::<serde_json::Value>(data) {
                        Ok(v) => {
                            if let Some(text) =
                                v["candidates"][0]["content"]["parts"][0]["text"].as_str()
                            {
                                if !text.is_empty() && tx.send(Ok(text.to_string())).await.is_err() {
                                    return;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage::new(role, content)
    }

    #[test]
    fn system_content_folds_into_first_user_message() {
        let contents = GeminiProvider::convert_messages(&[
            msg("system", "You are terse."),
            msg("user", "hi"),
            msg("assistant", "hello"),
            msg("user", "bye"),
        ]);

        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "You are terse.\nhi");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][0]["text"], "bye");
    }

    #[test]
    fn system_only_input_becomes_a_user_turn() {
        let contents = GeminiProvider::convert_messages(&[msg("system", "rules only")]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], "rules only");
    }
}
