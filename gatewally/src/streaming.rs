// gatewally/src/streaming.rs
//
// Streaming orchestrator: the pipeline's admission gates, then the provider
// stream relayed chunk-by-chunk as SSE frames.
//
//   frame       data: <chunk>\n\n
//   terminator  data: [DONE]\n\n
//   error       data: [ERROR] <msg>\n\n   (then the stream closes)
//
// No cache, no budget pre-check, no output guardrail, no audit on this
// path. The completion hook receives the full buffered text when the
// stream ends, so a future output-side check can attach without reshaping
// the loop.
//
// Chunks are unmasked individually; the masking session is consumed by its
// first successful unmask, so sentinels split across chunk boundaries stay
// masked — a known limit of per-chunk rewriting.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::guardrails::{CheckInput, GuardrailEngine};
use crate::mask::PiiMasker;
use crate::pii::PiiDetector;
use crate::providers::router::AbRouter;
use crate::providers::ProviderRegistry;
use crate::ratelimit::RateLimiter;
use crate::types::{ChatRequest, Principal};

pub type CompletionHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct StreamOrchestrator {
    pub rate_limiter: Arc<RateLimiter>,
    pub detector:     Arc<PiiDetector>,
    pub masker:       Arc<PiiMasker>,
    pub guardrails:   Arc<GuardrailEngine>,
    pub registry:     Arc<ProviderRegistry>,
    pub router:       Arc<AbRouter>,

    masking_enabled: bool,
    on_complete:     Option<CompletionHook>,
}

impl StreamOrchestrator {
    pub fn new(
        config: &crate::config::GatewayConfig,
        rate_limiter: Arc<RateLimiter>,
        detector: Arc<PiiDetector>,
        masker: Arc<PiiMasker>,
        guardrails: Arc<GuardrailEngine>,
        registry: Arc<ProviderRegistry>,
        router: Arc<AbRouter>,
    ) -> Self {
        Self {
            rate_limiter,
            detector,
            masker,
            guardrails,
            registry,
            router,
            masking_enabled: config.pii.masking.enabled,
            on_complete:     None,
        }
    }

    /// Hook called with the full buffered completion when a stream ends
    /// cleanly. Placeholder seam for output-side symmetry with the
    /// non-streaming pipeline.
    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.on_complete = Some(hook);
        self
    }

    /// Run the pre-call gates and relay the upstream stream as SSE frames.
    /// Every failure, before or during the stream, becomes an [ERROR] frame
    /// — the SSE response itself has already committed to status 200.
    pub async fn stream(
        self: Arc<Self>,
        principal: Principal,
        request: ChatRequest,
    ) -> ReceiverStream<String> {
        let (tx, rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            if let Err(e) = self.drive(&principal, request, &tx).await {
                warn!("Streaming error: {e}");
                let _ = tx.send(format!("data: [ERROR] {e}\n\n")).await;
            }
        });

        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        principal: &Principal,
        request: ChatRequest,
        tx: &mpsc::Sender<String>,
    ) -> crate::errors::Result<()> {
        // Admission + input gates, same order as the pipeline.
        self.rate_limiter
            .check(&principal.id.to_string(), &principal.tier)
            .await?;

        let text = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let detection = self.detector.detect(&text, request.detection_mode);

        let verdict = self.guardrails.check(CheckInput {
            text:     Some(&text),
            entities: Some(&detection.entities),
            ..Default::default()
        });
        if verdict.should_block {
            return Err(crate::errors::GatewayError::GuardrailViolation(verdict.violations));
        }

        let mut messages = request.messages.clone();
        let mut session_id = String::new();
        if !detection.entities.is_empty() && self.masking_enabled {
            let (masked_text, sid) = self.masker.mask(&text, &detection.entities).await;
            session_id = sid;
            if let Some(last) = messages.last_mut() {
                last.content = masked_text;
            }
        }

        let (provider_name, model) = match &request.provider {
            Some(p) => (p.clone(), request.model.clone()),
            None => {
                let (p, m) = self.router.route();
                (p, Some(m))
            }
        };
        let provider = self.registry.get(&provider_name)?;
        let model = model.unwrap_or_else(|| provider.default_model().to_string());

        let mut upstream = provider
            .stream(&messages, &model, request.max_tokens, request.temperature)
            .await?;

        let mut full_completion = String::new();
        while let Some(chunk) = upstream.recv().await {
            let mut chunk = chunk?;
            full_completion.push_str(&chunk);

            if !session_id.is_empty() {
                chunk = self.masker.unmask(&chunk, &session_id).await;
            }
            if tx.send(format!("data: {chunk}\n\n")).await.is_err() {
                return Ok(()); // client went away — the loop just ends
            }
        }

        let _ = tx.send("data: [DONE]\n\n".to_string()).await;
        if let Some(hook) = &self.on_complete {
            hook(&full_completion);
        }
        Ok(())
    }
}
