// gatewally/src/pipeline.rs
//
// The request pipeline — ordered gates:
//
//   rate-limit → PII scan → input guardrail → mask → cache lookup → budget
//   → upstream (failover) → cache store → output guardrail → unmask
//   → meter → audit → notify
//
// Ordering invariants:
//   - the input guardrail runs before masking (rules see raw text)
//   - the cache is keyed by raw text, masked or not
//   - the budget pre-check is skipped on a cache hit
//   - unmask is the final transformation of the outgoing completion
//   - audit and webhooks run strictly after the response exists; their
//     failure never reaches the caller
//
// Fire-and-forget work (guardrail rows, audit, budget tracking, webhooks)
// runs on a task tracker with owned inputs and its own storage handle; the
// tracker is joined on graceful shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::AuditWriter;
use crate::budget::{estimate_cost, BudgetMeter};
use crate::cache::SemanticCache;
use crate::config::GatewayConfig;
use crate::errors::{GatewayError, Result};
use crate::guardrails::{CheckInput, GuardrailEngine};
use crate::mask::PiiMasker;
use crate::metrics::GatewayMetrics;
use crate::pii::PiiDetector;
use crate::providers::failover::FailoverManager;
use crate::providers::router::AbRouter;
use crate::ratelimit::RateLimiter;
use crate::types::{
    ChatRequest, GatewayResponse, Principal, RequestRecord, RequestStatus, TokenUsage, Violation,
};
use crate::webhooks::WebhookDispatcher;

pub struct Pipeline {
    pub rate_limiter: Arc<RateLimiter>,
    pub detector:     Arc<PiiDetector>,
    pub masker:       Arc<PiiMasker>,
    pub cache:        Arc<SemanticCache>,
    pub guardrails:   Arc<GuardrailEngine>,
    pub budget:       Arc<BudgetMeter>,
    pub failover:     Arc<FailoverManager>,
    pub router:       Arc<AbRouter>,
    pub audit:        Arc<AuditWriter>,
    pub webhooks:     Arc<WebhookDispatcher>,
    pub metrics:      Arc<GatewayMetrics>,

    masking_enabled: bool,
    timeout_secs:    u64,
    tasks:           TaskTracker,
}

/// Everything the error path needs to know about how far a request got.
struct RequestContext {
    request_id:     Uuid,
    started:        Instant,
    provider_label: String,
    model_label:    String,
    messages:       Vec<crate::types::ChatMessage>,
    pii_detected:   bool,
    pii_entities:   Vec<crate::types::PiiEntity>,
    violations:     Vec<Violation>,
}

#[allow(clippy::too_many_arguments)]
impl Pipeline {
    pub fn new(
        config: &GatewayConfig,
        rate_limiter: Arc<RateLimiter>,
        detector: Arc<PiiDetector>,
        masker: Arc<PiiMasker>,
        cache: Arc<SemanticCache>,
        guardrails: Arc<GuardrailEngine>,
        budget: Arc<BudgetMeter>,
        failover: Arc<FailoverManager>,
        router: Arc<AbRouter>,
        audit: Arc<AuditWriter>,
        webhooks: Arc<WebhookDispatcher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            rate_limiter,
            detector,
            masker,
            cache,
            guardrails,
            budget,
            failover,
            router,
            audit,
            webhooks,
            metrics,
            masking_enabled: config.pii.masking.enabled,
            timeout_secs:    config.timeout.default,
            tasks:           TaskTracker::new(),
        }
    }

    /// Drive one request through every gate.
    pub async fn process(
        &self,
        principal: &Principal,
        request: ChatRequest,
    ) -> Result<GatewayResponse> {
        let mut ctx = RequestContext {
            request_id:     Uuid::new_v4(),
            started:        Instant::now(),
            provider_label: request.provider.clone().unwrap_or_else(|| "unknown".to_string()),
            model_label:    request.model.clone().unwrap_or_else(|| "unknown".to_string()),
            messages:       request.messages.clone(),
            pii_detected:   false,
            pii_entities:   Vec::new(),
            violations:     Vec::new(),
        };

        self.metrics.active_requests.fetch_add(1, Ordering::Relaxed);
        let outcome = self.run(principal, &request, &mut ctx).await;
        self.metrics.active_requests.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(response) => Ok(response),
            Err(e)       => Err(self.fail(principal, ctx, e)),
        }
    }

    async fn run(
        &self,
        principal: &Principal,
        request: &ChatRequest,
        ctx: &mut RequestContext,
    ) -> Result<GatewayResponse> {
        // 1. Admission.
        self.rate_limiter
            .check(&principal.id.to_string(), &principal.tier)
            .await?;

        // 2.–3. Raw text + input PII scan.
        let text = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let detection = self.detector.detect(&text, request.detection_mode);
        ctx.pii_detected = !detection.entities.is_empty();
        ctx.pii_entities = detection.entities.clone();
        if ctx.pii_detected {
            self.metrics.record_pii_detection("input");
        }

        // 4. Input guardrail — runs on raw text, before any masking.
        let verdict = self.guardrails.check(CheckInput {
            text:     Some(&text),
            entities: Some(&detection.entities),
            ..Default::default()
        });
        if !verdict.passed {
            self.note_violations(principal.id, &verdict.violations, ctx);
            if verdict.should_block {
                return Err(GatewayError::GuardrailViolation(verdict.violations));
            }
        }

        // 5. Masking — only the final message is rewritten.
        let mut session_id = String::new();
        if ctx.pii_detected && self.masking_enabled {
            let (masked_text, sid) = self.masker.mask(&text, &detection.entities).await;
            session_id = sid;
            if let Some(last) = ctx.messages.last_mut() {
                last.content = masked_text;
            }
        }

        // 6. Cache lookup — keyed by the raw text.
        let cached = self.cache.get(&text).await;
        let cache_hit = cached.is_some();

        // 7. Budget pre-check, skipped on a hit.
        if !cache_hit {
            self.budget
                .check(principal.id, estimate_cost(&text))
                .await?;
        }

        // 8.–9. Upstream call with failover, or the cached envelope at zero
        // cost.
        let envelope = match cached {
            Some(mut envelope) => {
                envelope.cost_usd = 0.0;
                self.metrics.record_cache_hit();
                debug!("Cache hit for request {}", ctx.request_id);
                envelope
            }
            None => {
                let (provider_name, model) = match &request.provider {
                    Some(p) => (p.clone(), request.model.clone()),
                    None => {
                        let (p, m) = self.router.route();
                        (p, Some(m))
                    }
                };
                ctx.provider_label = provider_name.clone();
                if let Some(m) = &model {
                    ctx.model_label = m.clone();
                }

                let upstream = self.failover.execute(
                    &ctx.messages,
                    &provider_name,
                    model.as_deref(),
                    request.max_tokens,
                    request.temperature,
                );
                let envelope = tokio::time::timeout(
                    Duration::from_secs(self.timeout_secs),
                    upstream,
                )
                .await
                .map_err(|_| GatewayError::Timeout(self.timeout_secs))??;

                self.cache.set(&text, &envelope).await;
                envelope
            }
        };
        ctx.provider_label = envelope.provider.clone();
        ctx.model_label = envelope.model.clone();

        // 10. Output scan + guardrail — only when the output carries PII.
        let mut completion = envelope.completion.clone();
        let output_detection = self.detector.detect(&completion, request.detection_mode);
        if !output_detection.entities.is_empty() {
            self.metrics.record_pii_detection("output");
            let verdict = self.guardrails.check(CheckInput {
                text:     Some(&completion),
                entities: Some(&output_detection.entities),
                ..Default::default()
            });
            if !verdict.passed {
                self.note_violations(principal.id, &verdict.violations, ctx);
                if verdict.should_block {
                    return Err(GatewayError::GuardrailViolation(verdict.violations));
                }
            }
        }

        // 11. Unmask last — nothing may rewrite the completion after this.
        if !session_id.is_empty() {
            completion = self.masker.unmask(&completion, &session_id).await;
        }

        // 12. Metering.
        let duration_ms = ctx.started.elapsed().as_millis() as u64;
        self.metrics
            .record_request(&envelope.provider, &envelope.model, "completed");
        self.metrics.observe_duration(duration_ms as f64 / 1000.0);
        self.metrics
            .observe_tokens(envelope.prompt_tokens, envelope.completion_tokens);
        self.metrics.observe_cost(envelope.cost_usd);

        // 13. Realised spend, fire-and-forget, with alert notifications.
        if !cache_hit {
            let budget    = Arc::clone(&self.budget);
            let webhooks  = Arc::clone(&self.webhooks);
            let principal_id = principal.id;
            let cost = envelope.cost_usd;
            self.tasks.spawn(async move {
                for alert in budget.track(principal_id, cost).await {
                    webhooks
                        .trigger(
                            "budget.alert",
                            serde_json::json!({
                                "user_id": principal_id.to_string(),
                                "threshold": alert.threshold,
                                "usage_ratio": alert.usage_ratio,
                                "current_spend": alert.current_spend,
                                "limit": alert.limit,
                                "timestamp": chrono::Utc::now().timestamp() as f64,
                            }),
                        )
                        .await;
                }
            });
        }

        // 14. Audit row (+ guardrail back-fill inside the writer).
        let record = RequestRecord {
            id:                   ctx.request_id,
            principal_id:         principal.id,
            request_timestamp:    chrono::Utc::now(),
            provider:             envelope.provider.clone(),
            model:                envelope.model.clone(),
            messages:             ctx.messages.clone(),
            completion:           completion.clone(),
            prompt_tokens:        envelope.prompt_tokens,
            completion_tokens:    envelope.completion_tokens,
            total_tokens:         envelope.total_tokens,
            cost_usd:             envelope.cost_usd,
            duration_ms,
            cache_hit,
            pii_detected:         ctx.pii_detected,
            pii_entities:         ctx.pii_entities.clone(),
            status:               RequestStatus::Completed,
            error_message:        None,
            guardrail_violations: ctx.violations.clone(),
        };
        let audit = Arc::clone(&self.audit);
        self.tasks.spawn(async move {
            audit.log_request(record).await;
        });

        // 15. Completion webhook.
        let webhooks = Arc::clone(&self.webhooks);
        let event_data = serde_json::json!({
            "request_id": ctx.request_id.to_string(),
            "user_id": principal.id.to_string(),
            "provider": envelope.provider.clone(),
            "model": envelope.model.clone(),
            "tokens": envelope.total_tokens,
            "cost": envelope.cost_usd,
            "timestamp": chrono::Utc::now().timestamp() as f64,
        });
        self.tasks.spawn(async move {
            webhooks.trigger("request.completed", event_data).await;
        });

        Ok(GatewayResponse {
            completion,
            tokens: TokenUsage {
                prompt:     envelope.prompt_tokens,
                completion: envelope.completion_tokens,
                total:      envelope.total_tokens,
            },
            cost:         envelope.cost_usd,
            cache_hit,
            pii_detected: ctx.pii_detected,
            pii_entities: if ctx.pii_detected { Some(ctx.pii_entities.clone()) } else { None },
            duration_ms,
            model:        envelope.model,
            provider:     envelope.provider,
            request_id:   ctx.request_id,
        })
    }

    /// Persist violations and count them, without blocking the request path.
    fn note_violations(&self, principal_id: Uuid, violations: &[Violation], ctx: &mut RequestContext) {
        for v in violations {
            self.metrics.record_violation(&v.rule_name, &v.severity.to_string());
        }
        ctx.violations.extend_from_slice(violations);

        let audit = Arc::clone(&self.audit);
        let owned: Vec<Violation> = violations.to_vec();
        self.tasks.spawn(async move {
            audit.log_violations(principal_id, &owned, None).await;
        });
    }

    /// Error-path side effects: metrics, audit row, failure webhook. The
    /// error itself passes straight through to the caller.
    fn fail(&self, principal: &Principal, ctx: RequestContext, error: GatewayError) -> GatewayError {
        let duration_ms = ctx.started.elapsed().as_millis() as u64;
        let status = match &error {
            GatewayError::GuardrailViolation(_) => RequestStatus::Blocked,
            GatewayError::BudgetExceeded { .. } => RequestStatus::BudgetExceeded,
            _                                   => RequestStatus::Failed,
        };

        self.metrics
            .record_request(&ctx.provider_label, &ctx.model_label, &status.to_string());
        self.metrics.record_error(error.kind(), &ctx.provider_label);
        info!(
            "Request {} {} after {duration_ms}ms: {error}",
            ctx.request_id, status
        );

        let record = RequestRecord {
            id:                   ctx.request_id,
            principal_id:         principal.id,
            request_timestamp:    chrono::Utc::now(),
            provider:             ctx.provider_label,
            model:                ctx.model_label,
            messages:             ctx.messages,
            completion:           String::new(),
            prompt_tokens:        0,
            completion_tokens:    0,
            total_tokens:         0,
            cost_usd:             0.0,
            duration_ms,
            cache_hit:            false,
            pii_detected:         ctx.pii_detected,
            pii_entities:         ctx.pii_entities,
            status,
            error_message:        Some(error.to_string()),
            guardrail_violations: ctx.violations,
        };
        let audit = Arc::clone(&self.audit);
        self.tasks.spawn(async move {
            audit.log_request(record).await;
        });

        let webhooks = Arc::clone(&self.webhooks);
        let event_data = serde_json::json!({
            "user_id": principal.id.to_string(),
            "error": error.to_string(),
            "timestamp": chrono::Utc::now().timestamp() as f64,
        });
        self.tasks.spawn(async move {
            webhooks.trigger("request.failed", event_data).await;
        });

        error
    }

    /// Join every fire-and-forget task. Call on graceful shutdown.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
