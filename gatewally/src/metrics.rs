// gatewally/src/metrics.rs
//
// Gateway metrics registry + Prometheus text exposition.
//
// Metrics exposed:
//
//   gatewally_requests_total{provider,model,status}   Counter
//   gatewally_errors_total{error_type,provider}       Counter
//   gatewally_cache_hits_total                        Counter
//   gatewally_pii_detections_total{direction}         Counter
//   gatewally_guardrail_violations_total{rule,severity} Counter
//   gatewally_request_duration_seconds_bucket{le}     Histogram
//   gatewally_tokens_per_request_bucket{type,le}      Histogram
//   gatewally_cost_per_request_usd_bucket{le}         Histogram
//   gatewally_active_requests                         Gauge
//
// Prometheus endpoint: GET /metrics (raw TCP responder, default port 9091).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::info;

// ── Histogram buckets ─────────────────────────────────────────────────────────

const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
const TOKEN_BUCKETS:    &[f64] = &[100.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 20000.0];
const COST_BUCKETS:     &[f64] = &[0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

struct Histogram {
    bounds:  &'static [f64],
    buckets: Vec<AtomicU64>,
    count:   AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count:   AtomicU64::new(0),
        }
    }

    fn observe(&self, v: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if v <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String, name: &str, help: &str, extra_label: Option<(&str, &str)>) {
        out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} histogram\n"));
        let extra = extra_label
            .map(|(k, v)| format!("{k}=\"{v}\","))
            .unwrap_or_default();
        for (i, bound) in self.bounds.iter().enumerate() {
            out.push_str(&format!(
                "{name}_bucket{{{extra}le=\"{bound}\"}} {}\n",
                self.buckets[i].load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "{name}_bucket{{{extra}le=\"+Inf\"}} {c}\n{name}_count{{{extra2}}} {c}\n",
            c = self.count.load(Ordering::Relaxed),
            extra2 = extra.trim_end_matches(','),
        ));
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct GatewayMetrics {
    pub cache_hits:      AtomicU64,
    pub active_requests: AtomicI64,

    // Labeled counters
    requests:   Mutex<HashMap<(String, String, String), u64>>, // (provider, model, status)
    errors:     Mutex<HashMap<(String, String), u64>>,         // (error_type, provider)
    pii:        Mutex<HashMap<String, u64>>,                   // direction
    violations: Mutex<HashMap<(String, String), u64>>,         // (rule, severity)

    duration:          Histogram,
    prompt_tokens:     Histogram,
    completion_tokens: Histogram,
    cost:              Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache_hits:        AtomicU64::new(0),
            active_requests:   AtomicI64::new(0),
            requests:          Mutex::new(HashMap::new()),
            errors:            Mutex::new(HashMap::new()),
            pii:               Mutex::new(HashMap::new()),
            violations:        Mutex::new(HashMap::new()),
            duration:          Histogram::new(DURATION_BUCKETS),
            prompt_tokens:     Histogram::new(TOKEN_BUCKETS),
            completion_tokens: Histogram::new(TOKEN_BUCKETS),
            cost:              Histogram::new(COST_BUCKETS),
        })
    }

    pub fn record_request(&self, provider: &str, model: &str, status: &str) {
        *self
            .requests
            .lock()
            .entry((provider.to_string(), model.to_string(), status.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_error(&self, error_type: &str, provider: &str) {
        *self
            .errors
            .lock()
            .entry((error_type.to_string(), provider.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pii_detection(&self, direction: &str) {
        *self.pii.lock().entry(direction.to_string()).or_insert(0) += 1;
    }

    pub fn record_violation(&self, rule: &str, severity: &str) {
        *self
            .violations
            .lock()
            .entry((rule.to_string(), severity.to_string()))
            .or_insert(0) += 1;
    }

    pub fn observe_duration(&self, seconds: f64) {
        self.duration.observe(seconds);
    }

    pub fn observe_tokens(&self, prompt: u32, completion: u32) {
        self.prompt_tokens.observe(prompt as f64);
        self.completion_tokens.observe(completion as f64);
    }

    pub fn observe_cost(&self, usd: f64) {
        self.cost.observe(usd);
    }

    /// Counter value for one (error_type, provider) pair — test hook.
    pub fn error_count(&self, error_type: &str, provider: &str) -> u64 {
        self.errors
            .lock()
            .get(&(error_type.to_string(), provider.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Counter value for one (provider, model, status) triple — test hook.
    pub fn request_count(&self, provider: &str, model: &str, status: &str) -> u64 {
        self.requests
            .lock()
            .get(&(provider.to_string(), model.to_string(), status.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Render everything in Prometheus text exposition format.
    pub fn prometheus_text(&self) -> String {
        let mut out = String::with_capacity(4096);

        out.push_str("# HELP gatewally_requests_total Total requests by provider/model/status\n");
        out.push_str("# TYPE gatewally_requests_total counter\n");
        for ((provider, model, status), n) in self.requests.lock().iter() {
            out.push_str(&format!(
                "gatewally_requests_total{{provider=\"{provider}\",model=\"{model}\",status=\"{status}\"}} {n}\n"
            ));
        }

        out.push_str("# HELP gatewally_errors_total Total errors by type and provider\n");
        out.push_str("# TYPE gatewally_errors_total counter\n");
        for ((error_type, provider), n) in self.errors.lock().iter() {
            out.push_str(&format!(
                "gatewally_errors_total{{error_type=\"{error_type}\",provider=\"{provider}\"}} {n}\n"
            ));
        }

        out.push_str("# HELP gatewally_cache_hits_total Semantic cache hits\n");
        out.push_str("# TYPE gatewally_cache_hits_total counter\n");
        out.push_str(&format!(
            "gatewally_cache_hits_total {}\n",
            self.cache_hits.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP gatewally_pii_detections_total PII detections by direction\n");
        out.push_str("# TYPE gatewally_pii_detections_total counter\n");
        for (direction, n) in self.pii.lock().iter() {
            out.push_str(&format!(
                "gatewally_pii_detections_total{{direction=\"{direction}\"}} {n}\n"
            ));
        }

        out.push_str("# HELP gatewally_guardrail_violations_total Guardrail violations\n");
        out.push_str("# TYPE gatewally_guardrail_violations_total counter\n");
        for ((rule, severity), n) in self.violations.lock().iter() {
            out.push_str(&format!(
                "gatewally_guardrail_violations_total{{rule=\"{rule}\",severity=\"{severity}\"}} {n}\n"
            ));
        }

        out.push_str("# HELP gatewally_active_requests Requests currently in the pipeline\n");
        out.push_str("# TYPE gatewally_active_requests gauge\n");
        out.push_str(&format!(
            "gatewally_active_requests {}\n",
            self.active_requests.load(Ordering::Relaxed)
        ));

        self.duration.render(
            &mut out,
            "gatewally_request_duration_seconds",
            "Request duration in seconds",
            None,
        );
        self.prompt_tokens.render(
            &mut out,
            "gatewally_tokens_per_request",
            "Prompt tokens per request",
            Some(("type", "prompt")),
        );
        self.completion_tokens.render(
            &mut out,
            "gatewally_tokens_per_request",
            "Completion tokens per request",
            Some(("type", "completion")),
        );
        self.cost.render(
            &mut out,
            "gatewally_cost_per_request_usd",
            "Cost per request in USD",
            None,
        );

        out
    }
}

// ── HTTP /metrics endpoint ────────────────────────────────────────────────────

pub struct MetricsServer {
    pub metrics: Arc<GatewayMetrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<GatewayMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("/metrics endpoint listening on {}", self.addr);

        loop {
            let (mut stream, _) = listener.accept().await?;
            let metrics = Arc::clone(&self.metrics);

            tokio::spawn(async move {
                let body = metrics.prometheus_text();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(), body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }
}
