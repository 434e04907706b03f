// gatewally/src/main.rs
//
// Gatewally — authenticated LLM gateway core.
//
// Three operational modes:
//   tail    — follow a JSONL feed of gateway requests (staging / shadowing)
//   replay  — run a captured feed through the pipeline once (testing)
//   detect  — PII-scan a file or stdin and print the entities
//
// Usage:
//   gatewally --mode tail --path /var/log/gateway/requests.jsonl
//   gatewally --mode replay --path captured.jsonl
//   gatewally --mode detect --path prompts.txt --pii-mode detailed
//
// Feed lines are JSON objects: {"api_key": "...", "messages": [...], ...}.
// The configured admin key authenticates as the admin principal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatewally::audit::AuditWriter;
use gatewally::auth::Authenticator;
use gatewally::budget::BudgetMeter;
use gatewally::cache::SemanticCache;
use gatewally::config::GatewayConfig;
use gatewally::embeddings::Embedder;
use gatewally::guardrails::GuardrailEngine;
use gatewally::mask::PiiMasker;
use gatewally::metrics::{GatewayMetrics, MetricsServer};
use gatewally::pii::PiiDetector;
use gatewally::pipeline::Pipeline;
use gatewally::providers::failover::FailoverManager;
use gatewally::providers::router::AbRouter;
use gatewally::providers::ProviderRegistry;
use gatewally::ratelimit::RateLimiter;
use gatewally::redis_conn;
use gatewally::store::MemoryStore;
use gatewally::types::{ChatRequest, DetectionMode};
use gatewally::webhooks::WebhookDispatcher;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "gatewally",
    about   = "Authenticated LLM gateway — PII masking, semantic cache, budgets, failover",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "config.yaml", help = "YAML configuration file")]
    config: PathBuf,

    #[arg(long, default_value = "/tmp/gatewally_feed.jsonl",
          help = "JSONL feed path (tail/replay) or text input (detect)")]
    path: PathBuf,

    #[arg(long, value_enum, default_value = "fast", help = "PII mode for detect")]
    pii_mode: PiiMode,

    #[arg(long, default_value = "9091", help = "Prometheus /metrics port")]
    metrics_port: u16,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,    // follow a live JSONL feed
    Replay,  // run a captured feed once
    Detect,  // PII-scan a file or stdin
}

#[derive(Clone, Copy, ValueEnum)]
enum PiiMode { Fast, Detailed }

/// One feed line: credential + the request body the HTTP surface would
/// have validated.
#[derive(Debug, Deserialize)]
struct FeedRequest {
    api_key: String,
    #[serde(flatten)]
    request: ChatRequest,
}

// ── Composition root ──────────────────────────────────────────────────────────

struct Gateway {
    pipeline: Arc<Pipeline>,
    auth:     Arc<Authenticator>,
    store:    Arc<MemoryStore>,
    metrics:  Arc<GatewayMetrics>,
}

async fn build_gateway(config: &GatewayConfig) -> Gateway {
    let store   = Arc::new(MemoryStore::new());
    let metrics = GatewayMetrics::new();

    // Connection per subsystem — prefixes keep the keyspaces apart.
    let limiter_conn = redis_conn::connect(&config.redis.url).await;
    let cache_conn   = redis_conn::connect(&config.redis.url).await;
    let masker_conn  = redis_conn::connect(&config.redis.url).await;

    let embedder = Arc::new(Embedder::from_config(&config.cache, &config.providers));
    let registry = Arc::new(ProviderRegistry::from_config(&config.providers));
    let router   = Arc::new(AbRouter::new(&config.ab_testing, registry.default_route()));

    let store_dyn: Arc<dyn gatewally::store::Store> = store.clone();
    let pipeline = Arc::new(Pipeline::new(
        config,
        Arc::new(RateLimiter::new(&config.rate_limiting, limiter_conn)),
        Arc::new(PiiDetector::new(None)),
        Arc::new(PiiMasker::new(masker_conn, config.pii.masking.session_ttl)),
        Arc::new(SemanticCache::new(&config.cache, cache_conn, Some(embedder))),
        Arc::new(GuardrailEngine::new(&config.guardrails)),
        Arc::new(BudgetMeter::new(&config.budget, store_dyn.clone())),
        Arc::new(FailoverManager::new(&config.fallback, registry, metrics.clone())),
        router,
        Arc::new(AuditWriter::new(store_dyn.clone())),
        Arc::new(WebhookDispatcher::new(&config.webhooks, store_dyn)),
        metrics.clone(),
    ));

    let auth = Arc::new(Authenticator::new(
        config.auth.admin_api_key.clone(),
        store.clone(),
    ));

    Gateway { pipeline, auth, store, metrics }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("   ██████╗  █████╗ ████████╗███████╗██╗    ██╗ █████╗ ██╗     ██╗  ██╗   ██╗");
    println!("  ██╔════╝ ██╔══██╗╚══██╔══╝██╔════╝██║    ██║██╔══██╗██║     ██║  ╚██╗ ██╔╝");
    println!("  ██║  ███╗███████║   ██║   █████╗  ██║ █╗ ██║███████║██║     ██║   ╚████╔╝ ");
    println!("  ██║   ██║██╔══██║   ██║   ██╔══╝  ██║███╗██║██╔══██║██║     ██║    ╚██╔╝  ");
    println!("  ╚██████╔╝██║  ██║   ██║   ███████╗╚███╔███╔╝██║  ██║███████╗███████╗██║   ");
    println!("   ╚═════╝ ╚═╝  ╚═╝   ╚═╝   ╚══════╝ ╚══╝╚══╝ ╚═╝  ╚═╝╚══════╝╚══════╝╚═╝   ");
    println!("\x1b[0m");
    println!("  \x1b[90mAuthenticated LLM gateway | masking · cache · budgets · failover\x1b[0m\n");
}

fn print_outcome(line_no: usize, result: &gatewally::Result<gatewally::types::GatewayResponse>) {
    match result {
        Ok(r) => {
            let cache = if r.cache_hit { " \x1b[96m[cache]\x1b[0m" } else { "" };
            let pii   = if r.pii_detected { " \x1b[93m[pii]\x1b[0m" } else { "" };
            println!(
                "\x1b[92m✓\x1b[0m #{line_no} {}/{} tokens={} cost=${:.6} {}ms{cache}{pii}",
                r.provider, r.model, r.tokens.total, r.cost, r.duration_ms
            );
        }
        Err(e) => {
            println!(
                "\x1b[91m✗\x1b[0m #{line_no} {} (HTTP {}) — {e}",
                e.kind(),
                e.http_status()
            );
        }
    }
}

async fn stats_loop(metrics: Arc<GatewayMetrics>, store: Arc<MemoryStore>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  logged={}  cache_hits={} ──\x1b[0m",
            elapsed,
            store.n_request_logs(),
            metrics.cache_hits.load(std::sync::atomic::Ordering::Relaxed),
        );
    }
}

// ── Feed sources ──────────────────────────────────────────────────────────────

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<FeedRequest>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {} // consume existing
    }

    info!("Tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<FeedRequest>(&line) {
                    Ok(req) => {
                        if tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Parse error: {e}"),
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<FeedRequest>) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedRequest>(line) {
            Ok(req) => {
                if tx.send(req).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("Parse error: {e}"),
        }
    }
    Ok(())
}

// ── Detect mode ───────────────────────────────────────────────────────────────

async fn run_detect(path: PathBuf, mode: DetectionMode) -> Result<()> {
    let text = if path.as_os_str() == "-" {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(&path).await?
    };

    let detector = PiiDetector::new(None);
    let result = detector.detect(&text, mode);

    for entity in &result.entities {
        println!("{}", serde_json::to_string(entity)?);
    }
    println!(
        "\x1b[90m{} entities, mode={}, {:.2}ms\x1b[0m",
        result.entities.len(),
        result.mode,
        result.processing_time_ms
    );
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("gatewally=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();

    if let Mode::Detect = cli.mode {
        let mode = match cli.pii_mode {
            PiiMode::Fast     => DetectionMode::Fast,
            PiiMode::Detailed => DetectionMode::Detailed,
        };
        return run_detect(cli.path, mode).await;
    }

    let config = if cli.config.exists() {
        GatewayConfig::load(&cli.config)?
    } else {
        info!("No config at {} — using defaults", cli.config.display());
        GatewayConfig::default()
    };

    let gateway = build_gateway(&config).await;
    let start   = Instant::now();
    let (tx, mut rx) = mpsc::channel::<FeedRequest>(4096);

    print_banner();

    // Prometheus scrape endpoint.
    let metrics_server = Arc::new(MetricsServer::new(
        gateway.metrics.clone(),
        ([0, 0, 0, 0], cli.metrics_port).into(),
    ));
    tokio::spawn(async move {
        if let Err(e) = metrics_server.serve().await {
            warn!("Metrics server stopped: {e}");
        }
    });

    // Stats printer.
    tokio::spawn(stats_loop(gateway.metrics.clone(), gateway.store.clone(), start));

    // Feed source.
    match cli.mode {
        Mode::Tail => {
            println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.path.display());
            let path = cli.path.clone();
            tokio::spawn(async move {
                if let Err(e) = tail_jsonl(path, tx, true).await {
                    warn!("Feed ended: {e}");
                }
            });
        }
        Mode::Replay => {
            println!("  Mode: \x1b[93mREPLAY\x1b[0m  |  {}", cli.path.display());
            let path = cli.path.clone();
            tokio::spawn(async move {
                if let Err(e) = replay_jsonl(path, tx).await {
                    warn!("Feed ended: {e}");
                }
            });
        }
        Mode::Detect => unreachable!("handled above"),
    }

    println!("  Metrics: \x1b[90mhttp://127.0.0.1:{}/metrics\x1b[0m", cli.metrics_port);
    println!("  Press Ctrl+C to stop.\n");

    // Consumer — one task per request, like any other gateway worker.
    let mut line_no = 0usize;
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(feed) = maybe else { break };
                line_no += 1;
                let pipeline = gateway.pipeline.clone();
                let auth     = gateway.auth.clone();
                let n        = line_no;
                tokio::spawn(async move {
                    let result = match auth.authenticate(&feed.api_key).await {
                        Ok(principal) => pipeline.process(&principal, feed.request).await,
                        Err(e)        => Err(e),
                    };
                    print_outcome(n, &result);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down — draining background tasks…");
                break;
            }
        }
    }

    gateway.pipeline.shutdown().await;
    info!("Drained. {} requests logged.", gateway.store.n_request_logs());
    Ok(())
}
