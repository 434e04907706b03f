// gatewally/src/redis_conn.rs
//
// Redis connector. Each Redis-backed subsystem (rate limiter, semantic
// cache, masker) opens its own ConnectionManager; key prefixes
// (`rate_limit:`, `cache:`, `mask:`) keep them from colliding.
//
// Without a reachable Redis the subsystems degrade to their in-process
// fallbacks — the gateway keeps serving, the operator gets a warning.

use redis::aio::ConnectionManager;
use tracing::warn;

pub async fn connect(url: &Option<String>) -> Option<ConnectionManager> {
    let url = url.as_deref()?;
    let client = match redis::Client::open(url) {
        Ok(c) => c,
        Err(e) => {
            warn!("Invalid Redis URL {url}: {e} — running on in-process state");
            return None;
        }
    };
    match client.get_connection_manager().await {
        Ok(manager) => Some(manager),
        Err(e) => {
            warn!("Redis unreachable at {url}: {e} — running on in-process state");
            None
        }
    }
}
