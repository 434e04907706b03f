// gatewally/src/cache/mod.rs
//
// Semantic response cache.
//
// Keys are `cache:<md5(query)>`; each entry is a hash of
//   { vector: little-endian f32 bytes, text: original query,
//     response: serialized completion envelope }
// with a TTL. Lookup embeds the query and linear-scans live keys for the
// best cosine match — nearest-neighbour over live cache keys; an ANN index
// can replace the scan without changing this interface.
//
// Every failure path (embedding, Redis, deserialization) degrades to a
// cache miss. The cache can slow a request down, never fail it.

pub mod similarity;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::embeddings::Embedder;
use crate::types::CompletionEnvelope;
use similarity::cosine;

const SCAN_BATCH: usize = 100;

struct MemoryEntry {
    vector:     Vec<f32>,
    response:   String,
    expires_at: Instant,
}

pub struct SemanticCache {
    redis:     Option<ConnectionManager>,
    memory:    DashMap<String, MemoryEntry>,
    embedder:  Option<Arc<Embedder>>,
    enabled:   bool,
    ttl:       u64,
    threshold: f32,
}

impl SemanticCache {
    pub fn new(
        config: &CacheConfig,
        redis: Option<ConnectionManager>,
        embedder: Option<Arc<Embedder>>,
    ) -> Self {
        Self {
            redis,
            memory:    DashMap::new(),
            embedder,
            enabled:   config.enabled,
            ttl:       config.ttl,
            threshold: config.similarity_threshold,
        }
    }

    /// Disabled cache — misses on get, noop on set.
    pub fn disabled() -> Self {
        Self {
            redis:     None,
            memory:    DashMap::new(),
            embedder:  None,
            enabled:   false,
            ttl:       0,
            threshold: 1.0,
        }
    }

    /// Best stored response with cosine similarity ≥ threshold, or None.
    pub async fn get(&self, query: &str) -> Option<CompletionEnvelope> {
        if !self.enabled {
            return None;
        }
        let embedder = self.embedder.as_ref()?;
        let query_vec = match embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Cache lookup embed failed: {e}");
                return None;
            }
        };

        let best = match &self.redis {
            Some(conn) => self.scan_redis(conn.clone(), &query_vec).await,
            None       => self.scan_memory(&query_vec),
        };

        let (similarity, response) = best?;
        if similarity < self.threshold {
            return None;
        }
        match serde_json::from_str(&response) {
            Ok(envelope) => {
                debug!("Cache hit, similarity={similarity:.4}");
                Some(envelope)
            }
            Err(e) => {
                warn!("Cache entry deserialize failed: {e}");
                None
            }
        }
    }

    /// Store a response keyed by the query's md5; last writer wins on races.
    pub async fn set(&self, query: &str, response: &CompletionEnvelope) {
        if !self.enabled {
            return;
        }
        let embedder = match &self.embedder {
            Some(e) => e,
            None    => return,
        };
        let vector = match embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Cache store embed failed: {e}");
                return;
            }
        };
        let json = match serde_json::to_string(response) {
            Ok(j) => j,
            Err(e) => {
                warn!("Cache store serialize failed: {e}");
                return;
            }
        };

        let key = format!("cache:{:x}", md5::compute(query.as_bytes()));

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let stored: redis::RedisResult<()> = redis::cmd("HSET")
                .arg(&key)
                .arg("vector")
                .arg(vector_to_bytes(&vector))
                .arg("text")
                .arg(query)
                .arg("response")
                .arg(&json)
                .query_async(&mut conn)
                .await;
            match stored {
                Ok(()) => {
                    let expired: redis::RedisResult<()> = redis::cmd("EXPIRE")
                        .arg(&key)
                        .arg(self.ttl)
                        .query_async(&mut conn)
                        .await;
                    if let Err(e) = expired {
                        warn!("Cache EXPIRE {key} failed: {e}");
                    }
                    return;
                }
                Err(e) => warn!("Cache HSET {key} failed: {e} — keeping entry in-process"),
            }
        }

        self.memory.insert(
            key,
            MemoryEntry {
                vector,
                response:   json,
                expires_at: Instant::now() + Duration::from_secs(self.ttl),
            },
        );
    }

    // ── Scans ─────────────────────────────────────────────────────────────────

    async fn scan_redis(
        &self,
        mut conn: ConnectionManager,
        query_vec: &[f32],
    ) -> Option<(f32, String)> {
        let mut cursor: u64 = 0;
        let mut best: Option<(f32, String)> = None;

        loop {
            let scanned: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("cache:*")
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await;
            let (next, keys) = match scanned {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Cache SCAN failed: {e}");
                    return None;
                }
            };

            for key in keys {
                let fields: redis::RedisResult<std::collections::HashMap<String, Vec<u8>>> =
                    redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await;
                let fields = match fields {
                    Ok(f) if !f.is_empty() => f,
                    _ => continue,
                };
                let vector = match fields.get("vector") {
                    Some(bytes) => bytes_to_vector(bytes),
                    None        => continue,
                };
                let response = match fields.get("response") {
                    Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    None        => continue,
                };

                let similarity = cosine(query_vec, &vector);
                if best.as_ref().map(|(s, _)| similarity > *s).unwrap_or(true) {
                    best = Some((similarity, response));
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        best
    }

    fn scan_memory(&self, query_vec: &[f32]) -> Option<(f32, String)> {
        let now = Instant::now();
        self.memory.retain(|_, entry| entry.expires_at > now);

        let mut best: Option<(f32, String)> = None;
        for entry in self.memory.iter() {
            let similarity = cosine(query_vec, &entry.vector);
            if best.as_ref().map(|(s, _)| similarity > *s).unwrap_or(true) {
                best = Some((similarity, entry.response.clone()));
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

// ── Vector codec ──────────────────────────────────────────────────────────────

fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn cache() -> SemanticCache {
        let config = CacheConfig {
            vector_dimension: 256,
            embedding_provider: "hashing".to_string(),
            ..CacheConfig::default()
        };
        let embedder = Arc::new(Embedder::Hashing { dimension: 256 });
        SemanticCache::new(&config, None, Some(embedder))
    }

    fn envelope(completion: &str) -> CompletionEnvelope {
        CompletionEnvelope {
            completion:        completion.to_string(),
            prompt_tokens:     10,
            completion_tokens: 20,
            total_tokens:      30,
            model:             "gpt-4o-mini".to_string(),
            cost_usd:          0.0021,
            provider:          "openai".to_string(),
        }
    }

    #[tokio::test]
    async fn identical_query_hits() {
        let c = cache();
        c.set("what is the capital of France", &envelope("Paris")).await;

        let hit = c.get("what is the capital of France").await.unwrap();
        assert_eq!(hit.completion, "Paris");
        assert_eq!(hit.total_tokens, 30);
    }

    #[tokio::test]
    async fn unrelated_query_misses() {
        let c = cache();
        c.set("what is the capital of France", &envelope("Paris")).await;
        assert!(c.get("rustc borrow checker lifetime error").await.is_none());
    }

    #[tokio::test]
    async fn best_of_several_entries_wins() {
        let c = cache();
        c.set("what is the capital of France", &envelope("Paris")).await;
        c.set("what is the capital of Germany", &envelope("Berlin")).await;
        c.set("how do I boil an egg", &envelope("gently")).await;

        let hit = c.get("what is the capital of Germany").await.unwrap();
        assert_eq!(hit.completion, "Berlin");
    }

    #[tokio::test]
    async fn disabled_cache_misses_and_ignores_set() {
        let c = SemanticCache::disabled();
        c.set("query", &envelope("stored")).await;
        assert!(c.get("query").await.is_none());
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn missing_embedder_is_a_miss_not_an_error() {
        let config = CacheConfig::default();
        let c = SemanticCache::new(&config, None, None);
        c.set("query", &envelope("stored")).await;
        assert!(c.get("query").await.is_none());
    }

    #[test]
    fn vector_codec_round_trips() {
        let v = vec![0.25f32, -1.5, 3.0e-7, 42.0];
        assert_eq!(bytes_to_vector(&vector_to_bytes(&v)), v);
    }
}
