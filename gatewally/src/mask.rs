// gatewally/src/mask.rs
//
// Reversible PII masking sessions.
//
// mask() rewrites each entity right-to-left (so byte offsets stay valid)
// into a sentinel `<KIND:session_id:KIND_idx>` and stores the
// `{entity_id → original}` map under `mask:<session_id>` with a TTL.
// unmask() substitutes the originals back and consumes the session.
//
// The mapping lives in Redis when a connection is configured; otherwise in
// an in-process map with the same TTL semantics. A Redis write failure also
// falls back to the in-process map — losing a mapping would strand
// sentinels in the completion, which is worse than a process-local session.
//
// A single in-process mutex serialises mask/unmask: it protects session-id
// minting and keeps the read-substitute-delete sequence of unmask atomic
// within the process.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::ConnectionManager;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::PiiEntity;

pub struct PiiMasker {
    redis:    Option<ConnectionManager>,
    sessions: DashMap<String, (HashMap<String, String>, Instant)>, // sid → (map, expiry)
    ttl:      u64,
    lock:     Mutex<()>,
}

impl PiiMasker {
    pub fn new(redis: Option<ConnectionManager>, session_ttl: u64) -> Self {
        Self {
            redis,
            sessions: DashMap::new(),
            ttl: session_ttl,
            lock: Mutex::new(()),
        }
    }

    /// Mask all entities in `text`. Returns `(masked_text, session_id)`;
    /// an empty entity list returns the text untouched with an empty id.
    pub async fn mask(&self, text: &str, entities: &[PiiEntity]) -> (String, String) {
        if entities.is_empty() {
            return (text.to_string(), String::new());
        }

        let _guard = self.lock.lock().await;
        let session_id = Uuid::new_v4().simple().to_string();
        let mut mapping: HashMap<String, String> = HashMap::new();

        // The pattern families can emit nested spans (a phone-shaped run
        // inside a TCKN). Keep the widest-leftmost span of each overlap
        // group, then splice right-to-left so earlier offsets stay valid.
        let mut sorted: Vec<&PiiEntity> = entities.iter().collect();
        sorted.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        let mut kept: Vec<&PiiEntity> = Vec::new();
        for entity in sorted {
            if kept.last().map(|k| entity.start < k.end).unwrap_or(false) {
                continue;
            }
            kept.push(entity);
        }

        let mut masked = text.to_string();
        for (idx, entity) in kept.iter().rev().enumerate() {
            let entity_id = format!("{}_{idx}", entity.kind);
            let sentinel  = format!("<{}:{session_id}:{entity_id}>", entity.kind);
            masked = format!("{}{}{}", &masked[..entity.start], sentinel, &masked[entity.end..]);
            mapping.insert(entity_id, entity.text.clone());
        }

        self.store_session(&session_id, &mapping).await;
        (masked, session_id)
    }

    /// Substitute stored originals back into `text` and consume the session.
    /// Unknown ids stay as-is; unknown or expired sessions return the text
    /// unchanged.
    pub async fn unmask(&self, text: &str, session_id: &str) -> String {
        if session_id.is_empty() {
            return text.to_string();
        }

        let _guard = self.lock.lock().await;
        let mapping = match self.load_session(session_id).await {
            Some(m) => m,
            None    => return text.to_string(),
        };

        let pattern = format!(
            "<([A-Z_]+):{}:([A-Z_]+_\\d+)>",
            regex::escape(session_id)
        );
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!("Unmask pattern build failed: {e}");
                return text.to_string();
            }
        };

        let unmasked = re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                mapping
                    .get(&caps[2])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();

        self.delete_session(session_id).await;
        unmasked
    }

    // ── Session storage ───────────────────────────────────────────────────────

    async fn store_session(&self, session_id: &str, mapping: &HashMap<String, String>) {
        let json = match serde_json::to_string(mapping) {
            Ok(j) => j,
            Err(e) => {
                warn!("Mask session serialize failed: {e}");
                self.store_local(session_id, mapping.clone());
                return;
            }
        };

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let key = format!("mask:{session_id}");
            let result: redis::RedisResult<()> = redis::cmd("SETEX")
                .arg(&key)
                .arg(self.ttl)
                .arg(&json)
                .query_async(&mut conn)
                .await;
            match result {
                Ok(()) => {
                    debug!("Mask session {session_id} stored ({} entries)", mapping.len());
                    return;
                }
                Err(e) => warn!("Redis SETEX {key} failed: {e} — keeping session in-process"),
            }
        }
        self.store_local(session_id, mapping.clone());
    }

    fn store_local(&self, session_id: &str, mapping: HashMap<String, String>) {
        let expiry = Instant::now() + Duration::from_secs(self.ttl);
        self.sessions.insert(session_id.to_string(), (mapping, expiry));
    }

    async fn load_session(&self, session_id: &str) -> Option<HashMap<String, String>> {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let key = format!("mask:{session_id}");
            let loaded: redis::RedisResult<Option<String>> =
                redis::cmd("GET").arg(&key).query_async(&mut conn).await;
            match loaded {
                Ok(Some(json)) => {
                    if let Ok(mapping) = serde_json::from_str(&json) {
                        return Some(mapping);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Redis GET {key} failed: {e}"),
            }
        }

        let entry = self.sessions.get(session_id)?;
        let (mapping, expiry) = entry.value();
        if *expiry <= Instant::now() {
            drop(entry);
            self.sessions.remove(session_id);
            return None;
        }
        Some(mapping.clone())
    }

    async fn delete_session(&self, session_id: &str) {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let key = format!("mask:{session_id}");
            let result: redis::RedisResult<()> =
                redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
            if let Err(e) = result {
                warn!("Redis DEL {key} failed: {e}");
            }
        }
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pii::patterns::detect_patterns;
    use crate::types::PiiKind;

    fn masker() -> PiiMasker {
        PiiMasker::new(None, 3600)
    }

    #[tokio::test]
    async fn mask_then_unmask_round_trips() {
        let m = masker();
        let text = "Call 555-123-4567 or write test@example.com";
        let entities = detect_patterns(text);
        assert_eq!(entities.len(), 2);

        let (masked, sid) = m.mask(text, &entities).await;
        assert!(!sid.is_empty());
        assert!(!masked.contains("555-123-4567"));
        assert!(!masked.contains("test@example.com"));
        assert!(masked.contains(&format!("<PHONE:{sid}:")));
        assert!(masked.contains(&format!("<EMAIL:{sid}:")));

        let unmasked = m.unmask(&masked, &sid).await;
        assert_eq!(unmasked, text);
    }

    #[tokio::test]
    async fn session_is_consumed_on_first_unmask() {
        let m = masker();
        let text = "mail test@example.com now";
        let entities = detect_patterns(text);
        let (masked, sid) = m.mask(text, &entities).await;

        assert_eq!(m.unmask(&masked, &sid).await, text);
        // Second unmask: session is gone, sentinels stay.
        assert_eq!(m.unmask(&masked, &sid).await, masked);
    }

    #[tokio::test]
    async fn unknown_session_leaves_text_unchanged() {
        let m = masker();
        let text = "some <EMAIL:deadbeef:EMAIL_0> sentinel";
        assert_eq!(m.unmask(text, "deadbeef").await, text);
        assert_eq!(m.unmask(text, "").await, text);
    }

    #[tokio::test]
    async fn no_entities_is_a_noop() {
        let m = masker();
        let (masked, sid) = m.mask("nothing sensitive here", &[]).await;
        assert_eq!(masked, "nothing sensitive here");
        assert!(sid.is_empty());
    }

    #[tokio::test]
    async fn unknown_entity_ids_survive_unmask() {
        let m = masker();
        let text = "id 10000000146 ok";
        let entities: Vec<_> = detect_patterns(text)
            .into_iter()
            .filter(|e| e.kind == PiiKind::Tckn)
            .collect();
        let (masked, sid) = m.mask(text, &entities).await;

        // Splice in a sentinel the session never issued.
        let tampered = format!("{masked} <TCKN:{sid}:TCKN_99>");
        let unmasked = m.unmask(&tampered, &sid).await;
        assert!(unmasked.contains("10000000146"));
        assert!(unmasked.contains(&format!("<TCKN:{sid}:TCKN_99>")));
    }

    #[tokio::test]
    async fn expired_local_sessions_are_dropped() {
        let m = PiiMasker::new(None, 0); // immediate expiry
        let text = "mail test@example.com now";
        let entities = detect_patterns(text);
        let (masked, sid) = m.mask(text, &entities).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(m.unmask(&masked, &sid).await, masked);
    }

    #[tokio::test]
    async fn nested_spans_mask_as_one_sentinel_and_round_trip() {
        let m = masker();
        // A valid TCKN also contains a phone-shaped digit run; both pattern
        // families fire with overlapping spans.
        let text = "id 10000000146 on file";
        let entities = detect_patterns(text);
        assert!(entities.len() >= 2);

        let (masked, sid) = m.mask(text, &entities).await;
        assert!(!masked.contains("10000000146"));
        assert!(!masked.contains("0000000146"));
        assert_eq!(m.unmask(&masked, &sid).await, text);
    }

    #[tokio::test]
    async fn multibyte_text_masks_on_byte_offsets() {
        let m = masker();
        let text = "çağrı: 555-123-4567 bitti";
        let entities = detect_patterns(text);
        let (masked, sid) = m.mask(text, &entities).await;
        assert!(masked.starts_with("çağrı: "));
        assert_eq!(m.unmask(&masked, &sid).await, text);
    }
}
