// gatewally/src/auth.rs
//
// Bearer credential verification.
//
// Two paths:
//   1. admin — constant-time equality against the configured static key;
//      yields the distinguished admin principal (bypasses per-key checks).
//   2. api key — bcrypt-compare against every active stored hash. Linear
//      scan; key counts are small by assumption.
//
// The store only ever holds salted bcrypt hashes. Plaintext keys exist at
// provisioning time and in the Authorization header, nowhere else.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::errors::{GatewayError, Result};
use crate::store::Store;
use crate::types::Principal;

pub struct Authenticator {
    admin_api_key: String,
    store:         Arc<dyn Store>,
}

impl Authenticator {
    pub fn new(admin_api_key: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self { admin_api_key: admin_api_key.into(), store }
    }

    /// Verify an Authorization header value ("Bearer <key>" or a raw key).
    pub async fn authenticate(&self, header: &str) -> Result<Principal> {
        let presented = strip_bearer(header);
        if presented.is_empty() {
            return Err(GatewayError::Authentication("missing API key".to_string()));
        }

        if constant_time_eq(presented.as_bytes(), self.admin_api_key.as_bytes()) {
            return Ok(Principal::admin());
        }

        for key in self.store.active_api_keys().await? {
            if bcrypt::verify(presented, &key.key_hash).unwrap_or(false) {
                return Ok(key.principal);
            }
        }

        Err(GatewayError::Authentication("invalid API key".to_string()))
    }

    /// Admin-only surfaces call this; anything but the admin key is a 403.
    pub fn verify_admin(&self, header: &str) -> Result<()> {
        let presented = strip_bearer(header);
        if constant_time_eq(presented.as_bytes(), self.admin_api_key.as_bytes()) {
            Ok(())
        } else {
            Err(GatewayError::Authentication("admin access required".to_string()))
        }
    }
}

fn strip_bearer(header: &str) -> &str {
    header.strip_prefix("Bearer ").unwrap_or(header).trim()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Provisioning helpers ──────────────────────────────────────────────────────

/// Generate a fresh plaintext API key. Shown once; only the hash is stored.
pub fn generate_api_key() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect();
    format!("sk-{token}")
}

pub fn hash_api_key(key: &str) -> Result<String> {
    bcrypt::hash(key, bcrypt::DEFAULT_COST)
        .map_err(|e| GatewayError::Storage(format!("bcrypt: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ApiKeyRecord;
    use uuid::Uuid;

    fn seeded_store(key: &str) -> (Arc<MemoryStore>, Principal) {
        let store = Arc::new(MemoryStore::new());
        let principal = Principal {
            id:       Uuid::new_v4(),
            name:     "alice".to_string(),
            is_admin: false,
            tier:     "default".to_string(),
        };
        // Low cost keeps the test fast; production uses DEFAULT_COST.
        let hash = bcrypt::hash(key, 4).unwrap();
        store.add_api_key(ApiKeyRecord {
            id:        Uuid::new_v4(),
            principal: principal.clone(),
            key_hash:  hash,
            active:    true,
        });
        (store, principal)
    }

    #[tokio::test]
    async fn bearer_prefix_and_raw_keys_both_work() {
        let (store, principal) = seeded_store("sk-test-123");
        let auth = Authenticator::new("admin-key", store);

        let p = auth.authenticate("Bearer sk-test-123").await.unwrap();
        assert_eq!(p.id, principal.id);
        let p = auth.authenticate("sk-test-123").await.unwrap();
        assert_eq!(p.id, principal.id);
    }

    #[tokio::test]
    async fn admin_key_yields_admin_principal() {
        let (store, _) = seeded_store("sk-test-123");
        let auth = Authenticator::new("admin-key", store);
        let p = auth.authenticate("Bearer admin-key").await.unwrap();
        assert!(p.is_admin);
        assert!(auth.verify_admin("admin-key").is_ok());
        assert!(auth.verify_admin("sk-test-123").is_err());
    }

    #[tokio::test]
    async fn wrong_or_missing_keys_are_rejected() {
        let (store, _) = seeded_store("sk-test-123");
        let auth = Authenticator::new("admin-key", store);
        assert!(auth.authenticate("Bearer nope").await.is_err());
        assert!(auth.authenticate("").await.is_err());
    }

    #[test]
    fn generated_keys_hash_and_verify() {
        let key = generate_api_key();
        assert!(key.starts_with("sk-"));
        let hash = bcrypt::hash(&key, 4).unwrap();
        assert!(bcrypt::verify(&key, &hash).unwrap());
        assert!(!bcrypt::verify("other", &hash).unwrap());
    }
}
