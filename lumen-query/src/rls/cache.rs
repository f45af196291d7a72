use super::{AccessRequest, RlsFilterResponse, RlsPolicy, UserSecurityContext};
use lumen_core::{Result, RlsConfig, TtlCache};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Cache of evaluated access decisions, shared between requests
pub trait PolicyCache: Send + Sync {
    fn get(&self, key: &str) -> Option<RlsFilterResponse>;
    fn insert(&self, key: String, response: RlsFilterResponse);
    /// Drop everything, e.g. after policies were edited
    fn invalidate_all(&self);
}

pub struct TtlPolicyCache {
    entries: TtlCache<String, RlsFilterResponse>,
}

impl TtlPolicyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: TtlCache::with_ttl(max_entries, ttl),
        }
    }

    pub fn from_config(config: &RlsConfig) -> Self {
        Self::new(config.cache_max_entries, config.cache_ttl())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PolicyCache for TtlPolicyCache {
    fn get(&self, key: &str) -> Option<RlsFilterResponse> {
        self.entries.get(&key.to_string())
    }

    fn insert(&self, key: String, response: RlsFilterResponse) {
        self.entries.insert(key, response);
    }

    fn invalidate_all(&self) {
        self.entries.clear();
    }
}

/// Fingerprint of every input to an access decision.
///
/// Keys are content hashes, so a cached response can only be returned for
/// the exact same context, policy list and request it was computed from.
pub fn policy_cache_key(
    config: &RlsConfig,
    context: &UserSecurityContext,
    policies: &[RlsPolicy],
    request: &AccessRequest,
) -> Result<String> {
    let mut bypass: Vec<&String> = config.bypass_roles.iter().collect();
    bypass.sort();

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&(
        config.dialect(),
        config.default_deny,
        config.allow_expressions,
        bypass,
    ))?);
    hasher.update(serde_json::to_vec(context)?);
    hasher.update(serde_json::to_vec(policies)?);
    hasher.update(serde_json::to_vec(request)?);
    Ok(hex::encode(hasher.finalize()))
}
