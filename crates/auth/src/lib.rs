//! Token validation caches. The bad-auth cache is a negative cache of
//! recently rejected bearer tokens; the decision cache holds full
//! validation decisions. Losing either only forces re-validation.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

const BAD_AUTH_TTL: Duration = Duration::from_secs(30);

/// Process-wide map from rejected token to expiry. Initialized once at
/// startup and passed by reference; never package-level state.
#[derive(Debug, Default)]
pub struct BadAuthCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl BadAuthCache {
    pub fn new() -> BadAuthCache {
        BadAuthCache::default()
    }

    /// Record a failed validation. Empty tokens are ignored.
    pub fn add(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.insert(token.to_string(), Instant::now() + BAD_AUTH_TTL);
    }

    /// Whether the token failed validation within the TTL. Expired entries
    /// are removed opportunistically on lookup.
    pub fn contains(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let mut entries = self.entries.lock().unwrap();
        match entries.get(token) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                entries.remove(token);
                false
            }
            None => false,
        }
    }
}

/// Constant-shape bearer comparison against the configured secret.
/// A mismatch is recorded in the cache by the caller.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && presented == expected
}

/// A cached validation decision. One whose expiry has passed is treated as
/// absent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Decision {
    pub permitted: bool,
    pub expires_at: Instant,
    /// Small validator-specific code explaining the decision.
    pub reason: u8,
}

/// Process-wide cache of validation decisions, read-mostly: lookups take
/// the read lock so readers never block each other.
#[derive(Debug, Default)]
pub struct DecisionCache {
    entries: RwLock<HashMap<String, Decision>>,
}

impl DecisionCache {
    pub fn new() -> DecisionCache {
        DecisionCache::default()
    }

    pub fn set(&self, token: &str, permitted: bool, ttl: Duration, reason: u8) {
        if token.is_empty() {
            return;
        }
        let decision = Decision {
            permitted,
            expires_at: Instant::now() + ttl,
            reason,
        };
        self.entries
            .write()
            .unwrap()
            .insert(token.to_string(), decision);
    }

    pub fn get(&self, token: &str) -> Option<Decision> {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read().unwrap();
            match entries.get(token) {
                Some(decision) if decision.expires_at > now => return Some(*decision),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.entries.write().unwrap().remove(token);
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_then_contains() {
        let cache = BadAuthCache::new();
        assert!(!cache.contains("tok"));
        cache.add("tok");
        assert!(cache.contains("tok"));
        assert!(!cache.contains("other"));
    }

    #[test]
    fn test_empty_tokens_are_ignored() {
        let cache = BadAuthCache::new();
        cache.add("");
        assert!(!cache.contains(""));
    }

    #[test]
    fn test_expired_entries_are_removed_on_lookup() {
        let cache = BadAuthCache::new();
        cache.add("tok");
        // Rewind the entry past its TTL instead of sleeping 30 s.
        {
            let mut entries = cache.entries.lock().unwrap();
            let expired = Instant::now() - Duration::from_secs(1);
            entries.insert("tok".to_string(), expired);
        }
        assert!(!cache.contains("tok"));
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_decision_cache_round_trip() {
        let cache = DecisionCache::new();
        assert_eq!(cache.get("tok"), None);

        cache.set("tok", true, Duration::from_secs(60), 0);
        let decision = cache.get("tok").unwrap();
        assert!(decision.permitted);
        assert_eq!(decision.reason, 0);

        cache.set("bad", false, Duration::from_secs(60), 3);
        assert!(!cache.get("bad").unwrap().permitted);
    }

    #[test]
    fn test_expired_decisions_are_absent() {
        let cache = DecisionCache::new();
        cache.set("tok", true, Duration::from_secs(60), 0);
        {
            let mut entries = cache.entries.write().unwrap();
            entries.get_mut("tok").unwrap().expires_at = Instant::now() - Duration::from_secs(1);
        }
        assert_eq!(cache.get("tok"), None);
        assert!(cache.entries.read().unwrap().is_empty());
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("wrong", "secret"));
        assert!(!token_matches("", "secret"));
        assert!(!token_matches("", ""));
    }
}
