use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

/// Content-derived fingerprint for deduplicating repeated work.
///
/// Keys are sha256 over the namespaced parts (e.g. operation, video id,
/// options) so identical requests across jobs hash to the same entry.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    value: String,
    inserted_at: DateTime<Utc>,
}

/// Shared read-many/write-once cache with TTL-only expiry.
///
/// The sole resource shared across jobs. Values are serialized by the caller;
/// a key is never overwritten, so concurrent jobs racing on the same input
/// agree on whichever result landed first.
pub struct FingerprintCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl FingerprintCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(key)?;
        if now - entry.inserted_at > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert if absent; an existing live entry wins.
    pub fn put(&self, key: &str, value: String, now: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap();
        match entries.get(key) {
            Some(existing) if now - existing.inserted_at <= self.ttl => {}
            _ => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value,
                        inserted_at: now,
                    },
                );
            }
        }
    }

    /// Drop expired entries. Called from the background sweep.
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, e| now - e.inserted_at <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinguishes_parts() {
        let a = fingerprint(&["transcript", "abc123", "en-US"]);
        let b = fingerprint(&["transcript", "abc123", "en-US"]);
        let c = fingerprint(&["transcript", "abc124", "en-US"]);
        // Part boundaries matter: "ab"+"c" != "a"+"bc".
        let d = fingerprint(&["transcript", "abc", "123en-US"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn get_respects_ttl() {
        let cache = FingerprintCache::new(Duration::seconds(60));
        let now = Utc::now();
        cache.put("k", "v".into(), now);

        assert_eq!(cache.get("k", now).as_deref(), Some("v"));
        assert_eq!(cache.get("k", now + Duration::seconds(61)), None);
    }

    #[test]
    fn put_is_write_once_while_live() {
        let cache = FingerprintCache::new(Duration::seconds(60));
        let now = Utc::now();
        cache.put("k", "first".into(), now);
        cache.put("k", "second".into(), now + Duration::seconds(1));
        assert_eq!(cache.get("k", now).as_deref(), Some("first"));

        // Past the TTL a fresh value may land.
        cache.put("k", "third".into(), now + Duration::seconds(120));
        assert_eq!(
            cache.get("k", now + Duration::seconds(121)).as_deref(),
            Some("third")
        );
    }

    #[test]
    fn evict_expired_drops_old_entries() {
        let cache = FingerprintCache::new(Duration::seconds(60));
        let now = Utc::now();
        cache.put("old", "v".into(), now);
        cache.put("new", "v".into(), now + Duration::seconds(59));

        cache.evict_expired(now + Duration::seconds(61));
        assert!(cache.get("old", now + Duration::seconds(61)).is_none());
        assert!(cache.get("new", now + Duration::seconds(61)).is_some());
    }
}
