//! Content-addressed caching of finished document analyses.
//!
//! Keys are BLAKE3 fingerprints of the extracted document, so the same
//! content hits the same entry no matter which file or row carried it.
//! Values are the serialized [`DocumentAnalysis`](crate::schema::DocumentAnalysis)
//! JSON, which keeps the trait implementable over external stores.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::schema::FiscalDocument;

/// Hex BLAKE3 digest of the document's canonical JSON form.
pub fn fingerprint(document: &FiscalDocument) -> Result<String> {
    let bytes = serde_json::to_vec(document)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[async_trait]
pub trait AnalysisCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String) -> Result<()>;
}

struct MemoryEntry {
    value: String,
    stored_at: Instant,
}

/// Process-local cache. Entries past the TTL are dropped lazily on read;
/// without a TTL they live as long as the cache does.
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new(ttl_secs: Option<u64>) -> Self {
        MemoryCache {
            entries: Mutex::new(BTreeMap::new()),
            ttl: ttl_secs.map(Duration::from_secs),
        }
    }
}

#[async_trait]
impl AnalysisCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) => match self.ttl {
                Some(ttl) => entry.stored_at.elapsed() > ttl,
                None => false,
            },
            None => return Ok(None),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }
}

/// Per-fingerprint mutual exclusion. Holding the key's lock across the
/// read-compute-write sequence collapses concurrent analyses of identical
/// content into a single computation.
#[derive(Default)]
pub struct SingleFlight {
    locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        SingleFlight::default()
    }

    pub async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Prunes the key's entry once the registry holds the last reference.
    /// Callers drop their guard and their `Arc` clone first; if another
    /// task fetched the lock in the meantime the entry stays until that
    /// task releases it.
    pub async fn release(&self, key: &str) {
        let mut locks = self.locks.lock().await;
        let last_holder = match locks.get(key) {
            Some(entry) => Arc::strong_count(entry) == 1,
            None => false,
        };
        if last_holder {
            locks.remove(key);
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use crate::schema::DocumentKind;

    fn sample_document(total: i64) -> FiscalDocument {
        FiscalDocument {
            access_key: Some("35240311222333000181550010000000011000000017".to_string()),
            kind: DocumentKind::Invoice,
            number: Some("1".to_string()),
            series: Some("1".to_string()),
            issuer_tax_id: "11222333000181".to_string(),
            issuer_name: None,
            recipient_tax_id: None,
            recipient_name: None,
            issued_at: NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap(),
            declared_total: Decimal::new(total, 0),
            declared_tax: None,
            items: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = fingerprint(&sample_document(1_000)).unwrap();
        let b = fingerprint(&sample_document(1_000)).unwrap();
        let c = fingerprint(&sample_document(1_001)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        println!("✓ fingerprint {}", a);
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip() {
        let cache = MemoryCache::new(None);
        assert!(cache.get("k").await.unwrap().is_none());
        cache.put("k", "{\"x\":1}".to_string()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("{\"x\":1}"));
    }

    #[tokio::test]
    async fn test_ttl_expires_entries() {
        let cache = MemoryCache::new(Some(0));
        cache.put("k", "v".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_flight_hands_out_one_lock_per_key() {
        let flight = SingleFlight::new();
        let a = flight.lock_for("fp1").await;
        let b = flight.lock_for("fp1").await;
        let c = flight.lock_for("fp2").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let flight = SingleFlight::new();
        for i in 0..100 {
            let key = format!("fp{}", i);
            let lock = flight.lock_for(&key).await;
            {
                let _guard = lock.lock().await;
            }
            drop(lock);
            flight.release(&key).await;
        }
        assert!(flight.is_empty().await);
        println!("✓ lock registry is empty after every holder released");
    }

    #[tokio::test]
    async fn test_release_skips_entries_still_held_elsewhere() {
        let flight = SingleFlight::new();
        let held = flight.lock_for("fp").await;
        flight.release("fp").await;
        assert_eq!(flight.len().await, 1);
        drop(held);
        flight.release("fp").await;
        assert!(flight.is_empty().await);
    }

    #[tokio::test]
    async fn test_double_checked_read_computes_once() {
        let cache = Arc::new(MemoryCache::new(None));
        let flight = Arc::new(SingleFlight::new());
        let computations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let flight = Arc::clone(&flight);
            let computations = Arc::clone(&computations);
            handles.push(tokio::spawn(async move {
                let lock = flight.lock_for("fp").await;
                let _guard = lock.lock().await;
                if cache.get("fp").await.unwrap().is_some() {
                    return;
                }
                computations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                cache.put("fp", "done".to_string()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
        println!("✓ four concurrent analyses of the same content computed once");
    }
}
