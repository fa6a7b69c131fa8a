//! Gate lookup: the store interface, an in-memory store, and a read-through
//! TTL cache in front of any store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::gate::Gate;

#[async_trait]
pub trait GateStore: Send + Sync {
    /// Find a gate owned by `owner_id` whose name or id is `name_or_id`.
    async fn get_gate(&self, owner_id: &str, name_or_id: &str) -> Result<Option<Gate>>;
}

#[derive(Debug, Default)]
pub struct MemoryGateStore {
    gates: RwLock<Vec<Gate>>,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_gates(gates: Vec<Gate>) -> Self {
        Self {
            gates: RwLock::new(gates),
        }
    }

    /// Insert a gate, replacing any with the same owner and id.
    pub fn upsert(&self, gate: Gate) {
        if let Ok(mut gates) = self.gates.write() {
            gates.retain(|g| !(g.owner_id == gate.owner_id && g.id == gate.id));
            gates.push(gate);
        }
    }

    pub fn len(&self) -> usize {
        self.gates.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GateStore for MemoryGateStore {
    async fn get_gate(&self, owner_id: &str, name_or_id: &str) -> Result<Option<Gate>> {
        let gates = self
            .gates
            .read()
            .map_err(|_| GatewayError::config("gate store lock poisoned"))?;
        // Ids win over names when both match.
        let by_id = gates
            .iter()
            .find(|g| g.owner_id == owner_id && g.id == name_or_id);
        let found = by_id.or_else(|| {
            gates
                .iter()
                .find(|g| g.owner_id == owner_id && g.name == name_or_id)
        });
        Ok(found.cloned())
    }
}

#[async_trait]
pub trait GateCache: Send + Sync {
    async fn get(&self, owner_id: &str, name_or_id: &str) -> Result<Option<Gate>>;

    /// Cache a gate under both its name and its id.
    async fn put(&self, gate: &Gate) -> Result<()>;
}

struct CacheEntry {
    gate: Gate,
    inserted: Instant,
}

/// Names and ids live in separate key spaces, so a gate named like another
/// gate's id cannot displace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum KeyKind {
    Id,
    Name,
}

type CacheKey = (String, KeyKind, String);

/// Bounded in-process cache keyed by `(owner, name)` and `(owner, id)`.
/// Lookups try the id first, the same precedence as [`MemoryGateStore`].
pub struct MemoryGateCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryGateCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(2),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| GatewayError::config("gate cache lock poisoned"))
    }
}

#[async_trait]
impl GateCache for MemoryGateCache {
    async fn get(&self, owner_id: &str, name_or_id: &str) -> Result<Option<Gate>> {
        let mut entries = self.lock()?;
        for kind in [KeyKind::Id, KeyKind::Name] {
            let key = (owner_id.to_string(), kind, name_or_id.to_string());
            match entries.get(&key) {
                Some(entry) if entry.inserted.elapsed() < self.ttl => return Ok(Some(entry.gate.clone())),
                Some(_) => {
                    entries.remove(&key);
                }
                None => {}
            }
        }
        Ok(None)
    }

    async fn put(&self, gate: &Gate) -> Result<()> {
        let mut entries = self.lock()?;
        if entries.len() + 2 > self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted.elapsed() < ttl);
        }
        while entries.len() + 2 > self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => entries.remove(&key),
                None => break,
            };
        }

        let now = Instant::now();
        for (kind, key) in [(KeyKind::Name, &gate.name), (KeyKind::Id, &gate.id)] {
            entries.insert(
                (gate.owner_id.clone(), kind, key.clone()),
                CacheEntry {
                    gate: gate.clone(),
                    inserted: now,
                },
            );
        }
        Ok(())
    }
}

/// A store with an optional cache in front. Cache failures are logged and
/// the store is consulted instead.
pub struct CachedGateStore {
    store: Arc<dyn GateStore>,
    cache: Option<Arc<dyn GateCache>>,
}

impl CachedGateStore {
    pub fn new(store: Arc<dyn GateStore>, cache: Option<Arc<dyn GateCache>>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl GateStore for CachedGateStore {
    async fn get_gate(&self, owner_id: &str, name_or_id: &str) -> Result<Option<Gate>> {
        let Some(cache) = &self.cache else {
            return self.store.get_gate(owner_id, name_or_id).await;
        };

        match cache.get(owner_id, name_or_id).await {
            Ok(Some(gate)) => {
                debug!(owner = owner_id, gate = name_or_id, "Gate cache hit");
                return Ok(Some(gate));
            }
            Ok(None) => {}
            Err(e) => warn!(owner = owner_id, gate = name_or_id, "Gate cache read failed: {}", e),
        }

        let gate = self.store.get_gate(owner_id, name_or_id).await?;
        if let Some(gate) = &gate {
            if let Err(e) = cache.put(gate).await {
                warn!(owner = owner_id, gate = name_or_id, "Gate cache write failed: {}", e);
            }
        }
        Ok(gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gate(id: &str, name: &str, owner: &str) -> Gate {
        let mut gate = Gate::new(id, name, "gpt-4o-mini");
        gate.owner_id = owner.to_string();
        gate
    }

    struct CountingStore {
        inner: MemoryGateStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl GateStore for CountingStore {
        async fn get_gate(&self, owner_id: &str, name_or_id: &str) -> Result<Option<Gate>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_gate(owner_id, name_or_id).await
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl GateCache for BrokenCache {
        async fn get(&self, _owner_id: &str, _name_or_id: &str) -> Result<Option<Gate>> {
            Err(GatewayError::config("cache offline"))
        }

        async fn put(&self, _gate: &Gate) -> Result<()> {
            Err(GatewayError::config("cache offline"))
        }
    }

    #[tokio::test]
    async fn test_lookup_by_name_or_id_scoped_to_owner() {
        let store = MemoryGateStore::from_gates(vec![gate("g1", "support", "acme"), gate("g2", "support", "other")]);

        let by_name = store.get_gate("acme", "support").await.unwrap().unwrap();
        assert_eq!(by_name.id, "g1");
        let by_id = store.get_gate("other", "g2").await.unwrap().unwrap();
        assert_eq!(by_id.owner_id, "other");
        assert!(store.get_gate("acme", "g2").await.unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let store = MemoryGateStore::new();
        store.upsert(gate("g1", "support", "acme"));
        store.upsert(gate("g1", "renamed", "acme"));
        assert_eq!(store.len(), 1);
        let found = tokio_test::block_on(store.get_gate("acme", "renamed")).unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_read_through_cache_hits_by_name_and_id() {
        let store = Arc::new(CountingStore {
            inner: MemoryGateStore::from_gates(vec![gate("g1", "support", "acme")]),
            reads: AtomicUsize::new(0),
        });
        let cache = Arc::new(MemoryGateCache::new(Duration::from_secs(60), 16));
        let cached = CachedGateStore::new(store.clone(), Some(cache));

        cached.get_gate("acme", "support").await.unwrap().unwrap();
        cached.get_gate("acme", "support").await.unwrap().unwrap();
        cached.get_gate("acme", "g1").await.unwrap().unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let cache = MemoryGateCache::new(Duration::from_millis(20), 16);
        cache.put(&gate("g1", "support", "acme")).await.unwrap();
        assert!(cache.get("acme", "g1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("acme", "g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let cache = MemoryGateCache::new(Duration::from_secs(60), 4);
        for i in 0..5 {
            cache.put(&gate(&format!("g{i}"), &format!("n{i}"), "acme")).await.unwrap();
        }
        assert!(cache.lock().unwrap().len() <= 4);
        assert!(cache.get("acme", "g4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_name_colliding_with_id_does_not_shadow() {
        let first = gate("g1", "alpha", "acme");
        let second = gate("g2", "g1", "acme");
        let store = Arc::new(MemoryGateStore::from_gates(vec![first.clone(), second.clone()]));
        let cache = Arc::new(MemoryGateCache::new(Duration::from_secs(60), 16));
        cache.put(&first).await.unwrap();
        cache.put(&second).await.unwrap();

        let cached = cache.get("acme", "g1").await.unwrap().unwrap();
        let stored = store.get_gate("acme", "g1").await.unwrap().unwrap();
        assert_eq!(cached.id, "g1");
        assert_eq!(cached.id, stored.id);
        assert_eq!(cache.get("acme", "alpha").await.unwrap().unwrap().id, "g1");
        assert_eq!(cache.get("acme", "g2").await.unwrap().unwrap().id, "g2");
    }

    #[tokio::test]
    async fn test_broken_cache_falls_back_to_store() {
        let store = Arc::new(MemoryGateStore::from_gates(vec![gate("g1", "support", "acme")]));
        let cached = CachedGateStore::new(store, Some(Arc::new(BrokenCache)));
        let found = cached.get_gate("acme", "support").await.unwrap();
        assert_eq!(found.map(|g| g.id), Some("g1".to_string()));
    }
}
