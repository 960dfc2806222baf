use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use rustc_hash::FxHashMap;

/// A map that is read far more often than it is written. Readers get an immutable snapshot that
///  is unaffected by later updates, writers copy the map, modify the copy and publish it.
///
/// The lock is only ever held for cloning an [Arc] or for swapping it, so readers never wait
///  for a writer's closure to run.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
    update_lock: std::sync::Mutex<()>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
            update_lock: Default::default(),
        }
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load()
            .get(key)
            .cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.load().contains_key(key)
    }

    /// Updates are serialized with each other, but not with readers: a reader holding an older
    ///  snapshot keeps seeing it.
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let _update_guard = self.update_lock.lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut map: FxHashMap<K,V> = (*self.load()).clone();
        let result = f(&mut map);

        *self.map.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_drop() {
        let _ = AtomicMap::<u32, u32>::new();
    }

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();

        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
        assert!(map.contains_key(&1));
        assert!(!map.contains_key(&2));
    }

    #[test]
    fn test_update_result() {
        let map = AtomicMap::<u32, u32>::new();

        assert_eq!(None, map.update(|m| m.insert(1, 2)));
        assert_eq!(Some(2), map.update(|m| m.insert(1, 3)));
        assert_eq!(Some(3), map.get(&1));
    }

    #[test]
    fn test_snapshot_isolation() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| { m.insert(1, 1); });

        let snapshot = map.load();
        map.update(|m| {
            m.insert(2, 2);
            m.remove(&1);
        });

        assert_eq!(snapshot.get(&1), Some(&1));
        assert_eq!(snapshot.get(&2), None);
        assert_eq!(map.get(&1), None);
        assert_eq!(map.get(&2), Some(2));
    }

    #[test]
    fn test_concurrent_updates() {
        let map = Arc::new(AtomicMap::<u32, u32>::new());

        let handles = (0..4u32)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        map.update(|m| { m.insert(t*1000 + i, i); });
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(map.load().len(), 400);
    }
}
