//! Per-URI build cache.
//!
//! Each URI owns a slot guarded by its own mutex.  The first caller builds
//! while holding the slot lock, so concurrent first requests for one URI
//! block until that single build finishes and then share its result.
//! Requests for other URIs are never held up.  A failed build leaves the
//! slot empty; the next request tries again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Error;

type Slot<T> = Arc<Mutex<Option<Arc<T>>>>;

pub struct UriCache<T> {
    slots: DashMap<String, Slot<T>>,
    builds: AtomicUsize,
}

impl<T> Default for UriCache<T> {
    fn default() -> Self {
        UriCache { slots: DashMap::new(), builds: AtomicUsize::new(0) }
    }
}

impl<T> UriCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached value for `uri`, building it with `build` on first use.
    pub fn get_or_build(&self, uri: &str, build: impl FnOnce() -> Result<T, Error>) -> Result<Arc<T>, Error> {
        // Clone the slot out so the map shard is not locked during the build.
        let slot = self.slots.entry(uri.to_owned()).or_default().clone();
        let mut guard = slot.lock();
        if let Some(hit) = guard.as_ref() {
            debug!(uri, "template cache hit");
            return Ok(hit.clone());
        }
        debug!(uri, "template cache miss, building");
        let built = Arc::new(build()?);
        self.builds.fetch_add(1, Ordering::Relaxed);
        *guard = Some(built.clone());
        Ok(built)
    }

    pub fn get(&self, uri: &str) -> Option<Arc<T>> {
        let slot = self.slots.get(uri)?.clone();
        let guard = slot.lock();
        guard.clone()
    }

    pub fn remove(&self, uri: &str) -> bool {
        self.slots.remove(uri).is_some()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Number of URIs with a finished build.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|e| e.value().lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful builds since creation, cleared entries included.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn builds_once_and_shares() {
        let cache: UriCache<String> = UriCache::new();
        let a = cache.get_or_build("a", || Ok("A".to_owned())).unwrap();
        let b = cache.get_or_build("a", || panic!("built twice")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.build_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_build_is_retried() {
        let cache: UriCache<u32> = UriCache::new();
        assert!(cache.get_or_build("x", || Err(Error::Raised("nope".into()))).is_err());
        assert!(cache.get("x").is_none());
        assert_eq!(*cache.get_or_build("x", || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn clear_forces_rebuild() {
        let cache: UriCache<u32> = UriCache::new();
        cache.get_or_build("x", || Ok(1)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_build("x", || Ok(2)).unwrap(), 2);
        assert_eq!(cache.build_count(), 2);
    }

    #[test]
    fn concurrent_first_access_builds_once() {
        let cache: Arc<UriCache<u32>> = Arc::new(UriCache::new());
        let barrier = Arc::new(Barrier::new(8));
        let builds = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (cache, barrier, builds) = (cache.clone(), barrier.clone(), builds.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    let v = cache
                        .get_or_build("shared", || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(20));
                            Ok(42)
                        })
                        .unwrap();
                    *v
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
