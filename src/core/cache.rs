//! Processed-window cache
//!
//! In-memory LRU of decoded, resampled elevation grids keyed by
//! [`WindowKey`], bounded by a byte budget rather than an entry count
//! since window sizes vary with meshing method. The cache holds one
//! `Arc` reference per entry; lookups hand out clones and never pin
//! entries beyond the caller's scope.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::core::window::{ElevationGrid, WindowKey};

/// Default byte budget: 256 MiB
pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;

pub struct WindowCache {
    inner: Mutex<Inner>,
    budget: usize,
}

struct Inner {
    entries: LruCache<WindowKey, Arc<ElevationGrid>>,
    total_bytes: usize,
}

impl WindowCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                // The LRU order is what we use; the byte budget does the
                // actual bounding, so the entry cap just needs to be high
                entries: LruCache::new(NonZeroUsize::new(usize::MAX >> 1).unwrap()),
                total_bytes: 0,
            }),
            budget: budget_bytes.max(1),
        }
    }

    pub fn get(&self, key: &WindowKey) -> Option<Arc<ElevationGrid>> {
        self.inner.lock().unwrap().entries.get(key).cloned()
    }

    /// Insert a grid, evicting least-recently-used entries until the
    /// total fits the budget. Re-inserting an existing key is a no-op.
    pub fn insert(&self, key: WindowKey, grid: Arc<ElevationGrid>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains(&key) {
            return;
        }
        let size = grid.size_bytes();
        inner.entries.put(key, grid);
        inner.total_bytes += size;
        // The budget is a hard bound; a grid larger than the whole
        // budget gets evicted right back out
        while inner.total_bytes > self.budget {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.total_bytes -= evicted.size_bytes(),
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }
}
