//! Request coalescer
//!
//! Single-flight fetching of processed windows. Concurrent tile requests
//! overlap heavily in the windows they need (a tile and its neighbor
//! share six of their nine windows), so each distinct [`WindowKey`] gets
//! at most one in-flight producer; everyone else subscribes to its
//! completion channel and receives the same shared grid.
//!
//! Cancellation policy: the producer task is detached, so a waiter going
//! away never cancels the shared work. Even with zero waiters left the
//! fetch runs to completion and populates the window cache, since the
//! window will almost always be wanted again by an adjacent tile.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::core::cache::WindowCache;
use crate::core::error::{Error, Result};
use crate::core::window::{ElevationGrid, WindowKey};

type FetchOutcome = std::result::Result<Arc<ElevationGrid>, Error>;
type PendingMap = Arc<Mutex<HashMap<WindowKey, broadcast::Sender<FetchOutcome>>>>;

pub struct Coalescer {
    cache: Arc<WindowCache>,
    pending: PendingMap,
}

impl Coalescer {
    pub fn new(cache: Arc<WindowCache>) -> Self {
        Self {
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &Arc<WindowCache> {
        &self.cache
    }

    /// Return the cached grid for `key`, or run `produce` exactly once
    /// across all concurrent callers and fan the result out.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &WindowKey,
        produce: F,
    ) -> Result<Arc<ElevationGrid>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ElevationGrid>> + Send + 'static,
    {
        if let Some(grid) = self.cache.get(key) {
            return Ok(grid);
        }

        let mut rx = {
            let mut pending = self.pending.lock().unwrap();
            // Re-check under the lock: the producer publishes to the
            // cache before retiring its pending entry, so a miss here
            // with no pending entry means we really are first
            if let Some(grid) = self.cache.get(key) {
                return Ok(grid);
            }
            match pending.get(key) {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    pending.insert(key.clone(), tx.clone());
                    spawn_producer(self.cache.clone(), self.pending.clone(), key.clone(), tx, produce());
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(Ok(grid)) => Ok(grid),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Internal(
                "window producer dropped without publishing".into(),
            )),
        }
    }

    /// Number of fetches currently in flight
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn spawn_producer<Fut>(
    cache: Arc<WindowCache>,
    pending: PendingMap,
    key: WindowKey,
    tx: broadcast::Sender<FetchOutcome>,
    fut: Fut,
) where
    Fut: Future<Output = Result<ElevationGrid>> + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = match fut.await {
            Ok(grid) => {
                let grid = Arc::new(grid);
                cache.insert(key.clone(), grid.clone());
                Ok(grid)
            }
            Err(err) => Err(err),
        };
        pending.lock().unwrap().remove(&key);
        // No receivers left is fine; the cache already has the result
        let _ = tx.send(outcome);
    });
}
