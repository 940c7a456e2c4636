//! CPU worker pool
//!
//! Raster decode, resampling, meshing, stitching and encoding are all
//! CPU-bound and must never run on the async reactor. Jobs run on a
//! rayon pool sized to the machine's cores; the caller suspends on a
//! oneshot until its job finishes. Admission control lives in the
//! factory, which bounds in-flight tile requests rather than individual
//! jobs, so coalesced requests waiting on a shared fetch do not count
//! as queued CPU work.

use tokio::sync::oneshot;

use crate::core::error::{Error, Result};

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl WorkerPool {
    /// A pool with one thread per logical core
    pub fn new() -> Result<Self> {
        Self::with_threads(num_cpus::get())
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("terrain-worker-{}", i))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build worker pool: {}", e)))?;
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run a job on the pool, suspending the caller until it finishes
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = tx.send(job());
        });
        rx.await
            .map_err(|_| Error::Internal("worker dropped its result channel".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_and_return() {
        let pool = WorkerPool::with_threads(2).unwrap();
        let out = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_job_errors_propagate() {
        let pool = WorkerPool::with_threads(1).unwrap();
        let err = pool
            .run::<(), _>(|| Err(Error::MeshingFailed("bad grid".into())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MeshingFailed");
    }

    #[tokio::test]
    async fn test_jobs_run_off_the_reactor() {
        let pool = WorkerPool::with_threads(2).unwrap();
        let name = pool
            .run(|| {
                Ok(std::thread::current()
                    .name()
                    .unwrap_or_default()
                    .to_string())
            })
            .await
            .unwrap();
        assert!(name.starts_with("terrain-worker-"), "ran on {}", name);
    }

    #[tokio::test]
    async fn test_many_jobs_all_complete() {
        let pool = Arc::new(WorkerPool::with_threads(2).unwrap());
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let pool = pool.clone();
            let done = done.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 64);
    }
}
