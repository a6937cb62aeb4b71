//! Named deduplicating job queue
//!
//! A FIFO queue drained by a bounded pool of workers. Submitting under a
//! non-empty name collapses concurrent requests for the same work into one
//! execution (single-flight); workers run jobs outside the queue mutex and
//! exit when they find the queue empty.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::error::Result;

/// Default cap on concurrently running workers
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 1000;

type BoxedJob = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

struct NamedJob {
    name: String,
    job: BoxedJob,
}

#[derive(Default)]
struct JobState {
    queue: VecDeque<NamedJob>,
    names: HashSet<String>,
    active_workers: usize,
}

/// Deduplicating work queue with a bounded worker pool
pub struct JobManager {
    max_concurrent: usize,
    state: Arc<Mutex<JobState>>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_JOBS)
    }
}

impl JobManager {
    /// Create a job manager running at most `max_concurrent` jobs at once
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state: Arc::new(Mutex::new(JobState::default())),
        }
    }

    /// Enqueue `job` under `name`.
    ///
    /// If `name` is non-empty and a job with the same name is already
    /// enqueued or running, the submission is silently dropped; the earlier
    /// job's completion completes the logical operation for every caller.
    /// An empty name skips duplicate prevention.
    pub fn submit<F>(&self, name: impl Into<String>, job: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();

        let spawn_worker = {
            let Ok(mut state) = self.state.lock() else {
                error!("job queue mutex poisoned; dropping submission");
                return;
            };

            if !name.is_empty() {
                if state.names.contains(&name) {
                    return;
                }
                state.names.insert(name.clone());
            }
            state.queue.push_back(NamedJob {
                name,
                job: Box::pin(job),
            });

            if state.active_workers < self.max_concurrent {
                state.active_workers += 1;
                true
            } else {
                false
            }
        };

        if spawn_worker {
            let state = Arc::clone(&self.state);
            tokio::spawn(Self::worker(state));
        }
    }

    /// Number of jobs enqueued or running under a name
    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.names.len()).unwrap_or(0)
    }

    async fn worker(state: Arc<Mutex<JobState>>) {
        loop {
            let next = {
                let Ok(mut state) = state.lock() else { return };
                match state.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.active_workers -= 1;
                        return;
                    }
                }
            };

            // the job runs without holding the queue mutex
            if let Err(e) = next.job.await {
                error!(job = %next.name, error = %e, "Background job failed");
            }

            if !next.name.is_empty() {
                if let Ok(mut state) = state.lock() {
                    state.names.remove(&next.name);
                }
            }
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("max_concurrent", &self.max_concurrent)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run() {
        let manager = JobManager::new(4);
        let ran = Arc::new(AtomicU32::new(0));

        for i in 0..10 {
            let ran = ran.clone();
            manager.submit(format!("job-{i}"), async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while ran.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_names_collapse() {
        let manager = JobManager::new(8);
        let ran = Arc::new(AtomicU32::new(0));

        for _ in 0..100 {
            let ran = ran.clone();
            manager.submit("obtain:example.com", async move {
                ran.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_name_skips_dedup() {
        let manager = JobManager::new(8);
        let ran = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let ran = ran.clone();
            manager.submit("", async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while ran.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_name_reusable_after_completion() {
        let manager = JobManager::new(2);
        let ran = Arc::new(AtomicU32::new(0));

        let r = ran.clone();
        manager.submit("named", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let r = ran.clone();
        manager.submit("named", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while ran.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_worker_cap_respected() {
        let manager = JobManager::new(1);
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicU32::new(0));

        for i in 0..5 {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            let done = done.clone();
            manager.submit(format!("cap-{i}"), async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while done.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
