//! Supervised background tasks
//!
//! Periodic jobs (error retry, repair sweep, cache eviction, health check,
//! counter snapshots) and the replication worker pools run under a
//! `TaskSupervisor`. Each iteration runs in its own tokio task, so a panic
//! is caught at the join point, logged, and the loop carries on with the
//! next run. Periodic loops stop on the shutdown broadcast; workers stop
//! once their queue is closed and drained.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `shutdown` waits for tasks before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct TaskSupervisor {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, name: String, handle: JoinHandle<()>) {
        match self.handles.lock() {
            Ok(mut handles) => handles.push((name, handle)),
            Err(poisoned) => poisoned.into_inner().push((name, handle)),
        }
    }

    /// Run `job` after `initial_delay`, then every `period`, until shutdown
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => break,
                }
                if let Err(e) = tokio::spawn(job()).await {
                    if e.is_panic() {
                        error!(task = %task_name, "Task panicked, rescheduling");
                    }
                }
                delay = period;
            }
            debug!(task = %task_name, "Periodic task stopped");
        });
        info!(task = %name, period_secs = period.as_secs(), "Scheduled periodic task");
        self.track(name.to_string(), handle);
    }

    /// Run `count` workers built by `make`. A worker that panics is
    /// restarted; one that returns normally is done.
    pub fn spawn_workers<F, Fut>(&self, name: &str, count: usize, make: F)
    where
        F: Fn(usize) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        for index in 0..count {
            let make = make.clone();
            let task_name = format!("{}-{}", name, index);
            let worker_name = task_name.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match tokio::spawn(make(index)).await {
                        Ok(()) => break,
                        Err(e) if e.is_panic() => {
                            error!(task = %worker_name, "Worker panicked, restarting");
                        }
                        Err(_) => break,
                    }
                }
            });
            self.track(task_name, handle);
        }
        info!(pool = %name, workers = count, "Started worker pool");
    }

    /// Stop periodic tasks and wait for everything to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        for (name, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(task = %name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_task_runs_until_shutdown() {
        let supervisor = TaskSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        supervisor.spawn_periodic("tick", Duration::ZERO, Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;
        let after_shutdown = runs.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_panicking_task_is_rescheduled() {
        let supervisor = TaskSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        supervisor.spawn_periodic("flaky", Duration::ZERO, Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_worker_restarted_after_panic() {
        let supervisor = TaskSupervisor::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        supervisor.spawn_workers("worker", 1, move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("worker crashed");
                }
            }
        });

        supervisor.shutdown().await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }
}
