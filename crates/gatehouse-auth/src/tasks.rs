//! Periodic background jobs with explicit cancellation.
//!
//! Sweeps are an optimization: every read path re-checks expiry, so a sweep
//! that never starts, fails, or is stopped only delays reclamation.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to a running periodic job.
#[derive(Debug)]
pub struct CleanupHandle {
    name: &'static str,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Job name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` once the job has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the job and waits for the current tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(task = self.name, error = %e, "cleanup task ended abnormally");
        }
    }
}

/// Spawns `job` every `interval` until `token` is cancelled.
///
/// The first run happens one full interval after spawning. Job errors are
/// logged; the next tick runs as usual.
pub fn spawn_periodic<F, Fut, E>(
    name: &'static str,
    interval: Duration,
    token: CancellationToken,
    mut job: F,
) -> CleanupHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<usize, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let child = token.child_token();
    let task_token = child.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    match job().await {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::debug!(task = name, removed, "cleanup sweep finished");
                        }
                        Err(e) => {
                            tracing::error!(task = name, error = %e, "cleanup sweep failed");
                        }
                    }
                }
            }
        }
        tracing::debug!(task = name, "cleanup task stopped");
    });

    CleanupHandle {
        name,
        token: child,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_runs_each_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic(
            "test",
            Duration::from_secs(10),
            CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(1)
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_the_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic(
            "failing",
            Duration::from_secs(1),
            CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<usize, _>("storage unavailable")
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_cancels() {
        let parent = CancellationToken::new();
        let handle = spawn_periodic("child", Duration::from_secs(1), parent.clone(), || async {
            Ok::<_, std::io::Error>(0)
        });

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
        assert_eq!(handle.name(), "child");
    }
}
