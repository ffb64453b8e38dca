//! Background service supervision.
//!
//! The server runs three long-lived services: the agent/API endpoint, the
//! outbound dispatch loop, and the license monitor. The first two must
//! outlive any transient failure; the monitor may give up after repeated
//! failures since a broken license check must not churn forever.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Restart policy for a supervised service.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Consecutive failures tolerated before giving up; None restarts forever.
    max_restarts: Option<u32>,
    /// Delay before the first restart; doubles per consecutive failure.
    base_delay: Duration,
    /// Ceiling for the doubling delay.
    max_delay: Duration,
    /// A run at least this long resets the failure counter.
    stable_after: Duration,
}

impl RestartPolicy {
    /// Core services (agent endpoint, dispatch loop): never give up,
    /// come back quickly.
    pub fn core() -> Self {
        Self {
            max_restarts: None,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            stable_after: Duration::from_secs(30),
        }
    }

    /// Periodic monitors: bounded restarts with a slower ramp.
    pub fn monitor() -> Self {
        Self {
            max_restarts: Some(8),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            stable_after: Duration::from_secs(300),
        }
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Run a service under supervision in a tokio task.
///
/// The service restarts on error or panic with exponential backoff. A run
/// that stays up past the policy's stability window resets the failure
/// counter; a bounded policy stops restarting once its budget is spent.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let factory = Arc::new(factory);
    tokio::spawn(async move {
        let mut failures: u32 = 0;

        loop {
            info!(service = name, "Starting service");
            let started = Instant::now();

            // Each run gets its own task so a panic surfaces as a JoinError
            // instead of taking the supervisor down with it.
            let f = Arc::clone(&factory);
            let outcome = tokio::spawn(async move { f().await }).await;

            match outcome {
                Ok(Ok(())) => {
                    info!(service = name, "Service exited cleanly");
                    return;
                }
                Ok(Err(e)) => error!(service = name, "Service failed: {e:#}"),
                Err(join_error) => error!(service = name, "Service panicked: {join_error}"),
            }

            if started.elapsed() >= policy.stable_after {
                failures = 0;
            }
            failures += 1;

            if let Some(max) = policy.max_restarts {
                if failures > max {
                    error!(service = name, failures, "Service keeps failing, giving up");
                    return;
                }
            }

            let delay = policy.delay_for(failures);
            warn!(service = name, attempt = failures, "Service restarting in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let policy = RestartPolicy::core();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        // Large failure counts clamp to the ceiling without overflowing.
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_monitor_policy_is_bounded() {
        let policy = RestartPolicy::monitor();
        assert_eq!(policy.max_restarts, Some(8));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(12), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_restarted() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = spawn_supervised("one-shot", RestartPolicy::core(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_policy_gives_up() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let policy = RestartPolicy {
            max_restarts: Some(2),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            stable_after: Duration::from_secs(60),
        };
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = spawn_supervised("flaky", policy, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always fails")
            }
        });

        handle.await.unwrap();
        // Initial run plus two restarts before the budget runs out.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
