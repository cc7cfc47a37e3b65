// Scheduled executor for periodic collection and maintenance tasks.
// Ticks are period-aligned: a run that overruns its period causes the
// missed tick(s) to be skipped, never queued.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// A trait for tasks that run periodically
pub trait ScheduledTask: Send + Sync + 'static {
    /// Execute the task
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>>;

    /// Check if the task should terminate
    /// Default: never terminate (run forever)
    fn should_terminate(&self) -> bool {
        false
    }

    /// Called with the number of ticks skipped when a run overran its period
    fn on_overrun(&self, _skipped_ticks: u64) {}
}

/// Blanket implementation for Arc<T> where T: ScheduledTask
impl<T: ScheduledTask> ScheduledTask for Arc<T> {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        (**self).run()
    }

    fn should_terminate(&self) -> bool {
        (**self).should_terminate()
    }

    fn on_overrun(&self, skipped_ticks: u64) {
        (**self).on_overrun(skipped_ticks)
    }
}

/// Scheduled executor for running periodic tasks
pub struct ScheduledExecutor {
    interval: Duration,
    task_name: String,
    shutdown: Arc<AtomicBool>,
}

impl ScheduledExecutor {
    /// Create a new scheduled executor
    ///
    /// # Arguments
    /// * `task_name` - Name of the task (for logging)
    /// * `interval` - Interval between executions
    pub fn new(task_name: impl Into<String>, interval: Duration) -> Self {
        Self { task_name: task_name.into(), interval, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    /// Handle that stops the executor when set to true
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Start the scheduled task
    ///
    /// Runs until `shutdown_handle()` is set or the task's
    /// `should_terminate()` returns true. The shutdown flag is polled at
    /// least every 200ms so stop requests do not wait out a long interval.
    pub async fn start<T>(self, task: T)
    where
        T: ScheduledTask,
    {
        let task_name = self.task_name;
        let interval_ms = self.interval.as_millis().max(1) as i64;
        let shutdown = self.shutdown;

        tracing::info!("Starting scheduled task '{}' with interval {:?}", task_name, self.interval);

        let mut next_execution = Utc::now().timestamp_millis() + interval_ms;

        loop {
            if shutdown.load(Ordering::Relaxed) || task.should_terminate() {
                tracing::info!("Scheduled task '{}' is shutting down", task_name);
                break;
            }

            let now = Utc::now().timestamp_millis();

            if now >= next_execution {
                tracing::debug!("Executing scheduled task '{}'", task_name);

                if let Err(e) = task.run().await {
                    tracing::error!("Scheduled task '{}' failed: {}", task_name, e);
                }

                // Advance to the next period boundary. Missed boundaries are
                // skipped, not queued.
                let after = Utc::now().timestamp_millis();
                let mut skipped = 0u64;
                next_execution += interval_ms;
                while next_execution <= after {
                    next_execution += interval_ms;
                    skipped += 1;
                }
                if skipped > 0 {
                    tracing::warn!(
                        "Scheduled task '{}' overran its interval, skipped {} tick(s)",
                        task_name,
                        skipped
                    );
                    task.on_overrun(skipped);
                }
            }

            let wait_ms = next_execution.saturating_sub(Utc::now().timestamp_millis());
            if wait_ms > 0 {
                sleep(Duration::from_millis((wait_ms as u64).min(200))).await;
            }
        }

        tracing::info!("Scheduled task '{}' stopped", task_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct TestTask {
        counter: Arc<AtomicU32>,
        max_runs: u32,
    }

    impl ScheduledTask for TestTask {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
            Box::pin(async move {
                self.counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }

        fn should_terminate(&self) -> bool {
            self.counter.load(Ordering::Relaxed) >= self.max_runs
        }
    }

    #[tokio::test]
    async fn test_scheduled_executor_runs_until_terminate() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = TestTask { counter: counter.clone(), max_runs: 3 };

        let executor = ScheduledExecutor::new("test", Duration::from_millis(50));
        executor.start(task).await;

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    struct SlowTask {
        counter: Arc<AtomicU32>,
        overruns: Arc<AtomicU32>,
    }

    impl ScheduledTask for SlowTask {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
            Box::pin(async move {
                self.counter.fetch_add(1, Ordering::Relaxed);
                // Overrun a 20ms interval by several periods
                sleep(Duration::from_millis(70)).await;
                Ok(())
            })
        }

        fn should_terminate(&self) -> bool {
            self.counter.load(Ordering::Relaxed) >= 2
        }

        fn on_overrun(&self, skipped: u64) {
            self.overruns.fetch_add(skipped as u32, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_overrun_skips_ticks() {
        let counter = Arc::new(AtomicU32::new(0));
        let overruns = Arc::new(AtomicU32::new(0));
        let task = SlowTask { counter: counter.clone(), overruns: overruns.clone() };

        let executor = ScheduledExecutor::new("slow", Duration::from_millis(20));
        executor.start(task).await;

        // Each 70ms run across a 20ms interval skips at least 2 boundaries
        assert!(overruns.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_executor() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = TestTask { counter: counter.clone(), max_runs: u32::MAX };

        let executor = ScheduledExecutor::new("stoppable", Duration::from_millis(10));
        let handle = executor.shutdown_handle();
        let join = tokio::spawn(executor.start(task));

        sleep(Duration::from_millis(60)).await;
        handle.store(true, Ordering::Relaxed);
        join.await.unwrap();

        assert!(counter.load(Ordering::Relaxed) >= 1);
    }
}
