//! Test helper utilities and common testing patterns

use std::time::Duration;

use scheduler_core::SchedulerConfig;
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    ///
    /// Background loops run on their own tasks, so tests poll for their effects.
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    /// Scheduler settings tuned for fast tests: short loop intervals,
    /// no queue-full waiting and no random rescans
    pub fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            pq_maxsize: 0,
            pq_max_random_objects: 0,
            reschedule_interval_seconds: 1,
            new_plugins_interval_seconds: 1,
            push_max_tries: 1,
            push_poll_interval_ms: 10,
            worker_pool_size: 4,
            stop_timeout_seconds: 1,
            ..SchedulerConfig::default()
        }
    }
}
