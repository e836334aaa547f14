//! 退避重试策略：有上限的尝试次数 + 指数退避等待。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::context::Config;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次），至少为 1。
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        let min_ms = cfg.min_wait_time.max(1);
        let max_ms = cfg.max_wait_time.max(min_ms);
        Self {
            max_attempts: cfg.max_retries.max(1),
            min_wait: Duration::from_millis(min_ms),
            max_wait: Duration::from_millis(max_ms),
        }
    }

    /// 第 `attempt` 次失败后（从 0 计）的等待时间：`min * 2^attempt`，不超过 `max`。
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(10);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.min_wait.saturating_mul(factor).min(self.max_wait)
    }

    /// 分片睡眠，期间收到取消信号立即返回 `false`。
    pub fn sleep(&self, attempt: u32, cancel: &AtomicBool) -> bool {
        let deadline = Instant::now() + self.delay(attempt);
        loop {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn config_values_are_clamped() {
        let cfg = Config {
            max_retries: 0,
            min_wait_time: 0,
            max_wait_time: 0,
            ..Config::default()
        };
        let policy = RetryPolicy::from_config(&cfg);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.min_wait, Duration::from_millis(1));
        assert_eq!(policy.max_wait, Duration::from_millis(1));
    }

    #[test]
    fn sleep_stops_on_cancel() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_wait: Duration::from_secs(30),
            max_wait: Duration::from_secs(30),
        };
        let cancel = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!policy.sleep(0, &cancel));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
