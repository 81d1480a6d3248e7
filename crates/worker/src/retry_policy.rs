use std::time::Duration;

use orchestrator_core::config::ConsumerConfig;

/// 空队列轮询的指数退避
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.poll_initial_delay_ms),
            Duration::from_millis(config.poll_max_delay_ms),
            config.backoff_multiplier,
        )
    }

    /// 第 `attempt` 次等待的时长，不超过上限
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64;
        let exponential = base * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = exponential.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// 取到消息后回到初始间隔
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
