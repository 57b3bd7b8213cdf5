//! 재연결 백오프 정책.
//!
//! 원치 않은 연결 끊김 후 재연결할 때 대기 시간을 지수적으로 늘려,
//! 계속 실패하는 거래소에 연결을 반복하지 않도록 합니다.
//!
//! ```rust
//! use alert_exchange::ReconnectPolicy;
//! use std::time::Duration;
//!
//! let policy = ReconnectPolicy::default().without_jitter();
//! assert_eq!(policy.delay_for(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(3), Duration::from_secs(8));
//! ```

use alert_core::StreamConfig;
use rand::Rng;
use std::time::Duration;

/// 재연결 정책.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// 연속 재연결 최대 시도 횟수. 연결에 성공하면 다시 0부터 셉니다.
    pub max_attempts: u32,
    /// 첫 재연결 대기 시간
    pub base_delay: Duration,
    /// 최대 대기 시간
    pub max_delay: Duration,
    /// 백오프 배수
    pub backoff_multiplier: f64,
    /// ±25% 지터 추가 여부
    pub add_jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// 스트림 설정에서 정책을 생성합니다.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            ..Default::default()
        }
    }

    /// 지터를 끈 정책 (테스트용).
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// `attempt`번째(0부터) 재연결 전 대기 시간.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt.min(32) as i32);
        let delay = Duration::from_secs_f64(
            (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64()),
        );

        if self.add_jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            let jitter = rand::thread_rng().gen_range(-1.0..=1.0) * jitter_range;
            Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
        } else {
            delay
        }
    }

    /// 시도 횟수가 한도를 넘었는지 확인합니다.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = ReconnectPolicy {
            max_delay: Duration::from_secs(5),
            ..Default::default()
        }
        .without_jitter();

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(100), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let policy = ReconnectPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(1).as_millis();
            assert!((1500..=2500).contains(&delay), "delay {delay}");
        }
    }

    #[test]
    fn test_from_config() {
        let config = StreamConfig {
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 250,
            ..Default::default()
        };
        let policy = ReconnectPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
