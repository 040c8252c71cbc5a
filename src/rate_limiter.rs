/// 新连接速率限制
///
/// 基于 governor 的令牌桶，监听器在接受连接后检查，超限的连接直接关闭
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// 速率限制配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRateConfig {
    /// 每秒允许的新连接数
    pub per_second: u32,
    /// 突发容量
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    200
}

impl Default for AcceptRateConfig {
    fn default() -> Self {
        Self {
            per_second: 100,
            burst: default_burst(),
        }
    }
}

#[derive(Clone)]
pub struct AcceptRateLimiter {
    inner: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: AcceptRateConfig,
}

impl AcceptRateLimiter {
    /// 为 0 的参数按 1 处理
    pub fn new(config: AcceptRateConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            inner: Arc::new(RateLimiter::direct(quota)),
            config,
        }
    }

    /// 尝试取得一个令牌，失败时返回需要等待的时间
    pub fn check(&self) -> Result<(), Duration> {
        self.inner
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    pub fn config(&self) -> &AcceptRateConfig {
        &self.config
    }
}

impl std::fmt::Debug for AcceptRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptRateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let limiter = AcceptRateLimiter::new(AcceptRateConfig {
            per_second: 1,
            burst: 3,
        });
        for _ in 0..3 {
            assert!(limiter.check().is_ok());
        }
        let wait = limiter.check().unwrap_err();
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_clones_share_bucket() {
        let a = AcceptRateLimiter::new(AcceptRateConfig {
            per_second: 1,
            burst: 2,
        });
        let b = a.clone();
        assert!(a.check().is_ok());
        assert!(b.check().is_ok());
        assert!(a.check().is_err());
    }

    #[test]
    fn test_zero_is_clamped() {
        let limiter = AcceptRateLimiter::new(AcceptRateConfig {
            per_second: 0,
            burst: 0,
        });
        assert!(limiter.check().is_ok());
    }
}
