//! 后端调用的重试策略
//!
//! 所有组件共享同一个 [`RetryPolicy`]：单次请求超时 + 指数退避（可选抖动）+ 尝试次数上限。
//! 只有 [`BackendError::is_transient`] 为真的错误才会被重试，其余错误立即返回。

use crate::config::RetryConfig;
use crate::error::{BackendError, BackendResult, MemoryError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: bool,
    attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// 不重试、不等待的策略，适合测试
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::immediate(1)
        }
    }

    /// 立即重试（零退避）的策略，适合测试
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
            attempt_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// 第 `retry`（从 1 开始）次重试前的等待时间
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(retry.saturating_sub(1).min(16) as i32);
        let base = self.initial_backoff.mul_f64(exp).min(self.max_backoff);
        if self.jitter && !base.is_zero() {
            // equal jitter：[base/2, base]
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            base.mul_f64(factor)
        } else {
            base
        }
    }

    /// 带超时与重试地执行一次后端调用
    ///
    /// 重试预算耗尽或遇到不可重试错误时返回 [`MemoryError::BackendUnavailable`]。
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.attempt_timeout)),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "✅ 后端调用在重试后成功");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(operation, attempt, error = %err, delay_ms = delay.as_millis() as u64, "🔁 后端调用失败，准备重试");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(MemoryError::BackendUnavailable {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::from(&RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            multiplier: 2.0,
            jitter: false,
            attempt_timeout_ms: 1_000,
        });
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::from(&RetryConfig {
            initial_backoff_ms: 200,
            jitter: true,
            ..RetryConfig::default()
        });
        for _ in 0..50 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);
        let value = policy
            .run("get", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_backend_unavailable() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::immediate(2);
        let err = policy
            .run("search", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::Api {
                    status: 503,
                    message: "unavailable".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match err {
            MemoryError::BackendUnavailable { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let err = policy
            .run("put", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::Api {
                    status: 400,
                    message: "mapper_parsing_exception".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), "backend_unavailable");
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let policy = RetryPolicy::no_retry().with_attempt_timeout(Duration::from_millis(10));
        let err = policy
            .run("get", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BackendError>(())
            })
            .await
            .unwrap_err();
        match err {
            MemoryError::BackendUnavailable { source, .. } => {
                assert!(matches!(source, BackendError::Timeout(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
