// 重试策略
//
// 包装任意可失败的异步操作，按指数退避重试：
//   delay(a) = clamp(min_retry * (1 + multiplier)^a, min_retry, max_retry)
//
// 只有可重试错误类（网络错误、锁冲突）会被重试；
// 不可重试错误在第一次出现时立即向上传递，不消耗重试预算。
// 实际休眠前会叠加一个不超过 250ms 的随机抖动，但不会越出
// [min_retry, max_retry] 区间。

use crate::config::UploadConfig;
#[cfg_attr(not(test), allow(unused_imports))]
use crate::error::{Result, UploadError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// 抖动上限（毫秒）
const MAX_JITTER_MS: u64 = 250;

/// 单个操作的重试状态
///
/// 作用域仅限一次被包装的逻辑操作，不做持久化。
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// 已执行的尝试次数
    pub attempts: u32,
    /// 累计等待时间
    pub total_wait: Duration,
    /// 最后一次错误信息
    pub last_error: Option<String>,
}

impl RetryState {
    /// 消耗的重试次数（首次尝试不算重试）
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// 重试策略（不可变，可在多个操作间共享）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数
    max_retries: u32,
    /// 最小退避时间
    min_delay: Duration,
    /// 最大退避时间
    max_delay: Duration,
    /// 退避乘数
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, min_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            min_delay,
            max_delay,
            multiplier,
        }
    }

    /// 从上传配置构造
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs(config.min_retry_secs),
            Duration::from_secs(config.max_retry_secs),
            config.retry_multiplier,
        )
    }

    /// 第 `attempt` 次重试前的退避时间（attempt 从 0 开始）
    ///
    /// 确定性公式，便于测试；抖动在 `run` 中叠加。
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = (1.0 + self.multiplier).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.min_delay.as_secs_f64() * factor;
        let clamped = secs.clamp(self.min_delay.as_secs_f64(), self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    /// 叠加随机抖动，结果不超过最大退避时间
    fn jittered(&self, base: Duration) -> Duration {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
        std::cmp::min(base + jitter, std::cmp::max(base, self.max_delay))
    }

    /// 执行操作，失败时按策略重试
    ///
    /// # 参数
    /// * `op_name` - 操作名（日志用）
    /// * `op` - 每次尝试重新构造的异步操作
    ///
    /// # 返回
    /// (操作结果, 重试状态)。重试预算耗尽或遇到不可重试错误时
    /// 结果为最后一次错误；重试状态在两种结局下都有效，
    /// 调用方据此累计消耗的重试次数。
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> (Result<T>, RetryState)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::default();

        loop {
            state.attempts += 1;

            match op().await {
                Ok(value) => return (Ok(value), state),
                Err(e) if !e.is_retryable() => {
                    // 不可重试错误立即失败
                    error!("[{}] 失败（不可重试）: {}", op_name, e);
                    state.last_error = Some(e.to_string());
                    return (Err(e), state);
                }
                Err(e) => {
                    state.last_error = Some(e.to_string());

                    if state.attempts >= self.max_retries {
                        error!(
                            "[{}] 失败，已达最大尝试次数 ({}): {}",
                            op_name, self.max_retries, e
                        );
                        return (Err(e), state);
                    }

                    let delay = self.jittered(self.backoff_delay(state.attempts - 1));
                    warn!(
                        "[{}] 失败，等待 {:?} 后重试 ({}/{}): {}",
                        op_name, delay, state.attempts, self.max_retries, e
                    );
                    tokio::time::sleep(delay).await;

                    state.total_wait += delay;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn default_policy() -> RetryPolicy {
        // 默认参数: min=1s, max=240s, multiplier=0.1
        RetryPolicy::from_config(&UploadConfig::default())
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            0.1,
        )
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = default_policy();

        // min=1, multiplier=0.1 -> 1.0, 1.1, 1.21
        assert!((policy.backoff_delay(0).as_secs_f64() - 1.0).abs() < 1e-9);
        assert!((policy.backoff_delay(1).as_secs_f64() - 1.1).abs() < 1e-9);
        assert!((policy.backoff_delay(2).as_secs_f64() - 1.21).abs() < 1e-9);
    }

    #[test]
    fn test_backoff_bounds_and_monotonic() {
        let policy = default_policy();
        let mut previous = Duration::ZERO;

        for attempt in 0..80 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= Duration::from_secs(1), "attempt {}", attempt);
            assert!(delay <= Duration::from_secs(240), "attempt {}", attempt);
            assert!(delay >= previous, "attempt {}", attempt);
            previous = delay;
        }

        // 足够大的 attempt 饱和在最大值
        assert_eq!(policy.backoff_delay(200), Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let policy = fast_policy(10);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let (result, state) = policy
            .run("test-op", move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(UploadError::Network("connection reset".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        // 失败两次后成功，重试计数为 2
        assert_eq!(state.retries(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let policy = fast_policy(3);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let (result, state) = policy
            .run("test-op", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(UploadError::Network("timeout".into()))
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), UploadError::Network(_)));
        // 最多 max_retries 次尝试
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.attempts, 3);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let policy = fast_policy(10);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let (result, state) = policy
            .run("test-op", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(UploadError::Validation("file missing".into()))
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), UploadError::Validation(_)));
        // 不可重试错误只尝试一次，不消耗重试预算
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.retries(), 0);
    }

    #[tokio::test]
    async fn test_lock_conflict_is_retried() {
        let policy = fast_policy(5);
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let (result, state) = policy
            .run("register", move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(UploadError::LockConflict("dataset lock: Ingest".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(state.retries(), 1);
    }
}
