//! Exponential backoff retry scheduling keyed by task name
//!
//! Only one retry may be pending per key at a time; scheduling under an
//! existing key cancels the previous pending retry first.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Pure backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_max_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 2000,
            cap_ms: 30000,
            jitter_max_ms: 500,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `retry_count + 1`: exponential with jitter,
    /// capped.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(16);
        let backoff_ms = self.base_ms.saturating_mul(1u64 << exponent).min(self.cap_ms);
        let jitter_ms = if self.jitter_max_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_max_ms)
        } else {
            0
        };
        Duration::from_millis(backoff_ms + jitter_ms)
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// Schedules delayed retries, at most one pending per key
pub struct RetryScheduler {
    policy: RetryPolicy,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn next_delay(&self, retry_count: u32) -> Duration {
        self.policy.next_delay(retry_count)
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        self.policy.can_retry(retry_count)
    }

    /// Schedule `fn` to run after `delay`, cancelling any retry already
    /// pending under the same key.
    pub fn schedule<F, Fut>(&self, key: &str, delay: Duration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
        });

        let mut pending = self.pending.lock().expect("retry scheduler lock poisoned");
        if let Some(previous) = pending.insert(key.to_string(), handle) {
            previous.abort();
            debug!(key, "replaced pending retry");
        }
        debug!(key, delay_ms = delay.as_millis() as u64, "retry scheduled");
    }

    /// Cancel a pending retry, if any.
    pub fn cancel(&self, key: &str) {
        let mut pending = self.pending.lock().expect("retry scheduler lock poisoned");
        if let Some(handle) = pending.remove(key) {
            handle.abort();
            debug!(key, "pending retry cancelled");
        }
    }

    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().expect("retry scheduler lock poisoned");
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter_policy() -> RetryPolicy {
        RetryPolicy {
            base_ms: 2000,
            cap_ms: 30000,
            jitter_max_ms: 0,
            max_retries: 3,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = no_jitter_policy();
        assert_eq!(policy.next_delay(0), Duration::from_millis(2000));
        assert_eq!(policy.next_delay(1), Duration::from_millis(4000));
        assert_eq!(policy.next_delay(2), Duration::from_millis(8000));
        assert_eq!(policy.next_delay(3), Duration::from_millis(16000));
        assert_eq!(policy.next_delay(4), Duration::from_millis(30000));
        assert_eq!(policy.next_delay(10), Duration::from_millis(30000));
    }

    #[test]
    fn retry_limit_enforced() {
        let policy = no_jitter_policy();
        assert!(policy.can_retry(0));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
        assert!(!policy.can_retry(10));
    }

    #[tokio::test]
    async fn schedule_replaces_pending_retry() {
        let scheduler = RetryScheduler::new(no_jitter_policy());
        let counter = Arc::new(AtomicU32::new(0));

        // First schedule is replaced before it can fire
        let c1 = counter.clone();
        scheduler.schedule("fetch", Duration::from_millis(50), move || async move {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = counter.clone();
        scheduler.schedule("fetch", Duration::from_millis(20), move || async move {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn cancel_prevents_execution() {
        let scheduler = RetryScheduler::new(no_jitter_policy());
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        scheduler.schedule("fetch", Duration::from_millis(30), move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel("fetch");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
