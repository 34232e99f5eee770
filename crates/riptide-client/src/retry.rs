//! Bounded, delayed retry for the reconnect paths.
//!
//! ```rust,ignore
//! let result = Retry::any()
//!     .delay(Duration::from_secs(1))
//!     .max(5)
//!     .do_on_retry(|attempt, cause, delay| {
//!         warn!("attempt {} failed ({}), retrying in {:?}", attempt, cause, delay)
//!     })
//!     .run(|| async { provider.connect_any_host().await })
//!     .await?;
//! ```

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

type RetryHook = Box<dyn Fn(u32, &Error, Duration) + Send + Sync>;

/// Retry policy builder. Retries any failure up to `max` times with a
/// fixed jittered delay between attempts.
pub struct Retry {
    delay: Duration,
    max_retries: u32,
    on_retry: Option<RetryHook>,
    stop: Option<Arc<AtomicBool>>,
}

impl Retry {
    /// Retry on any error.
    pub fn any() -> Self {
        Self {
            delay: Duration::from_millis(100),
            max_retries: 3,
            on_retry: None,
            stop: None,
        }
    }

    /// Fixed delay between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Maximum number of retries after the initial attempt.
    pub fn max(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Hook invoked before each retry with the attempt number (1-based),
    /// the cause and the upcoming delay.
    pub fn do_on_retry(
        mut self,
        hook: impl Fn(u32, &Error, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Observe a stop flag: once set, the loop terminates with
    /// [`Error::Stopped`] instead of attempting again.
    pub fn until_stopped(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Runs the operation under this policy.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.stopped() {
                return Err(Error::Stopped);
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(cause) => {
                    if attempt >= self.max_retries {
                        return Err(Error::RetriesExhausted {
                            attempts: attempt + 1,
                            source: Box::new(cause),
                        });
                    }
                    attempt += 1;
                    let delay = jittered(self.delay);
                    if let Some(hook) = &self.on_retry {
                        hook(attempt, &cause, delay);
                    }
                    sleep(delay).await;
                }
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Applies up to 25% of jitter so synchronized clients do not retry in
/// lockstep.
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let base = delay.as_millis() as f64;
    let jitter = (rand::random::<f64>() * 0.5 - 0.25) * base;
    Duration::from_millis((base + jitter).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = Retry::any()
            .delay(Duration::from_millis(1))
            .max(5)
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::ConnectionClosed)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_cause() {
        let result: Result<()> = Retry::any()
            .delay(Duration::from_millis(1))
            .max(2)
            .run(|| async { Err(Error::ConnectionClosed) })
            .await;

        match result.unwrap_err() {
            Error::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::ConnectionClosed));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_hook_sees_each_retry() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_hook = seen.clone();
        let _: Result<()> = Retry::any()
            .delay(Duration::from_millis(1))
            .max(3)
            .do_on_retry(move |attempt, _cause, _delay| {
                seen_hook.store(attempt, Ordering::SeqCst);
            })
            .run(|| async { Err(Error::ConnectionClosed) })
            .await;

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_flag_terminates_loop() {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_in_op = stop.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let result: Result<()> = Retry::any()
            .delay(Duration::from_millis(1))
            .max(100)
            .until_stopped(stop)
            .run(move || {
                let stop = stop_in_op.clone();
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    stop.store(true, Ordering::Relaxed);
                    Err(Error::ConnectionClosed)
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), Error::Stopped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
