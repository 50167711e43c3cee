use crate::config::RetryConfig;
use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Doubling delay between attempts, capped at `max`.
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Backoff { max: max.max(initial), current: initial }
    }

    /// Delay to wait now; the following call returns twice as much.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// `recover` runs before every retry, after the backoff sleep.
    pub async fn run<T, S, Op, Rec>(&self, state: &mut S, label: &str, mut op: Op, mut recover: Rec) -> Result<T>
    where
        Op: for<'a> FnMut(&'a mut S) -> std::pin::Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
        Rec: for<'a> FnMut(&'a mut S) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1;
        loop {
            let err = match op(state).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_transient() || attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                "{} attempt {}/{} failed: {}; retrying in {:?}",
                label,
                attempt,
                self.max_attempts,
                err,
                delay
            );
            sleep(delay).await;
            attempt += 1;

            if let Err(e) = recover(state).await {
                if !e.is_transient() {
                    return Err(e);
                }
                tracing::warn!("{} recovery failed: {}", label, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn timeout_until(calls: &mut u32, succeed_on: u32) -> Result<u32> {
        *calls += 1;
        if *calls >= succeed_on {
            Ok(*calls)
        } else {
            Err(Error::Timeout("test"))
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut calls = 0u32;
        let result = policy(3)
            .run(
                &mut calls,
                "test",
                |c| Box::pin(async move { timeout_until(c, 3) }),
                |_| Box::pin(async { Ok(()) }),
            )
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let mut calls = 0u32;
        let result = policy(2)
            .run(
                &mut calls,
                "test",
                |c| Box::pin(async move { timeout_until(c, 10) }),
                |_| Box::pin(async { Ok(()) }),
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let mut calls = 0u32;
        let result: Result<()> = policy(5)
            .run(
                &mut calls,
                "test",
                |c| {
                    Box::pin(async move {
                        *c += 1;
                        Err(Error::decode("test", "bad", &[]))
                    })
                },
                |_| Box::pin(async { Ok(()) }),
            )
            .await;
        assert!(matches!(result, Err(Error::Decode { .. })));
        assert_eq!(calls, 1);
    }
}
