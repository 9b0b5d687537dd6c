use std::io;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff with optional jitter and a bounded attempt count, for
/// per-file filesystem operations that hit transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    jitter: bool,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, jitter: bool, attempts: u32) -> Self {
        Self {
            base,
            max,
            jitter,
            attempts: attempts.max(1),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_millis(500), true, 3)
    }
}

/// Whether retrying the same operation has any chance of succeeding.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Runs `op`, retrying failures the predicate marks transient. The final
/// error is returned unchanged.
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < policy.attempts && transient(&err) => {
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `with_retry_if` specialized to plain I/O operations.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    with_retry_if(policy, is_transient, op).await
}
