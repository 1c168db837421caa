//! Retry policies for client requests and leader redirection.

use crate::error::{ClientError, ClientErrorKind};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use tokio::time::{sleep, Duration, Instant};

/// A retry policy over fallible async operations. Build one with a named
/// constructor or the builder methods, then run an operation through
/// [`Retry::call`].
///
/// A successful first call never sleeps. Failures sleep between attempts
/// (never after the last one), with optional backoff, jitter, and bounds on
/// tries, elapsed time, and total deadline.
#[derive(Debug, Clone)]
pub struct Retry {
    max_tries: Option<u32>,
    delay: Duration,
    max_delay: Option<Duration>,
    backoff: u32,
    max_jitter: f64,
    deadline: Option<Duration>,
    max_elapsed: Option<Duration>,
    retry_on: Option<HashSet<ClientErrorKind>>,
}

impl Retry {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Retry::new().max_tries(1)
    }

    /// At most `tries` attempts with a fixed sleep between failures.
    pub fn n_times(tries: u32, delay: Duration) -> Self {
        Retry::new().max_tries(tries).delay(delay)
    }

    /// Fixed-delay retries until `max_elapsed` wall-clock time has passed.
    pub fn until_elapsed(delay: Duration, max_elapsed: Duration) -> Self {
        Retry {
            max_elapsed: Some(max_elapsed),
            ..Retry::new().delay(delay)
        }
    }

    /// Unbounded retries, doubling the delay up to `max_sleep`.
    pub fn exponential_backoff(base: Duration, max_sleep: Duration) -> Self {
        Retry::new().delay(base).backoff(2).max_delay(max_sleep)
    }

    /// Exponential backoff with a bound on attempts.
    pub fn bounded_exponential_backoff(tries: u32, base: Duration, max_sleep: Duration) -> Self {
        Retry::exponential_backoff(base, max_sleep).max_tries(tries)
    }

    pub fn new() -> Self {
        Retry {
            max_tries: None,
            delay: Duration::ZERO,
            max_delay: None,
            backoff: 1,
            max_jitter: 0.0,
            deadline: None,
            max_elapsed: None,
            retry_on: None,
        }
    }

    pub fn max_tries(mut self, tries: u32) -> Self {
        self.max_tries = Some(tries);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay multiplier applied after each failure. 1 keeps the delay fixed.
    pub fn backoff(mut self, backoff: u32) -> Self {
        self.backoff = backoff.max(1);
        self
    }

    /// Fraction of the delay added as random jitter, in `[0, jitter)`.
    pub fn max_jitter(mut self, jitter: f64) -> Self {
        self.max_jitter = jitter.max(0.0);
        self
    }

    /// Hard bound on total time spent, including sleeps.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Restricts which error kinds are retried. Without any `on_error`, every
    /// error is retryable; with at least one, anything unlisted surfaces
    /// immediately.
    pub fn on_error(mut self, kind: ClientErrorKind) -> Self {
        self.retry_on.get_or_insert_with(HashSet::new).insert(kind);
        self
    }

    fn retryable(&self, err: &ClientError) -> bool {
        match &self.retry_on {
            None => true,
            Some(kinds) => kinds.contains(&err.kind()),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.max_jitter <= 0.0 {
            return delay;
        }
        delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..self.max_jitter))
    }

    pub async fn call<T, F, Fut>(&self, mut f: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let start = Instant::now();
        let mut tries: u32 = 0;
        let mut delay = self.delay;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tries += 1;
                    if !self.retryable(&err) {
                        return Err(err);
                    }
                    if let Some(max_tries) = self.max_tries {
                        if tries >= max_tries {
                            return Err(err);
                        }
                    }
                    if let Some(max_elapsed) = self.max_elapsed {
                        if start.elapsed() >= max_elapsed {
                            return Err(err);
                        }
                    }
                    if let Some(deadline) = self.deadline {
                        if start.elapsed() + delay > deadline {
                            return Err(err);
                        }
                    }
                    sleep(self.jittered(delay)).await;
                    delay = match self.max_delay {
                        Some(cap) => (delay * self.backoff).min(cap),
                        None => delay * self.backoff,
                    };
                }
            }
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new()
    }
}
