use std::time::Duration;

/// Anything that can put the current thread to sleep.
///
/// Polling and retry loops take a Sleeper rather than calling `std::thread::sleep`
/// directly, so tests can run them without real delays.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

impl std::fmt::Debug for dyn Sleeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sleeper")
    }
}

/// The real thing
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

/// Capped exponential backoff used while waiting on the producer.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now. Doubles for the next call, never exceeding the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Go back to the initial delay once work shows up again
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Bounded retries for filesystem operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or `max_attempts` is reached, sleeping between tries.
    ///
    /// Returns the last error along with the number of attempts made.
    pub fn run<T, E: std::fmt::Display>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, (E, u32)> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err((e, attempt)),
                Err(e) => {
                    log::warn!("Attempt {attempt} of {attempts} failed: {e}. Retrying...");
                    sleeper.sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}
