use std::future::Future;
use std::time::{Duration, Instant};

use crate::Error;

/// ThresholdBreaker trips open after a run of consecutive failures and lets a
/// single probe call through once the reset timeout has elapsed. It shields
/// the store and cache from being hammered during an outage; callers treat
/// [`Error::CircuitOpen`] like any other swallowed persistence failure.
#[derive(Debug)]
pub(crate) struct ThresholdBreaker {
    threshold: u32,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    reset_timeout: Duration,
}

impl ThresholdBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
            open_until: None,
            reset_timeout,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.open_until, Some(until) if Instant::now() < until)
    }

    pub async fn call<T, F>(&mut self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.is_open() {
            return Err(Error::CircuitOpen);
        }

        match fut.await {
            Ok(value) => {
                self.consecutive_failures = 0;
                self.open_until = None;
                Ok(value)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.open_until = Some(Instant::now() + self.reset_timeout);
                }
                Err(err)
            }
        }
    }
}
