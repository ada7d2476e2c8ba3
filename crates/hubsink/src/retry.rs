// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Infinite retry with a fixed delay.
//!
//! Both endpoint supervisors share the same discipline: attempt the
//! operation, log the failure at error severity, sleep 30 seconds, repeat
//! until it succeeds. A failure is never surfaced to the caller.

use std::fmt::Display;
use std::time::Duration;

/// Delay between attempts, for both endpoints.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Sleeping seam, so retry timing is observable in tests.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// Wall-clock sleeper used by the live bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Run `op` until it succeeds, sleeping [`RETRY_DELAY`] after each failure.
pub fn forever<T, E: Display>(
    what: &str,
    sleeper: &mut impl Sleeper,
    mut op: impl FnMut() -> Result<T, E>,
) -> T {
    loop {
        match op() {
            Ok(value) => return value,
            Err(err) => {
                tracing::error!(
                    "{} failed: {}. Retrying in {}s",
                    what,
                    err,
                    RETRY_DELAY.as_secs()
                );
                sleeper.sleep(RETRY_DELAY);
            }
        }
    }
}

/// Sleeper that records requested durations instead of blocking.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSleeper {
    pub slept: Vec<Duration>,
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.slept.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forever_returns_first_success() {
        let mut sleeper = RecordingSleeper::default();
        let value = forever("noop", &mut sleeper, || Ok::<_, String>(7));
        assert_eq!(value, 7);
        assert!(sleeper.slept.is_empty());
    }

    #[test]
    fn test_forever_retries_until_success() {
        let mut sleeper = RecordingSleeper::default();
        let mut attempts = 0;
        let value = forever("flaky", &mut sleeper, || {
            attempts += 1;
            if attempts <= 3 {
                Err("connection refused".to_string())
            } else {
                Ok(attempts)
            }
        });

        // N failures then success: exactly N+1 attempts, one delay per failure.
        assert_eq!(value, 4);
        assert_eq!(attempts, 4);
        assert_eq!(sleeper.slept, vec![RETRY_DELAY; 3]);
        assert!(sleeper.slept.iter().all(|d| *d >= Duration::from_secs(30)));
    }
}
