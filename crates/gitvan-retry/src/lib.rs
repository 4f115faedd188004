//! Backoff scheduling for gitvan's remote fetches.
//!
//! Registry lookups and forge clones fail for reasons that heal on their
//! own: a dropped connection, a rate-limit window, a ref update racing the
//! clone. Three rules govern how those call sites retry. Only errors the
//! caller classifies as transient earn another attempt; a bad manifest or a
//! declared conflict is final on the first try. Every pause is *sampled* -
//! drawn uniformly below an exponentially growing ceiling - so a burst of
//! parallel resolvers does not hammer a recovering host in lockstep. And
//! the loop is bounded twice, by attempt count and by wall clock, with each
//! pause clamped so the schedule can never sleep past its own deadline.
//!
//! # Example
//!
//! ```
//! use gitvan_retry::{Backoff, BackoffConfig};
//!
//! let mut backoff = Backoff::new(&BackoffConfig::default());
//! // After a failed attempt, ask the schedule whether to go again.
//! if let Some(pause) = backoff.next_pause() {
//!     assert!(pause <= BackoffConfig::default().max_delay);
//! }
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How pauses between attempts are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Go straight back in with no pause. For sources that answer from
    /// local disk, and for tests that must not sleep.
    None,
    /// The same pause every time. For polling something with a known
    /// cadence, like a registry index that republishes on a schedule.
    Fixed,
    /// Sample each pause uniformly between zero and a ceiling that doubles
    /// after every failure. The default for registry and forge traffic:
    /// concurrent resolvers spread out instead of retrying in step.
    #[default]
    FullJitter,
}

/// Budget and shape of a retry schedule.
///
/// `max_attempts` counts every try including the first; `max_elapsed` caps
/// the whole loop in wall-clock time. Whichever runs out first ends the
/// schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Total tries allowed, first included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed pause, or the starting jitter ceiling, in milliseconds.
    #[serde(default = "default_base_delay", with = "duration_millis")]
    pub base_delay: Duration,
    /// The jitter ceiling stops growing here, in milliseconds.
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,
    /// Wall-clock budget for the whole schedule, in milliseconds.
    #[serde(default = "default_max_elapsed", with = "duration_millis")]
    pub max_elapsed: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::FullJitter,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_elapsed: default_max_elapsed(),
        }
    }
}

impl BackoffConfig {
    /// Tuned for registry descriptor fetches: cheap requests, quick to
    /// re-ask, give up inside a minute.
    pub fn registry() -> Self {
        Self {
            strategy: BackoffStrategy::FullJitter,
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            max_elapsed: Duration::from_secs(45),
        }
    }

    /// Tuned for forge clones: each attempt is expensive, so fewer tries
    /// with wider spacing.
    pub fn forge() -> Self {
        Self {
            strategy: BackoffStrategy::FullJitter,
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
            max_elapsed: Duration::from_secs(90),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_elapsed() -> Duration {
    Duration::from_secs(120)
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// A live retry schedule: tracks failures seen and time spent, and answers
/// one question - pause and try again, or stop.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
    started: Instant,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            failures: 0,
            started: Instant::now(),
        }
    }

    /// Failed attempts recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Call after a failed attempt. `Some(pause)` means sleep that long and
    /// try again; `None` means a budget ran out and the schedule is over.
    /// Pauses are clamped so the schedule never sleeps past `max_elapsed`.
    pub fn next_pause(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            return None;
        }

        let spent = self.started.elapsed();
        if spent >= self.config.max_elapsed {
            return None;
        }
        let budget_left = self.config.max_elapsed - spent;

        let pause = match self.config.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.config.base_delay,
            BackoffStrategy::FullJitter => sample_below(self.ceiling()),
        };

        Some(pause.min(budget_left))
    }

    /// Current jitter ceiling: the base doubled once per recorded failure
    /// beyond the first, saturating at `max_delay`.
    fn ceiling(&self) -> Duration {
        let doublings = self.failures.saturating_sub(1).min(20);
        let ceiling_ms = u64::try_from(self.config.base_delay.as_millis())
            .unwrap_or(u64::MAX)
            .checked_shl(doublings)
            .unwrap_or(u64::MAX);
        Duration::from_millis(ceiling_ms).min(self.config.max_delay)
    }
}

/// Uniform draw from `[0, ceiling]`.
fn sample_below(ceiling: Duration) -> Duration {
    let ceiling_ms = ceiling.as_millis() as f64;
    Duration::from_millis((rand::random::<f64>() * ceiling_ms).floor() as u64)
}

/// Final error of an exhausted schedule, with the try count for receipts.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Drive `op` under a schedule. `is_transient` is the gate: an error it
/// rejects ends the loop immediately, whatever budget remains, so logical
/// failures never burn retry time.
pub fn retry<T, E>(
    config: &BackoffConfig,
    mut op: impl FnMut(u32) -> Result<T, E>,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, RetryExhausted<E>> {
    let mut backoff = Backoff::new(config);

    loop {
        let attempt = backoff.failures() + 1;
        let error = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_transient(&error) {
            return Err(RetryExhausted {
                attempts: attempt,
                last_error: error,
            });
        }
        match backoff.next_pause() {
            Some(pause) => std::thread::sleep(pause),
            None => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }
        }
    }
}
