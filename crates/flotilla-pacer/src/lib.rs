//! Retry pacing and concurrency gating for backend calls.
//!
//! Remote stores throttle aggressively and fail transiently; every retryable
//! backend call goes through a [`Pacer`] that sleeps between attempts with
//! exponential backoff, decays back toward the minimum on success, and honors
//! server-provided `Retry-After` hints. A [`TokenDispenser`] bounds the
//! fan-out of concurrent operations (e.g. outstanding upload chunks) per
//! backend.
//!
//! The pacer is deliberately generic over the error type: the caller decides
//! what is retryable by returning a [`Verdict`], so this crate has no
//! knowledge of any particular backend's failure taxonomy.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

pub mod dispenser;

pub use dispenser::{TokenDispenser, TokenGuard};

/// Outcome of a single paced attempt.
#[derive(Debug)]
pub enum Verdict<T, E> {
    /// The call succeeded; decay the sleep toward the minimum.
    Done(T),
    /// The call failed transiently; sleep, double the backoff, try again.
    Retry(E),
    /// The call was throttled with an explicit hint; reset the sleep to the
    /// hinted duration before the next attempt.
    RetryAfter(E, Duration),
    /// The call failed terminally; surface the error unchanged.
    Fail(E),
}

/// Pacer tuning knobs.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Sleep floor between calls.
    pub min_sleep: Duration,
    /// Backoff ceiling.
    pub max_sleep: Duration,
    /// On success the sleep decays by `sleep * (2^d - 1) / 2^d`; `d == 0`
    /// snaps straight back to `min_sleep`.
    pub decay_constant: u32,
    /// Maximum attempts per [`Pacer::call`].
    pub retries: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        PacerConfig {
            min_sleep: Duration::from_millis(10),
            max_sleep: Duration::from_secs(2),
            decay_constant: 1,
            retries: 10,
        }
    }
}

/// Exponential-backoff retry governor.
///
/// Sleep state is private to each instance; backends each own one so that a
/// throttled remote does not slow down an unrelated one.
#[derive(Debug)]
pub struct Pacer {
    config: PacerConfig,
    sleep: Mutex<Duration>,
}

impl Pacer {
    pub fn new(config: PacerConfig) -> Self {
        let sleep = Mutex::new(config.min_sleep);
        Pacer { config, sleep }
    }

    /// A pacer with [`PacerConfig::default`] tuning.
    pub fn with_defaults() -> Self {
        Self::new(PacerConfig::default())
    }

    /// The currently scheduled inter-call sleep.
    pub fn current_sleep(&self) -> Duration {
        *self.sleep.lock().unwrap()
    }

    /// Run `f` until it reports [`Verdict::Done`] or [`Verdict::Fail`], or
    /// the attempt budget is exhausted (the last error is surfaced).
    pub async fn call<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Verdict<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Verdict::Done(v) => {
                    self.decay();
                    return Ok(v);
                }
                Verdict::Fail(e) => {
                    self.decay();
                    return Err(e);
                }
                Verdict::Retry(e) => {
                    if attempt >= self.config.retries {
                        warn!(attempt, "retry budget exhausted");
                        return Err(e);
                    }
                    let pause = self.backoff();
                    debug!(attempt, pause_ms = pause.as_millis() as u64, "pacer retry");
                    tokio::time::sleep(pause).await;
                }
                Verdict::RetryAfter(e, hint) => {
                    if attempt >= self.config.retries {
                        warn!(attempt, "retry budget exhausted");
                        return Err(e);
                    }
                    self.reset_to(hint);
                    debug!(
                        attempt,
                        hint_ms = hint.as_millis() as u64,
                        "pacer honoring retry-after hint"
                    );
                    tokio::time::sleep(hint).await;
                }
            }
        }
    }

    /// Like [`Pacer::call`] but with exactly one attempt; retryable failures
    /// surface their error without sleeping.
    pub async fn call_no_retry<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Verdict<T, E>>,
    {
        match f().await {
            Verdict::Done(v) => {
                self.decay();
                Ok(v)
            }
            Verdict::Fail(e) => Err(e),
            Verdict::Retry(e) | Verdict::RetryAfter(e, _) => {
                self.backoff();
                Err(e)
            }
        }
    }

    /// Sleep the current backoff, then double it (capped at `max_sleep`).
    /// Returns the duration that was slept.
    fn backoff(&self) -> Duration {
        let mut sleep = self.sleep.lock().unwrap();
        let pause = *sleep;
        *sleep = (*sleep * 2).min(self.config.max_sleep).max(self.config.min_sleep);
        pause
    }

    /// Decay the sleep toward `min_sleep` by the decay constant.
    fn decay(&self) {
        let mut sleep = self.sleep.lock().unwrap();
        let d = self.config.decay_constant;
        let decayed = if d == 0 {
            self.config.min_sleep
        } else {
            let nanos = sleep.as_nanos();
            let kept = nanos - (nanos >> d);
            Duration::from_nanos(kept as u64)
        };
        *sleep = decayed.max(self.config.min_sleep);
    }

    /// Replace the sleep with a server-provided hint, clamped to the ceiling.
    fn reset_to(&self, hint: Duration) {
        let mut sleep = self.sleep.lock().unwrap();
        *sleep = hint.min(self.config.max_sleep).max(self.config.min_sleep);
    }
}

/// Whether an HTTP-style status code is retryable by default: request
/// timeout, throttling, and server errors.
pub fn retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

/// Shared handle used where several tasks pace through one governor.
pub type SharedPacer = Arc<Pacer>;
