/// Polling utilities for waiting on conditions with backoff, timeout and cancellation
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::cancel::CancelSignal;

/// Backoff policy for a single wait
///
/// The delay after the n-th unsuccessful attempt is `initial * factor^(n-1)`,
/// capped at `max_delay`. No jitter is applied, so delays never decrease.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub max_elapsed: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.7,
            max_delay: Duration::from_secs(30),
            max_attempts: 30,
            max_elapsed: Some(Duration::from_secs(600)),
        }
    }
}

impl Backoff {
    /// Create a backoff policy without an overall time budget
    pub fn new(initial: Duration, factor: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            factor,
            max_delay,
            max_attempts,
            max_elapsed: None,
        }
    }

    /// Bound the whole wait by a wall-clock budget
    #[allow(dead_code)]
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Delay slept after the `attempt`-th (1-based) unsuccessful probe
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        // f64::min discards NaN, so an overflowing product falls back to the cap
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Classification of a failed probe call
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Retried like "not done yet"
    #[error("{0:#}")]
    Transient(anyhow::Error),
    /// Aborts the wait immediately
    #[error("{0:#}")]
    Permanent(anyhow::Error),
}

impl ProbeError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("wait cancelled")]
    Cancelled,
    #[error(transparent)]
    Probe(anyhow::Error),
}

/// Terminal result of a wait
#[derive(Debug)]
pub enum WaitOutcome {
    Succeeded { attempts: u32 },
    TimedOut { attempts: u32, elapsed: Duration },
    Errored(WaitError),
}

impl WaitOutcome {
    #[allow(dead_code)]
    pub fn is_succeeded(&self) -> bool {
        matches!(self, WaitOutcome::Succeeded { .. })
    }

    #[allow(dead_code)]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitOutcome::TimedOut { .. })
    }

    /// Convert into a check-level result, naming what was awaited
    pub fn into_result(self, what: &str) -> anyhow::Result<()> {
        match self {
            WaitOutcome::Succeeded { .. } => Ok(()),
            WaitOutcome::TimedOut { attempts, elapsed } => anyhow::bail!(
                "timed out waiting for {} after {} attempts ({}s)",
                what,
                attempts,
                elapsed.as_secs()
            ),
            WaitOutcome::Errored(WaitError::Cancelled) => {
                anyhow::bail!("cancelled while waiting for {}", what)
            }
            WaitOutcome::Errored(WaitError::Probe(e)) => {
                Err(e.context(format!("failed waiting for {}", what)))
            }
        }
    }
}

/// Poll `probe` until it reports done, fails permanently, the backoff budget
/// is exhausted or the run is cancelled
///
/// The probe should return:
/// - Ok(true) when the condition is met
/// - Ok(false) when the condition is not yet met
/// - Err(ProbeError::Transient) for errors worth retrying
/// - Err(ProbeError::Permanent) when the condition can never be met
pub async fn wait_for<F, Fut>(
    description: &str,
    backoff: &Backoff,
    cancel: &CancelSignal,
    mut probe: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ProbeError>>,
{
    info!("{}...", description);

    let start = Instant::now();
    let mut attempts = 0u32;
    if backoff.max_attempts == 0 {
        return WaitOutcome::TimedOut {
            attempts,
            elapsed: Duration::ZERO,
        };
    }

    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Errored(WaitError::Cancelled);
        }

        attempts += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WaitOutcome::Errored(WaitError::Cancelled),
            result = probe() => result,
        };
        match result {
            Ok(true) => {
                info!("✓ {}", description);
                return WaitOutcome::Succeeded { attempts };
            }
            Ok(false) => {}
            Err(ProbeError::Transient(e)) => {
                debug!("{} (attempt {}): {:#}", description, attempts, e);
            }
            Err(ProbeError::Permanent(e)) => {
                return WaitOutcome::Errored(WaitError::Probe(e));
            }
        }

        let elapsed = start.elapsed();
        if attempts >= backoff.max_attempts {
            return WaitOutcome::TimedOut { attempts, elapsed };
        }

        let mut delay = backoff.delay_after(attempts);
        if let Some(max_elapsed) = backoff.max_elapsed {
            if elapsed >= max_elapsed {
                return WaitOutcome::TimedOut { attempts, elapsed };
            }
            delay = delay.min(max_elapsed - elapsed);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WaitOutcome::Errored(WaitError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
