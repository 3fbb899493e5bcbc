/// Retry policy with exponential backoff for re-establishing connections
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Add random jitter to each delay (±30%)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt `attempt` (0-based): `base × 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `f` until it succeeds or `max_attempts` attempts have failed.
///
/// `label` names the remote end in log lines ("target store", "event source").
/// No delay follows the final failed attempt.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    label: &str,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;

                if attempt >= max_attempts {
                    error!(
                        target_name = label,
                        attempts = attempt,
                        error = %e,
                        "Giving up on connection after {} attempts",
                        attempt
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                let delay = config.delay_for(attempt - 1);
                warn!(
                    "{} connection attempt {}/{} failed: {}. Retrying in {:.1}s...",
                    label,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_secs_f64()
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn apply_jitter(base: Duration) -> Duration {
    let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}
