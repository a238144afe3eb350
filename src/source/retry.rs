use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::logging::{log, obj, v_num, v_str, Domain, Level};

/// Declarative retry policy shared by every source and asset class.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
            backoff: 1.5,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// `base * backoff^attempt`, capped at `max_delay_ms`, then spread by
    /// up to `jitter_factor` either way.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = (self.base_delay_ms as f64 * self.backoff.powi(attempt as i32))
            .min(self.max_delay_ms as f64);
        let spread = capped * self.jitter_factor;
        let offset = if spread > 0.0 { rand::thread_rng().gen_range(-spread..=spread) } else { 0.0 };
        Duration::from_millis((capped + offset).max(0.0).round() as u64)
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// the policy's attempts are spent. Returns the last error.
pub async fn retry_async<F, Fut, T, E, P>(policy: &RetryPolicy, label: &str, retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if attempt >= policy.max_retries || !retryable(&err) {
            return Err(err);
        }
        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        log(
            Level::Debug,
            Domain::Market,
            "retry",
            obj(&[
                ("operation", v_str(label)),
                ("attempt", v_num(attempt as f64)),
                ("of", v_num(policy.attempts() as f64)),
                ("error", v_str(&err.to_string())),
                ("delay_ms", v_num(delay.as_millis() as f64)),
            ]),
        );
        sleep(delay).await;
    }
}

/// Throttling, timeouts and gateway trouble; worth asking again.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

pub fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}
