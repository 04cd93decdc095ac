//! Readiness waiter: polls an HTTP endpoint until it answers.
//!
//! Any HTTP response counts as ready, whatever its status code. Only
//! transport failures (connection refused, unreachable host, probe timeout)
//! mean "not listening yet". A URL that cannot be probed at all is a
//! configuration error, not a timeout.

use std::time::Duration;

use reqwest::Url;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};

use crate::{AppError, Result};

/// Longest readiness deadline a target accepts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Endpoint, deadline, and poll interval for one readiness wait.
#[derive(Debug, Clone)]
pub struct ReadinessTarget {
    url: Url,
    timeout: Duration,
    poll_interval: Duration,
}

impl ReadinessTarget {
    /// Validate and build a readiness target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `url` is not an absolute `http`/`https`
    /// URL, if either duration is zero, or if `timeout` exceeds
    /// [`MAX_TIMEOUT`].
    pub fn new(url: &str, timeout: Duration, poll_interval: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|err| AppError::Config(format!("invalid readiness url {url:?}: {err}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "readiness url must use http or https, got {}",
                url.scheme()
            )));
        }

        if timeout.is_zero() {
            return Err(AppError::Config(
                "readiness timeout must be greater than zero".into(),
            ));
        }

        if timeout > MAX_TIMEOUT {
            return Err(AppError::Config(format!(
                "readiness timeout must be at most {}s, got {}s",
                MAX_TIMEOUT.as_secs(),
                timeout.as_secs()
            )));
        }

        if poll_interval.is_zero() {
            return Err(AppError::Config(
                "readiness poll interval must be greater than zero".into(),
            ));
        }

        Ok(Self {
            url,
            timeout,
            poll_interval,
        })
    }

    /// Probed URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Overall deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pause between failed probes.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Outcome of one readiness wait.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReadinessReport {
    /// Whether the endpoint answered before the deadline.
    pub ready: bool,
    /// Probes sent, including the successful one.
    pub attempts: u32,
    /// Time spent waiting.
    pub elapsed: Duration,
}

/// Block until `url` answers an HTTP GET or `timeout` elapses.
///
/// Returns `Ok(true)` on the first response of any status, without sleeping
/// if the very first probe succeeds. Returns `Ok(false)` once the deadline
/// has passed. The deadline is never overshot by more than one probe
/// interval because both sleeps and probes are clipped to the time left.
///
/// # Errors
///
/// Returns `AppError::Config` for a malformed URL or zero durations, and for
/// request errors that no amount of waiting can fix.
pub async fn wait_until_ready(url: &str, timeout: Duration, poll_interval: Duration) -> Result<bool> {
    let target = ReadinessTarget::new(url, timeout, poll_interval)?;
    Ok(wait_for_target(&target).await?.ready)
}

/// Poll a pre-validated [`ReadinessTarget`] and report how it went.
///
/// # Errors
///
/// See [`wait_until_ready`].
pub async fn wait_for_target(target: &ReadinessTarget) -> Result<ReadinessReport> {
    let span = info_span!("wait_until_ready", url = %target.url);
    poll(target).instrument(span).await
}

async fn poll(target: &ReadinessTarget) -> Result<ReadinessReport> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

    let started = Instant::now();
    let deadline = started.checked_add(target.timeout).ok_or_else(|| {
        AppError::Config(format!(
            "readiness timeout of {}s cannot be scheduled",
            target.timeout.as_secs()
        ))
    })?;
    let mut attempts: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        attempts += 1;
        match client
            .get(target.url.clone())
            .timeout(remaining)
            .send()
            .await
        {
            Ok(response) => {
                info!(
                    attempts,
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "endpoint is ready"
                );
                return Ok(ReadinessReport {
                    ready: true,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
            Err(err) if err.is_builder() => {
                return Err(AppError::Config(format!(
                    "cannot probe {}: {err}",
                    target.url
                )));
            }
            Err(err) => {
                debug!(attempts, %err, "endpoint not ready yet");
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(target.poll_interval.min(remaining)).await;
    }

    info!(
        attempts,
        timeout_ms = target.timeout.as_millis(),
        "endpoint did not become ready before the deadline"
    );
    Ok(ReadinessReport {
        ready: false,
        attempts,
        elapsed: started.elapsed(),
    })
}
