//! Retry loop driving [`RegistrationClient`] until the device is onboarded.
//!
//! ```text
//! Idle -> Attempting -> Succeeded
//!              |
//!              v
//!       WaitingBackoff -> Attempting ...
//! ```
//!
//! The first attempt runs on the caller. If it fails while the device is still
//! on its initial configuration, a single background task keeps retrying with
//! exponential backoff. The task ends on the first successful attempt, on an
//! error that cannot be retried, when the configuration probe reports the
//! device as configured, or when cancelled.
//!
//! A successful first attempt starts no loop at all, even while the probe
//! still reports the initial configuration; earlier agents kept polling until
//! the probe flipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use fleetlink_core::RegistrationSettings;

use crate::client::RegistrationClient;
use crate::collaborators::ConfigProbe;
use crate::error::RegistrationError;

/// Doubling backoff with an upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// A ceiling below `initial` is raised to `initial`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_settings(settings: &RegistrationSettings) -> Self {
        Self::new(settings.retry_after(), settings.max_interval())
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Interval to wait after a failed attempt that followed `current`.
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }

    /// Successive waits assuming every attempt fails.
    pub fn intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial), move |current| Some(self.next(*current)))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&RegistrationSettings::default())
    }
}

/// Runs the first attempt and owns the background retry task.
pub struct RetryScheduler {
    client: Arc<RegistrationClient>,
    probe: Arc<dyn ConfigProbe>,
    policy: BackoffPolicy,
}

impl RetryScheduler {
    pub fn new(
        client: Arc<RegistrationClient>,
        probe: Arc<dyn ConfigProbe>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            probe,
            policy,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Attempt registration once, then detach the retry loop if still needed.
    ///
    /// Errors from the first attempt are logged, never returned. Returns the
    /// loop's handle, or `None` when no loop was started. Sending `true` on
    /// the channel that feeds `cancel` (or dropping its sender) stops the loop
    /// at its next wake-up.
    pub async fn start(&self, cancel: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let device_id = self.client.device_id().to_string();

        match self.client.register_unless_cancelled(&cancel).await {
            Ok(()) => return None,
            Err(RegistrationError::Cancelled) => return None,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "Cannot register device");
            }
        }

        if !self.probe.is_initial_config() {
            tracing::debug!(device_id = %device_id, "Device already configured, no retry needed");
            return None;
        }

        tracing::info!(
            device_id = %device_id,
            interval_secs = self.policy.initial().as_secs(),
            "Scheduling registration retries"
        );

        let client = self.client.clone();
        let probe = self.probe.clone();
        let policy = self.policy;
        Some(tokio::spawn(retry_loop(client, probe, policy, cancel)))
    }
}

async fn retry_loop(
    client: Arc<RegistrationClient>,
    probe: Arc<dyn ConfigProbe>,
    policy: BackoffPolicy,
    mut cancel: watch::Receiver<bool>,
) {
    let device_id = client.device_id().to_string();
    let mut interval = policy.initial();
    let sleep = tokio::time::sleep(interval);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    tracing::info!(device_id = %device_id, "Registration retry cancelled");
                    return;
                }
                continue;
            }
        }

        tracing::debug!(
            device_id = %device_id,
            interval_secs = interval.as_secs(),
            "Registration retry tick"
        );

        if !probe.is_initial_config() {
            tracing::info!(
                device_id = %device_id,
                "Device configured, stopping registration retry"
            );
            return;
        }

        let result = client.register_unless_cancelled(&cancel).await;
        if let Err(RegistrationError::Cancelled) = result {
            tracing::info!(device_id = %device_id, "Registration retry cancelled");
            return;
        }
        let retry_count = client.state().increment_retry();

        match result {
            Ok(()) => {
                tracing::info!(device_id = %device_id, retry_count, "Registration retry succeeded");
                return;
            }
            Err(e) if !e.is_retryable() => {
                tracing::error!(
                    device_id = %device_id,
                    retry_count,
                    error = %e,
                    "Registration retry stopped on unrecoverable error"
                );
                return;
            }
            Err(e) => {
                interval = policy.next(interval);
                sleep.as_mut().reset(Instant::now() + interval);
                tracing::error!(
                    device_id = %device_id,
                    retry_count,
                    interval_secs = interval.as_secs(),
                    error = %e,
                    "Registration retry failed"
                );
            }
        }
    }
}
