//! Error types for device registration.
//!
//! Every failure on the register/renew path maps to one of these kinds. All of
//! them except [`RegistrationError::Config`] and [`RegistrationError::Cancelled`]
//! are retried by the scheduler.

use std::fmt;

use thiserror::Error;

/// Errors that can occur while registering or deregistering a device.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Identity material missing or transport configuration unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key, CSR or certificate could not be generated or parsed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Request could not be sent or timed out
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operator answered with a non-success status
    #[error("cannot register to the operator, status_code={status_code}, body={body}")]
    Rejected {
        /// Status code from the response envelope
        status_code: i64,
        /// Raw response body
        body: String,
    },

    /// Response envelope or message content malformed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Hardware facts could not be collected
    #[error("Hardware information error: {0}")]
    Hardware(String),

    /// Certificate or key could not be persisted
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Attempt abandoned because the device is being deregistered or shut down
    #[error("Registration cancelled")]
    Cancelled,

    /// One or more collaborators failed to deregister
    #[error(transparent)]
    Deregistration(#[from] DeregistrationError),
}

impl RegistrationError {
    /// Whether the retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RegistrationError::Config(_) | RegistrationError::Cancelled
        )
    }
}

impl From<fleetlink_core::CoreError> for RegistrationError {
    fn from(err: fleetlink_core::CoreError) -> Self {
        RegistrationError::Config(err.to_string())
    }
}

/// A single collaborator that failed to deregister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeregistrationFailure {
    /// Name of the collaborator
    pub handle: String,
    /// Reported failure
    pub reason: String,
}

/// Aggregate of every collaborator failure from one deregistration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeregistrationError {
    failures: Vec<DeregistrationFailure>,
}

impl DeregistrationError {
    pub(crate) fn new(failures: Vec<DeregistrationFailure>) -> Self {
        Self { failures }
    }

    /// Failures in the order the collaborators were invoked.
    pub fn failures(&self) -> &[DeregistrationFailure] {
        &self.failures
    }
}

impl fmt::Display for DeregistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} deregistration(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; failed to deregister {}: {}", failure.handle, failure.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeregistrationError {}

/// Result type for registration operations.
pub type RegistrationResult<T> = Result<T, RegistrationError>;
