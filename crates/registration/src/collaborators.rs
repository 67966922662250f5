//! Capabilities the registration core consumes from the rest of the agent.
//!
//! Each trait carries exactly the operations registration needs. Implementors
//! report failures as `anyhow::Error`; the core maps them into
//! [`RegistrationError`](crate::RegistrationError) kinds at the call site.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::protocol::Envelope;

/// Certificate and key locations supplied by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// PEM certificate file used for mTLS
    pub cert_file: PathBuf,
    /// PEM private key file used for mTLS
    pub key_file: PathBuf,
}

/// Request/response channel to the fleet operator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Locations of the mTLS identity. Called once per [`Registration`](crate::Registration).
    async fn get_config(&self) -> anyhow::Result<TransportConfig>;

    /// Send one envelope and return the raw response bytes.
    async fn send(&self, envelope: Envelope) -> anyhow::Result<Vec<u8>>;
}

/// Source of the device's hardware facts.
pub trait HardwareSource: Send + Sync {
    fn hardware_information(&self) -> anyhow::Result<serde_json::Value>;
}

/// Read-only view of whether the device is still on its initial configuration.
pub trait ConfigProbe: Send + Sync {
    fn is_initial_config(&self) -> bool;
}

/// Collaborator that must release resources when the device unregisters.
///
/// The `Display` output names the collaborator in logs and in
/// [`DeregistrationError`](crate::DeregistrationError).
pub trait Deregistrable: fmt::Display + Send + Sync {
    fn deregister(&self) -> anyhow::Result<()>;
}
