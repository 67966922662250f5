//! Device registration for the Fleetlink edge-device agent.
//!
//! A device starts with a shared bootstrap identity (certificate CN
//! `register`). Registration exchanges it for a device certificate issued by
//! the fleet operator, persists the new pair, and renews it with the same key
//! on later starts.
//!
//! # Components
//!
//! - [`CertificateStore`]: key/certificate pair on disk, role detection, CSRs
//! - [`RegistrationClient`]: one register/renew exchange
//! - [`RetryScheduler`]: first attempt plus background retries with backoff
//! - [`DeregistrationRegistry`]: ordered release of collaborators
//! - [`Registration`]: the handle an agent holds, composing the above

pub mod cert_store;
pub mod client;
pub mod collaborators;
pub mod deregistration;
pub mod error;
pub mod protocol;
pub mod registration;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod test_support;

pub use cert_store::{CertificateSigningRequest, CertificateStore, IdentityMaterial, IdentityRole};
pub use client::{RegistrationClient, REQUEST_TIMEOUT};
pub use collaborators::{ConfigProbe, Deregistrable, HardwareSource, Transport, TransportConfig};
pub use deregistration::DeregistrationRegistry;
pub use error::{
    DeregistrationError, DeregistrationFailure, RegistrationError, RegistrationResult,
};
pub use protocol::{
    Envelope, MessageResponse, RegistrationRequest, ResponseEnvelope, REGISTRATION_DIRECTIVE,
};
pub use registration::Registration;
pub use scheduler::{BackoffPolicy, RetryScheduler};
pub use state::{RegistrationState, SharedState};
