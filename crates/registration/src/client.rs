//! One register/renew exchange with the fleet operator.
//!
//! # Protocol Flow
//!
//! 1. Classify the current identity: bootstrap mints a new key, device renews
//!    with the current one
//! 2. Collect hardware facts
//! 3. Wrap `{Hardware, CertificateRequest}` in a registration envelope
//! 4. Send under a fixed 1 second deadline
//! 5. Parse the outer response envelope
//! 6. Reject status codes of 300 and above
//! 7. Extract `certificate` from the inner message content
//! 8. Persist certificate and key as one unit
//! 9. Mark the device registered
//!
//! Any failure before step 8 leaves the registered flag and the files on disk
//! untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::cert_store::{CertificateSigningRequest, CertificateStore, IdentityRole};
use crate::collaborators::{HardwareSource, Transport};
use crate::error::{RegistrationError, RegistrationResult};
use crate::protocol::{RegistrationRequest, ResponseEnvelope};
use crate::state::SharedState;

/// Deadline for a single request to the operator.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Performs single registration attempts for one device.
pub struct RegistrationClient {
    device_id: String,
    store: CertificateStore,
    transport: Arc<dyn Transport>,
    hardware: Arc<dyn HardwareSource>,
    state: SharedState,
    /// Serializes attempts
    in_flight: Mutex<()>,
}

impl RegistrationClient {
    pub fn new(
        device_id: impl Into<String>,
        store: CertificateStore,
        transport: Arc<dyn Transport>,
        hardware: Arc<dyn HardwareSource>,
        state: SharedState,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            transport,
            hardware,
            state,
            in_flight: Mutex::new(()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Run one complete register/renew attempt.
    pub async fn register_once(&self) -> RegistrationResult<()> {
        let _attempt = self.in_flight.lock().await;
        self.attempt().await
    }

    /// Like [`register_once`](Self::register_once), but gives up with
    /// [`RegistrationError::Cancelled`] if `cancel` is set by the time this
    /// attempt gets its turn.
    pub async fn register_unless_cancelled(
        &self,
        cancel: &watch::Receiver<bool>,
    ) -> RegistrationResult<()> {
        let _attempt = self.in_flight.lock().await;
        if *cancel.borrow() {
            return Err(RegistrationError::Cancelled);
        }
        self.attempt().await
    }

    /// Wait for the attempt in flight, if any, and hold off new ones until the
    /// guard is dropped.
    pub(crate) async fn idle(&self) -> MutexGuard<'_, ()> {
        self.in_flight.lock().await
    }

    async fn attempt(&self) -> RegistrationResult<()> {
        let signing_request = self.signing_request()?;

        let hardware = self
            .hardware
            .hardware_information()
            .map_err(|e| RegistrationError::Hardware(format!("{:#}", e)))?;

        let envelope = RegistrationRequest {
            hardware,
            certificate_request: signing_request.csr_pem.clone(),
        }
        .into_envelope()?;
        let message_id = envelope.message_id.clone();

        tracing::debug!(
            device_id = %self.device_id,
            message_id = %message_id,
            "Sending registration request"
        );

        let sent = tokio::time::timeout(REQUEST_TIMEOUT, self.transport.send(envelope)).await;
        let raw = match sent {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(RegistrationError::Transport(format!("{:#}", e))),
            Err(_) => {
                return Err(RegistrationError::Transport(format!(
                    "no response within {:?}",
                    REQUEST_TIMEOUT
                )))
            }
        };

        let response = ResponseEnvelope::parse(&raw)?;
        if !response.is_success() {
            tracing::error!(
                device_id = %self.device_id,
                status_code = response.status_code,
                body = response.body_text(),
                "Operator rejected registration"
            );
            return Err(RegistrationError::Rejected {
                status_code: response.status_code,
                body: response.body_text().to_string(),
            });
        }

        let message = response.message()?;
        let certificate = message.certificate()?;

        self.store
            .write_certificate(certificate, &signing_request.key_pem)
            .map_err(|e| {
                tracing::error!(
                    device_id = %self.device_id,
                    error = %e,
                    "Failed to write certificate"
                );
                e
            })?;

        self.state.mark_registered();
        tracing::info!(
            device_id = %self.device_id,
            message_id = %message_id,
            "Device registered"
        );
        Ok(())
    }

    fn signing_request(&self) -> RegistrationResult<CertificateSigningRequest> {
        match self.store.role()? {
            IdentityRole::Bootstrap => self.store.create_device_identity(&self.device_id),
            IdentityRole::Device => {
                let key = self.store.current_key()?;
                self.store.renew(&self.device_id, &key)
            }
        }
    }
}
