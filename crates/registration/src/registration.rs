//! Top-level registration handle for one agent instance.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use fleetlink_core::RegistrationSettings;

use crate::cert_store::CertificateStore;
use crate::client::RegistrationClient;
use crate::collaborators::{ConfigProbe, Deregistrable, HardwareSource, Transport};
use crate::deregistration::DeregistrationRegistry;
use crate::error::{RegistrationError, RegistrationResult};
use crate::scheduler::{BackoffPolicy, RetryScheduler};
use crate::state::{RegistrationState, SharedState};

/// Composes the certificate store, client, retry scheduler and
/// deregistration registry around one shared [`RegistrationState`].
pub struct Registration {
    client: Arc<RegistrationClient>,
    scheduler: RetryScheduler,
    registry: DeregistrationRegistry,
    state: SharedState,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl Registration {
    /// Fetch the transport configuration and load the bootstrap identity.
    ///
    /// Any failure here is a [`RegistrationError::Config`] and the agent
    /// cannot start.
    pub async fn new(
        device_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        hardware: Arc<dyn HardwareSource>,
        probe: Arc<dyn ConfigProbe>,
        settings: &RegistrationSettings,
    ) -> RegistrationResult<Self> {
        let settings = RegistrationSettings {
            device_id: device_id.into(),
            ..settings.clone()
        };
        settings.validate()?;

        let config = transport.get_config().await.map_err(|e| {
            RegistrationError::Config(format!("cannot get transport config: {:#}", e))
        })?;
        let store = CertificateStore::open(&config, settings.register_common_name.clone())?;

        tracing::info!(
            device_id = %settings.device_id,
            cert_path = %store.cert_path().display(),
            role = %store.role()?,
            "Loaded registration identity"
        );

        let state = SharedState::new();
        let client = Arc::new(RegistrationClient::new(
            settings.device_id.clone(),
            store,
            transport,
            hardware,
            state.clone(),
        ));
        let scheduler = RetryScheduler::new(
            client.clone(),
            probe,
            BackoffPolicy::from_settings(&settings),
        );

        Ok(Self {
            client,
            scheduler,
            registry: DeregistrationRegistry::new(state.clone()),
            state,
            cancel: Mutex::new(None),
        })
    }

    /// Register now and keep retrying in the background if needed.
    ///
    /// Returns once the first attempt has finished, which does not imply the
    /// device is registered. A loop left over from an earlier call is
    /// cancelled first.
    pub async fn register_device(&self) -> Option<JoinHandle<()>> {
        let (tx, rx) = watch::channel(false);
        let previous = self.cancel_slot().replace(tx);
        if let Some(previous) = previous {
            let _ = previous.send(true);
        }
        self.scheduler.start(rx).await
    }

    pub fn is_registered(&self) -> bool {
        self.state.is_registered()
    }

    /// Attempts made by the retry loop.
    pub fn retry_count(&self) -> u32 {
        self.state.retry_count()
    }

    pub fn state(&self) -> RegistrationState {
        self.state.snapshot()
    }

    pub fn device_id(&self) -> &str {
        self.client.device_id()
    }

    pub fn certificate_store(&self) -> &CertificateStore {
        self.client.store()
    }

    /// Queue collaborators to release on [`deregister`](Self::deregister).
    pub fn deregister_later<I>(&mut self, handles: I)
    where
        I: IntoIterator<Item = Arc<dyn Deregistrable>>,
    {
        self.registry.deregister_later(handles);
    }

    /// Stop retrying and release every queued collaborator.
    ///
    /// An attempt already in flight is allowed to finish first, so the device
    /// is unregistered when this returns. Collaborator failures come back as
    /// [`RegistrationError::Deregistration`].
    pub async fn deregister(&self) -> RegistrationResult<()> {
        self.shutdown();
        let _idle = self.client.idle().await;
        self.registry.deregister()?;
        Ok(())
    }

    /// Stop the retry loop, if one is running.
    pub fn shutdown(&self) {
        if let Some(cancel) = self.cancel_slot().take() {
            let _ = cancel.send(true);
            tracing::debug!(device_id = %self.device_id(), "Registration retry stopped");
        }
    }

    fn cancel_slot(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shutdown();
    }
}
