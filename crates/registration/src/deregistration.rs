//! Ordered release of collaborators when the device unregisters.

use std::sync::Arc;

use crate::collaborators::Deregistrable;
use crate::error::{DeregistrationError, DeregistrationFailure};
use crate::state::SharedState;

/// Append-only list of collaborators to deregister, in registration order.
pub struct DeregistrationRegistry {
    handles: Vec<Arc<dyn Deregistrable>>,
    state: SharedState,
}

impl DeregistrationRegistry {
    pub fn new(state: SharedState) -> Self {
        Self {
            handles: Vec::new(),
            state,
        }
    }

    /// Queue collaborators for deregistration. Setup-time only.
    pub fn deregister_later<I>(&mut self, handles: I)
    where
        I: IntoIterator<Item = Arc<dyn Deregistrable>>,
    {
        self.handles.extend(handles);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Deregister every collaborator, continuing past failures.
    ///
    /// The device is marked unregistered whatever the outcome.
    pub fn deregister(&self) -> Result<(), DeregistrationError> {
        let mut failures = Vec::new();

        for handle in &self.handles {
            match handle.deregister() {
                Ok(()) => tracing::debug!(handle = %handle, "Deregistered"),
                Err(e) => {
                    tracing::error!(handle = %handle, error = %e, "Failed to deregister");
                    failures.push(DeregistrationFailure {
                        handle: handle.to_string(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        self.state.mark_deregistered();
        tracing::info!(
            handles = self.handles.len(),
            failed = failures.len(),
            "Device deregistered"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeregistrationError::new(failures))
        }
    }
}
