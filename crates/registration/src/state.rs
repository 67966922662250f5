//! Registration flags shared between the caller and the retry task.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Snapshot of the registration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationState {
    /// Set only by a fully committed successful attempt, cleared only by deregistration
    pub registered: bool,
    /// Attempts made by the retry loop; the first synchronous attempt is not counted
    pub retry_count: u32,
}

/// Lock-guarded handle to the [`RegistrationState`] of one agent instance.
///
/// Clones share the same state. Readers take the read lock, every mutation
/// takes the write lock and none of them call back out while holding it.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<RegistrationState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of both flags.
    pub fn snapshot(&self) -> RegistrationState {
        *self.read()
    }

    pub fn is_registered(&self) -> bool {
        self.read().registered
    }

    pub fn retry_count(&self) -> u32 {
        self.read().retry_count
    }

    pub(crate) fn mark_registered(&self) {
        self.write().registered = true;
    }

    pub(crate) fn mark_deregistered(&self) {
        self.write().registered = false;
    }

    /// Increment the retry counter and return the new value.
    pub(crate) fn increment_retry(&self) -> u32 {
        let mut state = self.write();
        state.retry_count = state.retry_count.saturating_add(1);
        state.retry_count
    }

    // The guarded values are plain flags, so a poisoned lock still holds
    // usable data.
    fn read(&self) -> RwLockReadGuard<'_, RegistrationState> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistrationState> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
