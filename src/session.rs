//! Device session handles
//!
//! The physical device's communication channel is a single-owner resource.
//! A [`SessionHandle`] is the capability to use it; acquiring waits until the
//! current owner releases, and dropping the handle always releases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwner {
    Discovery,
    Signing,
}

type Owners = Arc<Mutex<HashMap<String, SessionOwner>>>;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    owners: Owners,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session of the device at `device_path`, waiting for the current owner
    pub async fn acquire(&self, device_path: &str, owner: SessionOwner) -> SessionHandle {
        let slot = self.slot(device_path);
        let guard = slot.lock_owned().await;
        self.handle(device_path, owner, guard)
    }

    /// Claim the session only if nobody holds it
    pub fn try_acquire(&self, device_path: &str, owner: SessionOwner) -> Option<SessionHandle> {
        let slot = self.slot(device_path);
        let guard = slot.try_lock_owned().ok()?;
        Some(self.handle(device_path, owner, guard))
    }

    pub fn owner(&self, device_path: &str) -> Option<SessionOwner> {
        lock(&self.owners).get(device_path).copied()
    }

    pub fn is_held(&self, device_path: &str) -> bool {
        self.owner(device_path).is_some()
    }

    fn slot(&self, device_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.slots)
            .entry(device_path.to_string())
            .or_default()
            .clone()
    }

    fn handle(
        &self,
        device_path: &str,
        owner: SessionOwner,
        guard: OwnedMutexGuard<()>,
    ) -> SessionHandle {
        lock(&self.owners).insert(device_path.to_string(), owner);
        log::debug!("Session on {} acquired by {:?}", device_path, owner);
        SessionHandle {
            device_path: device_path.to_string(),
            owner,
            owners: Arc::clone(&self.owners),
            _guard: guard,
        }
    }
}

pub struct SessionHandle {
    device_path: String,
    owner: SessionOwner,
    owners: Owners,
    _guard: OwnedMutexGuard<()>,
}

impl SessionHandle {
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn owner(&self) -> SessionOwner {
        self.owner
    }

    /// Explicitly give the session back
    pub fn release(self) {}
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        lock(&self.owners).remove(&self.device_path);
        log::debug!("Session on {} released by {:?}", self.device_path, self.owner);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
