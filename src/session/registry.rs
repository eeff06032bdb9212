//! Check-out / check-in of physical devices
//!
//! One session per device. A registry is an ordinary value: sessions that
//! share one contend for devices, separate registries never collide.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{CameraError, Result};

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    checked_out: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a device; the claim lasts until the lease is dropped
    pub fn check_out(&self, device_id: &str) -> Result<RegistryLease> {
        if !self.lock().insert(device_id.to_string()) {
            return Err(CameraError::DeviceBusy(format!(
                "{device_id} is held by another session"
            )));
        }
        debug!(device = device_id, "Device checked out");
        Ok(RegistryLease {
            registry: self.clone(),
            device_id: device_id.to_string(),
        })
    }

    pub fn is_checked_out(&self, device_id: &str) -> bool {
        self.lock().contains(device_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn check_in(&self, device_id: &str) {
        if self.lock().remove(device_id) {
            debug!(device = device_id, "Device checked in");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.checked_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of check-out; checks the device back in on drop
#[derive(Debug)]
pub struct RegistryLease {
    registry: DeviceRegistry,
    device_id: String,
}

impl RegistryLease {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        self.registry.check_in(&self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_check_out_is_busy() {
        let registry = DeviceRegistry::new();
        let lease = registry.check_out("cam-0").unwrap();
        assert!(matches!(
            registry.check_out("cam-0"),
            Err(CameraError::DeviceBusy(_))
        ));
        assert!(registry.check_out("cam-1").is_ok());

        drop(lease);
        assert!(!registry.is_checked_out("cam-0"));
        assert!(registry.check_out("cam-0").is_ok());
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = DeviceRegistry::new();
        let b = DeviceRegistry::new();
        let _held = a.check_out("cam-0").unwrap();
        assert!(b.check_out("cam-0").is_ok());
        assert_eq!(a.len(), 1);
    }
}
