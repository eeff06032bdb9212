use core_affinity::CoreId;
use tracing::{info, warn};

use crate::error::{CameraError, Result};
use crate::transport::{DeviceDescriptor, Transport};

/// Pick the preferred device, or the first one the transport reports
pub fn select_device(
    transport: &dyn Transport,
    preferred: Option<&str>,
) -> Result<DeviceDescriptor> {
    info!("Enumerating capture devices...");
    let devices = transport
        .enumerate_devices()
        .map_err(CameraError::from_open)?;
    for device in &devices {
        info!("Found device: {}", device);
    }

    match preferred {
        Some(id) => devices
            .into_iter()
            .find(|device| device.id == id)
            .ok_or_else(|| CameraError::DeviceNotFound(id.to_string())),
        None => devices
            .into_iter()
            .next()
            .ok_or_else(|| CameraError::DeviceNotFound("no capture device found".to_string())),
    }
}

/// Pin the calling thread to one CPU core
pub fn pin_current_thread(cpu: usize) -> bool {
    let pinned = core_affinity::set_for_current(CoreId { id: cpu });
    if pinned {
        info!(cpu, "Thread pinned");
    } else {
        warn!(cpu, "Could not pin thread");
    }
    pinned
}
