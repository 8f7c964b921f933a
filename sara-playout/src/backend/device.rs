//! Device registry and reference-counted acquisition
//!
//! One `DeviceManager` per process. Acquisition is reference counted so a
//! second player on the same device (crossfade overlap, preview pair)
//! succeeds without re-initializing anything; the last release tears the
//! count down. Enumeration is pluggable so tests can register virtual
//! devices without audio hardware.

use crate::backend::DeviceId;
use cpal::traits::{DeviceTrait, HostTrait};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One enumerated output device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    /// True for the host default output
    pub is_default: bool,
}

type Enumerator = Box<dyn Fn() -> Vec<DeviceInfo> + Send + Sync>;

/// Process-wide device registry with refcounted acquisition
pub struct DeviceManager {
    enumerate: Enumerator,
    known: Mutex<Vec<DeviceInfo>>,
    refcounts: Mutex<HashMap<DeviceId, usize>>,
}

impl DeviceManager {
    /// Registry backed by cpal enumeration.
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(Self {
            enumerate: Box::new(enumerate_cpal_outputs),
            known: Mutex::new(Vec::new()),
            refcounts: Mutex::new(HashMap::new()),
        });
        manager.refresh();
        manager
    }

    /// Registry with a fixed virtual device list (tests, null output).
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Arc<Self> {
        let list = devices.clone();
        let manager = Arc::new(Self {
            enumerate: Box::new(move || list.clone()),
            known: Mutex::new(devices),
            refcounts: Mutex::new(HashMap::new()),
        });
        manager
    }

    /// Snapshot of the known devices.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.known.lock().unwrap().clone()
    }

    /// Re-run enumeration, replacing the snapshot.
    pub fn refresh(&self) {
        let devices = (self.enumerate)();
        debug!("Device refresh found {} outputs", devices.len());
        *self.known.lock().unwrap() = devices;
    }

    pub fn is_known(&self, device: &DeviceId) -> bool {
        self.known.lock().unwrap().iter().any(|d| &d.id == device)
    }

    /// Acquire a device, bumping its refcount. Reentrant acquisition of the
    /// same device always succeeds.
    pub fn acquire(self: &Arc<Self>, device: &DeviceId) -> DeviceLease {
        let mut counts = self.refcounts.lock().unwrap();
        let count = counts.entry(device.clone()).or_insert(0);
        *count += 1;
        debug!("Device {} acquired (refs={})", device, count);
        DeviceLease {
            manager: Arc::clone(self),
            device: device.clone(),
        }
    }

    /// Current refcount for a device (0 when free).
    pub fn refcount(&self, device: &DeviceId) -> usize {
        self.refcounts
            .lock()
            .unwrap()
            .get(device)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, device: &DeviceId) {
        let mut counts = self.refcounts.lock().unwrap();
        match counts.get_mut(device) {
            Some(count) if *count > 1 => {
                *count -= 1;
                debug!("Device {} released (refs={})", device, count);
            }
            Some(_) => {
                counts.remove(device);
                debug!("Device {} released (free)", device);
            }
            None => warn!("Release of unacquired device {}", device),
        }
    }
}

/// RAII guard for one device acquisition
pub struct DeviceLease {
    manager: Arc<DeviceManager>,
    device: DeviceId,
}

impl DeviceLease {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.manager.release(&self.device);
    }
}

fn enumerate_cpal_outputs() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    match host.output_devices() {
        Ok(devices) => devices
            .filter_map(|device| device.name().ok())
            .map(|name| DeviceInfo {
                id: DeviceId(name.clone()),
                is_default: Some(&name) == default_name.as_ref(),
                name,
            })
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate output devices: {}", e);
            Vec::new()
        }
    }
}
