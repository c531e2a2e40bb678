// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Process-wide set of open devices.
//!
//! Opening the same GPU twice hands back the device that is already open.
//! The registry only holds weak references, apart from the default device,
//! which it keeps alive until [`DeviceRegistry::reset`].

use std::sync::Weak;

use parking_lot::Mutex;

use drmsurf_common::settings::Settings;

use crate::device::{Device, DeviceDescriptor, DeviceRef};
use crate::error::Result;

#[derive(Default)]
struct RegistryState {
    devices: Vec<Weak<Device>>,
    default: Option<DeviceRef>,
}

pub struct DeviceRegistry {
    settings: Settings,
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The open device for `desc.device_id`, creating it if needed.
    pub fn get(&self, desc: DeviceDescriptor) -> Result<DeviceRef> {
        let mut state = self.state.lock();
        state.devices.retain(|weak| weak.strong_count() > 0);
        if let Some(device) = state
            .devices
            .iter()
            .filter_map(Weak::upgrade)
            .find(|d| d.device_id() == desc.device_id && !d.is_finished())
        {
            return Ok(device);
        }

        let device = Device::create(desc, self.settings.clone())?;
        log::debug!("registry: registered device {:#x}", device.device_id());
        state.devices.push(DeviceRef::downgrade(&device));
        if state.default.is_none() {
            state.default = Some(DeviceRef::clone(&device));
        }
        Ok(device)
    }

    /// The open device using DRM file descriptor `fd`.
    pub fn get_for_fd(&self, fd: i32) -> Option<DeviceRef> {
        self.state
            .lock()
            .devices
            .iter()
            .filter_map(Weak::upgrade)
            .find(|d| d.fd() == fd && !d.is_finished())
    }

    /// The first device opened through this registry.
    pub fn default(&self) -> Option<DeviceRef> {
        self.state.lock().default.clone()
    }

    /// Number of devices still alive.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .devices
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every device and release the default one.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.devices.clear();
        let default = state.default.take();
        drop(state);
        drop(default);
        log::debug!("registry: reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::VENDOR_INTEL;
    use drmsurf_kernel::{GemDriver, SoftGem};
    use std::sync::Arc;

    fn desc(gem: &Arc<SoftGem>, device_id: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            driver: gem.clone(),
            device_id,
            vendor_id: VENDOR_INTEL,
            chip_id: 0,
        }
    }

    #[test]
    fn test_get_returns_open_device() {
        let registry = DeviceRegistry::new(Settings::default());
        let gem = Arc::new(SoftGem::new());
        let a = registry.get(desc(&gem, 7)).unwrap();
        let b = registry.get(desc(&gem, 7)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = Arc::new(SoftGem::new());
        let c = registry.get(desc(&other, 8)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_get_for_fd() {
        let registry = DeviceRegistry::new(Settings::default());
        let gem = Arc::new(SoftGem::new());
        let dev = registry.get(desc(&gem, 1)).unwrap();
        let found = registry.get_for_fd(gem.fd()).unwrap();
        assert!(Arc::ptr_eq(&dev, &found));
        assert!(registry.get_for_fd(-1).is_none());
    }

    #[test]
    fn test_default_held_until_reset() {
        let registry = DeviceRegistry::new(Settings::default());
        let gem = Arc::new(SoftGem::new());
        let first = registry.get(desc(&gem, 1)).unwrap();
        let weak = Arc::downgrade(&first);
        drop(first);
        assert!(registry.default().is_some());
        assert!(weak.upgrade().is_some());

        registry.reset();
        assert!(registry.default().is_none());
        assert!(weak.upgrade().is_none());
        assert!(registry.is_empty());
        // Dropping the last reference tore the device down.
        assert_eq!(gem.live_handles(), 0);
    }

    #[test]
    fn test_finished_device_is_replaced() {
        let registry = DeviceRegistry::new(Settings::default());
        let gem = Arc::new(SoftGem::new());
        let first = registry.get(desc(&gem, 3)).unwrap();
        first.finish().unwrap();
        let second = registry.get(desc(&gem, 3)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_finished());
    }
}
