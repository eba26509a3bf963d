//! Device list cache
//!
//! Enumeration runs once per session. Every later request returns the same
//! list, and freeing it is a no-op, so the `Device` handles it holds stay
//! valid for the life of the session.

use crate::handle::{ContextHandle, Device, OwnerId, resolve};
use crate::session::Session;
use crate::worker::WorkerCommand;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Devices found by the first enumeration of a session
#[derive(Debug)]
pub struct DeviceList {
    devices: Vec<Device>,
    /// Session whose worker owns the devices
    owner: OwnerId,
}

impl DeviceList {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn as_slice(&self) -> &[Device] {
        &self.devices
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeviceListCache {
    slot: Mutex<Option<Arc<DeviceList>>>,
}

impl DeviceListCache {
    /// Return the cached list, filling it with `enumerate` on first use
    ///
    /// A failed enumeration leaves the cache empty.
    fn get_or_try_init(
        &self,
        enumerate: impl FnOnce() -> abi::Result<DeviceList>,
    ) -> abi::Result<Arc<DeviceList>> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(list) = slot.as_ref() {
            return Ok(list.clone());
        }
        let list = Arc::new(enumerate()?);
        *slot = Some(list.clone());
        Ok(list)
    }
}

impl Session {
    /// Enumerate attached devices
    ///
    /// Only the first call reaches the worker; the count of the returned list
    /// is the number of devices.
    pub fn get_device_list(&self, ctx: &ContextHandle) -> abi::Result<Arc<DeviceList>> {
        resolve(ctx, self.owner())?;

        self.device_list_cache().get_or_try_init(|| {
            let natives = self.call("get_device_list", |response| {
                WorkerCommand::GetDeviceList { response }
            })?;
            let owner = self.owner();
            debug!("Enumerated {} USB devices", natives.len());
            Ok(DeviceList {
                devices: natives
                    .into_iter()
                    .map(|native| Device::new(owner, native))
                    .collect(),
                owner,
            })
        })
    }

    /// Release a device list
    ///
    /// The list is cached for the life of the session; this drops the
    /// caller's reference only.
    pub fn free_device_list(&self, list: Arc<DeviceList>, unref_devices: bool) {
        trace!(entry = "free_device_list", unref_devices, "handled locally");
        if list.owner() != self.owner() {
            warn!("free_device_list with a list from {}", list.owner());
        }
        drop(list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::NativeDevice;

    #[test]
    fn test_cache_enumerates_once() {
        let cache = DeviceListCache::default();
        let owner = OwnerId::next();
        let mut calls = 0;

        let first = cache
            .get_or_try_init(|| {
                calls += 1;
                Ok(DeviceList {
                    devices: vec![Device::new(owner, NativeDevice(1))],
                    owner,
                })
            })
            .unwrap();
        let second = cache
            .get_or_try_init(|| unreachable!("enumerated twice"))
            .unwrap();

        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_failed_enumeration_is_not_cached() {
        let cache = DeviceListCache::default();
        let owner = OwnerId::next();

        assert_eq!(
            cache.get_or_try_init(|| Err(abi::UsbError::Io)).unwrap_err(),
            abi::UsbError::Io
        );
        let list = cache
            .get_or_try_init(|| {
                Ok(DeviceList {
                    devices: Vec::new(),
                    owner,
                })
            })
            .unwrap();
        assert!(list.is_empty());
    }
}
