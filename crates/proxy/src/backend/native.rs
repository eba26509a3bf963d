//! Backend over the system libusb through rusb
//!
//! rusb exposes blocking transfers only, so submitted transfers are queued and
//! executed one after another, on the worker thread, by `handle_events`.

use super::{Rejected, TransferCompletion, TransferRequest, UsbBackend};
use crate::handle::{NativeDevice, NativeHandle};
use crate::transfer::TransferId;
use abi::{ControlSetup, DeviceDescriptor, TransferKind, TransferStatus, UsbError, is_in_endpoint};
use rusb::{Context, UsbContext};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Length of a control setup packet at the start of a control transfer buffer
const CONTROL_SETUP_SIZE: usize = 8;

/// rusb-backed USB backend
pub struct RusbBackend {
    context: Context,
    /// Enumerated devices, keyed by native id
    devices: HashMap<NativeDevice, rusb::Device<Context>>,
    /// Native ids already handed out: (bus, address) -> id
    device_ids: HashMap<(u8, u8), NativeDevice>,
    /// Open devices
    handles: HashMap<NativeHandle, rusb::DeviceHandle<Context>>,
    next_device_id: u32,
    next_handle_id: u32,
    /// Submitted transfers waiting for `handle_events`
    queue: VecDeque<TransferRequest>,
    /// Transfers already finished (cancelled) and not yet reported
    finished: Vec<TransferCompletion>,
}

impl RusbBackend {
    /// Create a backend with a fresh libusb context
    pub fn new() -> abi::Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        debug!("Created libusb context");

        Ok(Self {
            context,
            devices: HashMap::new(),
            device_ids: HashMap::new(),
            handles: HashMap::new(),
            next_device_id: 1,
            next_handle_id: 1,
            queue: VecDeque::new(),
            finished: Vec::new(),
        })
    }

    fn device(&self, device: NativeDevice) -> abi::Result<&rusb::Device<Context>> {
        self.devices.get(&device).ok_or(UsbError::NoDevice)
    }

    fn handle(&mut self, handle: NativeHandle) -> abi::Result<&mut rusb::DeviceHandle<Context>> {
        self.handles.get_mut(&handle).ok_or(UsbError::NoDevice)
    }

    /// Execute one queued transfer with rusb's blocking calls
    fn execute(&mut self, mut request: TransferRequest) -> TransferCompletion {
        let Some(handle) = self.handles.get_mut(&request.handle) else {
            return TransferCompletion::of(request, TransferStatus::NoDevice, 0);
        };

        let endpoint = request.endpoint;
        let timeout = request.timeout;
        let is_in = is_in_endpoint(endpoint);
        let buffer = &mut request.buffer;

        let result = match request.kind {
            TransferKind::Bulk if is_in => handle.read_bulk(endpoint, buffer, timeout),
            TransferKind::Bulk => handle.write_bulk(endpoint, buffer, timeout),
            TransferKind::Interrupt if is_in => handle.read_interrupt(endpoint, buffer, timeout),
            TransferKind::Interrupt => handle.write_interrupt(endpoint, buffer, timeout),
            TransferKind::Control => execute_control(handle, buffer, timeout),
        };

        match result {
            Ok(len) => {
                debug!("Transfer {:?} on endpoint {:#x}: {} bytes", request.id, endpoint, len);
                TransferCompletion::of(request, TransferStatus::Completed, len)
            }
            Err(e) => {
                warn!("Transfer {:?} on endpoint {:#x} failed: {}", request.id, endpoint, e);
                TransferCompletion::of(request, transfer_status(e), 0)
            }
        }
    }
}

/// Control transfer whose buffer starts with the 8-byte setup packet
///
/// The returned length counts data-stage bytes only.
fn execute_control(
    handle: &mut rusb::DeviceHandle<Context>,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<usize, rusb::Error> {
    if buffer.len() < CONTROL_SETUP_SIZE {
        return Err(rusb::Error::InvalidParam);
    }
    let (setup, data) = buffer.split_at_mut(CONTROL_SETUP_SIZE);
    let request_type = setup[0];
    let request = setup[1];
    let value = u16::from_le_bytes([setup[2], setup[3]]);
    let index = u16::from_le_bytes([setup[4], setup[5]]);

    if is_in_endpoint(request_type) {
        handle.read_control(request_type, request, value, index, data, timeout)
    } else {
        handle.write_control(request_type, request, value, index, data, timeout)
    }
}

/// Completion status for a failed blocking transfer
fn transfer_status(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        _ => TransferStatus::Error,
    }
}

impl UsbBackend for RusbBackend {
    fn devices(&mut self) -> abi::Result<Vec<NativeDevice>> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let mut ids = Vec::with_capacity(list.len());

        for device in list.iter() {
            let key = (device.bus_number(), device.address());
            let id = match self.device_ids.get(&key) {
                Some(id) => *id,
                None => {
                    let id = NativeDevice(self.next_device_id);
                    self.next_device_id += 1;
                    self.device_ids.insert(key, id);
                    id
                }
            };
            self.devices.insert(id, device);
            ids.push(id);
        }

        debug!("Enumerated {} devices", ids.len());
        Ok(ids)
    }

    fn device_descriptor(&mut self, device: NativeDevice) -> abi::Result<DeviceDescriptor> {
        let desc = self
            .device(device)?
            .device_descriptor()
            .map_err(map_rusb_error)?;
        let usb_version = desc.usb_version();
        let device_version = desc.device_version();

        Ok(DeviceDescriptor {
            usb_version: bcd(usb_version),
            class_code: desc.class_code(),
            sub_class_code: desc.sub_class_code(),
            protocol_code: desc.protocol_code(),
            max_packet_size: desc.max_packet_size(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device_version: bcd(device_version),
            manufacturer_string_index: desc.manufacturer_string_index().unwrap_or(0),
            product_string_index: desc.product_string_index().unwrap_or(0),
            serial_number_string_index: desc.serial_number_string_index().unwrap_or(0),
            num_configurations: desc.num_configurations(),
        })
    }

    fn open(&mut self, device: NativeDevice) -> abi::Result<NativeHandle> {
        let handle = self.device(device)?.open().map_err(|e| {
            warn!("Failed to open device {:?}: {}", device, e);
            map_rusb_error(e)
        })?;

        let id = NativeHandle(self.next_handle_id);
        self.next_handle_id += 1;
        self.handles.insert(id, handle);
        debug!("Opened device {:?} as {:?}", device, id);
        Ok(id)
    }

    fn close(&mut self, handle: NativeHandle) {
        let mut orphaned = Vec::new();
        self.queue.retain(|request| {
            if request.handle == handle {
                orphaned.push(request.id);
                false
            } else {
                true
            }
        });
        if !orphaned.is_empty() {
            debug!("Dropped {} queued transfers of closed {:?}", orphaned.len(), handle);
        }

        if self.handles.remove(&handle).is_some() {
            debug!("Closed {:?}", handle);
        }
    }

    fn string_descriptor_ascii(
        &mut self,
        handle: NativeHandle,
        index: u8,
        capacity: usize,
    ) -> abi::Result<Vec<u8>> {
        let text = self
            .handle(handle)?
            .read_string_descriptor_ascii(index)
            .map_err(map_rusb_error)?;
        let mut bytes = text.into_bytes();
        bytes.truncate(capacity);
        Ok(bytes)
    }

    fn set_configuration(&mut self, handle: NativeHandle, configuration: i32) -> abi::Result<()> {
        let handle = self.handle(handle)?;
        let result = match configuration {
            -1 => handle.unconfigure(),
            0..=255 => handle.set_active_configuration(configuration as u8),
            _ => return Err(UsbError::InvalidParam),
        };
        result.map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<()> {
        self.handle(handle)?
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<()> {
        self.handle(handle)?
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn set_alternate_setting(
        &mut self,
        handle: NativeHandle,
        interface: u8,
        setting: u8,
    ) -> abi::Result<()> {
        self.handle(handle)?
            .set_alternate_setting(interface, setting)
            .map_err(map_rusb_error)
    }

    fn control_transfer(
        &mut self,
        handle: NativeHandle,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> abi::Result<usize> {
        let handle = self.handle(handle)?;
        let ControlSetup {
            request_type,
            request,
            value,
            index,
        } = setup;

        let result = if setup.is_in() {
            handle.read_control(request_type, request, value, index, data, timeout)
        } else {
            handle.write_control(request_type, request, value, index, data, timeout)
        };
        result.map_err(map_rusb_error)
    }

    fn clear_halt(&mut self, handle: NativeHandle, endpoint: u8) -> abi::Result<()> {
        self.handle(handle)?
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }

    fn reset(&mut self, handle: NativeHandle) -> abi::Result<()> {
        self.handle(handle)?.reset().map_err(map_rusb_error)
    }

    fn kernel_driver_active(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<bool> {
        self.handle(handle)?
            .kernel_driver_active(interface)
            .map_err(map_rusb_error)
    }

    fn submit(&mut self, request: TransferRequest) -> Result<(), Rejected> {
        if !self.handles.contains_key(&request.handle) {
            return Err(Rejected {
                error: UsbError::NoDevice,
                request,
            });
        }
        self.queue.push_back(request);
        Ok(())
    }

    fn cancel(&mut self, id: TransferId) -> abi::Result<()> {
        let position = self
            .queue
            .iter()
            .position(|request| request.id == id)
            .ok_or(UsbError::NotFound)?;
        if let Some(request) = self.queue.remove(position) {
            self.finished
                .push(TransferCompletion::of(request, TransferStatus::Cancelled, 0));
        }
        Ok(())
    }

    fn release_transfer(&mut self, id: TransferId) {
        self.queue.retain(|request| request.id != id);
        self.finished.retain(|completion| completion.id != id);
    }

    fn handle_events(&mut self, _timeout: Duration) -> abi::Result<Vec<TransferCompletion>> {
        // Each queued transfer carries its own timeout, so the slice only
        // bounds how long we would wait with nothing queued: not at all.
        let mut completions = std::mem::take(&mut self.finished);
        while let Some(request) = self.queue.pop_front() {
            completions.push(self.execute(request));
        }
        Ok(completions)
    }
}

/// Expand rusb's decoded BCD version back into the packed `bcdUSB` form
fn bcd(version: rusb::Version) -> u16 {
    let (major, minor, sub_minor) = (version.major(), version.minor(), version.sub_minor());
    ((major as u16 / 10) << 12)
        | ((major as u16 % 10) << 8)
        | ((minor as u16 & 0x0f) << 4)
        | (sub_minor as u16 & 0x0f)
}

/// Map rusb::Error to the native error code it came from
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::Interrupted => UsbError::Interrupted,
        rusb::Error::NoMem => UsbError::NoMem,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbError::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::NotFound), UsbError::NotFound);
        assert_eq!(map_rusb_error(rusb::Error::Interrupted), UsbError::Interrupted);
        assert_eq!(map_rusb_error(rusb::Error::BadDescriptor), UsbError::Other);
    }

    #[test]
    fn test_transfer_status_of_error() {
        assert_eq!(transfer_status(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(transfer_status(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(transfer_status(rusb::Error::Io), TransferStatus::Error);
    }

    #[test]
    fn test_bcd_packing() {
        assert_eq!(bcd(rusb::Version::from_bcd(0x0200)), 0x0200);
        assert_eq!(bcd(rusb::Version::from_bcd(0x0110)), 0x0110);
        assert_eq!(bcd(rusb::Version::from_bcd(0x0321)), 0x0321);
    }

    #[test]
    fn test_backend_creation() {
        // May fail without libusb access; just verify we can attempt it
        match RusbBackend::new() {
            Ok(mut backend) => {
                let _ = backend.devices();
            }
            Err(e) => {
                eprintln!("libusb context creation failed (expected without USB): {}", e);
            }
        }
    }
}
