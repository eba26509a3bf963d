//! Native USB library as seen from the worker thread
//!
//! A backend is created by a factory that runs on the worker thread and is
//! never handed to any other thread, so implementations need not be `Send`.
//! Asynchronous transfers are submitted with [`UsbBackend::submit`] and come
//! back as [`TransferCompletion`]s from [`UsbBackend::handle_events`].

mod native;

pub use native::{RusbBackend, map_rusb_error};

use crate::handle::{NativeDevice, NativeHandle};
use crate::transfer::TransferId;
use abi::{ControlSetup, DeviceDescriptor, TransferKind, TransferStatus, UsbError};
use std::time::Duration;

/// Creates the backend on the worker thread; called again if it fails
pub type BackendFactory = Box<dyn FnMut() -> abi::Result<Box<dyn UsbBackend>> + Send>;

/// A transfer handed to the backend
///
/// The buffer is moved in on submission and moved back in the completion.
#[derive(Debug)]
pub struct TransferRequest {
    pub id: TransferId,
    pub handle: NativeHandle,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    pub timeout: Duration,
}

/// A finished transfer reported by event processing
#[derive(Debug)]
pub struct TransferCompletion {
    pub id: TransferId,
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
}

impl TransferCompletion {
    /// Complete `request` with `status`, keeping its buffer
    pub fn of(request: TransferRequest, status: TransferStatus, actual_length: usize) -> Self {
        Self {
            id: request.id,
            status,
            actual_length,
            buffer: request.buffer,
        }
    }
}

/// A submission the backend refused, with the request handed back
#[derive(Debug)]
pub struct Rejected {
    pub error: UsbError,
    pub request: TransferRequest,
}

/// Native USB operations executed on the worker thread
pub trait UsbBackend {
    /// Enumerate attached devices
    fn devices(&mut self) -> abi::Result<Vec<NativeDevice>>;

    fn device_descriptor(&mut self, device: NativeDevice) -> abi::Result<DeviceDescriptor>;

    fn open(&mut self, device: NativeDevice) -> abi::Result<NativeHandle>;

    /// Close an open device; unknown handles are ignored
    fn close(&mut self, handle: NativeHandle);

    /// Read string descriptor `index` in ASCII, at most `capacity` bytes
    fn string_descriptor_ascii(
        &mut self,
        handle: NativeHandle,
        index: u8,
        capacity: usize,
    ) -> abi::Result<Vec<u8>>;

    /// Select a configuration; `-1` puts the device in the unconfigured state
    fn set_configuration(&mut self, handle: NativeHandle, configuration: i32) -> abi::Result<()>;

    fn claim_interface(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<()>;

    fn release_interface(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<()>;

    fn set_alternate_setting(
        &mut self,
        handle: NativeHandle,
        interface: u8,
        setting: u8,
    ) -> abi::Result<()>;

    /// Blocking control transfer; returns the number of bytes transferred
    fn control_transfer(
        &mut self,
        handle: NativeHandle,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> abi::Result<usize>;

    fn clear_halt(&mut self, handle: NativeHandle, endpoint: u8) -> abi::Result<()>;

    fn reset(&mut self, handle: NativeHandle) -> abi::Result<()>;

    fn kernel_driver_active(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<bool>;

    /// Queue an asynchronous transfer
    fn submit(&mut self, request: TransferRequest) -> Result<(), Rejected>;

    /// Ask for a pending transfer to complete as cancelled
    ///
    /// Returns `NotFound` if the transfer is not pending.
    fn cancel(&mut self, id: TransferId) -> abi::Result<()>;

    /// Forget everything about a transfer that is being freed
    ///
    /// Called exactly once per freed transfer, pending or not.
    fn release_transfer(&mut self, id: TransferId);

    /// Process pending events for at most `timeout`
    fn handle_events(&mut self, timeout: Duration) -> abi::Result<Vec<TransferCompletion>>;
}
