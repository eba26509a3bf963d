//! Transfers and the synchronous transfer emulator
//!
//! A [`Transfer`] is allocated on the caller's thread, submitted to the
//! worker, completed by the worker's event processing and freed by consuming
//! it. [`Session::bulk_transfer`] and [`Session::interrupt_transfer`] build a
//! blocking call out of those asynchronous steps:
//!
//! ```text
//! alloc ──► submit ──► poll events until the completion flag is set ──► free
//!                        │  Interrupted: poll again
//!                        │  other error: cancel, poll again
//!                        └─ device closed underneath: NoDevice
//! ```

use crate::handle::{ContextHandle, DeviceHandle, resolve};
use crate::session::Session;
use crate::worker::WorkerCommand;
use abi::{TransferKind, TransferStatus, UsbError, is_in_endpoint};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Session-unique transfer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// Single-shot completion flag shared between the worker and a waiting caller
///
/// Unset until [`CompletionFlag::set`] is called for the first time; it never
/// goes back.
#[derive(Debug, Clone, Default)]
pub struct CompletionFlag(Arc<AtomicBool>);

impl CompletionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; returns `true` only for the call that set it
    pub fn set(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Completion callback, run on the worker thread
///
/// It may call back into the session, for example to resubmit the transfer
/// it receives.
pub type TransferCallback = Box<dyn FnMut(&Transfer) + Send>;

/// State of one transfer, shared by the caller and the worker
pub struct TransferRecord {
    id: TransferId,
    kind: TransferKind,
    endpoint: u8,
    timeout: Duration,
    /// Cleared when the device is closed while the transfer is pending
    device: Mutex<Option<DeviceHandle>>,
    /// Empty while the backend holds the buffer
    buffer: Mutex<Vec<u8>>,
    actual_length: AtomicUsize,
    status: Mutex<Option<TransferStatus>>,
    callback: Mutex<Option<TransferCallback>>,
}

impl TransferRecord {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Device the transfer is bound to; `None` once that device was closed
    pub fn device_handle(&self) -> Option<DeviceHandle> {
        *self.device.lock().unwrap()
    }

    /// Completion status; `None` until the transfer has completed
    pub fn status(&self) -> Option<TransferStatus> {
        *self.status.lock().unwrap()
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length.load(Ordering::Acquire)
    }

    /// Length of the transfer buffer
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the start of the buffer; returns the bytes copied
    pub fn write_data(&self, data: &[u8]) -> usize {
        let mut buffer = self.buffer.lock().unwrap();
        let n = data.len().min(buffer.len());
        buffer[..n].copy_from_slice(&data[..n]);
        n
    }

    /// Copy the first `actual_length` bytes of the buffer into `out`
    pub fn read_data(&self, out: &mut [u8]) -> usize {
        let buffer = self.buffer.lock().unwrap();
        let n = self.actual_length().min(buffer.len()).min(out.len());
        out[..n].copy_from_slice(&buffer[..n]);
        n
    }

    pub(crate) fn take_buffer(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    pub(crate) fn restore_buffer(&self, buffer: Vec<u8>) {
        *self.buffer.lock().unwrap() = buffer;
    }

    pub(crate) fn reset_completion(&self) {
        *self.status.lock().unwrap() = None;
        self.actual_length.store(0, Ordering::Release);
    }

    /// Record the outcome reported by the backend
    pub(crate) fn complete(&self, status: TransferStatus, actual_length: usize, buffer: Vec<u8>) {
        self.restore_buffer(buffer);
        self.actual_length.store(actual_length, Ordering::Release);
        *self.status.lock().unwrap() = Some(status);
    }

    pub(crate) fn force_status(&self, status: TransferStatus) {
        *self.status.lock().unwrap() = Some(status);
    }

    pub(crate) fn detach_device(&self) {
        *self.device.lock().unwrap() = None;
    }

    /// Run the completion callback, if any
    pub(crate) fn run_callback(self: &Arc<Self>) {
        let callback = self.callback.lock().unwrap().take();
        if let Some(mut callback) = callback {
            // Borrowed view; the caller's `Transfer` stays the only owner
            let transfer = Transfer {
                record: self.clone(),
            };
            callback(&transfer);
            let mut slot = self.callback.lock().unwrap();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

impl fmt::Debug for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("status", &self.status())
            .field("actual_length", &self.actual_length())
            .finish_non_exhaustive()
    }
}

/// An allocated transfer
///
/// Not `Clone`: [`Session::free_transfer`] consumes it, so each transfer is
/// freed at most once.
#[derive(Debug)]
pub struct Transfer {
    record: Arc<TransferRecord>,
}

impl Transfer {
    /// Install the completion callback
    pub fn set_callback(&self, callback: TransferCallback) {
        *self.record.callback.lock().unwrap() = Some(callback);
    }

    pub(crate) fn shared(&self) -> Arc<TransferRecord> {
        self.record.clone()
    }
}

impl std::ops::Deref for Transfer {
    type Target = TransferRecord;

    fn deref(&self) -> &TransferRecord {
        &self.record
    }
}

impl Session {
    /// Allocate a transfer with a zeroed buffer of `length` bytes
    ///
    /// Runs on the calling thread. For control transfers the buffer starts
    /// with the 8-byte setup packet.
    pub fn alloc_transfer(
        &self,
        handle: &DeviceHandle,
        kind: TransferKind,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> abi::Result<Transfer> {
        resolve(handle, self.owner())?;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(length)
            .map_err(|_| UsbError::NoMem)?;
        buffer.resize(length, 0);

        Ok(Transfer {
            record: Arc::new(TransferRecord {
                id: self.next_transfer_id(),
                kind,
                endpoint,
                timeout,
                device: Mutex::new(Some(*handle)),
                buffer: Mutex::new(buffer),
                actual_length: AtomicUsize::new(0),
                status: Mutex::new(None),
                callback: Mutex::new(None),
            }),
        })
    }

    /// Submit a transfer for asynchronous execution
    pub fn submit_transfer(&self, transfer: &Transfer) -> abi::Result<()> {
        let handle = transfer.device_handle().ok_or(UsbError::NoDevice)?;
        resolve(&handle, self.owner())?;

        let record = transfer.shared();
        self.call("submit_transfer", |response| WorkerCommand::SubmitTransfer {
            transfer: record,
            response,
        })
    }

    /// Ask the worker to cancel a pending transfer
    ///
    /// The transfer still completes (as cancelled) through event processing.
    pub fn cancel_transfer(&self, transfer: &Transfer) -> abi::Result<()> {
        let id = transfer.id();
        self.call("cancel_transfer", |response| WorkerCommand::CancelTransfer {
            id,
            response,
        })
    }

    /// Free a transfer
    pub fn free_transfer(&self, transfer: Transfer) {
        let id = transfer.id();
        if let Err(e) = self.dispatch("free_transfer", |response| WorkerCommand::FreeTransfer {
            id,
            response,
        }) {
            debug!("Transfer {:?} freed without worker: {}", id, e);
        }
    }

    /// Process pending events for up to the default slice
    pub fn handle_events(&self, ctx: &ContextHandle) -> abi::Result<()> {
        self.handle_events_timeout_completed(ctx, self.config().event_poll_slice(), None)
    }

    /// Process pending events for up to `timeout`
    pub fn handle_events_timeout(&self, ctx: &ContextHandle, timeout: Duration) -> abi::Result<()> {
        self.handle_events_timeout_completed(ctx, timeout, None)
    }

    /// Process pending events for up to the default slice, returning early if
    /// `completed` is already set
    pub fn handle_events_completed(
        &self,
        ctx: &ContextHandle,
        completed: Option<&CompletionFlag>,
    ) -> abi::Result<()> {
        self.handle_events_timeout_completed(ctx, self.config().event_poll_slice(), completed)
    }

    /// Process pending events for up to `timeout`, returning early if
    /// `completed` is already set
    pub fn handle_events_timeout_completed(
        &self,
        ctx: &ContextHandle,
        timeout: Duration,
        completed: Option<&CompletionFlag>,
    ) -> abi::Result<()> {
        resolve(ctx, self.owner())?;
        self.poll_events(timeout, completed)
    }

    fn poll_events(&self, timeout: Duration, completed: Option<&CompletionFlag>) -> abi::Result<()> {
        let completed = completed.cloned();
        self.call("handle_events_timeout_completed", |response| {
            WorkerCommand::HandleEvents {
                timeout,
                completed,
                response,
            }
        })
    }

    /// Synchronous bulk transfer
    ///
    /// The direction comes from bit 7 of `endpoint`. `actual_length` receives
    /// the number of bytes transferred even when the call fails.
    pub fn bulk_transfer(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
        actual_length: Option<&mut usize>,
        timeout: Duration,
    ) -> abi::Result<()> {
        self.do_sync_transfer(handle, endpoint, data, actual_length, timeout, TransferKind::Bulk)
    }

    /// Synchronous interrupt transfer
    pub fn interrupt_transfer(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
        actual_length: Option<&mut usize>,
        timeout: Duration,
    ) -> abi::Result<()> {
        self.do_sync_transfer(
            handle,
            endpoint,
            data,
            actual_length,
            timeout,
            TransferKind::Interrupt,
        )
    }

    fn do_sync_transfer(
        &self,
        handle: &DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
        actual_length: Option<&mut usize>,
        timeout: Duration,
        kind: TransferKind,
    ) -> abi::Result<()> {
        let transfer = self
            .alloc_transfer(handle, kind, endpoint, data.len(), timeout)
            .inspect_err(|e| debug!("{:?} transfer: allocation failed: {}", kind, e))?;
        if !is_in_endpoint(endpoint) {
            transfer.write_data(data);
        }

        let completed = CompletionFlag::new();
        let flag = completed.clone();
        transfer.set_callback(Box::new(move |_| {
            flag.set();
        }));

        if let Err(e) = self.submit_transfer(&transfer) {
            debug!("{:?} transfer: failed to submit: {}", kind, e);
            self.free_transfer(transfer);
            return Err(e);
        }

        self.wait_for_completion(&transfer, &completed);

        if let Some(out) = actual_length {
            *out = transfer.actual_length();
        }
        if is_in_endpoint(endpoint) {
            transfer.read_data(data);
        }

        let status = transfer.status();
        let result = TransferStatus::result_of(status);
        match status {
            Some(TransferStatus::Completed) => debug!("{:?} transfer: completed", kind),
            Some(status) => debug!("{:?} transfer: {:?}", kind, status),
            None => warn!("{:?} transfer: finished without a status", kind),
        }

        self.free_transfer(transfer);
        result
    }

    fn wait_for_completion(&self, transfer: &Transfer, completed: &CompletionFlag) {
        let slice = self.config().event_poll_slice();

        while !completed.is_set() {
            match self.poll_events(slice, Some(completed)) {
                Ok(()) => {}
                Err(UsbError::Interrupted) => continue,
                Err(e) if !self.worker_alive() => {
                    warn!("USB worker gone while waiting for transfer {:?}: {}", transfer.id(), e);
                    transfer.force_status(TransferStatus::NoDevice);
                    completed.set();
                    continue;
                }
                Err(e) => {
                    warn!("Event handling failed, cancelling transfer and retrying: {}", e);
                    if let Err(e) = self.cancel_transfer(transfer) {
                        debug!("Cancel of transfer {:?} failed: {}", transfer.id(), e);
                    }
                    continue;
                }
            }

            if !completed.is_set() && transfer.device_handle().is_none() {
                // Completion after close()
                transfer.force_status(TransferStatus::NoDevice);
                completed.set();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_flag_sets_once() {
        let flag = CompletionFlag::new();
        let other = flag.clone();

        assert!(!flag.is_set());
        assert!(other.set());
        assert!(!flag.set());
        assert!(flag.is_set());
    }
}
