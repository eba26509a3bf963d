//! USB worker thread
//!
//! The only thread that holds the backend. Callers reach it exclusively
//! through [`WorkerCommand`]s on the worker bridge and block until the reply
//! arrives, so every native operation runs here, one at a time, in arrival
//! order.
//!
//! Completion callbacks also run here. A callback that calls back into its
//! session (to resubmit its transfer, say) cannot wait on the queue, so its
//! commands are executed inline through [`execute_inline`]. The worker state
//! is therefore never borrowed while a callback runs.

use crate::backend::{BackendFactory, Rejected, TransferCompletion, TransferRequest, UsbBackend};
use crate::handle::{NativeDevice, NativeHandle};
use crate::transfer::{CompletionFlag, TransferId, TransferRecord};
use abi::{ControlSetup, DeviceDescriptor, UsbError};
use common::{Reply, WorkerLink};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Commands from caller threads to the USB worker
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Create the backend (native library initialization)
    Init { response: Reply<abi::Result<()>> },

    /// Enumerate devices
    GetDeviceList {
        response: Reply<abi::Result<Vec<NativeDevice>>>,
    },

    GetDeviceDescriptor {
        device: NativeDevice,
        response: Reply<abi::Result<DeviceDescriptor>>,
    },

    Open {
        device: NativeDevice,
        response: Reply<abi::Result<NativeHandle>>,
    },

    /// Close a device, orphaning its pending transfers
    Close {
        handle: NativeHandle,
        response: Reply<()>,
    },

    GetStringDescriptorAscii {
        handle: NativeHandle,
        index: u8,
        capacity: usize,
        response: Reply<abi::Result<Vec<u8>>>,
    },

    SetConfiguration {
        handle: NativeHandle,
        configuration: i32,
        response: Reply<abi::Result<()>>,
    },

    ClaimInterface {
        handle: NativeHandle,
        interface: u8,
        response: Reply<abi::Result<()>>,
    },

    ReleaseInterface {
        handle: NativeHandle,
        interface: u8,
        response: Reply<abi::Result<()>>,
    },

    SetInterfaceAltSetting {
        handle: NativeHandle,
        interface: u8,
        alt_setting: u8,
        response: Reply<abi::Result<()>>,
    },

    /// Blocking control transfer; the buffer travels there and back
    ControlTransfer {
        handle: NativeHandle,
        setup: ControlSetup,
        data: Vec<u8>,
        timeout: Duration,
        response: Reply<abi::Result<(usize, Vec<u8>)>>,
    },

    ClearHalt {
        handle: NativeHandle,
        endpoint: u8,
        response: Reply<abi::Result<()>>,
    },

    ResetDevice {
        handle: NativeHandle,
        response: Reply<abi::Result<()>>,
    },

    KernelDriverActive {
        handle: NativeHandle,
        interface: u8,
        response: Reply<abi::Result<bool>>,
    },

    SubmitTransfer {
        transfer: Arc<TransferRecord>,
        response: Reply<abi::Result<()>>,
    },

    CancelTransfer {
        id: TransferId,
        response: Reply<abi::Result<()>>,
    },

    FreeTransfer {
        id: TransferId,
        response: Reply<()>,
    },

    /// Run event processing unless `completed` is already set
    HandleEvents {
        timeout: Duration,
        completed: Option<CompletionFlag>,
        response: Reply<abi::Result<()>>,
    },

    /// Stop the worker
    Shutdown,
}

thread_local! {
    /// State of the USB worker running on this thread
    static CURRENT: RefCell<Option<Rc<RefCell<WorkerState>>>> = const { RefCell::new(None) };
}

/// USB worker thread
///
/// Owns the backend and the set of transfers that are in flight.
pub(crate) struct UsbWorkerThread {
    state: Rc<RefCell<WorkerState>>,
    /// Communication channel with callers
    link: WorkerLink<WorkerCommand>,
}

struct WorkerState {
    /// Creates the backend on `Init`
    factory: BackendFactory,
    /// Present once `Init` has succeeded
    backend: Option<Box<dyn UsbBackend>>,
    /// Submitted transfers that have not completed yet
    in_flight: HashMap<TransferId, Arc<TransferRecord>>,
}

impl UsbWorkerThread {
    pub(crate) fn new(link: WorkerLink<WorkerCommand>, factory: BackendFactory) -> Self {
        Self {
            state: Rc::new(RefCell::new(WorkerState {
                factory,
                backend: None,
                in_flight: HashMap::new(),
            })),
            link,
        }
    }

    /// Run the worker loop
    ///
    /// Blocks for commands and handles them one at a time until `Shutdown`
    /// arrives or every caller link is gone. Commands still queued at that
    /// point are dropped unanswered.
    pub(crate) fn run(self) {
        info!("USB worker thread started");
        CURRENT.with(|current| *current.borrow_mut() = Some(self.state.clone()));

        loop {
            match self.link.recv_command() {
                Ok(WorkerCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Ok(cmd) => execute(&self.state, cmd),
                Err(e) => {
                    debug!("USB worker command channel closed: {}", e);
                    break;
                }
            }
        }

        self.link.close();
        let mut dropped = 0;
        while let Some(cmd) = self.link.try_recv_command() {
            drop(cmd);
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {} commands queued behind shutdown", dropped);
        }

        CURRENT.with(|current| current.borrow_mut().take());
        self.state.borrow_mut().shutdown();
        info!("USB worker thread stopped");
    }
}

/// Run a command on the USB worker that owns the current thread
///
/// The command is dropped unanswered when no worker runs here or the worker
/// state is already borrowed.
pub(crate) fn execute_inline(cmd: WorkerCommand) {
    let state = CURRENT.with(|current| current.borrow().clone());
    match state {
        Some(state) => execute(&state, cmd),
        None => warn!("No USB worker on this thread"),
    }
}

/// Handle a command from the run loop or from a callback on the worker
fn execute(state: &RefCell<WorkerState>, cmd: WorkerCommand) {
    // A panic drops the reply slot, which the caller sees as a failed call
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match cmd {
        WorkerCommand::HandleEvents {
            timeout,
            completed,
            response,
        } => {
            let result = if completed.as_ref().is_some_and(CompletionFlag::is_set) {
                Ok(())
            } else {
                handle_events(state, timeout)
            };
            let _ = response.send(result);
        }
        cmd => match state.try_borrow_mut() {
            Ok(mut state) => state.handle_command(cmd),
            Err(_) => error!("USB worker re-entered while handling a command"),
        },
    }));

    if let Err(e) = result {
        error!("Panic in USB command handler: {:?}", e);
    }
}

/// Poll the backend, then run the callbacks of every completed transfer
fn handle_events(state: &RefCell<WorkerState>, timeout: Duration) -> abi::Result<()> {
    let completed = state
        .try_borrow_mut()
        .map_err(|_| UsbError::Busy)?
        .poll(timeout)?;

    for record in completed {
        let callback = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            record.run_callback()
        }));
        if let Err(e) = callback {
            error!(
                "Panic in completion callback of transfer {:?}: {:?}",
                record.id(),
                e
            );
        }
    }
    Ok(())
}

impl WorkerState {
    fn backend(&mut self) -> abi::Result<&mut Box<dyn UsbBackend>> {
        self.backend.as_mut().ok_or(UsbError::NotSupported)
    }

    /// Handle every command except event processing (can panic, caught by
    /// `execute`)
    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Init { response } => {
                let _ = response.send(self.init());
            }

            WorkerCommand::GetDeviceList { response } => {
                let result = self.backend().and_then(|b| b.devices());
                let _ = response.send(result);
            }

            WorkerCommand::GetDeviceDescriptor { device, response } => {
                let result = self.backend().and_then(|b| b.device_descriptor(device));
                let _ = response.send(result);
            }

            WorkerCommand::Open { device, response } => {
                let result = self.backend().and_then(|b| b.open(device));
                let _ = response.send(result);
            }

            WorkerCommand::Close { handle, response } => {
                self.close(handle);
                let _ = response.send(());
            }

            WorkerCommand::GetStringDescriptorAscii {
                handle,
                index,
                capacity,
                response,
            } => {
                let result = self
                    .backend()
                    .and_then(|b| b.string_descriptor_ascii(handle, index, capacity));
                let _ = response.send(result);
            }

            WorkerCommand::SetConfiguration {
                handle,
                configuration,
                response,
            } => {
                let result = self
                    .backend()
                    .and_then(|b| b.set_configuration(handle, configuration));
                let _ = response.send(result);
            }

            WorkerCommand::ClaimInterface {
                handle,
                interface,
                response,
            } => {
                let result = self
                    .backend()
                    .and_then(|b| b.claim_interface(handle, interface));
                let _ = response.send(result);
            }

            WorkerCommand::ReleaseInterface {
                handle,
                interface,
                response,
            } => {
                let result = self
                    .backend()
                    .and_then(|b| b.release_interface(handle, interface));
                let _ = response.send(result);
            }

            WorkerCommand::SetInterfaceAltSetting {
                handle,
                interface,
                alt_setting,
                response,
            } => {
                let result = self
                    .backend()
                    .and_then(|b| b.set_alternate_setting(handle, interface, alt_setting));
                let _ = response.send(result);
            }

            WorkerCommand::ControlTransfer {
                handle,
                setup,
                mut data,
                timeout,
                response,
            } => {
                let result = self
                    .backend()
                    .and_then(|b| b.control_transfer(handle, setup, &mut data, timeout))
                    .map(|len| (len, data));
                let _ = response.send(result);
            }

            WorkerCommand::ClearHalt {
                handle,
                endpoint,
                response,
            } => {
                let result = self.backend().and_then(|b| b.clear_halt(handle, endpoint));
                let _ = response.send(result);
            }

            WorkerCommand::ResetDevice { handle, response } => {
                let result = self.backend().and_then(|b| b.reset(handle));
                let _ = response.send(result);
            }

            WorkerCommand::KernelDriverActive {
                handle,
                interface,
                response,
            } => {
                let result = self
                    .backend()
                    .and_then(|b| b.kernel_driver_active(handle, interface));
                let _ = response.send(result);
            }

            WorkerCommand::SubmitTransfer { transfer, response } => {
                let _ = response.send(self.submit(transfer));
            }

            WorkerCommand::CancelTransfer { id, response } => {
                let result = if self.in_flight.contains_key(&id) {
                    self.backend().and_then(|b| b.cancel(id))
                } else {
                    Err(UsbError::NotFound)
                };
                let _ = response.send(result);
            }

            WorkerCommand::FreeTransfer { id, response } => {
                if self.in_flight.remove(&id).is_some() {
                    debug!("Freeing transfer {:?} while in flight", id);
                }
                if let Ok(backend) = self.backend() {
                    backend.release_transfer(id);
                }
                let _ = response.send(());
            }

            WorkerCommand::HandleEvents { response, .. } => {
                let _ = response.send(Err(UsbError::Busy));
            }

            WorkerCommand::Shutdown => {
                debug!("Shutdown is handled by the run loop");
            }
        }
    }

    fn init(&mut self) -> abi::Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let backend = (self.factory)()?;
        self.backend = Some(backend);
        debug!("USB backend initialized");
        Ok(())
    }

    fn close(&mut self, handle: NativeHandle) {
        let orphaned: Vec<TransferId> = self
            .in_flight
            .iter()
            .filter(|(_, record)| record.device_handle().map(|h| h.native()) == Some(handle))
            .map(|(id, _)| *id)
            .collect();

        for id in orphaned {
            if let Some(record) = self.in_flight.remove(&id) {
                debug!("Transfer {:?} orphaned by close of {:?}", id, handle);
                record.detach_device();
                if let Ok(backend) = self.backend() {
                    let _ = backend.cancel(id);
                }
            }
        }

        if let Ok(backend) = self.backend() {
            backend.close(handle);
        }
    }

    fn submit(&mut self, record: Arc<TransferRecord>) -> abi::Result<()> {
        let id = record.id();
        if self.in_flight.contains_key(&id) {
            return Err(UsbError::Busy);
        }
        let handle = record.device_handle().ok_or(UsbError::NoDevice)?;
        let backend = self.backend.as_mut().ok_or(UsbError::NotSupported)?;

        record.reset_completion();
        let request = TransferRequest {
            id,
            handle: handle.native(),
            endpoint: record.endpoint(),
            kind: record.kind(),
            buffer: record.take_buffer(),
            timeout: record.timeout(),
        };

        match backend.submit(request) {
            Ok(()) => {
                self.in_flight.insert(id, record);
                Ok(())
            }
            Err(Rejected { error, request }) => {
                record.restore_buffer(request.buffer);
                Err(error)
            }
        }
    }

    /// Poll the backend and record every completion
    ///
    /// Returns the records that completed, for their callbacks to run once
    /// the state is no longer borrowed.
    fn poll(&mut self, timeout: Duration) -> abi::Result<Vec<Arc<TransferRecord>>> {
        let completions = self.backend()?.handle_events(timeout)?;
        Ok(completions
            .into_iter()
            .filter_map(|completion| self.apply_completion(completion))
            .collect())
    }

    fn apply_completion(
        &mut self,
        completion: TransferCompletion,
    ) -> Option<Arc<TransferRecord>> {
        let TransferCompletion {
            id,
            status,
            actual_length,
            buffer,
        } = completion;

        let Some(record) = self.in_flight.remove(&id) else {
            debug!("Ignoring completion of orphaned transfer {:?}", id);
            return None;
        };
        record.complete(status, actual_length, buffer);
        Some(record)
    }

    /// Cancel and release every transfer still in flight, then drop the
    /// backend
    fn shutdown(&mut self) {
        if !self.in_flight.is_empty() {
            warn!("Releasing {} in-flight transfers", self.in_flight.len());
        }
        let in_flight: Vec<TransferId> = self.in_flight.drain().map(|(id, _)| id).collect();
        if let Some(backend) = self.backend.as_mut() {
            for id in in_flight {
                let _ = backend.cancel(id);
                backend.release_transfer(id);
            }
        }
        self.backend = None;
    }
}
