//! Session and call proxy
//!
//! A [`Session`] owns one USB worker. It is created explicitly, cloned freely
//! and shared by every thread that talks to USB. Each entry point validates
//! the caller's handle, turns the call into a [`WorkerCommand`] and blocks
//! until the worker has executed it; the worker's native result is returned
//! unchanged. Calls made on the worker thread itself, from a completion
//! callback, are executed inline instead of queued.

use crate::backend::{BackendFactory, RusbBackend, UsbBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::ProxyConfig;
use crate::device_list::DeviceListCache;
use crate::handle::{ContextHandle, Device, DeviceHandle, OwnerId, resolve};
use crate::transfer::TransferId;
use crate::worker::{UsbWorkerThread, WorkerCommand, execute_inline};
use abi::{ControlSetup, DeviceDescriptor, UsbError};
use common::{CallerLink, Reply, WorkerThread, call_inline, create_worker_bridge, spawn_worker};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Launch state, guarded by the session's launch lock
struct Launch {
    /// Moved into the worker when it is spawned
    factory: Option<BackendFactory>,
    worker: Option<WorkerThread<()>>,
    context: Option<ContextHandle>,
    /// Set when the worker could not be launched; USB access is over
    failed: bool,
}

pub(crate) struct SessionInner {
    owner: OwnerId,
    config: ProxyConfig,
    clock: Arc<dyn Clock>,
    launch: Mutex<Launch>,
    /// Set once the worker is running
    link: OnceLock<CallerLink<WorkerCommand>>,
    worker_thread: OnceLock<ThreadId>,
    device_list: DeviceListCache,
    next_transfer_id: AtomicU64,
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    config: ProxyConfig,
    clock: Arc<dyn Clock>,
    factory: BackendFactory,
}

impl SessionBuilder {
    /// Defaults: system clock, rusb backend
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
            clock: Arc::new(SystemClock),
            factory: Box::new(|| Ok(Box::new(RusbBackend::new()?) as Box<dyn UsbBackend>)),
        }
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Backend factory; it runs on the worker thread during `init`
    pub fn backend<F>(mut self, factory: F) -> Self
    where
        F: FnMut() -> abi::Result<Box<dyn UsbBackend>> + Send + 'static,
    {
        self.factory = Box::new(factory);
        self
    }

    pub fn build(self) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                owner: OwnerId::next(),
                config: self.config,
                clock: self.clock,
                launch: Mutex::new(Launch {
                    factory: Some(self.factory),
                    worker: None,
                    context: None,
                    failed: false,
                }),
                link: OnceLock::new(),
                worker_thread: OnceLock::new(),
                device_list: DeviceListCache::default(),
                next_transfer_id: AtomicU64::new(1),
            }),
        }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a USB session and its worker
///
/// Cloning is cheap; all clones talk to the same worker. The worker is shut
/// down when the last clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Session over the system USB stack
    pub fn new() -> Self {
        SessionBuilder::new().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Identity of this session's worker, carried by every handle it issues
    pub fn owner(&self) -> OwnerId {
        self.inner.owner
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub(crate) fn device_list_cache(&self) -> &DeviceListCache {
        &self.inner.device_list
    }

    pub(crate) fn next_transfer_id(&self) -> TransferId {
        TransferId(self.inner.next_transfer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether the worker is running and accepting commands
    pub fn worker_alive(&self) -> bool {
        self.inner.link.get().is_some_and(|link| !link.is_closed())
    }

    fn on_worker_thread(&self) -> bool {
        self.inner.worker_thread.get() == Some(&std::thread::current().id())
    }

    /// Dispatch a command to the worker and block for its reply
    ///
    /// On the worker thread the command runs inline; it fails with `Busy` if
    /// the worker cannot take it there.
    pub(crate) fn dispatch<T>(
        &self,
        entry: &'static str,
        build: impl FnOnce(Reply<T>) -> WorkerCommand,
    ) -> abi::Result<T> {
        trace!(entry, "proxying to USB worker");
        let link = self.inner.link.get().ok_or(UsbError::NotSupported)?;
        if self.on_worker_thread() {
            return call_inline(build, execute_inline).map_err(|e| {
                warn!("{}: not accepted inline by USB worker: {}", entry, e);
                UsbError::Busy
            });
        }
        link.call(build).map_err(|e| {
            warn!("{}: USB worker unavailable: {}", entry, e);
            UsbError::NotSupported
        })
    }

    /// Dispatch a command whose reply is a native result
    pub(crate) fn call<T>(
        &self,
        entry: &'static str,
        build: impl FnOnce(Reply<abi::Result<T>>) -> WorkerCommand,
    ) -> abi::Result<T> {
        self.dispatch(entry, build)?
    }

    /// Initialize the session
    ///
    /// The first call spawns the worker, waits for it to start and runs the
    /// native initialization on it. Later calls, from any thread, return the
    /// same context handle without spawning anything.
    pub fn init(&self) -> abi::Result<ContextHandle> {
        trace!(entry = "init", "proxying to USB worker");
        let mut launch = self.inner.launch.lock().unwrap();

        if let Some(ctx) = launch.context {
            debug!("Using existing USB worker {}", self.owner());
            return Ok(ctx);
        }
        if launch.failed {
            return Err(UsbError::NotSupported);
        }
        if launch.worker.is_none() {
            if let Err(e) = self.launch_worker(&mut launch) {
                launch.failed = true;
                return Err(e);
            }
        }

        self.call("init", |response| WorkerCommand::Init { response })?;

        let started = launch.worker.as_ref().is_some_and(WorkerThread::has_started);
        let ctx = ContextHandle::new(self.owner(), started);
        launch.context = Some(ctx);
        Ok(ctx)
    }

    fn launch_worker(&self, launch: &mut Launch) -> abi::Result<()> {
        let config = &self.inner.config;
        let factory = launch.factory.take().ok_or(UsbError::NotSupported)?;

        info!("Creating USB worker {}", self.owner());
        let (link, worker_link) = create_worker_bridge(config.command_queue_depth);
        // The backend is not Send; the worker is built on its own thread
        let thread = spawn_worker(&config.worker_name, move || {
            UsbWorkerThread::new(worker_link, factory).run()
        })
        .map_err(|e| {
            error!("Failed to spawn USB worker thread: {}", e);
            UsbError::NotSupported
        })?;

        let mut retries = 0;
        while !thread.has_started() {
            if retries >= config.start_retries {
                error!("USB worker thread did not start after {} checks", retries);
                return Err(UsbError::NotSupported);
            }
            self.inner.clock.sleep(config.start_retry_interval());
            retries += 1;
        }

        info!("USB worker thread: {}", thread.name());
        if self.inner.link.set(link).is_err() {
            warn!("USB worker link was already set");
        }
        let _ = self.inner.worker_thread.set(thread.thread_id());
        launch.worker = Some(thread);
        Ok(())
    }

    /// Tear down the context
    ///
    /// Leaves the worker and the device list cache in place; both live until
    /// the last clone of the session is dropped.
    pub fn exit(&self, ctx: &ContextHandle) {
        trace!(entry = "exit", "handled locally");
        if let Err(e) = resolve(ctx, self.owner()) {
            warn!("exit with a foreign context handle: {}", e);
        }
    }

    /// Stop the worker now
    ///
    /// Transfers still in flight are cancelled and released in the backend,
    /// synchronous waiters finish with `NoDevice`, and every later call,
    /// `init` included, fails with `NotSupported`. Dropping the last clone
    /// of the session does the same.
    pub fn shutdown(&self) {
        trace!(entry = "shutdown", "handled locally");
        let worker = {
            let mut launch = self.inner.launch.lock().unwrap();
            launch.context = None;
            launch.failed = true;
            launch.worker.take()
        };
        if let Some(worker) = worker {
            info!("Stopping USB worker {}", self.owner());
            stop_worker(self.inner.link.get(), worker);
        }
    }

    pub fn get_device_descriptor(&self, device: &Device) -> abi::Result<DeviceDescriptor> {
        resolve(device, self.owner())?;
        let device = device.native();
        self.call("get_device_descriptor", |response| {
            WorkerCommand::GetDeviceDescriptor { device, response }
        })
    }

    /// Open a device for I/O
    pub fn open(&self, device: &Device) -> abi::Result<DeviceHandle> {
        resolve(device, self.owner())?;
        let device = device.native();
        let native = self.call("open", |response| WorkerCommand::Open { device, response })?;
        Ok(DeviceHandle::new(self.owner(), native))
    }

    /// Close a device
    ///
    /// Transfers still pending on it finish with `NoDevice` in their
    /// synchronous waiters.
    pub fn close(&self, handle: &DeviceHandle) {
        if let Err(e) = resolve(handle, self.owner()) {
            warn!("close with an invalid device handle: {}", e);
            return;
        }
        let handle = handle.native();
        if let Err(e) = self.dispatch("close", |response| WorkerCommand::Close { handle, response })
        {
            debug!("close: {}", e);
        }
    }

    /// Read a string descriptor as ASCII into `data`; returns its length
    pub fn get_string_descriptor_ascii(
        &self,
        handle: &DeviceHandle,
        index: u8,
        data: &mut [u8],
    ) -> abi::Result<usize> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        let capacity = data.len();
        let bytes = self.call("get_string_descriptor_ascii", |response| {
            WorkerCommand::GetStringDescriptorAscii {
                handle,
                index,
                capacity,
                response,
            }
        })?;

        let n = bytes.len().min(capacity);
        data[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    /// Select a configuration; `-1` unconfigures the device
    pub fn set_configuration(&self, handle: &DeviceHandle, configuration: i32) -> abi::Result<()> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        self.call("set_configuration", |response| {
            WorkerCommand::SetConfiguration {
                handle,
                configuration,
                response,
            }
        })
    }

    pub fn claim_interface(&self, handle: &DeviceHandle, interface: u8) -> abi::Result<()> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        self.call("claim_interface", |response| WorkerCommand::ClaimInterface {
            handle,
            interface,
            response,
        })
    }

    pub fn release_interface(&self, handle: &DeviceHandle, interface: u8) -> abi::Result<()> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        self.call("release_interface", |response| {
            WorkerCommand::ReleaseInterface {
                handle,
                interface,
                response,
            }
        })
    }

    pub fn set_interface_alt_setting(
        &self,
        handle: &DeviceHandle,
        interface: u8,
        alt_setting: u8,
    ) -> abi::Result<()> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        self.call("set_interface_alt_setting", |response| {
            WorkerCommand::SetInterfaceAltSetting {
                handle,
                interface,
                alt_setting,
                response,
            }
        })
    }

    /// Synchronous control transfer
    ///
    /// `data` is the data stage; its length is `wLength`. Returns the number
    /// of bytes transferred.
    pub fn control_transfer(
        &self,
        handle: &DeviceHandle,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> abi::Result<usize> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        let buffer = data.to_vec();
        let (len, buffer) = self.call("control_transfer", |response| {
            WorkerCommand::ControlTransfer {
                handle,
                setup,
                data: buffer,
                timeout,
                response,
            }
        })?;

        if setup.is_in() {
            let n = len.min(data.len()).min(buffer.len());
            data[..n].copy_from_slice(&buffer[..n]);
        }
        Ok(len)
    }

    pub fn clear_halt(&self, handle: &DeviceHandle, endpoint: u8) -> abi::Result<()> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        self.call("clear_halt", |response| WorkerCommand::ClearHalt {
            handle,
            endpoint,
            response,
        })
    }

    pub fn reset_device(&self, handle: &DeviceHandle) -> abi::Result<()> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        self.call("reset_device", |response| WorkerCommand::ResetDevice {
            handle,
            response,
        })
    }

    pub fn kernel_driver_active(&self, handle: &DeviceHandle, interface: u8) -> abi::Result<bool> {
        resolve(handle, self.owner())?;
        let handle = handle.native();
        self.call("kernel_driver_active", |response| {
            WorkerCommand::KernelDriverActive {
                handle,
                interface,
                response,
            }
        })
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner", &self.inner.owner)
            .field("worker_alive", &self.worker_alive())
            .finish()
    }
}

/// Send `Shutdown` and wait for the worker to exit
///
/// From the worker thread itself (a callback) the wait is skipped; the
/// worker exits once the callback returns.
fn stop_worker(link: Option<&CallerLink<WorkerCommand>>, worker: WorkerThread<()>) {
    if let Some(link) = link {
        let _ = link.send_command(WorkerCommand::Shutdown);
    }
    if worker.thread_id() == std::thread::current().id() {
        return;
    }
    if let Err(e) = worker.join() {
        warn!("USB worker did not exit cleanly: {}", e);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let launch = match self.launch.get_mut() {
            Ok(launch) => launch,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(worker) = launch.worker.take() {
            stop_worker(self.link.get(), worker);
        }
    }
}
