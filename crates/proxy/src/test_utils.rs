//! Test utilities
//!
//! A scriptable in-memory [`UsbBackend`] and helpers to build a [`Session`]
//! on top of it with a [`ManualClock`], so worker behavior can be tested
//! without USB hardware or wall-clock waits.

use crate::backend::{BackendFactory, Rejected, TransferCompletion, TransferRequest, UsbBackend};
use crate::clock::{Clock, ManualClock};
use crate::config::ProxyConfig;
use crate::handle::{NativeDevice, NativeHandle};
use crate::session::Session;
use crate::transfer::TransferId;
use abi::{ControlSetup, DeviceDescriptor, TransferStatus, UsbError, is_in_endpoint};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// A simulated USB device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub descriptor: DeviceDescriptor,
    /// String descriptors by index
    pub strings: HashMap<u8, String>,
    /// Interfaces bound to a kernel driver
    pub kernel_drivers: HashSet<u8>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                usb_version: 0x0200,
                max_packet_size: 64,
                vendor_id,
                product_id,
                device_version: 0x0100,
                num_configurations: 1,
                ..Default::default()
            },
            strings: HashMap::new(),
            kernel_drivers: HashSet::new(),
        }
    }

    /// Add a product string at index 2
    pub fn with_product(mut self, product: &str) -> Self {
        self.descriptor.product_string_index = 2;
        self.strings.insert(2, product.to_string());
        self
    }

    pub fn with_string(mut self, index: u8, value: &str) -> Self {
        self.strings.insert(index, value.to_string());
        self
    }

    pub fn with_kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.insert(interface);
        self
    }
}

/// Scripted outcome of the next transfer submitted on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedTransfer {
    /// Completes on this event poll after submission; `None` never completes
    pub after_polls: Option<u32>,
    pub status: TransferStatus,
    /// Bytes transferred; defaults to the whole buffer
    pub bytes: Option<usize>,
}

impl ScriptedTransfer {
    pub fn completes_after(polls: u32) -> Self {
        Self::with_status(TransferStatus::Completed, polls)
    }

    pub fn stalls_after(polls: u32) -> Self {
        Self::with_status(TransferStatus::Stall, polls)
    }

    /// Stays pending until cancelled or timed out
    pub fn never() -> Self {
        Self {
            after_polls: None,
            status: TransferStatus::Completed,
            bytes: None,
        }
    }

    pub fn with_status(status: TransferStatus, polls: u32) -> Self {
        Self {
            after_polls: Some(polls),
            status,
            bytes: None,
        }
    }

    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

impl Default for ScriptedTransfer {
    fn default() -> Self {
        Self::completes_after(1)
    }
}

/// Counters of what the mock backend was asked to do
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub inits: usize,
    pub enumerations: usize,
    pub opens: usize,
    pub closes: usize,
    pub submits: usize,
    pub cancels: usize,
    pub polls: usize,
    pub resets: usize,
    /// `release_transfer` calls per transfer
    pub releases: HashMap<TransferId, usize>,
    pub control_requests: Vec<ControlSetup>,
    /// Threads the backend was used from
    pub threads: HashSet<ThreadId>,
}

#[derive(Debug)]
struct Pending {
    request: TransferRequest,
    remaining: Option<u32>,
    status: TransferStatus,
    bytes: Option<usize>,
    deadline: Option<Instant>,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    /// Open handle to device index
    open: HashMap<u32, usize>,
    next_handle: u32,
    configurations: HashMap<u32, i32>,
    claimed: HashSet<(u32, u8)>,
    scripts: HashMap<u8, VecDeque<ScriptedTransfer>>,
    event_errors: VecDeque<UsbError>,
    init_failures: VecDeque<UsbError>,
    pending: Vec<Pending>,
    stats: MockStats,
}

impl MockState {
    fn touch(&mut self) {
        self.stats.threads.insert(std::thread::current().id());
    }

    fn device(&self, device: NativeDevice) -> abi::Result<&MockDevice> {
        self.devices
            .get(device.0 as usize)
            .ok_or(UsbError::NoDevice)
    }

    fn opened(&self, handle: NativeHandle) -> abi::Result<&MockDevice> {
        let index = *self.open.get(&handle.0).ok_or(UsbError::NoDevice)?;
        self.devices.get(index).ok_or(UsbError::NoDevice)
    }
}

/// Test-side control of a [`MockBackend`]
#[derive(Debug, Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
}

impl MockController {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                devices,
                next_handle: 1,
                ..Default::default()
            })),
        }
    }

    /// Factory creating backends that share this controller's state
    pub fn factory(&self, clock: Arc<dyn Clock>) -> BackendFactory {
        let state = self.state.clone();
        Box::new(move || {
            let mut guard = state.lock().unwrap();
            guard.touch();
            guard.stats.inits += 1;
            if let Some(error) = guard.init_failures.pop_front() {
                return Err(error);
            }
            drop(guard);

            Ok(Box::new(MockBackend {
                state: state.clone(),
                clock: clock.clone(),
            }) as Box<dyn UsbBackend>)
        })
    }

    /// Script the next transfer submitted on `endpoint`
    pub fn script(&self, endpoint: u8, transfer: ScriptedTransfer) {
        let mut state = self.state.lock().unwrap();
        state.scripts.entry(endpoint).or_default().push_back(transfer);
    }

    /// Make the next event poll fail with `error`
    pub fn fail_next_poll(&self, error: UsbError) {
        self.state.lock().unwrap().event_errors.push_back(error);
    }

    /// Make the next backend creation fail with `error`
    pub fn fail_next_init(&self, error: UsbError) {
        self.state.lock().unwrap().init_failures.push_back(error);
    }

    pub fn stats(&self) -> MockStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Transfers the backend still holds
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn configuration(&self, handle: NativeHandle) -> Option<i32> {
        self.state.lock().unwrap().configurations.get(&handle.0).copied()
    }
}

/// In-memory backend driven by a [`MockController`]
///
/// Transfers complete on the event poll their script names. A poll that
/// completes nothing and has no transfer counting down sleeps on the clock
/// until the poll timeout or the earliest transfer deadline.
#[derive(Debug)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    clock: Arc<dyn Clock>,
}

impl MockBackend {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.touch();
        state
    }

    fn expire(state: &mut MockState, now: Instant, done: &mut Vec<TransferCompletion>) {
        let mut i = 0;
        while i < state.pending.len() {
            let expired = state.pending[i].deadline.is_some_and(|d| now >= d);
            if expired {
                let pending = state.pending.remove(i);
                done.push(TransferCompletion::of(pending.request, TransferStatus::TimedOut, 0));
            } else {
                i += 1;
            }
        }
    }
}

fn finish(pending: Pending) -> TransferCompletion {
    let Pending {
        mut request,
        status,
        bytes,
        ..
    } = pending;
    let len = bytes.unwrap_or(request.buffer.len()).min(request.buffer.len());
    if status == TransferStatus::Completed && is_in_endpoint(request.endpoint) {
        for (i, byte) in request.buffer[..len].iter_mut().enumerate() {
            *byte = i as u8;
        }
    }
    let actual = if status == TransferStatus::Completed { len } else { 0 };
    TransferCompletion::of(request, status, actual)
}

impl UsbBackend for MockBackend {
    fn devices(&mut self) -> abi::Result<Vec<NativeDevice>> {
        let mut state = self.state();
        state.stats.enumerations += 1;
        Ok((0..state.devices.len() as u32).map(NativeDevice).collect())
    }

    fn device_descriptor(&mut self, device: NativeDevice) -> abi::Result<DeviceDescriptor> {
        Ok(self.state().device(device)?.descriptor)
    }

    fn open(&mut self, device: NativeDevice) -> abi::Result<NativeHandle> {
        let mut state = self.state();
        state.device(device)?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.open.insert(handle, device.0 as usize);
        state.stats.opens += 1;
        Ok(NativeHandle(handle))
    }

    fn close(&mut self, handle: NativeHandle) {
        let mut state = self.state();
        if state.open.remove(&handle.0).is_some() {
            state.stats.closes += 1;
            state.claimed.retain(|(h, _)| *h != handle.0);
        }
    }

    fn string_descriptor_ascii(
        &mut self,
        handle: NativeHandle,
        index: u8,
        capacity: usize,
    ) -> abi::Result<Vec<u8>> {
        let state = self.state();
        let value = state.opened(handle)?.strings.get(&index).ok_or(UsbError::Pipe)?;
        let mut bytes = value.as_bytes().to_vec();
        bytes.truncate(capacity);
        Ok(bytes)
    }

    fn set_configuration(&mut self, handle: NativeHandle, configuration: i32) -> abi::Result<()> {
        let mut state = self.state();
        let max = state.opened(handle)?.descriptor.num_configurations as i32;
        if configuration < -1 || configuration > max {
            return Err(UsbError::NotFound);
        }
        state.configurations.insert(handle.0, configuration);
        Ok(())
    }

    fn claim_interface(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<()> {
        let mut state = self.state();
        state.opened(handle)?;
        state.claimed.insert((handle.0, interface));
        Ok(())
    }

    fn release_interface(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<()> {
        let mut state = self.state();
        state.opened(handle)?;
        if !state.claimed.remove(&(handle.0, interface)) {
            return Err(UsbError::NotFound);
        }
        Ok(())
    }

    fn set_alternate_setting(
        &mut self,
        handle: NativeHandle,
        interface: u8,
        _setting: u8,
    ) -> abi::Result<()> {
        let state = self.state();
        state.opened(handle)?;
        if !state.claimed.contains(&(handle.0, interface)) {
            return Err(UsbError::NotFound);
        }
        Ok(())
    }

    fn control_transfer(
        &mut self,
        handle: NativeHandle,
        setup: ControlSetup,
        data: &mut [u8],
        _timeout: Duration,
    ) -> abi::Result<usize> {
        let mut state = self.state();
        state.opened(handle)?;
        state.stats.control_requests.push(setup);
        if setup.is_in() {
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = 0xA0 | (i as u8 & 0x0F);
            }
        }
        Ok(data.len())
    }

    fn clear_halt(&mut self, handle: NativeHandle, _endpoint: u8) -> abi::Result<()> {
        self.state().opened(handle).map(|_| ())
    }

    fn reset(&mut self, handle: NativeHandle) -> abi::Result<()> {
        let mut state = self.state();
        state.opened(handle)?;
        state.stats.resets += 1;
        Ok(())
    }

    fn kernel_driver_active(&mut self, handle: NativeHandle, interface: u8) -> abi::Result<bool> {
        Ok(self.state().opened(handle)?.kernel_drivers.contains(&interface))
    }

    fn submit(&mut self, request: TransferRequest) -> Result<(), Rejected> {
        let now = self.clock.now();
        let mut state = self.state();
        if state.opened(request.handle).is_err() {
            return Err(Rejected {
                error: UsbError::NoDevice,
                request,
            });
        }

        let script = state
            .scripts
            .get_mut(&request.endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        let deadline = (!request.timeout.is_zero()).then(|| now + request.timeout);

        state.stats.submits += 1;
        state.pending.push(Pending {
            request,
            remaining: script.after_polls,
            status: script.status,
            bytes: script.bytes,
            deadline,
            cancelled: false,
        });
        Ok(())
    }

    fn cancel(&mut self, id: TransferId) -> abi::Result<()> {
        let mut state = self.state();
        let pending = state
            .pending
            .iter_mut()
            .find(|p| p.request.id == id && !p.cancelled)
            .ok_or(UsbError::NotFound)?;
        pending.cancelled = true;
        state.stats.cancels += 1;
        Ok(())
    }

    fn release_transfer(&mut self, id: TransferId) {
        let mut state = self.state();
        *state.stats.releases.entry(id).or_insert(0) += 1;
        state.pending.retain(|p| p.request.id != id);
    }

    fn handle_events(&mut self, timeout: Duration) -> abi::Result<Vec<TransferCompletion>> {
        let mut state = self.state();
        state.stats.polls += 1;
        if let Some(error) = state.event_errors.pop_front() {
            return Err(error);
        }

        let mut done = Vec::new();
        let mut kept = Vec::new();
        let mut counting_down = false;
        for mut pending in std::mem::take(&mut state.pending) {
            if pending.cancelled {
                done.push(TransferCompletion::of(pending.request, TransferStatus::Cancelled, 0));
                continue;
            }
            match pending.remaining {
                Some(n) if n <= 1 => done.push(finish(pending)),
                Some(n) => {
                    pending.remaining = Some(n - 1);
                    counting_down = true;
                    kept.push(pending);
                }
                None => kept.push(pending),
            }
        }
        state.pending = kept;

        let now = self.clock.now();
        Self::expire(&mut state, now, &mut done);
        if !done.is_empty() || counting_down {
            return Ok(done);
        }

        let wait = state
            .pending
            .iter()
            .filter_map(|p| p.deadline)
            .map(|d| d.saturating_duration_since(now))
            .fold(timeout, Duration::min);
        drop(state);

        if !wait.is_zero() {
            self.clock.sleep(wait);
        }

        let now = self.clock.now();
        let mut state = self.state();
        Self::expire(&mut state, now, &mut done);
        Ok(done)
    }
}

/// Proxy configuration for tests: fast launch polling on a manual clock
pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        worker_name: "usb-worker-test".to_string(),
        start_retries: 20_000,
        start_retry_interval_ms: 1,
        ..Default::default()
    }
}

/// Create a session over a [`MockBackend`] with the given devices
pub fn mock_session(devices: Vec<MockDevice>) -> (Session, MockController, Arc<ManualClock>) {
    mock_session_with(devices, test_config())
}

pub fn mock_session_with(
    devices: Vec<MockDevice>,
    config: ProxyConfig,
) -> (Session, MockController, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let controller = MockController::new(devices);
    let mut factory = controller.factory(clock.clone());

    let session = Session::builder()
        .config(config)
        .clock(clock.clone())
        .backend(move || factory())
        .build();

    (session, controller, clock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, endpoint: u8, len: usize, timeout: Duration) -> TransferRequest {
        TransferRequest {
            id: TransferId(id),
            handle: NativeHandle(1),
            endpoint,
            kind: abi::TransferKind::Bulk,
            buffer: vec![0; len],
            timeout,
        }
    }

    fn backend(controller: &MockController, clock: Arc<ManualClock>) -> Box<dyn UsbBackend> {
        let mut factory = controller.factory(clock);
        factory().unwrap()
    }

    #[test]
    fn test_scripted_completion_counts_polls() {
        let controller = MockController::new(vec![MockDevice::new(0x1234, 0x5678)]);
        let clock = Arc::new(ManualClock::new());
        let mut backend = backend(&controller, clock);
        backend.open(NativeDevice(0)).unwrap();
        controller.script(0x81, ScriptedTransfer::completes_after(2).with_bytes(10));

        backend.submit(request(1, 0x81, 64, Duration::ZERO)).unwrap();
        assert!(backend.handle_events(Duration::from_secs(1)).unwrap().is_empty());

        let done = backend.handle_events(Duration::from_secs(1)).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, TransferStatus::Completed);
        assert_eq!(done[0].actual_length, 10);
        assert_eq!(done[0].buffer[9], 9);
    }

    #[test]
    fn test_idle_poll_sleeps_until_deadline() {
        let controller = MockController::new(vec![MockDevice::new(0x1234, 0x5678)]);
        let clock = Arc::new(ManualClock::new());
        let mut backend = backend(&controller, clock.clone());
        backend.open(NativeDevice(0)).unwrap();
        controller.script(0x02, ScriptedTransfer::never());

        backend
            .submit(request(1, 0x02, 8, Duration::from_millis(250)))
            .unwrap();
        let done = backend.handle_events(Duration::from_secs(60)).unwrap();

        assert_eq!(done[0].status, TransferStatus::TimedOut);
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn test_submit_on_closed_handle_is_rejected() {
        let controller = MockController::new(vec![MockDevice::new(0x1234, 0x5678)]);
        let mut backend = backend(&controller, Arc::new(ManualClock::new()));

        let rejected = backend
            .submit(request(1, 0x02, 8, Duration::ZERO))
            .unwrap_err();
        assert_eq!(rejected.error, UsbError::NoDevice);
        assert_eq!(rejected.request.buffer.len(), 8);
    }
}
