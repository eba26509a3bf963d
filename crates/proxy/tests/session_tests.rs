//! Session integration tests
//!
//! Covers the worker launch, device enumeration, handle validation and the
//! device-level entry points, all against the mock backend.
//!
//! Run with: `cargo test -p usbproxy --test session_tests`

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use usbproxy::test_utils::{MockDevice, mock_session, mock_session_with, test_config};
use usbproxy::{ControlSetup, Device, DeviceHandle, TypedHandle, UsbError};

fn keyboard() -> MockDevice {
    MockDevice::new(0x046d, 0xc31c).with_product("USB Keyboard")
}

fn storage() -> MockDevice {
    MockDevice::new(0x0781, 0x5567)
        .with_product("Cruzer Blade")
        .with_kernel_driver(0)
}

// ============================================================================
// Launch
// ============================================================================

mod launch {
    use super::*;

    #[test]
    fn test_concurrent_init_spawns_one_worker() {
        let (session, controller, _clock) = mock_session(vec![keyboard()]);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    session.init()
                })
            })
            .collect();

        let contexts: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        assert!(contexts.iter().all(|ctx| *ctx == contexts[0]));
        assert!(contexts[0].is_started());

        let stats = controller.stats();
        assert_eq!(stats.inits, 1);
        assert_eq!(stats.threads.len(), 1);
        assert!(!stats.threads.contains(&thread::current().id()));
    }

    #[test]
    fn test_init_is_idempotent() {
        let (session, controller, _clock) = mock_session(vec![]);

        let first = session.init().unwrap();
        let second = session.init().unwrap();

        assert_eq!(first, second);
        assert_eq!(controller.stats().inits, 1);
        assert!(session.worker_alive());
    }

    #[test]
    fn test_failed_native_init_is_retried() {
        let (session, controller, _clock) = mock_session(vec![]);
        controller.fail_next_init(UsbError::Access);

        assert_eq!(session.init(), Err(UsbError::Access));
        assert!(session.worker_alive());

        session.init().unwrap();
        assert_eq!(controller.stats().inits, 2);
        assert_eq!(controller.stats().threads.len(), 1);
    }

    #[test]
    fn test_foreign_device_refused_before_init() {
        let (session, _controller, _clock) = mock_session(vec![keyboard()]);
        let (other, _, _) = mock_session(vec![keyboard()]);

        let ctx = other.init().unwrap();
        let device = other.get_device_list(&ctx).unwrap().get(0).copied().unwrap();

        // Foreign handles are refused before the worker is consulted
        assert_eq!(
            session.get_device_descriptor(&device),
            Err(UsbError::InvalidParam)
        );
        assert!(!session.worker_alive());
    }

    #[test]
    fn test_worker_uses_configured_name() {
        let mut config = test_config();
        config.worker_name = "usb-worker-named".to_string();
        let (session, _controller, _clock) = mock_session_with(vec![], config);

        session.init().unwrap();
        assert_eq!(session.config().worker_name, "usb-worker-named");
    }

    #[test]
    fn test_exit_keeps_worker() {
        let (session, _controller, _clock) = mock_session(vec![keyboard()]);
        let ctx = session.init().unwrap();

        session.exit(&ctx);

        assert!(session.worker_alive());
        assert_eq!(session.get_device_list(&ctx).unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_stops_worker() {
        let (session, _controller, _clock) = mock_session(vec![keyboard()]);
        let ctx = session.init().unwrap();
        let device = session.get_device_list(&ctx).unwrap().get(0).copied().unwrap();

        session.shutdown();

        assert!(!session.worker_alive());
        assert_eq!(session.get_device_descriptor(&device), Err(UsbError::NotSupported));
        assert_eq!(session.init(), Err(UsbError::NotSupported));

        // Second shutdown and the final drop have nothing left to stop
        session.shutdown();
    }

    #[test]
    fn test_drop_stops_worker() {
        let (session, controller, _clock) = mock_session(vec![keyboard()]);
        session.init().unwrap();
        let other = session.clone();

        drop(session);
        assert!(other.worker_alive());

        drop(other);
        // Backend state is shared with the controller and outlives the worker
        assert_eq!(controller.stats().inits, 1);
    }
}

// ============================================================================
// Enumeration
// ============================================================================

mod enumeration {
    use super::*;

    #[test]
    fn test_device_list_is_cached() {
        let (session, controller, _clock) = mock_session(vec![keyboard(), storage()]);
        let ctx = session.init().unwrap();

        let first = session.get_device_list(&ctx).unwrap();
        let second = session.get_device_list(&ctx).unwrap();

        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(controller.stats().enumerations, 1);
    }

    #[test]
    fn test_free_device_list_keeps_cache() {
        let (session, controller, _clock) = mock_session(vec![keyboard()]);
        let ctx = session.init().unwrap();

        let list = session.get_device_list(&ctx).unwrap();
        let device = list.get(0).copied().unwrap();
        session.free_device_list(list, true);

        let again = session.get_device_list(&ctx).unwrap();
        assert_eq!(again.get(0), Some(&device));
        assert_eq!(controller.stats().enumerations, 1);

        // Devices from the freed list remain usable
        let descriptor = session.get_device_descriptor(&device).unwrap();
        assert_eq!(descriptor.vendor_id, 0x046d);
    }

    #[test]
    fn test_device_descriptors() {
        let (session, _controller, _clock) = mock_session(vec![keyboard(), storage()]);
        let ctx = session.init().unwrap();
        let list = session.get_device_list(&ctx).unwrap();

        let ids: Vec<_> = list
            .iter()
            .map(|d| session.get_device_descriptor(d).unwrap())
            .map(|d| (d.vendor_id, d.product_id))
            .collect();

        assert_eq!(ids, vec![(0x046d, 0xc31c), (0x0781, 0x5567)]);
    }
}

// ============================================================================
// Handle validation
// ============================================================================

mod handles {
    use super::*;

    #[test]
    fn test_foreign_context_is_rejected() {
        let (a, _, _) = mock_session(vec![keyboard()]);
        let (b, _, _) = mock_session(vec![keyboard()]);
        let ctx_a = a.init().unwrap();
        b.init().unwrap();

        assert_eq!(b.get_device_list(&ctx_a).unwrap_err(), UsbError::InvalidParam);
        assert_eq!(
            b.handle_events_timeout(&ctx_a, Duration::from_millis(1)),
            Err(UsbError::InvalidParam)
        );
    }

    #[test]
    fn test_foreign_device_handle_is_rejected() {
        let (a, _, _) = mock_session(vec![keyboard()]);
        let (b, controller_b, _) = mock_session(vec![keyboard()]);
        let ctx_a = a.init().unwrap();
        b.init().unwrap();

        let device = a.get_device_list(&ctx_a).unwrap().get(0).copied().unwrap();
        let handle = a.open(&device).unwrap();

        assert_eq!(b.open(&device), Err(UsbError::InvalidParam));
        assert_eq!(b.claim_interface(&handle, 0), Err(UsbError::InvalidParam));
        assert_eq!(b.reset_device(&handle), Err(UsbError::InvalidParam));
        assert_eq!(controller_b.stats().opens, 0);
    }

    #[test]
    fn test_role_mismatch_is_rejected() {
        let (session, _, _) = mock_session(vec![keyboard()]);
        let ctx = session.init().unwrap();
        let device = session.get_device_list(&ctx).unwrap().get(0).copied().unwrap();
        let handle = session.open(&device).unwrap();

        assert_eq!(DeviceHandle::try_from(device.raw()), Err(UsbError::InvalidParam));
        assert_eq!(Device::try_from(handle.raw()), Err(UsbError::InvalidParam));
        assert_eq!(DeviceHandle::try_from(handle.raw()), Ok(handle));
    }
}

// ============================================================================
// Device operations
// ============================================================================

mod device_ops {
    use super::*;

    fn open_first(session: &usbproxy::Session) -> DeviceHandle {
        let ctx = session.init().unwrap();
        let device = session.get_device_list(&ctx).unwrap().get(0).copied().unwrap();
        session.open(&device).unwrap()
    }

    #[test]
    fn test_open_and_close() {
        let (session, controller, _clock) = mock_session(vec![keyboard()]);
        let handle = open_first(&session);

        session.close(&handle);

        let stats = controller.stats();
        assert_eq!(stats.opens, 1);
        assert_eq!(stats.closes, 1);
        assert_eq!(session.claim_interface(&handle, 0), Err(UsbError::NoDevice));
    }

    #[test]
    fn test_string_descriptor_ascii() {
        let (session, _controller, _clock) = mock_session(vec![keyboard()]);
        let handle = open_first(&session);

        let mut buf = [0u8; 64];
        let len = session.get_string_descriptor_ascii(&handle, 2, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"USB Keyboard");

        let mut short = [0u8; 3];
        let len = session.get_string_descriptor_ascii(&handle, 2, &mut short).unwrap();
        assert_eq!(len, 3);
        assert_eq!(&short, b"USB");

        assert_eq!(
            session.get_string_descriptor_ascii(&handle, 9, &mut buf),
            Err(UsbError::Pipe)
        );
    }

    #[test]
    fn test_configuration_and_interfaces() {
        let (session, controller, _clock) = mock_session(vec![storage()]);
        let handle = open_first(&session);

        session.set_configuration(&handle, 1).unwrap();
        assert_eq!(controller.configuration(handle.native()), Some(1));
        session.set_configuration(&handle, -1).unwrap();
        assert_eq!(controller.configuration(handle.native()), Some(-1));
        assert_eq!(session.set_configuration(&handle, 5), Err(UsbError::NotFound));

        assert!(session.kernel_driver_active(&handle, 0).unwrap());
        assert!(!session.kernel_driver_active(&handle, 1).unwrap());

        session.claim_interface(&handle, 0).unwrap();
        session.set_interface_alt_setting(&handle, 0, 1).unwrap();
        session.release_interface(&handle, 0).unwrap();
        assert_eq!(session.release_interface(&handle, 0), Err(UsbError::NotFound));
        assert_eq!(
            session.set_interface_alt_setting(&handle, 0, 1),
            Err(UsbError::NotFound)
        );
    }

    #[test]
    fn test_control_transfer_in() {
        let (session, controller, _clock) = mock_session(vec![keyboard()]);
        let handle = open_first(&session);

        let setup = ControlSetup {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
        };
        let mut data = [0u8; 18];
        let len = session
            .control_transfer(&handle, setup, &mut data, Duration::from_secs(1))
            .unwrap();

        assert_eq!(len, 18);
        assert_eq!(data[0], 0xA0);
        assert_eq!(data[17], 0xA1);
        assert_eq!(controller.stats().control_requests, vec![setup]);
    }

    #[test]
    fn test_control_transfer_out_leaves_buffer() {
        let (session, _controller, _clock) = mock_session(vec![keyboard()]);
        let handle = open_first(&session);

        let setup = ControlSetup {
            request_type: 0x21,
            request: 0x09,
            value: 0x0200,
            index: 0,
        };
        let mut data = [1u8, 2, 3];
        let len = session
            .control_transfer(&handle, setup, &mut data, Duration::from_secs(1))
            .unwrap();

        assert_eq!(len, 3);
        assert_eq!(data, [1, 2, 3]);
    }

    #[test]
    fn test_clear_halt_and_reset() {
        let (session, controller, _clock) = mock_session(vec![keyboard()]);
        let handle = open_first(&session);

        session.clear_halt(&handle, 0x81).unwrap();
        session.reset_device(&handle).unwrap();
        assert_eq!(controller.stats().resets, 1);
    }
}
