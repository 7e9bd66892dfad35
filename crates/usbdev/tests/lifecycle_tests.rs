//! Device lifecycle integration tests
//!
//! Attach, open, release and detach against the loopback transport, checking
//! the device object's reference count at every step.
//!
//! Run with: `cargo test -p usbdev --test lifecycle_tests`

use common::{BusLocation, EndpointDescriptor};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use usbdev::test_utils::{DEFAULT_TEST_TIMEOUT, LoopbackInterface};
use usbdev::{
    ControllerSettings, DriverError, DriverEvent, EventSender, HotplugController, Minor,
    UsbInterface, create_event_channel,
};

fn controller() -> HotplugController {
    HotplugController::new(ControllerSettings::default(), EventSender::discarding())
}

fn device_at(address: u8) -> Arc<LoopbackInterface> {
    LoopbackInterface::builder()
        .location(BusLocation::new(1, address))
        .bulk_pair(64)
        .build()
}

// ============================================================================
// End-to-end scenario
// ============================================================================

#[test]
fn test_attach_open_write_disconnect_release() {
    let ctl = controller();
    let iface = LoopbackInterface::builder().bulk_pair(64).build();

    let minor = ctl.on_attach(iface.clone()).unwrap();
    assert_eq!(ctl.registry().len(), 1);
    assert_eq!(ctl.ref_count(minor), Some(1));

    let session = ctl.open(minor).unwrap();
    assert_eq!(ctl.ref_count(minor), Some(2));

    assert_eq!(session.write_bytes(&[0x5a; 10]).unwrap(), 10);
    assert!(iface.flush(DEFAULT_TEST_TIMEOUT));
    let stats = iface.dma_stats();
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.frees, 1);

    let watch = ctl.watch(minor).unwrap();
    assert_eq!(ctl.on_detach(iface.location()), Some(minor));
    assert_eq!(session.device_ref_count(), 1);
    assert!(ctl.registry().is_empty());
    assert!(watch.upgrade().is_some());

    session.release();
    assert!(watch.upgrade().is_none());
    // Teardown gave the hardware handle back
    assert_eq!(Arc::strong_count(&iface), 1);
}

// ============================================================================
// Reference counting
// ============================================================================

#[test]
fn test_open_after_detach_fails() {
    let ctl = controller();
    let iface = device_at(3);
    let minor = ctl.on_attach(iface.clone()).unwrap();

    ctl.on_detach(iface.location());
    assert_eq!(
        ctl.open(minor).unwrap_err(),
        DriverError::NoSuchDevice(minor.0)
    );
}

#[test]
fn test_detach_with_many_sessions_defers_teardown() {
    let ctl = controller();
    let iface = device_at(5);
    let minor = ctl.on_attach(iface.clone()).unwrap();
    let watch = ctl.watch(minor).unwrap();

    let sessions: Vec<_> = (0..4).map(|_| ctl.open(minor).unwrap()).collect();
    assert_eq!(ctl.ref_count(minor), Some(5));

    ctl.on_detach(iface.location());
    assert_eq!(sessions[0].device_ref_count(), 4);

    let mut remaining = sessions;
    while let Some(session) = remaining.pop() {
        assert!(watch.upgrade().is_some());
        session.release();
    }
    assert!(watch.upgrade().is_none());
}

#[test]
fn test_sessions_released_from_many_threads() {
    let ctl = Arc::new(controller());
    let iface = device_at(6);
    let minor = ctl.on_attach(iface.clone()).unwrap();
    let watch = ctl.watch(minor).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || {
                for _ in 0..50 {
                    let session = ctl.open(minor).unwrap();
                    session.release();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ctl.ref_count(minor), Some(1));
    ctl.on_detach(iface.location());
    assert!(watch.upgrade().is_none());
}

proptest! {
    /// Refcount is the registry's reference plus every session still open
    #[test]
    fn prop_refcount_tracks_open_sessions(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
        let ctl = controller();
        let iface = device_at(7);
        let minor = ctl.on_attach(iface.clone()).unwrap();
        let watch = ctl.watch(minor).unwrap();

        let mut open = Vec::new();
        for opens in ops {
            if opens {
                open.push(ctl.open(minor).unwrap());
            } else if let Some(session) = open.pop() {
                session.release();
            }
            prop_assert_eq!(ctl.ref_count(minor), Some(1 + open.len()));
        }

        ctl.on_detach(iface.location());
        for session in open.drain(..) {
            prop_assert!(watch.upgrade().is_some());
            session.release();
        }
        prop_assert!(watch.upgrade().is_none());
        prop_assert_eq!(Arc::strong_count(&iface), 1);
    }
}

// ============================================================================
// Attach failures and minor allocation
// ============================================================================

#[test]
fn test_probe_takes_first_matching_endpoints() {
    let ctl = controller();
    let iface = LoopbackInterface::builder()
        .endpoint(EndpointDescriptor::bulk_out(1, 512))
        .endpoint(EndpointDescriptor::bulk_in(2, 64))
        .endpoint(EndpointDescriptor::bulk_in(3, 512))
        .endpoint(EndpointDescriptor::bulk_out(4, 512))
        .build();

    let minor = ctl.on_attach(iface).unwrap();
    let session = ctl.open(minor).unwrap();
    assert_eq!(session.device().bulk_in_endpoint(), 0x82);
    assert_eq!(session.device().bulk_out_endpoint(), 0x01);
    assert_eq!(session.device().bulk_in_size(), 64);
}

#[test]
fn test_missing_bulk_out_is_not_published() {
    let (tx, rx) = create_event_channel();
    let ctl = HotplugController::new(ControllerSettings::default(), tx);
    let iface = LoopbackInterface::builder()
        .endpoint(EndpointDescriptor::bulk_in(1, 64))
        .build();

    assert_eq!(
        ctl.on_attach(iface.clone()).unwrap_err(),
        DriverError::EndpointNotFound
    );
    assert!(ctl.registry().is_empty());
    assert!(rx.drain().is_empty());
    assert_eq!(Arc::strong_count(&iface), 1);
}

#[test]
fn test_minors_exhausted() {
    let ctl = HotplugController::new(
        ControllerSettings {
            max_minors: 2,
            ..ControllerSettings::default()
        },
        EventSender::discarding(),
    );

    ctl.on_attach(device_at(1)).unwrap();
    ctl.on_attach(device_at(2)).unwrap();
    let third = device_at(3);
    assert!(matches!(
        ctl.on_attach(third.clone()).unwrap_err(),
        DriverError::MinorsExhausted { .. }
    ));
    assert_eq!(Arc::strong_count(&third), 1);
}

#[test]
fn test_second_attach_at_same_location_is_refused() {
    let ctl = controller();
    let first = device_at(4);
    let second = device_at(4);

    let minor = ctl.on_attach(first.clone()).unwrap();
    assert_eq!(
        ctl.on_attach(second.clone()).unwrap_err(),
        DriverError::AlreadyAttached(first.location())
    );
    assert_eq!(ctl.minors(), vec![minor]);
    assert_eq!(Arc::strong_count(&second), 1);

    // One detach tears the only device object down
    let watch = ctl.watch(minor).unwrap();
    assert_eq!(ctl.on_detach(first.location()), Some(minor));
    assert!(ctl.registry().is_empty());
    assert!(watch.upgrade().is_none());
    assert_eq!(Arc::strong_count(&first), 1);

    // The location is free again
    assert_eq!(ctl.on_attach(second).unwrap(), minor);
}

#[test]
fn test_minor_reused_after_detach() {
    let ctl = controller();
    let first = device_at(1);
    let second = device_at(2);

    let a = ctl.on_attach(first.clone()).unwrap();
    let b = ctl.on_attach(second).unwrap();
    assert_eq!(b, Minor(a.0 + 1));

    ctl.on_detach(first.location());
    let c = ctl.on_attach(device_at(9)).unwrap();
    assert_eq!(c, a);
}

#[test]
fn test_stale_session_survives_minor_reuse() {
    let ctl = controller();
    let old = device_at(1);
    let minor = ctl.on_attach(old.clone()).unwrap();
    let session = ctl.open(minor).unwrap();

    ctl.on_detach(old.location());
    let new = device_at(2);
    assert_eq!(ctl.on_attach(new.clone()).unwrap(), minor);

    // The old session still talks to the old device
    assert_eq!(session.device().location(), old.location());
    assert_eq!(ctl.ref_count(minor), Some(1));

    // A detach for the old location is now a no-op
    assert_eq!(ctl.on_detach(old.location()), None);
    assert_eq!(ctl.minors(), vec![minor]);
}

#[test]
fn test_attach_and_detach_events() {
    let (tx, rx) = create_event_channel();
    let ctl = HotplugController::new(ControllerSettings::default(), tx);
    let iface = device_at(4);

    let minor = ctl.on_attach(iface.clone()).unwrap();
    match rx.recv_timeout(DEFAULT_TEST_TIMEOUT) {
        Some(DriverEvent::Attached {
            minor: m,
            bulk_in,
            bulk_out,
            bulk_in_size,
            ..
        }) => {
            assert_eq!(m, minor);
            assert_eq!(bulk_in, 0x81);
            assert_eq!(bulk_out, 0x02);
            assert_eq!(bulk_in_size, 64);
        }
        other => panic!("expected Attached, got {:?}", other),
    }

    ctl.on_detach(iface.location());
    assert_eq!(
        rx.recv_timeout(DEFAULT_TEST_TIMEOUT),
        Some(DriverEvent::Detached {
            minor,
            location: iface.location()
        })
    );
}
