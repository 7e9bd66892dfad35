//! Hotplug controller
//!
//! Turns attach/detach notifications from the enumeration layer into device
//! objects published in the registry, and hands out sessions on them. All
//! methods take `&self`: the controller is shared between the hotplug thread
//! and every thread that opens sessions.

use crate::config::DriverConfig;
use crate::error::Result;
use crate::events::{DriverEvent, EventSender};
use crate::usb::device::UsbSkel;
use crate::usb::registry::{DeviceRegistry, Minor};
use crate::usb::session::Session;
use crate::usb::transfers::DEFAULT_READ_TIMEOUT;
use crate::usb::transport::UsbInterface;
use common::BusLocation;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

/// First minor handed out by default
pub const DEFAULT_MINOR_BASE: u32 = 192;

/// Number of minors available by default
pub const DEFAULT_MAX_MINORS: u32 = 16;

/// Tunables of a [`HotplugController`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub minor_base: u32,
    pub max_minors: u32,
    pub read_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            minor_base: DEFAULT_MINOR_BASE,
            max_minors: DEFAULT_MAX_MINORS,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl From<&DriverConfig> for ControllerSettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            minor_base: config.usb.minor_base,
            max_minors: config.usb.max_minors,
            read_timeout: config.transfer.read_timeout(),
        }
    }
}

/// Attach/detach state machine and owner of the device registry
#[derive(Debug)]
pub struct HotplugController {
    registry: DeviceRegistry,
    events: EventSender,
    read_timeout: Duration,
}

impl HotplugController {
    pub fn new(settings: ControllerSettings, events: EventSender) -> Self {
        Self {
            registry: DeviceRegistry::new(settings.minor_base, settings.max_minors),
            events,
            read_timeout: settings.read_timeout,
        }
    }

    /// Probe a newly attached interface and publish it
    ///
    /// Nothing is published unless the interface has both a bulk-in and a
    /// bulk-out endpoint; on any failure the partially built device object
    /// is dropped before the error is returned.
    pub fn on_attach(&self, interface: Arc<dyn UsbInterface>) -> Result<Minor> {
        let identity = interface.identity();
        let location = interface.location();
        info!("USB device ({}) is plugged at {}", identity, location);

        let device = UsbSkel::probe(interface).map_err(|e| {
            error!("Could not probe device at {}: {}", location, e);
            e
        })?;
        let summary = device.summary();

        let minor = self.registry.publish(device).map_err(|e| {
            error!("Not able to publish this device: {}", e);
            e
        })?;

        info!(
            "USB Skeleton device now attached to usbdev-{} ({})",
            minor, summary
        );
        self.events.publish(DriverEvent::Attached {
            minor,
            location,
            identity,
            bulk_in: summary.bulk_in,
            bulk_in_size: summary.bulk_in_size,
            bulk_out: summary.bulk_out,
        });

        Ok(minor)
    }

    /// Unpublish the device that left `location`
    ///
    /// Returns the minor it was published under, or `None` if no device was
    /// known there. The registry's reference is released here; the device
    /// object itself lives on until the last open session is released.
    pub fn on_detach(&self, location: BusLocation) -> Option<Minor> {
        let Some((minor, device)) = self.registry.find_by_location(location) else {
            // libusb reports every device leaving the bus, bound or not
            debug!("Disconnect for unbound device at {}", location);
            return None;
        };

        {
            let _guard = device.lock_disconnect();
            // Dropping the registry's reference can't tear the device down
            // here: `device` is still held by this function.
            if self.registry.unpublish_device(minor, &device).is_none() {
                return None;
            }
        }

        info!("USB Skeleton #{} now disconnected", minor);
        self.events
            .publish(DriverEvent::Detached { minor, location });
        Some(minor)
    }

    /// Detach every published device (used on shutdown)
    pub fn detach_all(&self) -> Vec<Minor> {
        self.registry
            .minors()
            .into_iter()
            .filter_map(|minor| self.registry.lookup(minor))
            .filter_map(|device| self.on_detach(device.location()))
            .collect()
    }

    /// Open a session on the device published under `minor`
    pub fn open(&self, minor: Minor) -> Result<Session> {
        Session::open(&self.registry, minor, self.events.clone(), self.read_timeout)
    }

    /// Strong reference count of a published device
    pub fn ref_count(&self, minor: Minor) -> Option<usize> {
        self.registry.ref_count(minor)
    }

    /// Weak handle on a published device, to observe it after unpublish
    pub fn watch(&self, minor: Minor) -> Option<Weak<UsbSkel>> {
        self.registry
            .lookup(minor)
            .map(|device| Arc::downgrade(&device))
    }

    pub fn minors(&self) -> Vec<Minor> {
        self.registry.minors()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use crate::events::create_event_channel;
    use crate::test_utils::LoopbackInterface;
    use common::EndpointDescriptor;

    fn controller() -> HotplugController {
        HotplugController::new(ControllerSettings::default(), EventSender::discarding())
    }

    #[test]
    fn test_attach_publishes_with_one_reference() {
        let ctl = controller();
        let minor = ctl
            .on_attach(LoopbackInterface::builder().bulk_pair(64).build())
            .unwrap();

        assert_eq!(minor, Minor(DEFAULT_MINOR_BASE));
        assert_eq!(ctl.minors(), vec![minor]);
        assert_eq!(ctl.ref_count(minor), Some(1));
    }

    #[test]
    fn test_attach_without_endpoints_publishes_nothing() {
        let ctl = controller();
        let iface = LoopbackInterface::builder()
            .endpoint(EndpointDescriptor::bulk_in(1, 64))
            .build();

        assert_eq!(
            ctl.on_attach(iface.clone()).unwrap_err(),
            DriverError::EndpointNotFound
        );
        assert!(ctl.minors().is_empty());
        assert_eq!(Arc::strong_count(&iface), 1);
    }

    #[test]
    fn test_detach_unknown_location_is_noop() {
        let (tx, rx) = create_event_channel();
        let ctl = HotplugController::new(ControllerSettings::default(), tx);
        let iface = LoopbackInterface::builder().bulk_pair(64).build();
        let minor = ctl.on_attach(iface).unwrap();
        rx.drain();

        assert_eq!(ctl.on_detach(BusLocation::new(9, 9)), None);
        assert_eq!(ctl.minors(), vec![minor]);
        assert_eq!(ctl.ref_count(minor), Some(1));
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_detach_without_sessions_tears_down() {
        let ctl = controller();
        let iface = LoopbackInterface::builder().bulk_pair(64).build();
        let minor = ctl.on_attach(iface.clone()).unwrap();
        let watch = ctl.watch(minor).unwrap();

        assert_eq!(ctl.on_detach(iface.location()), Some(minor));
        assert!(watch.upgrade().is_none());
        assert_eq!(Arc::strong_count(&iface), 1);
    }

    #[test]
    fn test_open_unknown_minor() {
        let ctl = controller();
        assert_eq!(
            ctl.open(Minor(7)).unwrap_err(),
            DriverError::NoSuchDevice(7)
        );
    }

    #[test]
    fn test_events_follow_lifecycle() {
        let (tx, rx) = create_event_channel();
        let ctl = HotplugController::new(ControllerSettings::default(), tx);
        let iface = LoopbackInterface::builder().bulk_pair(64).build();

        let minor = ctl.on_attach(iface.clone()).unwrap();
        ctl.on_detach(iface.location());

        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DriverEvent::Attached { bulk_in_size: 64, .. }));
        assert_eq!(
            events[1],
            DriverEvent::Detached {
                minor,
                location: iface.location()
            }
        );
    }

    #[test]
    fn test_detach_all() {
        let ctl = controller();
        for address in 1..=3 {
            let iface = LoopbackInterface::builder()
                .location(BusLocation::new(1, address))
                .bulk_pair(64)
                .build();
            ctl.on_attach(iface).unwrap();
        }

        assert_eq!(ctl.detach_all().len(), 3);
        assert!(ctl.registry().is_empty());
    }
}
