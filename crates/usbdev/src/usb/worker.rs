//! Hotplug worker thread
//!
//! Owns the libusb context. Runs the `handle_events` loop, receives hotplug
//! notifications from libusb and feeds them to the [`HotplugController`].
//! The libusb callback only forwards the event over a channel; probing and
//! opening happen on the worker loop, outside the callback.

use crate::config::{DriverConfig, IdTable};
use crate::usb::hotplug::HotplugController;
use crate::usb::rusb_backend::RusbInterface;
use anyhow::{Context as _, Result};
use async_channel::{Receiver, Sender, unbounded};
use common::{BusLocation, UsbId};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Notification forwarded out of the libusb callback
enum HotplugEvent {
    Arrived(Device<Context>),
    Left(BusLocation),
}

/// Stops a running hotplug worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the worker to detach everything and exit after its current poll
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Start the hotplug worker for `controller`
///
/// Devices already present and matching the id table are attached before
/// the first event-loop pass.
pub fn spawn_hotplug_worker(
    controller: Arc<HotplugController>,
    config: &DriverConfig,
) -> Result<(WorkerHandle, JoinHandle<()>)> {
    let ids = config.usb.ids()?;
    let context = Context::new().context("Failed to initialize libusb")?;
    let handle = WorkerHandle::new();

    let worker = HotplugWorker {
        context,
        controller,
        ids,
        config: config.clone(),
        stop: handle.clone(),
    };

    let thread = std::thread::Builder::new()
        .name("usbdev-hotplug".to_string())
        .spawn(move || worker.run())
        .context("Failed to spawn hotplug worker thread")?;

    Ok((handle, thread))
}

struct HotplugWorker {
    context: Context,
    controller: Arc<HotplugController>,
    ids: IdTable,
    config: DriverConfig,
    stop: WorkerHandle,
}

impl HotplugWorker {
    fn run(self) {
        info!("Hotplug worker started");

        let (event_tx, event_rx) = unbounded();
        self.enumerate();
        let _registration = self.register_hotplug(event_tx);

        let poll = self.config.transfer.event_poll();
        while !self.stop.is_shutdown() {
            match self.context.handle_events(Some(poll)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(poll);
                }
            }

            self.drain(&event_rx);
        }

        let detached = self.controller.detach_all();
        info!(
            "Hotplug worker stopped ({} devices detached)",
            detached.len()
        );
    }

    fn enumerate(&self) {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                error!("Failed to enumerate USB devices: {}", e);
                return;
            }
        };

        for device in devices.iter() {
            self.attach(device);
        }
        debug!(
            "Initial enumeration bound {} devices",
            self.controller.minors().len()
        );
    }

    fn register_hotplug(&self, events: Sender<HotplugEvent>) -> Option<Registration<Context>> {
        if !rusb::has_hotplug() {
            warn!("libusb has no hotplug support; only devices present at start are bound");
            return None;
        }

        match HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { events }))
        {
            Ok(registration) => {
                debug!("Hot-plug callbacks registered");
                Some(registration)
            }
            Err(e) => {
                error!("Failed to register hotplug callback: {}", e);
                None
            }
        }
    }

    fn drain(&self, events: &Receiver<HotplugEvent>) {
        while let Ok(event) = events.try_recv() {
            match event {
                HotplugEvent::Arrived(device) => self.attach(device),
                HotplugEvent::Left(location) => {
                    self.controller.on_detach(location);
                }
            }
        }
    }

    fn attach(&self, device: Device<Context>) {
        let Some(identity) = device_identity(&device) else {
            return;
        };
        if !self.ids.matches(identity) {
            return;
        }

        match RusbInterface::open(&device, &self.config.transfer) {
            // on_attach logs its own failures
            Ok(interface) => {
                let _ = self.controller.on_attach(interface);
            }
            Err(e) => warn!(
                "Could not open {} at bus {} device {}: {}",
                identity,
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }
}

/// Matching device currently on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentDevice {
    pub location: BusLocation,
    pub identity: UsbId,
}

/// List attached devices that match `ids`, without opening them
pub fn list_matching_devices(ids: &IdTable) -> Result<Vec<PresentDevice>> {
    let context = Context::new().context("Failed to initialize libusb")?;
    let devices = context
        .devices()
        .context("Failed to enumerate USB devices")?;

    Ok(devices
        .iter()
        .filter_map(|device| {
            let identity = device_identity(&device)?;
            ids.matches(identity).then(|| PresentDevice {
                location: BusLocation::new(device.bus_number(), device.address()),
                identity,
            })
        })
        .collect())
}

fn device_identity<T: UsbContext>(device: &Device<T>) -> Option<UsbId> {
    match device.device_descriptor() {
        Ok(descriptor) => Some(UsbId::new(descriptor.vendor_id(), descriptor.product_id())),
        Err(e) => {
            debug!(
                "Skipping device at bus {} device {}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            None
        }
    }
}

/// libusb hotplug callback; forwards to the worker loop
struct HotplugForwarder {
    events: Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if self.events.try_send(HotplugEvent::Arrived(device)).is_err() {
            warn!("Hotplug worker gone; dropping arrival");
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let location = BusLocation::new(device.bus_number(), device.address());
        debug!("Hot-plug callback: device left ({})", location);
        if self.events.try_send(HotplugEvent::Left(location)).is_err() {
            warn!("Hotplug worker gone; dropping removal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_handle_shutdown_is_shared() {
        let handle = WorkerHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_shutdown());

        handle.shutdown();
        assert!(clone.is_shutdown());
    }
}
