//! rusb-backed hardware handle
//!
//! Wraps a claimed libusb interface as a [`UsbInterface`]. Bulk IN runs on the
//! caller's thread through `read_bulk`. Bulk OUT requests are queued to a
//! per-device writer thread which performs the transfer and completes the
//! request, so completions never run on the thread that submitted them.

use crate::config::TransferSettings;
use crate::error::TransferError;
use crate::usb::dma::DmaPool;
use crate::usb::transport::{OutboundTransfer, SubmitError, UsbInterface};
use async_channel::{Receiver, Sender, TrySendError, bounded};
use common::{BusLocation, EndpointDescriptor, TransferKind, UsbId};
use rusb::{Context, Device, DeviceHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A claimed interface of a real USB device
pub struct RusbInterface {
    handle: Arc<DeviceHandle<Context>>,
    location: BusLocation,
    identity: UsbId,
    interface_number: u8,
    endpoints: Vec<EndpointDescriptor>,
    dma: DmaPool,
    write_tx: Option<Sender<OutboundTransfer>>,
    closing: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
}

impl RusbInterface {
    /// Open `device` and claim the interface that carries its bulk endpoints
    ///
    /// The first interface exposing any bulk endpoint is chosen; if there is
    /// none, interface 0 is claimed and probe will reject the device.
    pub fn open(
        device: &Device<Context>,
        settings: &TransferSettings,
    ) -> Result<Arc<Self>, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let identity = UsbId::new(descriptor.vendor_id(), descriptor.product_id());
        let location = BusLocation::new(device.bus_number(), device.address());

        let config = device.active_config_descriptor()?;
        let mut candidates = config
            .interfaces()
            .filter_map(|interface| interface.descriptors().next())
            .map(|alt| {
                let endpoints: Vec<EndpointDescriptor> = alt
                    .endpoint_descriptors()
                    .map(|ep| {
                        EndpointDescriptor::new(
                            ep.address(),
                            map_transfer_type(ep.transfer_type()),
                            ep.max_packet_size(),
                        )
                    })
                    .collect();
                (alt.interface_number(), endpoints)
            })
            .collect::<Vec<_>>();

        let chosen = candidates
            .iter()
            .position(|(_, eps)| eps.iter().any(|ep| ep.kind == TransferKind::Bulk))
            .unwrap_or(0);
        let (interface_number, endpoints) = if candidates.is_empty() {
            (0, Vec::new())
        } else {
            candidates.swap_remove(chosen)
        };

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device at {}: {}", location, e);
            e
        })?;

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        handle.claim_interface(interface_number).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface_number, e);
            e
        })?;
        debug!(
            "Claimed interface {} on {} ({})",
            interface_number, location, identity
        );

        let handle = Arc::new(handle);
        let closing = Arc::new(AtomicBool::new(false));
        let (write_tx, write_rx) = bounded(settings.write_queue_depth);

        let writer = spawn_writer(
            Arc::clone(&handle),
            write_rx,
            Arc::clone(&closing),
            settings.write_timeout(),
            location,
        )
        .map_err(|e| {
            warn!("Failed to spawn writer thread: {}", e);
            rusb::Error::Other
        })?;

        Ok(Arc::new(Self {
            handle,
            location,
            identity,
            interface_number,
            endpoints,
            dma: DmaPool::new(),
            write_tx: Some(write_tx),
            closing,
            writer: Some(writer),
        }))
    }
}

impl UsbInterface for RusbInterface {
    fn location(&self) -> BusLocation {
        self.location
    }

    fn identity(&self) -> UsbId {
        self.identity
    }

    fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.endpoints.clone()
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError> {
        trace!(
            "Bulk IN: endpoint={:#04x}, len={}, timeout={}ms",
            endpoint,
            buffer.len(),
            timeout.as_millis()
        );
        self.handle
            .read_bulk(endpoint, buffer, timeout)
            .map_err(map_rusb_error)
    }

    fn submit_bulk_out(&self, request: OutboundTransfer) -> Result<(), SubmitError> {
        let Some(tx) = &self.write_tx else {
            return Err(SubmitError::new(TransferError::Shutdown, request));
        };

        tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(request) => {
                SubmitError::new(TransferError::Other("write queue full".to_string()), request)
            }
            TrySendError::Closed(request) => SubmitError::new(TransferError::Shutdown, request),
        })
    }

    fn dma_pool(&self) -> &DmaPool {
        &self.dma
    }
}

impl Drop for RusbInterface {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.write_tx.take();

        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            warn!("Writer thread for {} panicked", self.location);
        }

        if let Err(e) = self.handle.release_interface(self.interface_number) {
            debug!(
                "Could not release interface {} on {} (may already be gone): {}",
                self.interface_number, self.location, e
            );
        }
    }
}

fn spawn_writer(
    handle: Arc<DeviceHandle<Context>>,
    requests: Receiver<OutboundTransfer>,
    closing: Arc<AtomicBool>,
    timeout: Duration,
    location: BusLocation,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("usbdev-tx-{}-{}", location.bus, location.address))
        .spawn(move || {
            while let Ok(request) = requests.recv_blocking() {
                if closing.load(Ordering::Acquire) {
                    request.complete(Err(TransferError::Shutdown));
                    continue;
                }

                let status = handle
                    .write_bulk(request.endpoint(), request.data(), timeout)
                    .map_err(map_rusb_error);
                request.complete(status);
            }
            debug!("Writer thread for {} stopped", location);
        })
}

/// Map rusb transfer type to the shared descriptor vocabulary
fn map_transfer_type(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Map rusb::Error to the transport status the driver passes through
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransferError::NoDevice,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Interrupted => TransferError::Canceled,
        rusb::Error::Io => TransferError::Io,
        _ => TransferError::Other(err.to_string()),
    }
}
