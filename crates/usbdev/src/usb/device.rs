//! USB Skeleton device object
//!
//! One [`UsbSkel`] exists per attached device. It is always held in an
//! `Arc`: the registry keeps one strong reference while the device is
//! published and every open session keeps another. Teardown is `Drop`, so it
//! runs exactly once, on whichever thread lets go of the last reference.

use crate::error::{DriverError, Result};
use crate::usb::transport::UsbInterface;
use common::{BusLocation, UsbId};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Endpoint layout discovered at probe time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSummary {
    pub bulk_in: u8,
    pub bulk_in_size: usize,
    pub bulk_out: u8,
}

impl fmt::Display for EndpointSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bulk-in {:#04x} ({} bytes), bulk-out {:#04x}",
            self.bulk_in, self.bulk_in_size, self.bulk_out
        )
    }
}

/// Driver-side state of one attached device
pub struct UsbSkel {
    /// Hardware handle, held until teardown
    interface: Arc<dyn UsbInterface>,
    location: BusLocation,
    identity: UsbId,
    bulk_in_endpoint: u8,
    bulk_out_endpoint: u8,
    /// Receive buffer, sized to the bulk-in max packet and never resized
    bulk_in_buffer: Mutex<Box<[u8]>>,
    bulk_in_size: usize,
    /// Held by detach while the device is unpublished
    disconnect_guard: Mutex<()>,
}

impl UsbSkel {
    /// Build the device object for a freshly attached interface
    ///
    /// Takes the first bulk-in and the first bulk-out endpoint in descriptor
    /// order. If either is missing the interface handle is released and
    /// `EndpointNotFound` is returned.
    pub fn probe(interface: Arc<dyn UsbInterface>) -> Result<Arc<Self>> {
        let mut bulk_in: Option<(u8, Box<[u8]>)> = None;
        let mut bulk_out: Option<u8> = None;

        for endpoint in interface.endpoints() {
            if bulk_in.is_none() && endpoint.is_bulk_in() {
                let size = usize::from(endpoint.max_packet_size);
                let buffer = allocate_receive_buffer(size)?;
                debug!(
                    "Found bulk-in endpoint {:#04x}, max packet {}",
                    endpoint.address, size
                );
                bulk_in = Some((endpoint.address, buffer));
            }

            if bulk_out.is_none() && endpoint.is_bulk_out() {
                debug!("Found bulk-out endpoint {:#04x}", endpoint.address);
                bulk_out = Some(endpoint.address);
            }
        }

        let ((bulk_in_endpoint, buffer), bulk_out_endpoint) = match (bulk_in, bulk_out) {
            (Some(bulk_in), Some(bulk_out)) => (bulk_in, bulk_out),
            _ => {
                debug!(
                    "Device at {} lacks a bulk-in/bulk-out endpoint pair",
                    interface.location()
                );
                return Err(DriverError::EndpointNotFound);
            }
        };

        Ok(Arc::new(Self {
            location: interface.location(),
            identity: interface.identity(),
            interface,
            bulk_in_endpoint,
            bulk_out_endpoint,
            bulk_in_size: buffer.len(),
            bulk_in_buffer: Mutex::new(buffer),
            disconnect_guard: Mutex::new(()),
        }))
    }

    pub fn location(&self) -> BusLocation {
        self.location
    }

    pub fn identity(&self) -> UsbId {
        self.identity
    }

    pub fn bulk_in_endpoint(&self) -> u8 {
        self.bulk_in_endpoint
    }

    pub fn bulk_out_endpoint(&self) -> u8 {
        self.bulk_out_endpoint
    }

    /// Capacity of the receive buffer
    pub fn bulk_in_size(&self) -> usize {
        self.bulk_in_size
    }

    pub fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            bulk_in: self.bulk_in_endpoint,
            bulk_in_size: self.bulk_in_size,
            bulk_out: self.bulk_out_endpoint,
        }
    }

    pub fn interface(&self) -> &dyn UsbInterface {
        self.interface.as_ref()
    }

    /// Exclusive access to the receive buffer for one read
    pub(crate) fn lock_bulk_in(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bulk_in_buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_disconnect(&self) -> MutexGuard<'_, ()> {
        self.disconnect_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for UsbSkel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbSkel")
            .field("location", &self.location)
            .field("identity", &self.identity)
            .field("endpoints", &self.summary())
            .finish_non_exhaustive()
    }
}

impl Drop for UsbSkel {
    fn drop(&mut self) {
        info!(
            "Releasing USB Skeleton device at {} ({})",
            self.location, self.identity
        );
    }
}

fn allocate_receive_buffer(size: usize) -> Result<Box<[u8]>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| DriverError::OutOfMemory(size))?;
    buffer.resize(size, 0);
    Ok(buffer.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::LoopbackInterface;
    use common::{EndpointDescriptor, TransferKind};

    #[test]
    fn test_probe_takes_first_bulk_pair() {
        let iface = LoopbackInterface::builder()
            .endpoint(EndpointDescriptor::new(0x83, TransferKind::Interrupt, 8))
            .endpoint(EndpointDescriptor::bulk_in(1, 64))
            .endpoint(EndpointDescriptor::bulk_in(2, 512))
            .endpoint(EndpointDescriptor::bulk_out(3, 512))
            .endpoint(EndpointDescriptor::bulk_out(4, 64))
            .build();

        let dev = UsbSkel::probe(iface).unwrap();
        assert_eq!(dev.bulk_in_endpoint(), 0x81);
        assert_eq!(dev.bulk_in_size(), 64);
        assert_eq!(dev.bulk_out_endpoint(), 0x03);
        assert_eq!(dev.lock_bulk_in().len(), 64);
    }

    #[test]
    fn test_probe_without_bulk_out_fails() {
        let iface = LoopbackInterface::builder()
            .endpoint(EndpointDescriptor::bulk_in(1, 64))
            .build();

        assert_eq!(
            UsbSkel::probe(iface).unwrap_err(),
            DriverError::EndpointNotFound
        );
    }

    #[test]
    fn test_probe_releases_interface_on_failure() {
        let iface = LoopbackInterface::builder()
            .endpoint(EndpointDescriptor::bulk_out(1, 64))
            .build();
        let before = Arc::strong_count(&iface);

        let handle: Arc<dyn UsbInterface> = iface.clone();
        assert!(UsbSkel::probe(handle).is_err());
        assert_eq!(Arc::strong_count(&iface), before);
    }

    #[test]
    fn test_teardown_releases_interface() {
        let iface = LoopbackInterface::builder().bulk_pair(64).build();
        let dev = UsbSkel::probe(iface.clone()).unwrap();
        assert_eq!(Arc::strong_count(&iface), 2);

        drop(dev);
        assert_eq!(Arc::strong_count(&iface), 1);
    }
}
