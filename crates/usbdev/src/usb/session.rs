//! Session layer
//!
//! A [`Session`] is one caller's open handle on a published device. Opening
//! takes a strong reference to the device object; dropping or releasing the
//! session gives it back, exactly once, whether or not the device has been
//! unplugged in the meantime.

use crate::error::{DriverError, Result};
use crate::events::EventSender;
use crate::uaccess::{IoBufferReader, IoBufferWriter};
use crate::usb::device::UsbSkel;
use crate::usb::registry::{DeviceRegistry, Minor};
use crate::usb::transfers;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// An open handle on one device
#[derive(Debug)]
pub struct Session {
    minor: Minor,
    device: Arc<UsbSkel>,
    events: EventSender,
    read_timeout: Duration,
}

impl Session {
    /// Bind a new session to the device published under `minor`
    pub(crate) fn open(
        registry: &DeviceRegistry,
        minor: Minor,
        events: EventSender,
        read_timeout: Duration,
    ) -> Result<Self> {
        let device = registry.lookup(minor).ok_or_else(|| {
            debug!("Can't find device for minor {}", minor);
            DriverError::NoSuchDevice(minor.0)
        })?;

        debug!(
            "Opened session on minor {} ({} references)",
            minor,
            Arc::strong_count(&device)
        );

        Ok(Self {
            minor,
            device,
            events,
            read_timeout,
        })
    }

    pub fn minor(&self) -> Minor {
        self.minor
    }

    pub fn device(&self) -> &UsbSkel {
        &self.device
    }

    /// Current strong reference count of the bound device
    pub fn device_ref_count(&self) -> usize {
        Arc::strong_count(&self.device)
    }

    /// Blocking read of at most `out.len()` bytes
    pub fn read<W: IoBufferWriter + ?Sized>(&self, out: &mut W) -> Result<usize> {
        transfers::read_bulk(&self.device, out, self.read_timeout)
    }

    /// Read into a freshly allocated vector of at most `max_len` bytes
    pub fn read_to_vec(&self, max_len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; max_len.min(self.device.bulk_in_size())];
        let count = self.read(&mut data.as_mut_slice())?;
        data.truncate(count);
        Ok(data)
    }

    /// Queue `data` for transfer; returns once the transport accepted it
    pub fn write<R: IoBufferReader + ?Sized>(&self, data: &mut R) -> Result<usize> {
        transfers::write_bulk(&self.device, self.minor, &self.events, data)
    }

    pub fn write_bytes(&self, data: &[u8]) -> Result<usize> {
        let mut reader = data;
        self.write(&mut reader)
    }

    /// Close the session, giving back its device reference
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(
            "Releasing session on minor {} ({} references before release)",
            self.minor,
            Arc::strong_count(&self.device)
        );
    }
}

impl io::Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut out = buf;
        Session::read(self, &mut out).map_err(io::Error::from)
    }
}

impl io::Write for Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Session::write_bytes(self, buf).map_err(io::Error::from)
    }

    /// Writes are handed off to the transport immediately; nothing is buffered here
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
