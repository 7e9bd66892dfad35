//! Bulk transfer paths
//!
//! Reads are synchronous: one blocking bulk IN transfer into the device's
//! receive buffer, then a copy of whatever actually arrived. Writes are
//! fire-and-forget: the data is staged in a DMA buffer, handed to the
//! transport, and the call returns before the device has seen a byte.

use crate::error::{DriverError, Result, TransferError};
use crate::events::{DriverEvent, EventSender};
use crate::uaccess::{IoBufferReader, IoBufferWriter};
use crate::usb::device::UsbSkel;
use crate::usb::dma::DmaBuffer;
use crate::usb::registry::Minor;
use crate::usb::transport::{OutboundTransfer, SubmitError};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Default bulk IN timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Read one bulk IN transfer into `out`
///
/// Requests at most `min(bulk_in_size, out.len())` bytes and returns the
/// number the device actually sent. A short transfer is a success. Transport
/// failures, timeouts included, are returned unchanged and nothing is copied.
pub fn read_bulk<W: IoBufferWriter + ?Sized>(
    device: &UsbSkel,
    out: &mut W,
    timeout: Duration,
) -> Result<usize> {
    if out.is_empty() {
        return Ok(0);
    }

    // Held for the whole read: the receive buffer is reused by every call.
    let mut buffer = device.lock_bulk_in();
    let len = buffer.len().min(out.len());

    let count = device
        .interface()
        .read_bulk(device.bulk_in_endpoint(), &mut buffer[..len], timeout)
        .map_err(|e| {
            warn!(
                "Bulk IN on endpoint {:#04x} failed: {}",
                device.bulk_in_endpoint(),
                e
            );
            DriverError::Transport(e)
        })?
        .min(len);

    out.write_slice(&buffer[..count])?;
    trace!("Bulk IN transfer returned {} of {} bytes", count, len);
    Ok(count)
}

/// Stage `data` and submit it to the bulk OUT endpoint without waiting
///
/// Returns the number of bytes accepted for transfer, which is always the
/// full length of `data`. Delivery is reported later through
/// [`DriverEvent::WriteCompleted`].
pub fn write_bulk<R: IoBufferReader + ?Sized>(
    device: &UsbSkel,
    minor: Minor,
    events: &EventSender,
    data: &mut R,
) -> Result<usize> {
    let count = data.len();
    if count == 0 {
        return Ok(0);
    }

    let interface = device.interface();
    let mut buffer = interface
        .dma_pool()
        .allocate(count)
        .ok_or(DriverError::OutOfMemory(count))?;

    if let Err(e) = data.read_slice(&mut buffer) {
        buffer.free();
        return Err(e);
    }

    let request = OutboundTransfer::new(
        device.bulk_out_endpoint(),
        buffer,
        WriteCompletion {
            minor,
            events: events.clone(),
        },
    );

    if let Err(SubmitError { error, request }) = interface.submit_bulk_out(request) {
        error!("Failed submitting write request, error {}", error);
        request.discard();
        return Err(DriverError::Transport(error));
    }

    debug!("Submitted {} byte write on minor {}", count, minor);
    Ok(count)
}

/// Completion side of an outbound transfer
///
/// Carries only the minor and an event sender: a pending write never keeps
/// the device object alive.
#[derive(Debug)]
pub struct WriteCompletion {
    minor: Minor,
    events: EventSender,
}

impl WriteCompletion {
    /// Runs once, on the transport's thread, when the write finishes
    pub(crate) fn run(
        self,
        status: std::result::Result<usize, TransferError>,
        buffer: DmaBuffer,
    ) {
        if let Err(e) = &status
            && !e.is_expected_shutdown()
        {
            warn!(
                "Minor {} - nonzero write bulk status received: {} ({})",
                self.minor,
                e,
                e.errno()
            );
        }

        let requested = buffer.len();
        buffer.free();

        self.events.publish(DriverEvent::WriteCompleted {
            minor: self.minor,
            requested,
            status,
        });
    }
}
