//! Transport seam
//!
//! [`UsbInterface`] is the hardware handle the driver borrows from the
//! enumeration layer: it knows the device's endpoints and performs the actual
//! bulk transfers. The rusb backend implements it for real devices and
//! `test_utils::LoopbackInterface` implements it for tests.

use crate::error::TransferError;
use crate::usb::dma::{DmaBuffer, DmaPool};
use crate::usb::transfers::WriteCompletion;
use common::{BusLocation, EndpointDescriptor, UsbId};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Hardware handle of one claimed USB interface
///
/// Implementations must be usable from several threads at once: sessions
/// read while the transport's own thread completes writes.
pub trait UsbInterface: Send + Sync {
    /// Where the device sits on the host; used to find it again on detach
    fn location(&self) -> BusLocation;

    fn identity(&self) -> UsbId;

    /// Endpoint descriptors of the interface, in the order the device reports them
    fn endpoints(&self) -> Vec<EndpointDescriptor>;

    /// Blocking bulk IN transfer into `buffer`
    ///
    /// Returns the number of bytes the device actually sent, which may be
    /// less than `buffer.len()`.
    fn read_bulk(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferError>;

    /// Queue a bulk OUT transfer without waiting for it
    ///
    /// On success the transport owns the request and must call
    /// [`OutboundTransfer::complete`] once, from a thread of its own. On
    /// failure the request comes back untouched inside [`SubmitError`].
    fn submit_bulk_out(&self, request: OutboundTransfer) -> Result<(), SubmitError>;

    /// Pool that outbound transfer buffers are allocated from
    fn dma_pool(&self) -> &DmaPool;
}

/// Submission flags carried by a transfer request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFlags {
    /// The buffer already is DMA-capable; the transport must not map it again
    pub no_transfer_dma_map: bool,
}

/// A bulk OUT request: staged data plus what to do when it finishes
pub struct OutboundTransfer {
    endpoint: u8,
    buffer: DmaBuffer,
    flags: TransferFlags,
    completion: WriteCompletion,
}

impl OutboundTransfer {
    pub(crate) fn new(endpoint: u8, buffer: DmaBuffer, completion: WriteCompletion) -> Self {
        Self {
            endpoint,
            buffer,
            flags: TransferFlags {
                no_transfer_dma_map: true,
            },
            completion,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn flags(&self) -> TransferFlags {
        self.flags
    }

    /// Finish the request with the transport's status
    ///
    /// Consumes the request, so completion can only ever run once; the
    /// staged buffer is freed here.
    pub fn complete(self, status: Result<usize, TransferError>) {
        let Self {
            buffer, completion, ..
        } = self;
        completion.run(status, buffer);
    }

    /// Drop a request that never reached the transport
    pub(crate) fn discard(self) {
        debug!(
            "Discarding unsubmitted bulk OUT request ({} bytes) for endpoint {:#04x}",
            self.buffer.len(),
            self.endpoint
        );
    }
}

impl fmt::Debug for OutboundTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundTransfer")
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("len", &self.buffer.len())
            .field("flags", &self.flags)
            .field("completion", &self.completion)
            .finish()
    }
}

/// Submission refused by the transport; the request is handed back
#[derive(Debug)]
pub struct SubmitError {
    pub error: TransferError,
    pub request: OutboundTransfer,
}

impl SubmitError {
    pub fn new(error: TransferError, request: OutboundTransfer) -> Self {
        Self { error, request }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed submitting write: {}", self.error)
    }
}

impl std::error::Error for SubmitError {}
