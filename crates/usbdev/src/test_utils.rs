//! Test utilities for usbdev
//!
//! [`LoopbackInterface`] stands in for real hardware: whatever is written to
//! its bulk OUT endpoint comes back on bulk IN. Completions run on a thread
//! the loopback owns, the same way a real transport would deliver them.
//!
//! # Example
//!
//! ```
//! use usbdev::test_utils::LoopbackInterface;
//! use usbdev::{ControllerSettings, EventSender, HotplugController};
//!
//! let ctl = HotplugController::new(ControllerSettings::default(), EventSender::discarding());
//! let iface = LoopbackInterface::builder().bulk_pair(64).build();
//! let minor = ctl.on_attach(iface.clone()).unwrap();
//!
//! let session = ctl.open(minor).unwrap();
//! assert_eq!(session.write_bytes(b"ping").unwrap(), 4);
//! assert!(iface.flush(std::time::Duration::from_secs(5)));
//! assert_eq!(session.read_to_vec(64).unwrap(), b"ping");
//! ```

use crate::error::{DriverError, Result, TransferError};
use crate::uaccess::{IoBufferReader, IoBufferWriter};
use crate::usb::dma::{DmaPool, DmaStats};
use crate::usb::transport::{OutboundTransfer, SubmitError, TransferFlags, UsbInterface};
use common::{BusLocation, EndpointDescriptor, UsbId};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct LoopbackState {
    inbound: VecDeque<u8>,
    unplugged: bool,
    fail_next_submit: Option<TransferError>,
    deferred: Vec<OutboundTransfer>,
    last_read_request: Option<usize>,
    last_submit_flags: Option<TransferFlags>,
    submitted: usize,
    completed: usize,
}

struct Shared {
    state: Mutex<LoopbackState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle one request: loop its data back, complete it, count it
    fn finish(&self, request: OutboundTransfer) {
        let status = {
            let mut state = self.lock();
            if state.unplugged {
                Err(TransferError::Shutdown)
            } else {
                state.inbound.extend(request.data());
                Ok(request.len())
            }
        };
        self.changed.notify_all();

        request.complete(status);

        self.lock().completed += 1;
        self.changed.notify_all();
    }
}

/// Builder for [`LoopbackInterface`]
#[derive(Debug, Clone)]
pub struct LoopbackBuilder {
    location: BusLocation,
    identity: UsbId,
    endpoints: Vec<EndpointDescriptor>,
    defer_completions: bool,
    dma_limit: Option<usize>,
}

impl LoopbackBuilder {
    pub fn location(mut self, location: BusLocation) -> Self {
        self.location = location;
        self
    }

    pub fn identity(mut self, identity: UsbId) -> Self {
        self.identity = identity;
        self
    }

    /// Append one endpoint descriptor, in reporting order
    pub fn endpoint(mut self, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Bulk-in 0x81 with the given packet size, plus bulk-out 0x02
    pub fn bulk_pair(self, max_packet_size: u16) -> Self {
        self.endpoint(EndpointDescriptor::bulk_in(1, max_packet_size))
            .endpoint(EndpointDescriptor::bulk_out(2, max_packet_size))
    }

    /// Hold accepted writes until [`LoopbackInterface::complete_pending`]
    pub fn defer_completions(mut self) -> Self {
        self.defer_completions = true;
        self
    }

    pub fn dma_limit(mut self, bytes: usize) -> Self {
        self.dma_limit = Some(bytes);
        self
    }

    pub fn build(self) -> Arc<LoopbackInterface> {
        let shared = Arc::new(Shared {
            state: Mutex::new(LoopbackState::default()),
            changed: Condvar::new(),
        });

        let completion_tx = if self.defer_completions {
            None
        } else {
            let (tx, rx) = async_channel::unbounded::<OutboundTransfer>();
            let worker = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("loopback-tx".to_string())
                .spawn(move || {
                    while let Ok(request) = rx.recv_blocking() {
                        worker.finish(request);
                    }
                })
                .expect("Failed to spawn loopback completion thread");
            Some(tx)
        };

        let dma = match self.dma_limit {
            Some(limit) => DmaPool::with_limit(limit),
            None => DmaPool::new(),
        };

        Arc::new(LoopbackInterface {
            location: self.location,
            identity: self.identity,
            endpoints: self.endpoints,
            dma,
            shared,
            completion_tx,
        })
    }
}

/// Loopback transport double
pub struct LoopbackInterface {
    location: BusLocation,
    identity: UsbId,
    endpoints: Vec<EndpointDescriptor>,
    dma: DmaPool,
    shared: Arc<Shared>,
    completion_tx: Option<async_channel::Sender<OutboundTransfer>>,
}

impl LoopbackInterface {
    pub fn builder() -> LoopbackBuilder {
        LoopbackBuilder {
            location: BusLocation::new(1, 4),
            identity: crate::config::DEFAULT_DEVICE,
            endpoints: Vec::new(),
            defer_completions: false,
            dma_limit: None,
        }
    }

    /// Make bytes available to the next bulk IN transfers
    pub fn queue_inbound(&self, data: &[u8]) {
        self.shared.lock().inbound.extend(data);
        self.shared.changed.notify_all();
    }

    /// Simulate the cable being pulled
    ///
    /// Reads and new submissions fail with `NoDevice`; writes that were
    /// already accepted complete with `Shutdown`.
    pub fn unplug(&self) {
        self.shared.lock().unplugged = true;
        self.shared.changed.notify_all();
    }

    pub fn fail_next_submit(&self, error: TransferError) {
        self.shared.lock().fail_next_submit = Some(error);
    }

    /// Complete every deferred write, on a separate thread, and wait for it
    pub fn complete_pending(&self) {
        let pending = std::mem::take(&mut self.shared.lock().deferred);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || {
            for request in pending {
                shared.finish(request);
            }
        });
        handle
            .join()
            .expect("Loopback completion thread panicked");
    }

    /// Wait until every accepted write has completed
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.completed < state.submitted {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn dma_stats(&self) -> DmaStats {
        self.dma.stats()
    }

    /// Writes accepted so far
    pub fn submitted(&self) -> usize {
        self.shared.lock().submitted
    }

    /// Writes completed so far
    pub fn completed(&self) -> usize {
        self.shared.lock().completed
    }

    /// Writes held back by `defer_completions`
    pub fn deferred(&self) -> usize {
        self.shared.lock().deferred.len()
    }

    /// Length of the most recent bulk IN request
    pub fn last_read_request(&self) -> Option<usize> {
        self.shared.lock().last_read_request
    }

    pub fn last_submit_flags(&self) -> Option<TransferFlags> {
        self.shared.lock().last_submit_flags
    }

    /// Bytes waiting to be read back
    pub fn inbound_len(&self) -> usize {
        self.shared.lock().inbound.len()
    }
}

impl UsbInterface for LoopbackInterface {
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
        _endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransferError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        state.last_read_request = Some(buffer.len());

        loop {
            if state.unplugged {
                return Err(TransferError::NoDevice);
            }
            if !state.inbound.is_empty() {
                let count = buffer.len().min(state.inbound.len());
                for (slot, byte) in buffer.iter_mut().zip(state.inbound.drain(..count)) {
                    *slot = byte;
                }
                return Ok(count);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransferError::Timeout);
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn submit_bulk_out(&self, request: OutboundTransfer) -> std::result::Result<(), SubmitError> {
        {
            let mut state = self.shared.lock();
            if let Some(error) = state.fail_next_submit.take() {
                return Err(SubmitError::new(error, request));
            }
            if state.unplugged {
                return Err(SubmitError::new(TransferError::NoDevice, request));
            }
            state.submitted += 1;
            state.last_submit_flags = Some(request.flags());

            if self.completion_tx.is_none() {
                state.deferred.push(request);
                return Ok(());
            }
        }

        let Some(tx) = &self.completion_tx else {
            return Ok(());
        };
        tx.try_send(request).map_err(|e| {
            self.shared.lock().submitted -= 1;
            SubmitError::new(TransferError::Shutdown, e.into_inner())
        })
    }

    fn dma_pool(&self) -> &DmaPool {
        &self.dma
    }
}

/// Caller buffer whose every copy faults
#[derive(Debug, Clone, Copy)]
pub struct FaultyBuffer {
    len: usize,
}

impl FaultyBuffer {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl IoBufferReader for FaultyBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn read_slice(&mut self, _dst: &mut [u8]) -> Result<()> {
        Err(DriverError::Fault)
    }
}

impl IoBufferWriter for FaultyBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn write_slice(&mut self, _src: &[u8]) -> Result<()> {
        Err(DriverError::Fault)
    }
}
