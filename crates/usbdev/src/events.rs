//! Driver event channel
//!
//! The driver reports attach, detach and write completion through a bounded
//! channel. Senders live on driver threads (hotplug, transport completion)
//! and never block: if nobody drains the channel, events are dropped.

use crate::error::TransferError;
use crate::usb::registry::Minor;
use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use common::{BusLocation, UsbId};
use std::time::{Duration, Instant};
use tracing::debug;

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the driver wants observers to know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A device passed probe and is published under `minor`
    Attached {
        minor: Minor,
        location: BusLocation,
        identity: UsbId,
        bulk_in: u8,
        bulk_in_size: usize,
        bulk_out: u8,
    },

    /// The device under `minor` was unpublished
    Detached { minor: Minor, location: BusLocation },

    /// An asynchronous write finished (successfully or not)
    WriteCompleted {
        minor: Minor,
        requested: usize,
        status: Result<usize, TransferError>,
    },
}

/// Sending half, cloned into every component that reports events
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<DriverEvent>,
}

impl EventSender {
    /// Publish an event without blocking the calling thread
    pub fn publish(&self, event: DriverEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// A sender whose events go nowhere
    pub fn discarding() -> Self {
        let (tx, _rx) = bounded(1);
        Self { tx }
    }
}

/// Receiving half, held by whoever observes the driver
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Receiver<DriverEvent>,
}

impl EventReceiver {
    /// Receive the next event (async)
    pub async fn recv(&self) -> Option<DriverEvent> {
        self.rx.recv().await.ok()
    }

    /// Receive the next event, blocking the current thread
    pub fn recv_blocking(&self) -> Option<DriverEvent> {
        self.rx.recv_blocking().ok()
    }

    /// Receive without blocking
    pub fn try_recv(&self) -> Option<DriverEvent> {
        self.rx.try_recv().ok()
    }

    /// Block for at most `timeout` waiting for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DriverEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<DriverEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create the event channel
///
/// Returns (EventSender for the driver, EventReceiver for observers)
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
    (EventSender { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(minor: u32) -> DriverEvent {
        DriverEvent::Detached {
            minor: Minor(minor),
            location: BusLocation::new(1, 2),
        }
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let (tx, rx) = create_event_channel();
        tx.publish(detached(192));
        assert_eq!(rx.recv().await, Some(detached(192)));
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (tx, rx) = create_event_channel();
        for minor in 0..(EVENT_CHANNEL_CAPACITY as u32 + 10) {
            tx.publish(detached(minor));
        }
        assert_eq!(rx.drain().len(), EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_discarding_sender_never_fails() {
        let tx = EventSender::discarding();
        tx.publish(detached(1));
        tx.publish(detached(2));
    }

    #[test]
    fn test_recv_timeout_expires() {
        let (_tx, rx) = create_event_channel();
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)), None);
    }
}
