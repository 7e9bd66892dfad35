//! usbdev
//!
//! A hotplug-aware character-stream driver for USB devices with one bulk-in
//! and one bulk-out endpoint. Attached devices are published under a minor
//! number; callers open a [`Session`] on a minor, read synchronously from
//! bulk IN and write asynchronously to bulk OUT. A device object stays alive
//! until both the registry and every open session have let go of it, so
//! unplugging never pulls memory out from under an in-flight caller.

pub mod config;
pub mod error;
pub mod events;
pub mod uaccess;
pub mod usb;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{DriverConfig, IdTable};
pub use error::{DriverError, Result, TransferError};
pub use events::{DriverEvent, EventReceiver, EventSender, create_event_channel};
pub use uaccess::{IoBufferReader, IoBufferWriter};
pub use usb::{
    ControllerSettings, DeviceRegistry, DmaBuffer, DmaPool, DmaStats, EndpointSummary,
    HotplugController, Minor, OutboundTransfer, Session, SubmitError, TransferFlags,
    UsbInterface, UsbSkel,
};
