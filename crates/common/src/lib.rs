//! Common utilities for usbdev
//!
//! This crate provides the pieces shared by the driver core and its binary:
//! USB descriptor vocabulary, the common error type, and logging setup.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{BusLocation, Direction, EndpointDescriptor, TransferKind, UsbId};
