//! USB subsystem
//!
//! Device objects, the minor registry, the hotplug controller and the
//! session layer, plus the rusb backend and the thread that drives it.
//!
//! Everything above [`transport::UsbInterface`] is hardware-agnostic; only
//! [`rusb_backend`] and [`worker`] talk to libusb.

pub mod device;
pub mod dma;
pub mod hotplug;
pub mod registry;
pub mod rusb_backend;
pub mod session;
pub mod transfers;
pub mod transport;
pub mod worker;

pub use device::{EndpointSummary, UsbSkel};
pub use dma::{DmaBuffer, DmaPool, DmaStats};
pub use hotplug::{ControllerSettings, HotplugController};
pub use registry::{DeviceRegistry, Minor};
pub use rusb_backend::RusbInterface;
pub use session::Session;
pub use transport::{OutboundTransfer, SubmitError, TransferFlags, UsbInterface};
pub use worker::{PresentDevice, WorkerHandle, list_matching_devices, spawn_hotplug_worker};
