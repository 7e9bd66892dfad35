//! USB type abstractions and utilities
//!
//! Descriptor-level vocabulary shared by the driver core, its transport
//! backends and the test doubles. Nothing in here touches hardware.

use std::fmt;
use std::str::FromStr;

/// Endpoint address bit that marks the device-to-host direction
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Vendor/product identity of a USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbId {
    type Err = crate::Error;

    /// Parse `VID:PID` in hex, with or without a `0x` prefix on either half
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| crate::Error::InvalidUsbId {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (vid, pid) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("expected VID:PID"))?;

        let parse_half = |half: &str, name: &str| {
            let digits = half
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            if digits.is_empty() || digits.len() > 4 {
                return Err(invalid(&format!("{} must be 1-4 hex digits", name)));
            }
            u16::from_str_radix(digits, 16)
                .map_err(|_| invalid(&format!("{} is not valid hex", name)))
        };

        Ok(Self {
            vendor_id: parse_half(vid, "vendor id")?,
            product_id: parse_half(pid, "product id")?,
        })
    }
}

/// Physical position of a device on the host (bus number, device address)
///
/// Stable for as long as the device stays plugged in, which makes it the key
/// used to find a device again when it leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusLocation {
    pub bus: u8,
    pub address: u8,
}

impl BusLocation {
    pub const fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for BusLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {:03} device {:03}", self.bus, self.address)
    }
}

/// Transfer direction, as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint descriptor as advertised by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address, including the direction bit
    pub address: u8,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub const fn new(address: u8, kind: TransferKind, max_packet_size: u16) -> Self {
        Self {
            address,
            kind,
            max_packet_size,
        }
    }

    pub const fn bulk_in(number: u8, max_packet_size: u16) -> Self {
        Self::new(number | ENDPOINT_DIR_IN, TransferKind::Bulk, max_packet_size)
    }

    pub const fn bulk_out(number: u8, max_packet_size: u16) -> Self {
        Self::new(number & !ENDPOINT_DIR_IN, TransferKind::Bulk, max_packet_size)
    }

    pub fn direction(&self) -> Direction {
        if self.address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn is_bulk_in(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction() == Direction::In
    }

    pub fn is_bulk_out(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction() == Direction::Out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_id_parse_with_and_without_prefix() {
        let id: UsbId = "0x0781:0x5567".parse().unwrap();
        assert_eq!(id, UsbId::new(0x0781, 0x5567));

        let id: UsbId = "0781:5567".parse().unwrap();
        assert_eq!(id, UsbId::new(0x0781, 0x5567));

        let id: UsbId = " abcd:1 ".parse().unwrap();
        assert_eq!(id, UsbId::new(0xabcd, 0x0001));
    }

    #[test]
    fn test_usb_id_parse_rejects_garbage() {
        assert!("07815567".parse::<UsbId>().is_err());
        assert!("0781:".parse::<UsbId>().is_err());
        assert!("0x12345:0001".parse::<UsbId>().is_err());
        assert!("zzzz:0001".parse::<UsbId>().is_err());
    }

    #[test]
    fn test_usb_id_display() {
        assert_eq!(UsbId::new(0x0781, 0x5567).to_string(), "0781:5567");
    }

    #[test]
    fn test_endpoint_direction() {
        let ep_in = EndpointDescriptor::bulk_in(1, 512);
        assert_eq!(ep_in.address, 0x81);
        assert_eq!(ep_in.direction(), Direction::In);
        assert!(ep_in.is_bulk_in());
        assert!(!ep_in.is_bulk_out());

        let ep_out = EndpointDescriptor::bulk_out(2, 512);
        assert_eq!(ep_out.address, 0x02);
        assert_eq!(ep_out.number(), 2);
        assert!(ep_out.is_bulk_out());
    }

    #[test]
    fn test_interrupt_endpoint_is_not_bulk() {
        let ep = EndpointDescriptor::new(0x83, TransferKind::Interrupt, 8);
        assert_eq!(ep.direction(), Direction::In);
        assert!(!ep.is_bulk_in());
    }
}
