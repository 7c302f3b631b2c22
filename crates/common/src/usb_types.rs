//! USB type abstractions and utilities
//!
//! Owned snapshots of the descriptors the probe consumes. The host-stack
//! implementation copies libusb's descriptor tree into these types and frees
//! libusb's copy immediately, so nothing here borrows from the host stack.

use std::fmt;

/// Mask for the transfer type bits of `bmAttributes`
pub const TRANSFER_TYPE_MASK: u8 = 0x03;
/// Direction bit of `bEndpointAddress` (set = device-to-host)
pub const ENDPOINT_DIR_MASK: u8 = 0x80;
/// Endpoint number bits of `bEndpointAddress`
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0F;

/// Size of a standard device descriptor
pub const DEVICE_DESCRIPTOR_LENGTH: u8 = 18;
/// `bDescriptorType` of a device descriptor
pub const DEVICE_DESCRIPTOR_TYPE: u8 = 0x01;

/// Transfer categories the probe tracks
///
/// Control endpoints and bulk streams have no variant: they are never
/// represented in an endpoint map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransferCategory {
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferCategory {
    pub const ALL: [TransferCategory; 3] = [
        TransferCategory::Isochronous,
        TransferCategory::Bulk,
        TransferCategory::Interrupt,
    ];

    /// Map a libusb transfer type value to a category
    ///
    /// 0 is control and 4 is bulk stream; both, and anything unknown, yield `None`.
    pub fn from_transfer_type(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(TransferCategory::Isochronous),
            2 => Some(TransferCategory::Bulk),
            3 => Some(TransferCategory::Interrupt),
            _ => None,
        }
    }

    /// The libusb transfer type value for this category
    pub fn transfer_type(self) -> u8 {
        match self {
            TransferCategory::Isochronous => 1,
            TransferCategory::Bulk => 2,
            TransferCategory::Interrupt => 3,
        }
    }
}

impl fmt::Display for TransferCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferCategory::Isochronous => "isochronous",
            TransferCategory::Bulk => "bulk",
            TransferCategory::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// Endpoint direction as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl EndpointDirection {
    pub fn from_address(address: u8) -> Self {
        if address & ENDPOINT_DIR_MASK != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }
}

impl fmt::Display for EndpointDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointDirection::In => f.write_str("IN"),
            EndpointDirection::Out => f.write_str("OUT"),
        }
    }
}

/// An endpoint descriptor as the device reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEndpoint {
    /// `bEndpointAddress`: direction bit plus endpoint number
    pub address: u8,
    /// `bmAttributes`
    pub attributes: u8,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSettingLayout {
    pub setting: u8,
    pub endpoints: Vec<RawEndpoint>,
}

/// One interface with all of its alternate settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub number: u8,
    pub alt_settings: Vec<AltSettingLayout>,
}

/// A configuration descriptor tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayout {
    pub number: u8,
    pub interfaces: Vec<InterfaceLayout>,
}

/// Cached device descriptor fields
///
/// Version fields are kept in their BCD wire form (`0x0200` for USB 2.0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub usb_version: u16,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: Option<u8>,
    pub product_index: Option<u8>,
    pub serial_number_index: Option<u8>,
    pub num_configurations: u8,
}

impl DeviceSummary {
    pub fn length(&self) -> u8 {
        DEVICE_DESCRIPTOR_LENGTH
    }

    pub fn descriptor_type(&self) -> u8 {
        DEVICE_DESCRIPTOR_TYPE
    }
}

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSpeed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl DeviceSpeed {
    /// Human-readable speed category
    pub fn describe(self) -> &'static str {
        match self {
            DeviceSpeed::Low => "Low speed 1.5 MBit/s",
            DeviceSpeed::Full => "Full speed 12 MBit/s",
            DeviceSpeed::High => "High speed 480 MBit/s",
            DeviceSpeed::Super => "Super speed 5000 MBit/s",
            DeviceSpeed::SuperPlus => "Super speed plus 10000 MBit/s",
            DeviceSpeed::Unknown => "Unknown speed reported.",
        }
    }
}
