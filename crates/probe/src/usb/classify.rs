//! Endpoint descriptor classification
//!
//! Decides which transfer category and direction an endpoint belongs to.
//! Control and bulk-stream endpoints are skipped.

use common::usb_types::{ENDPOINT_NUMBER_MASK, RawEndpoint, TRANSFER_TYPE_MASK};
use common::{EndpointDirection, TransferCategory};

/// Where an endpoint goes in the endpoint map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: TransferCategory,
    pub direction: EndpointDirection,
    /// Endpoint number (low 4 bits of the address)
    pub address: u8,
}

/// Classify an endpoint descriptor, or `None` if it should be skipped
pub fn classify(endpoint: &RawEndpoint) -> Option<Classification> {
    let category = TransferCategory::from_transfer_type(endpoint.attributes & TRANSFER_TYPE_MASK)?;

    Some(Classification {
        category,
        direction: EndpointDirection::from_address(endpoint.address),
        address: endpoint.address & ENDPOINT_NUMBER_MASK,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(address: u8, attributes: u8) -> RawEndpoint {
        RawEndpoint {
            address,
            attributes,
            max_packet_size: 64,
            interval: 0,
        }
    }

    #[test]
    fn test_category_from_low_bits() {
        for attributes in 0..=u8::MAX {
            let expected = match attributes & 0x03 {
                1 => Some(TransferCategory::Isochronous),
                2 => Some(TransferCategory::Bulk),
                3 => Some(TransferCategory::Interrupt),
                _ => None,
            };
            let got = classify(&raw(0x81, attributes)).map(|c| c.category);
            assert_eq!(got, expected, "attributes {:#04x}", attributes);
        }
    }

    #[test]
    fn test_control_endpoint_skipped() {
        assert!(classify(&raw(0x00, 0x00)).is_none());
        assert!(classify(&raw(0x80, 0x00)).is_none());
        // Sync/usage bits don't turn a control endpoint into something else
        assert!(classify(&raw(0x81, 0x3c)).is_none());
    }

    #[test]
    fn test_direction_and_address() {
        for address in 0..=u8::MAX {
            let class = classify(&raw(address, 0x02)).unwrap();
            let expected = if address & 0x80 != 0 {
                EndpointDirection::In
            } else {
                EndpointDirection::Out
            };
            assert_eq!(class.direction, expected);
            assert_eq!(class.address, address & 0x0f);
        }
    }

    #[test]
    fn test_reserved_address_bits_ignored() {
        // Bits 4..6 are reserved and never leak into the endpoint number
        let class = classify(&raw(0xf3, 0x03)).unwrap();
        assert_eq!(class.category, TransferCategory::Interrupt);
        assert_eq!(class.direction, EndpointDirection::In);
        assert_eq!(class.address, 3);
    }
}
