//! Endpoint map building
//!
//! Walks configuration -> interface -> alternate setting -> endpoint and
//! records every classified endpoint per transfer category. The single
//! endpoint set per category used for claiming and I/O is derived afterwards
//! with [`EndpointMap::keep_last`].

use crate::usb::classify::classify;
use common::usb_types::ENDPOINT_DIR_MASK;
use common::{EndpointDirection, Error, Result, TransferCategory, UsbHost};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// One classified endpoint and where it lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRecord {
    /// Configuration descriptor index
    pub configuration: u8,
    pub interface_number: u8,
    pub alt_setting: u8,
    pub direction: EndpointDirection,
    /// Endpoint number without the direction bit
    pub address: u8,
    pub poll_interval: u8,
    pub max_packet_size: u16,
}

/// All classified endpoints of a device, per category, in traversal order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInventory {
    records: BTreeMap<TransferCategory, Vec<EndpointRecord>>,
}

impl EndpointInventory {
    pub fn push(&mut self, category: TransferCategory, record: EndpointRecord) {
        self.records.entry(category).or_default().push(record);
    }

    /// Records of one category in traversal order
    pub fn records(&self, category: TransferCategory) -> &[EndpointRecord] {
        self.records
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the endpoint inventory of a device
///
/// Any configuration descriptor that cannot be fetched aborts the build.
pub fn build_inventory<H: UsbHost>(
    host: &H,
    device: &H::Device,
    num_configurations: u8,
) -> Result<EndpointInventory> {
    let mut inventory = EndpointInventory::default();

    for index in 0..num_configurations {
        let config = host.config_layout(device, index).map_err(|source| {
            warn!(
                "Failed to get config descriptor {} for {}: {}",
                index,
                host.describe(device),
                source
            );
            Error::Descriptor { index, source }
        })?;

        for interface in &config.interfaces {
            for alt in &interface.alt_settings {
                for endpoint in &alt.endpoints {
                    let Some(class) = classify(endpoint) else {
                        trace!("Skipping endpoint {:#04x}", endpoint.address);
                        continue;
                    };

                    inventory.push(
                        class.category,
                        EndpointRecord {
                            configuration: index,
                            interface_number: interface.number,
                            alt_setting: alt.setting,
                            direction: class.direction,
                            address: class.address,
                            poll_interval: endpoint.interval,
                            max_packet_size: endpoint.max_packet_size,
                        },
                    );
                }
            }
        }
        // `config` is dropped here, before the next descriptor is fetched
    }

    debug!(
        "Classified {} endpoints on {}",
        inventory.len(),
        host.describe(device)
    );
    Ok(inventory)
}

/// Endpoint configuration for one transfer category
///
/// Addresses are endpoint numbers; 0 means the direction is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferEndpointSet {
    pub interface_number: u8,
    pub alt_setting: u8,
    pub in_address: u8,
    pub out_address: u8,
    pub poll_interval: u8,
    pub max_packet_size: u16,
}

impl TransferEndpointSet {
    /// No endpoint of this category was found
    pub fn is_empty(&self) -> bool {
        self.in_address == 0 && self.out_address == 0
    }

    /// Full IN endpoint address including the direction bit
    pub fn in_endpoint(&self) -> Option<u8> {
        (self.in_address != 0).then_some(ENDPOINT_DIR_MASK | self.in_address)
    }

    /// Full OUT endpoint address
    pub fn out_endpoint(&self) -> Option<u8> {
        (self.out_address != 0).then_some(self.out_address)
    }

    fn absorb(&mut self, record: &EndpointRecord) {
        self.interface_number = record.interface_number;
        self.alt_setting = record.alt_setting;
        self.poll_interval = record.poll_interval;
        self.max_packet_size = record.max_packet_size;

        match record.direction {
            EndpointDirection::In => self.in_address = record.address,
            EndpointDirection::Out => self.out_address = record.address,
        }
    }
}

/// One endpoint set per transfer category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointMap {
    pub bulk: TransferEndpointSet,
    pub isochronous: TransferEndpointSet,
    pub interrupt: TransferEndpointSet,
}

impl EndpointMap {
    /// Reduce an inventory to one set per category, keeping the last record
    ///
    /// Every record overwrites interface, alternate setting, interval and
    /// packet size; addresses are only overwritten for the record's own
    /// direction. A device exposing the same category on several interfaces
    /// therefore ends up with the last one in traversal order, and an IN
    /// address can survive from an earlier interface when the last record
    /// is an OUT endpoint.
    pub fn keep_last(inventory: &EndpointInventory) -> Self {
        let mut map = Self::default();

        for category in TransferCategory::ALL {
            let records = inventory.records(category);
            let inbound = records
                .iter()
                .filter(|r| r.direction == EndpointDirection::In)
                .count();
            if inbound > 1 || records.len() - inbound > 1 {
                debug!(
                    "{} {} endpoints found, keeping the last of each direction",
                    records.len(),
                    category
                );
            }

            let set = map.get_mut(category);
            for record in records {
                set.absorb(record);
            }
        }

        map
    }

    pub fn get(&self, category: TransferCategory) -> &TransferEndpointSet {
        match category {
            TransferCategory::Bulk => &self.bulk,
            TransferCategory::Isochronous => &self.isochronous,
            TransferCategory::Interrupt => &self.interrupt,
        }
    }

    fn get_mut(&mut self, category: TransferCategory) -> &mut TransferEndpointSet {
        match category {
            TransferCategory::Bulk => &mut self.bulk,
            TransferCategory::Isochronous => &mut self.isochronous,
            TransferCategory::Interrupt => &mut self.interrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        FakeDeviceSpec, FakeHost, HostCall, bulk_endpoint, configuration, endpoint,
        interrupt_endpoint, iso_endpoint,
    };

    fn inventory_for(spec: FakeDeviceSpec) -> (FakeHost, Result<EndpointInventory>) {
        let host = FakeHost::new().with_device(spec);
        let devices = host.devices().unwrap();
        let count = host.device_summary(&devices[0]).unwrap().num_configurations;
        let result = build_inventory(&host, &devices[0], count);
        (host, result)
    }

    #[test]
    fn test_single_bulk_pair() {
        let layout = configuration(
            1,
            vec![
                (0, vec![(0, vec![])]),
                (1, vec![(0, vec![])]),
                (
                    2,
                    vec![(0, vec![bulk_endpoint(0x81, 64), bulk_endpoint(0x02, 64)])],
                ),
            ],
        );
        let (_host, inventory) = inventory_for(FakeDeviceSpec::new(1, 2).with_configuration(layout));
        let map = EndpointMap::keep_last(&inventory.unwrap());

        assert_eq!(
            map.bulk,
            TransferEndpointSet {
                interface_number: 2,
                alt_setting: 0,
                in_address: 1,
                out_address: 2,
                poll_interval: 0,
                max_packet_size: 64,
            }
        );
        assert_eq!(map.isochronous, TransferEndpointSet::default());
        assert_eq!(map.interrupt, TransferEndpointSet::default());
        assert_eq!(map.bulk.in_endpoint(), Some(0x81));
        assert_eq!(map.bulk.out_endpoint(), Some(0x02));
    }

    #[test]
    fn test_control_endpoints_never_recorded() {
        let layout = configuration(
            1,
            vec![(0, vec![(0, vec![endpoint(0x80, 0, 64, 0), endpoint(0x00, 0, 64, 0)])])],
        );
        let (_host, inventory) = inventory_for(FakeDeviceSpec::new(1, 2).with_configuration(layout));
        let inventory = inventory.unwrap();

        assert!(inventory.is_empty());
        assert_eq!(EndpointMap::keep_last(&inventory), EndpointMap::default());
    }

    #[test]
    fn test_same_direction_keeps_last() {
        let layout = configuration(
            1,
            vec![
                (0, vec![(0, vec![bulk_endpoint(0x81, 64)])]),
                (3, vec![(1, vec![bulk_endpoint(0x84, 512)])]),
            ],
        );
        let (_host, inventory) = inventory_for(FakeDeviceSpec::new(1, 2).with_configuration(layout));
        let inventory = inventory.unwrap();

        assert_eq!(inventory.records(TransferCategory::Bulk).len(), 2);

        let map = EndpointMap::keep_last(&inventory);
        assert_eq!(map.bulk.interface_number, 3);
        assert_eq!(map.bulk.alt_setting, 1);
        assert_eq!(map.bulk.in_address, 4);
        assert_eq!(map.bulk.out_address, 0);
        assert_eq!(map.bulk.max_packet_size, 512);

        // Deterministic across rebuilds
        assert_eq!(map, EndpointMap::keep_last(&inventory));
    }

    #[test]
    fn test_in_address_survives_later_out_record() {
        let layout = configuration(
            1,
            vec![
                (0, vec![(0, vec![bulk_endpoint(0x81, 64)])]),
                (1, vec![(0, vec![bulk_endpoint(0x03, 32)])]),
            ],
        );
        let (_host, inventory) = inventory_for(FakeDeviceSpec::new(1, 2).with_configuration(layout));
        let map = EndpointMap::keep_last(&inventory.unwrap());

        assert_eq!(map.bulk.interface_number, 1);
        assert_eq!(map.bulk.in_address, 1);
        assert_eq!(map.bulk.out_address, 3);
        assert_eq!(map.bulk.max_packet_size, 32);
    }

    #[test]
    fn test_categories_across_configurations() {
        let first = configuration(
            1,
            vec![(0, vec![(0, vec![interrupt_endpoint(0x83, 8, 10)])])],
        );
        let second = configuration(
            2,
            vec![
                (0, vec![(0, vec![]), (1, vec![iso_endpoint(0x85, 1023, 1)])]),
                (1, vec![(0, vec![bulk_endpoint(0x06, 64)])]),
            ],
        );
        let (host, inventory) = inventory_for(
            FakeDeviceSpec::new(1, 2)
                .with_configuration(first)
                .with_configuration(second),
        );
        let inventory = inventory.unwrap();
        let map = EndpointMap::keep_last(&inventory);

        assert_eq!(map.interrupt.in_address, 3);
        assert_eq!(map.interrupt.poll_interval, 10);
        assert_eq!(map.isochronous.alt_setting, 1);
        assert_eq!(map.isochronous.in_address, 5);
        assert_eq!(map.isochronous.max_packet_size, 1023);
        assert_eq!(map.bulk.interface_number, 1);
        assert_eq!(map.bulk.out_address, 6);

        assert_eq!(inventory.records(TransferCategory::Bulk)[0].configuration, 1);
        assert_eq!(
            host.count(|c| matches!(c, HostCall::ConfigDescriptor { .. })),
            2
        );
    }

    #[test]
    fn test_failed_configuration_aborts_build() {
        let layout = configuration(1, vec![(0, vec![(0, vec![bulk_endpoint(0x81, 64)])])]);
        let (host, result) = inventory_for(
            FakeDeviceSpec::new(1, 2)
                .with_configuration(layout.clone())
                .with_failing_configuration(rusb::Error::Io)
                .with_configuration(layout),
        );

        assert!(matches!(
            result,
            Err(Error::Descriptor {
                index: 1,
                source: rusb::Error::Io
            })
        ));
        // Nothing past the failing configuration is fetched
        assert_eq!(
            host.count(|c| matches!(c, HostCall::ConfigDescriptor { .. })),
            2
        );
    }

    #[test]
    fn test_empty_set_helpers() {
        let set = TransferEndpointSet::default();
        assert!(set.is_empty());
        assert_eq!(set.in_endpoint(), None);
        assert_eq!(set.out_endpoint(), None);
    }
}
