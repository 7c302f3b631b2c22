//! Host USB stack boundary
//!
//! [`UsbHost`] and [`UsbSession`] are the only primitives the probe consumes
//! from the host stack: enumeration, descriptor fetches, open/close, interface
//! claims and synchronous bulk reads. [`RusbHost`] implements them on top of
//! libusb through `rusb`; tests use the in-memory host in `test_utils`.
//!
//! Closing a session is `Drop`. Every call blocks until the host stack
//! completes it or its own timeout expires.

use crate::usb_types::{
    AltSettingLayout, ConfigLayout, DeviceSpeed, DeviceSummary, InterfaceLayout, RawEndpoint,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::debug;

/// Optional features reported by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    /// The capability query API itself is available
    pub has_capability_api: bool,
    /// Kernel drivers can be detached from interfaces
    pub kernel_driver_detach: bool,
}

/// An open session on one device
pub trait UsbSession {
    /// Read an ASCII string descriptor
    fn read_string_ascii(&self, index: u8) -> Result<String, rusb::Error>;

    /// Let claims detach (and releases reattach) kernel drivers automatically
    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> Result<(), rusb::Error>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error>;

    fn release_interface(&mut self, interface: u8) -> Result<(), rusb::Error>;

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), rusb::Error>;

    /// Synchronous bulk transfer; `endpoint` carries the direction bit
    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;
}

/// The host stack session context
///
/// One instance is created at startup and must outlive every device, session
/// and descriptor obtained through it.
pub trait UsbHost {
    /// A reference to one enumerated device
    type Device;
    /// An open session on a device
    type Session: UsbSession;

    fn capabilities(&self) -> HostCapabilities;

    /// Enumerate every device attached to the host
    fn devices(&self) -> Result<Vec<Self::Device>, rusb::Error>;

    fn device_summary(&self, device: &Self::Device) -> Result<DeviceSummary, rusb::Error>;

    /// Fetch the configuration descriptor at `index` (not the configuration value)
    fn config_layout(&self, device: &Self::Device, index: u8) -> Result<ConfigLayout, rusb::Error>;

    fn port_number(&self, device: &Self::Device) -> u8;

    fn speed(&self, device: &Self::Device) -> DeviceSpeed;

    fn open(&self, device: &Self::Device) -> Result<Self::Session, rusb::Error>;

    /// Short label for log lines
    fn describe(&self, device: &Self::Device) -> String;
}

/// libusb-backed host stack
pub struct RusbHost {
    context: Context,
}

impl RusbHost {
    /// Initialise the libusb context
    pub fn new() -> Result<Self, rusb::Error> {
        let mut context = Context::new()?;
        context.set_log_level(rusb::LogLevel::Warning);
        debug!("libusb context initialised");
        Ok(Self { context })
    }

    /// Get USB context
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbHost for RusbHost {
    type Device = Device<Context>;
    type Session = RusbSession;

    fn capabilities(&self) -> HostCapabilities {
        let has_capability_api = rusb::has_capability();
        HostCapabilities {
            has_capability_api,
            kernel_driver_detach: has_capability_api && rusb::supports_detach_kernel_driver(),
        }
    }

    fn devices(&self) -> Result<Vec<Self::Device>, rusb::Error> {
        Ok(self.context.devices()?.iter().collect())
    }

    fn device_summary(&self, device: &Self::Device) -> Result<DeviceSummary, rusb::Error> {
        let desc = device.device_descriptor()?;

        Ok(DeviceSummary {
            usb_version: version_to_bcd(desc.usb_version()),
            class_code: desc.class_code(),
            sub_class_code: desc.sub_class_code(),
            protocol_code: desc.protocol_code(),
            max_packet_size0: desc.max_packet_size(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device_version: version_to_bcd(desc.device_version()),
            manufacturer_index: desc.manufacturer_string_index(),
            product_index: desc.product_string_index(),
            serial_number_index: desc.serial_number_string_index(),
            num_configurations: desc.num_configurations(),
        })
    }

    fn config_layout(&self, device: &Self::Device, index: u8) -> Result<ConfigLayout, rusb::Error> {
        // The libusb descriptor is freed when `config` goes out of scope
        let config = device.config_descriptor(index)?;

        let interfaces = config
            .interfaces()
            .map(|interface| InterfaceLayout {
                number: interface.number(),
                alt_settings: interface
                    .descriptors()
                    .map(|alt| AltSettingLayout {
                        setting: alt.setting_number(),
                        endpoints: alt
                            .endpoint_descriptors()
                            .map(|ep| RawEndpoint {
                                address: ep.address(),
                                attributes: transfer_type_bits(ep.transfer_type()),
                                max_packet_size: ep.max_packet_size(),
                                interval: ep.interval(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Ok(ConfigLayout {
            number: config.number(),
            interfaces,
        })
    }

    fn port_number(&self, device: &Self::Device) -> u8 {
        device.port_number()
    }

    fn speed(&self, device: &Self::Device) -> DeviceSpeed {
        map_device_speed(device.speed())
    }

    fn open(&self, device: &Self::Device) -> Result<Self::Session, rusb::Error> {
        let handle = device.open()?;
        Ok(RusbSession { handle })
    }

    fn describe(&self, device: &Self::Device) -> String {
        format!("bus {:03} address {:03}", device.bus_number(), device.address())
    }
}

/// Open libusb device handle; closed on drop
pub struct RusbSession {
    handle: DeviceHandle<Context>,
}

impl UsbSession for RusbSession {
    fn read_string_ascii(&self, index: u8) -> Result<String, rusb::Error> {
        self.handle.read_string_descriptor_ascii(index)
    }

    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> Result<(), rusb::Error> {
        self.handle.set_auto_detach_kernel_driver(enable)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.handle.claim_interface(interface)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.handle.release_interface(interface)
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), rusb::Error> {
        self.handle.set_alternate_setting(interface, setting)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }
}

/// Rebuild the transfer type bits of `bmAttributes`
///
/// rusb only exposes the decoded transfer type; synchronisation and usage
/// bits are irrelevant to classification and are left clear.
fn transfer_type_bits(transfer_type: rusb::TransferType) -> u8 {
    match transfer_type {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
        #[allow(unreachable_patterns)]
        _ => 0,
    }
}

/// Encode a rusb version back into its BCD descriptor form
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16 & 0x0F) << 4)
        | (version.sub_minor() as u16 & 0x0F)
}

/// Map rusb device speed to DeviceSpeed
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::Full), DeviceSpeed::Full);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), DeviceSpeed::Super);
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version::from_bcd(0x0200)), 0x0200);
        assert_eq!(version_to_bcd(rusb::Version::from_bcd(0x0110)), 0x0110);
        assert_eq!(version_to_bcd(rusb::Version::from_bcd(0x1234)), 0x1234);
    }

    #[test]
    fn test_transfer_type_bits() {
        assert_eq!(transfer_type_bits(rusb::TransferType::Control), 0);
        assert_eq!(transfer_type_bits(rusb::TransferType::Bulk), 2);
        assert_eq!(transfer_type_bits(rusb::TransferType::Interrupt), 3);
    }
}
