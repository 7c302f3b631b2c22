//! Test utilities for the vendor USB probe
//!
//! Provides an in-memory host stack ([`FakeHost`]) that records every call the
//! probe makes, plus helpers for building descriptor trees.
//!
//! # Example
//!
//! ```
//! use common::host::UsbHost;
//! use common::test_utils::{FakeDeviceSpec, FakeHost, bulk_endpoint, configuration};
//!
//! let layout = configuration(1, vec![(0, vec![(0, vec![bulk_endpoint(0x81, 64)])])]);
//! let host = FakeHost::new().with_device(
//!     FakeDeviceSpec::new(0x03eb, 0x2423).with_configuration(layout),
//! );
//!
//! let devices = host.devices().unwrap();
//! assert_eq!(devices.len(), 1);
//! assert_eq!(host.device_summary(&devices[0]).unwrap().vendor_id, 0x03eb);
//! ```

use crate::host::{HostCapabilities, UsbHost, UsbSession};
use crate::usb_types::{
    AltSettingLayout, ConfigLayout, DeviceSpeed, DeviceSummary, InterfaceLayout, RawEndpoint,
};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// String descriptor index used for the manufacturer
pub const MANUFACTURER_INDEX: u8 = 1;
/// String descriptor index used for the product
pub const PRODUCT_INDEX: u8 = 2;
/// String descriptor index used for the serial number
pub const SERIAL_INDEX: u8 = 3;

/// A host-stack call observed by [`FakeHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    ConfigDescriptor { device: usize, index: u8 },
    Open { device: usize },
    Close { device: usize },
    ReadString { device: usize, index: u8 },
    AutoDetach { device: usize, enable: bool },
    Claim { device: usize, interface: u8 },
    Release { device: usize, interface: u8 },
    SetAltSetting { device: usize, interface: u8, setting: u8 },
    BulkRead { device: usize, endpoint: u8 },
}

type CallLog = Rc<RefCell<Vec<HostCall>>>;

/// Everything a fake device reports, plus the failures it should inject
#[derive(Debug, Clone)]
pub struct FakeDeviceSpec {
    pub summary: DeviceSummary,
    pub configurations: Vec<Result<ConfigLayout, rusb::Error>>,
    pub strings: HashMap<u8, String>,
    pub port: u8,
    pub speed: DeviceSpeed,
    pub descriptor_error: Option<rusb::Error>,
    pub open_error: Option<rusb::Error>,
    pub auto_detach_error: Option<rusb::Error>,
    pub claim_errors: HashMap<u8, rusb::Error>,
    pub alt_setting_errors: HashMap<u8, rusb::Error>,
    pub bulk_responses: Vec<Result<Vec<u8>, rusb::Error>>,
}

impl FakeDeviceSpec {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            summary: DeviceSummary {
                usb_version: 0x0200,
                class_code: 0xff,
                sub_class_code: 0x00,
                protocol_code: 0x00,
                max_packet_size0: 64,
                vendor_id,
                product_id,
                device_version: 0x0100,
                manufacturer_index: None,
                product_index: None,
                serial_number_index: None,
                num_configurations: 0,
            },
            configurations: Vec::new(),
            strings: HashMap::new(),
            port: 1,
            speed: DeviceSpeed::High,
            descriptor_error: None,
            open_error: None,
            auto_detach_error: None,
            claim_errors: HashMap::new(),
            alt_setting_errors: HashMap::new(),
            bulk_responses: Vec::new(),
        }
    }

    pub fn with_strings(mut self, manufacturer: &str, product: &str) -> Self {
        self.summary.manufacturer_index = Some(MANUFACTURER_INDEX);
        self.summary.product_index = Some(PRODUCT_INDEX);
        self.strings
            .insert(MANUFACTURER_INDEX, manufacturer.to_string());
        self.strings.insert(PRODUCT_INDEX, product.to_string());
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.summary.serial_number_index = Some(SERIAL_INDEX);
        self.strings.insert(SERIAL_INDEX, serial.to_string());
        self
    }

    pub fn with_configuration(mut self, layout: ConfigLayout) -> Self {
        self.configurations.push(Ok(layout));
        self.summary.num_configurations = self.configurations.len() as u8;
        self
    }

    /// Add a configuration whose descriptor fetch fails
    pub fn with_failing_configuration(mut self, error: rusb::Error) -> Self {
        self.configurations.push(Err(error));
        self.summary.num_configurations = self.configurations.len() as u8;
        self
    }

    pub fn with_port(mut self, port: u8) -> Self {
        self.port = port;
        self
    }

    pub fn with_speed(mut self, speed: DeviceSpeed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_descriptor_error(mut self, error: rusb::Error) -> Self {
        self.descriptor_error = Some(error);
        self
    }

    pub fn with_open_error(mut self, error: rusb::Error) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn with_auto_detach_error(mut self, error: rusb::Error) -> Self {
        self.auto_detach_error = Some(error);
        self
    }

    pub fn with_claim_error(mut self, interface: u8, error: rusb::Error) -> Self {
        self.claim_errors.insert(interface, error);
        self
    }

    pub fn with_alt_setting_error(mut self, interface: u8, error: rusb::Error) -> Self {
        self.alt_setting_errors.insert(interface, error);
        self
    }

    /// Queue the result of the next bulk read
    ///
    /// Reads past the end of the queue time out.
    pub fn with_bulk_response(mut self, response: Result<Vec<u8>, rusb::Error>) -> Self {
        self.bulk_responses.push(response);
        self
    }
}

#[derive(Debug)]
struct FakeDeviceState {
    index: usize,
    spec: FakeDeviceSpec,
    bulk_queue: RefCell<VecDeque<Result<Vec<u8>, rusb::Error>>>,
}

/// Reference to a device owned by [`FakeHost`]
#[derive(Debug, Clone)]
pub struct FakeDevice {
    state: Rc<FakeDeviceState>,
}

impl FakeDevice {
    /// Position of the device in the enumeration list
    pub fn index(&self) -> usize {
        self.state.index
    }
}

/// In-memory host stack
pub struct FakeHost {
    devices: Vec<Rc<FakeDeviceState>>,
    enumeration_error: Option<rusb::Error>,
    capabilities: HostCapabilities,
    calls: CallLog,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            enumeration_error: None,
            capabilities: HostCapabilities {
                has_capability_api: true,
                kernel_driver_detach: true,
            },
            calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn with_device(mut self, spec: FakeDeviceSpec) -> Self {
        let index = self.devices.len();
        let bulk_queue = RefCell::new(spec.bulk_responses.iter().cloned().collect());
        self.devices.push(Rc::new(FakeDeviceState {
            index,
            spec,
            bulk_queue,
        }));
        self
    }

    pub fn with_enumeration_error(mut self, error: rusb::Error) -> Self {
        self.enumeration_error = Some(error);
        self
    }

    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Every call recorded so far, in order
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.borrow().clone()
    }

    /// Number of recorded calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&HostCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|call| predicate(call)).count()
    }

    pub fn opens(&self, device: usize) -> usize {
        self.count(|call| *call == HostCall::Open { device })
    }

    pub fn closes(&self, device: usize) -> usize {
        self.count(|call| *call == HostCall::Close { device })
    }

    /// References to `device` held outside the host itself
    ///
    /// Counts enumerated device handles and open sessions.
    pub fn live_references(&self, device: usize) -> usize {
        Rc::strong_count(&self.devices[device]) - 1
    }

    fn record(&self, call: HostCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl UsbHost for FakeHost {
    type Device = FakeDevice;
    type Session = FakeSession;

    fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    fn devices(&self) -> Result<Vec<Self::Device>, rusb::Error> {
        if let Some(error) = self.enumeration_error {
            return Err(error);
        }

        Ok(self
            .devices
            .iter()
            .map(|state| FakeDevice {
                state: Rc::clone(state),
            })
            .collect())
    }

    fn device_summary(&self, device: &Self::Device) -> Result<DeviceSummary, rusb::Error> {
        match device.state.spec.descriptor_error {
            Some(error) => Err(error),
            None => Ok(device.state.spec.summary.clone()),
        }
    }

    fn config_layout(&self, device: &Self::Device, index: u8) -> Result<ConfigLayout, rusb::Error> {
        self.record(HostCall::ConfigDescriptor {
            device: device.index(),
            index,
        });

        device
            .state
            .spec
            .configurations
            .get(index as usize)
            .cloned()
            .unwrap_or(Err(rusb::Error::NotFound))
    }

    fn port_number(&self, device: &Self::Device) -> u8 {
        device.state.spec.port
    }

    fn speed(&self, device: &Self::Device) -> DeviceSpeed {
        device.state.spec.speed
    }

    fn open(&self, device: &Self::Device) -> Result<Self::Session, rusb::Error> {
        if let Some(error) = device.state.spec.open_error {
            return Err(error);
        }

        self.record(HostCall::Open {
            device: device.index(),
        });

        Ok(FakeSession {
            state: Rc::clone(&device.state),
            calls: Rc::clone(&self.calls),
        })
    }

    fn describe(&self, device: &Self::Device) -> String {
        format!("fake device {}", device.index())
    }
}

/// Open session on a fake device; records a close when dropped
pub struct FakeSession {
    state: Rc<FakeDeviceState>,
    calls: CallLog,
}

impl FakeSession {
    fn record(&self, call: HostCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl UsbSession for FakeSession {
    fn read_string_ascii(&self, index: u8) -> Result<String, rusb::Error> {
        self.record(HostCall::ReadString {
            device: self.state.index,
            index,
        });

        self.state
            .spec
            .strings
            .get(&index)
            .cloned()
            .ok_or(rusb::Error::InvalidParam)
    }

    fn set_auto_detach_kernel_driver(&mut self, enable: bool) -> Result<(), rusb::Error> {
        self.record(HostCall::AutoDetach {
            device: self.state.index,
            enable,
        });

        match self.state.spec.auto_detach_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.record(HostCall::Claim {
            device: self.state.index,
            interface,
        });

        match self.state.spec.claim_errors.get(&interface) {
            Some(error) => Err(*error),
            None => Ok(()),
        }
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.record(HostCall::Release {
            device: self.state.index,
            interface,
        });
        Ok(())
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), rusb::Error> {
        self.record(HostCall::SetAltSetting {
            device: self.state.index,
            interface,
            setting,
        });

        match self.state.spec.alt_setting_errors.get(&interface) {
            Some(error) => Err(*error),
            None => Ok(()),
        }
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.record(HostCall::BulkRead {
            device: self.state.index,
            endpoint,
        });

        match self.state.bulk_queue.borrow_mut().pop_front() {
            Some(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(Err(error)) => Err(error),
            None => Err(rusb::Error::Timeout),
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.record(HostCall::Close {
            device: self.state.index,
        });
    }
}

/// Build an endpoint descriptor from its address and libusb transfer type
pub fn endpoint(address: u8, transfer_type: u8, max_packet_size: u16, interval: u8) -> RawEndpoint {
    RawEndpoint {
        address,
        attributes: transfer_type & crate::usb_types::TRANSFER_TYPE_MASK,
        max_packet_size,
        interval,
    }
}

pub fn bulk_endpoint(address: u8, max_packet_size: u16) -> RawEndpoint {
    endpoint(address, 2, max_packet_size, 0)
}

pub fn interrupt_endpoint(address: u8, max_packet_size: u16, interval: u8) -> RawEndpoint {
    endpoint(address, 3, max_packet_size, interval)
}

pub fn iso_endpoint(address: u8, max_packet_size: u16, interval: u8) -> RawEndpoint {
    endpoint(address, 1, max_packet_size, interval)
}

/// Build a configuration from `(interface, [(alt setting, endpoints)])` tuples
pub fn configuration(number: u8, interfaces: Vec<(u8, Vec<(u8, Vec<RawEndpoint>)>)>) -> ConfigLayout {
    ConfigLayout {
        number,
        interfaces: interfaces
            .into_iter()
            .map(|(number, alt_settings)| InterfaceLayout {
                number,
                alt_settings: alt_settings
                    .into_iter()
                    .map(|(setting, endpoints)| AltSettingLayout { setting, endpoints })
                    .collect(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_drop_records_close() {
        let host = FakeHost::new().with_device(FakeDeviceSpec::new(1, 2));
        let devices = host.devices().unwrap();

        let session = host.open(&devices[0]).unwrap();
        assert_eq!(host.opens(0), 1);
        assert_eq!(host.closes(0), 0);

        drop(session);
        assert_eq!(host.closes(0), 1);
    }

    #[test]
    fn test_live_references_follow_drops() {
        let host = FakeHost::new()
            .with_device(FakeDeviceSpec::new(1, 2))
            .with_device(FakeDeviceSpec::new(3, 4));

        let devices = host.devices().unwrap();
        assert_eq!(host.live_references(0), 1);
        assert_eq!(host.live_references(1), 1);

        drop(devices);
        assert_eq!(host.live_references(0), 0);
        assert_eq!(host.live_references(1), 0);
    }

    #[test]
    fn test_bulk_queue_then_timeout() {
        let host = FakeHost::new()
            .with_device(FakeDeviceSpec::new(1, 2).with_bulk_response(Ok(b"pong".to_vec())));
        let devices = host.devices().unwrap();
        let session = host.open(&devices[0]).unwrap();

        let mut buf = [0u8; 8];
        let n = session
            .read_bulk(0x81, &mut buf, Duration::from_millis(10))
            .unwrap();
        assert_eq!(&buf[..n], b"pong");

        let err = session
            .read_bulk(0x81, &mut buf, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, rusb::Error::Timeout);
    }

    #[test]
    fn test_missing_configuration_is_not_found() {
        let host = FakeHost::new().with_device(FakeDeviceSpec::new(1, 2));
        let devices = host.devices().unwrap();

        let err = host.config_layout(&devices[0], 0).unwrap_err();
        assert_eq!(err, rusb::Error::NotFound);
    }
}
