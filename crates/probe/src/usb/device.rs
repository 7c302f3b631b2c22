//! Vendor device lifecycle
//!
//! [`VendorDevice`] owns the open session, the cached descriptors and the
//! endpoint map of the one device the probe talks to.
//!
//! Lifecycle: `open_and_build` (Ready) -> `claim` (Claimed) -> `release`
//! (Released). There is no way back from Released. Construction either
//! returns a fully built handle or closes everything it opened.

use crate::usb::endpoints::{EndpointInventory, EndpointMap, build_inventory};
use crate::usb::matcher::read_bounded_string;
use crate::usb::transfers::TransferOutcome;
use common::{
    DeviceSpeed, DeviceSummary, EndpointDirection, Error, Result, TransferCategory, UsbHost,
    UsbSession,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interfaces are claimed in this order
const CLAIM_ORDER: [TransferCategory; 3] = [
    TransferCategory::Bulk,
    TransferCategory::Isochronous,
    TransferCategory::Interrupt,
];

/// Alternate settings are selected in this order, after all claims
const ALT_SETTING_ORDER: [TransferCategory; 3] = [
    TransferCategory::Interrupt,
    TransferCategory::Isochronous,
    TransferCategory::Bulk,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Open with a built endpoint map, nothing claimed yet
    Ready,
    Claimed,
    Released,
}

/// How interfaces are claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClaimPolicy {
    /// Enable automatic kernel driver detach before claiming
    pub auto_detach_kernel_driver: bool,
    /// Also claim the interface of categories with no endpoints
    pub claim_unused_categories: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAction {
    Claim,
    SelectAltSetting(u8),
}

/// Outcome of one host-stack call made while claiming
#[derive(Debug, Clone)]
pub struct ClaimStep {
    pub category: TransferCategory,
    pub interface: u8,
    pub action: ClaimAction,
    pub result: std::result::Result<(), rusb::Error>,
}

/// Every call made by one `claim` attempt and how it went
#[derive(Debug, Clone, Default)]
pub struct ClaimReport {
    /// Result of enabling auto-detach, if it was requested
    pub auto_detach: Option<std::result::Result<(), rusb::Error>>,
    pub steps: Vec<ClaimStep>,
}

impl ClaimReport {
    pub fn failures(&self) -> impl Iterator<Item = &ClaimStep> {
        self.steps.iter().filter(|step| step.result.is_err())
    }

    /// All claims and alternate setting selections succeeded
    ///
    /// A failed auto-detach request does not count; the claims that follow
    /// show whether it mattered.
    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Whether the handle can be used for I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Unclaimed,
    Ready,
    /// Some claim or alternate setting call failed
    Degraded { failed_steps: usize },
    /// Claim ran but no interface is held
    NothingClaimed,
    Released,
}

/// Strings read for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// The matched vendor device
pub struct VendorDevice<H: UsbHost> {
    /// Underlying device reference
    device: H::Device,
    /// Open session; `None` once released
    session: Option<H::Session>,
    /// Cached device descriptor
    summary: DeviceSummary,
    port: u8,
    speed: DeviceSpeed,
    inventory: EndpointInventory,
    endpoints: EndpointMap,
    /// Interfaces claimed successfully, in claim order, without duplicates
    claimed_interfaces: Vec<u8>,
    claim_report: Option<ClaimReport>,
    state: LifecycleState,
    label: String,
}

impl<H: UsbHost> VendorDevice<H> {
    /// Open the device and build its endpoint map
    ///
    /// On failure the session, if it was opened, is closed before returning.
    pub fn open_and_build(host: &H, device: H::Device) -> Result<Self> {
        let label = host.describe(&device);

        let session = host.open(&device).map_err(|e| {
            warn!("Failed to open {}: {}", label, e);
            Error::Open(e)
        })?;
        debug!("Opened {}", label);

        let summary = host.device_summary(&device)?;
        let port = host.port_number(&device);
        let speed = host.speed(&device);

        let inventory = build_inventory(host, &device, summary.num_configurations)?;
        let endpoints = EndpointMap::keep_last(&inventory);

        info!(
            "Built endpoint map for {} ({:04x}:{:04x}, port {})",
            label, summary.vendor_id, summary.product_id, port
        );

        Ok(Self {
            device,
            session: Some(session),
            summary,
            port,
            speed,
            inventory,
            endpoints,
            claimed_interfaces: Vec::new(),
            claim_report: None,
            state: LifecycleState::Ready,
            label,
        })
    }

    /// Claim the interfaces recorded in the endpoint map
    ///
    /// Individual failures don't abort the attempt; they are collected in the
    /// returned report and reflected by [`readiness`](Self::readiness).
    pub fn claim(&mut self, policy: &ClaimPolicy) -> Result<&ClaimReport> {
        let session = self.session.as_mut().ok_or(Error::Released)?;
        let mut report = ClaimReport::default();

        if policy.auto_detach_kernel_driver {
            let result = session.set_auto_detach_kernel_driver(true);
            if let Err(e) = &result {
                warn!("Failed to enable kernel driver auto-detach on {}: {}", self.label, e);
            }
            report.auto_detach = Some(result);
        }

        let wanted = |category: TransferCategory| {
            policy.claim_unused_categories || !self.endpoints.get(category).is_empty()
        };

        for category in CLAIM_ORDER.into_iter().filter(|c| wanted(*c)) {
            let interface = self.endpoints.get(category).interface_number;
            let result = session.claim_interface(interface);

            match &result {
                Ok(()) => {
                    debug!("Claimed interface {} ({}) on {}", interface, category, self.label);
                    if !self.claimed_interfaces.contains(&interface) {
                        self.claimed_interfaces.push(interface);
                    }
                }
                Err(e) => warn!("Failed to claim interface {} ({}): {}", interface, category, e),
            }

            report.steps.push(ClaimStep {
                category,
                interface,
                action: ClaimAction::Claim,
                result,
            });
        }

        for category in ALT_SETTING_ORDER.into_iter().filter(|c| wanted(*c)) {
            let set = self.endpoints.get(category);
            let result = session.set_alternate_setting(set.interface_number, set.alt_setting);

            if let Err(e) = &result {
                warn!(
                    "Failed to select alt setting {} on interface {} ({}): {}",
                    set.alt_setting, set.interface_number, category, e
                );
            }

            report.steps.push(ClaimStep {
                category,
                interface: set.interface_number,
                action: ClaimAction::SelectAltSetting(set.alt_setting),
                result,
            });
        }

        self.state = LifecycleState::Claimed;
        Ok(&*self.claim_report.insert(report))
    }

    /// Release claimed interfaces and close the session
    ///
    /// Calling this on a released handle does nothing.
    pub fn release(&mut self) {
        let Some(mut session) = self.session.take() else {
            debug!("{} already released", self.label);
            return;
        };

        for interface in self.claimed_interfaces.drain(..) {
            match session.release_interface(interface) {
                Ok(()) => debug!("Released interface {} on {}", interface, self.label),
                Err(e) => warn!("Failed to release interface {}: {}", interface, e),
            }
        }

        drop(session);
        self.state = LifecycleState::Released;
        info!("Closed {}", self.label);
    }

    pub fn readiness(&self) -> Readiness {
        match (self.state, &self.claim_report) {
            (LifecycleState::Released, _) => Readiness::Released,
            (_, None) => Readiness::Unclaimed,
            _ if self.claimed_interfaces.is_empty() => Readiness::NothingClaimed,
            (_, Some(report)) if report.is_complete() => Readiness::Ready,
            (_, Some(report)) => Readiness::Degraded {
                failed_steps: report.failures().count(),
            },
        }
    }

    /// Read manufacturer, product and serial number strings
    pub fn read_strings(&self) -> DeviceStrings {
        let Some(session) = &self.session else {
            return DeviceStrings::default();
        };

        DeviceStrings {
            manufacturer: read_bounded_string(session, self.summary.manufacturer_index),
            product: read_bounded_string(session, self.summary.product_index),
            serial_number: read_bounded_string(session, self.summary.serial_number_index),
        }
    }

    /// Bulk IN transfer on the recorded bulk IN endpoint
    pub fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<TransferOutcome> {
        let session = self.session.as_ref().ok_or(Error::Released)?;
        let endpoint = self.endpoints.bulk.in_endpoint().ok_or(Error::NoEndpoint {
            category: TransferCategory::Bulk,
            direction: EndpointDirection::In,
        })?;

        Ok(TransferOutcome::from_result(
            session.read_bulk(endpoint, buf, timeout),
        ))
    }

    pub fn device(&self) -> &H::Device {
        &self.device
    }

    pub fn summary(&self) -> &DeviceSummary {
        &self.summary
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn endpoints(&self) -> &EndpointMap {
        &self.endpoints
    }

    pub fn inventory(&self) -> &EndpointInventory {
        &self.inventory
    }

    pub fn claimed_interfaces(&self) -> &[u8] {
        &self.claimed_interfaces
    }

    pub fn claim_report(&self) -> Option<&ClaimReport> {
        self.claim_report.as_ref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<H: UsbHost> Drop for VendorDevice<H> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        FakeDeviceSpec, FakeHost, HostCall, bulk_endpoint, configuration, interrupt_endpoint,
    };

    fn bulk_device() -> FakeDeviceSpec {
        FakeDeviceSpec::new(0x03eb, 0x2423).with_configuration(configuration(
            1,
            vec![
                (0, vec![(0, vec![interrupt_endpoint(0x83, 8, 4)])]),
                (
                    2,
                    vec![(0, vec![]), (1, vec![bulk_endpoint(0x81, 64), bulk_endpoint(0x02, 64)])],
                ),
            ],
        ))
    }

    fn open(host: &FakeHost) -> VendorDevice<FakeHost> {
        let device = host.devices().unwrap().remove(0);
        VendorDevice::open_and_build(host, device).unwrap()
    }

    #[test]
    fn test_open_and_build() {
        let host = FakeHost::new().with_device(bulk_device().with_port(4));
        let device = open(&host);

        assert_eq!(device.state(), LifecycleState::Ready);
        assert_eq!(device.readiness(), Readiness::Unclaimed);
        assert!(device.is_open());
        assert_eq!(device.port(), 4);
        assert_eq!(device.endpoints().bulk.interface_number, 2);
        assert_eq!(device.endpoints().bulk.alt_setting, 1);
        assert_eq!(device.endpoints().interrupt.in_address, 3);
        assert_eq!(host.opens(0), 1);
    }

    #[test]
    fn test_claim_order() {
        let host = FakeHost::new().with_device(bulk_device());
        let mut device = open(&host);

        let report = device
            .claim(&ClaimPolicy {
                auto_detach_kernel_driver: true,
                claim_unused_categories: false,
            })
            .unwrap();
        assert!(report.is_complete());
        assert!(matches!(report.auto_detach, Some(Ok(()))));

        let claim_calls: Vec<HostCall> = host
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    HostCall::AutoDetach { .. }
                        | HostCall::Claim { .. }
                        | HostCall::SetAltSetting { .. }
                )
            })
            .collect();
        assert_eq!(
            claim_calls,
            vec![
                HostCall::AutoDetach {
                    device: 0,
                    enable: true
                },
                HostCall::Claim {
                    device: 0,
                    interface: 2
                },
                HostCall::Claim {
                    device: 0,
                    interface: 0
                },
                HostCall::SetAltSetting {
                    device: 0,
                    interface: 0,
                    setting: 0
                },
                HostCall::SetAltSetting {
                    device: 0,
                    interface: 2,
                    setting: 1
                },
            ]
        );
        assert_eq!(device.readiness(), Readiness::Ready);
        assert_eq!(device.state(), LifecycleState::Claimed);
        assert_eq!(device.claimed_interfaces(), &[2, 0]);
    }

    #[test]
    fn test_claim_unused_categories() {
        let host = FakeHost::new().with_device(bulk_device());
        let mut device = open(&host);

        let report = device
            .claim(&ClaimPolicy {
                auto_detach_kernel_driver: false,
                claim_unused_categories: true,
            })
            .unwrap();

        // Isochronous has no endpoints; its zero-valued interface 0 is
        // claimed anyway and interface 0 is already claimed for interrupt
        assert_eq!(report.steps.len(), 6);
        assert!(report.auto_detach.is_none());
        assert_eq!(
            host.count(|c| matches!(c, HostCall::Claim { interface: 0, .. })),
            2
        );
        assert_eq!(device.claimed_interfaces(), &[2, 0]);
    }

    #[test]
    fn test_partial_claim_is_degraded() {
        let host = FakeHost::new().with_device(
            bulk_device()
                .with_claim_error(2, rusb::Error::Busy)
                .with_alt_setting_error(2, rusb::Error::NotFound),
        );
        let mut device = open(&host);

        let report = device.claim(&ClaimPolicy::default()).unwrap();
        assert!(!report.is_complete());
        let failed: Vec<_> = report.failures().map(|s| (s.category, s.action)).collect();
        assert_eq!(
            failed,
            vec![
                (TransferCategory::Bulk, ClaimAction::Claim),
                (TransferCategory::Bulk, ClaimAction::SelectAltSetting(1)),
            ]
        );

        assert_eq!(device.readiness(), Readiness::Degraded { failed_steps: 2 });
        assert_eq!(device.claimed_interfaces(), &[0]);
    }

    #[test]
    fn test_no_endpoints_nothing_claimed() {
        let host = FakeHost::new().with_device(FakeDeviceSpec::new(0x03eb, 0x2423));
        let mut device = open(&host);

        let report = device.claim(&ClaimPolicy::default()).unwrap();
        assert!(report.steps.is_empty());
        assert!(report.is_complete());

        assert_eq!(device.readiness(), Readiness::NothingClaimed);
        assert!(device.claimed_interfaces().is_empty());
    }

    #[test]
    fn test_every_claim_failing_is_nothing_claimed() {
        let host = FakeHost::new().with_device(
            bulk_device()
                .with_claim_error(0, rusb::Error::Busy)
                .with_claim_error(2, rusb::Error::Access),
        );
        let mut device = open(&host);
        device.claim(&ClaimPolicy::default()).unwrap();

        assert_eq!(device.readiness(), Readiness::NothingClaimed);
    }

    #[test]
    fn test_release_is_idempotent() {
        let host = FakeHost::new().with_device(bulk_device());
        let mut device = open(&host);
        device.claim(&ClaimPolicy::default()).unwrap();

        device.release();
        device.release();

        assert_eq!(device.state(), LifecycleState::Released);
        assert_eq!(device.readiness(), Readiness::Released);
        assert!(!device.is_open());
        assert_eq!(host.count(|c| matches!(c, HostCall::Release { .. })), 2);
        assert_eq!(host.closes(0), 1);

        drop(device);
        assert_eq!(host.closes(0), 1);
    }

    #[test]
    fn test_released_handle_rejects_use() {
        let host = FakeHost::new().with_device(bulk_device());
        let mut device = open(&host);
        device.release();

        assert!(matches!(
            device.claim(&ClaimPolicy::default()),
            Err(Error::Released)
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            device.read_bulk(&mut buf, Duration::from_millis(1)),
            Err(Error::Released)
        ));
        assert_eq!(device.read_strings(), DeviceStrings::default());
    }

    #[test]
    fn test_drop_releases() {
        let host = FakeHost::new().with_device(bulk_device());
        let mut device = open(&host);
        device.claim(&ClaimPolicy::default()).unwrap();
        drop(device);

        assert_eq!(host.closes(0), 1);
        assert_eq!(host.live_references(0), 0);
    }

    #[test]
    fn test_read_bulk_uses_in_endpoint() {
        let host = FakeHost::new()
            .with_device(bulk_device().with_bulk_response(Ok(b"hello".to_vec())));
        let device = open(&host);

        let mut buf = [0u8; 16];
        let outcome = device.read_bulk(&mut buf, Duration::from_millis(10)).unwrap();
        assert!(matches!(outcome, TransferOutcome::Received(5)));
        assert!(host.calls().contains(&HostCall::BulkRead {
            device: 0,
            endpoint: 0x81
        }));
    }

    #[test]
    fn test_read_bulk_without_in_endpoint() {
        let host = FakeHost::new().with_device(FakeDeviceSpec::new(1, 2).with_configuration(
            configuration(1, vec![(0, vec![(0, vec![bulk_endpoint(0x01, 64)])])]),
        ));
        let device = open(&host);

        let mut buf = [0u8; 16];
        assert!(matches!(
            device.read_bulk(&mut buf, Duration::from_millis(10)),
            Err(Error::NoEndpoint {
                category: TransferCategory::Bulk,
                direction: EndpointDirection::In
            })
        ));
    }

    #[test]
    fn test_read_strings() {
        let host = FakeHost::new().with_device(
            bulk_device()
                .with_strings("Mohammad El-Sabae", "libusb")
                .with_serial("0042"),
        );
        let device = open(&host);

        let strings = device.read_strings();
        assert_eq!(strings.manufacturer.as_deref(), Some("Mohammad El-Sabae"));
        assert_eq!(strings.product.as_deref(), Some("libusb"));
        assert_eq!(strings.serial_number.as_deref(), Some("0042"));
    }
}
