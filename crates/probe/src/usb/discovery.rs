//! Device discovery
//!
//! One pass over the host's device list: the first candidate that passes the
//! matcher and builds successfully becomes the [`VendorDevice`]. Every other
//! device reference is dropped by the end of the pass.

use crate::usb::device::VendorDevice;
use crate::usb::matcher::{DeviceMatcher, MatchRejected};
use common::{Error, Result, UsbHost};
use tracing::{debug, info, warn};

/// Find and open the vendor device
///
/// Candidates are walked in enumeration order. A matching candidate that
/// fails to build does not end the pass; if no handle is built, the last
/// build error is returned, or [`Error::NotFound`] if nothing matched.
pub fn discover<H: UsbHost>(host: &H, matcher: &DeviceMatcher) -> Result<VendorDevice<H>> {
    let candidates = host.devices().map_err(|e| {
        warn!("Failed to retrieve devices: {}", e);
        Error::Enumeration(e)
    })?;
    debug!("Enumerated {} devices", candidates.len());

    let mut last_error = None;

    for candidate in candidates {
        if !matcher.matches(host, &candidate) {
            continue;
        }

        info!("Found vendor device at {}", host.describe(&candidate));
        match VendorDevice::open_and_build(host, candidate) {
            Ok(device) => return Ok(device),
            Err(e) => {
                warn!("Failed to build matched device: {}", e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(Error::NotFound))
}

/// Match verdict for one enumerated device
#[derive(Debug)]
pub struct CandidateVerdict {
    pub label: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub verdict: std::result::Result<(), MatchRejected>,
}

/// Evaluate the matcher against every enumerated device
pub fn survey<H: UsbHost>(host: &H, matcher: &DeviceMatcher) -> Result<Vec<CandidateVerdict>> {
    let candidates = host.devices().map_err(Error::Enumeration)?;

    Ok(candidates
        .iter()
        .map(|candidate| {
            let summary = host.device_summary(candidate).ok();
            CandidateVerdict {
                label: host.describe(candidate),
                vendor_id: summary.as_ref().map(|s| s.vendor_id),
                product_id: summary.as_ref().map(|s| s.product_id),
                verdict: matcher.check(host, candidate),
            }
        })
        .collect())
}
