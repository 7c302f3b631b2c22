//! Vendor device matching
//!
//! A candidate matches when its vendor/product IDs and its manufacturer and
//! product string descriptors all equal the configured identity exactly.
//! Checks run in that order and stop at the first mismatch.

use common::{UsbHost, UsbSession};
use thiserror::Error;
use tracing::debug;

/// Buffer size used for string descriptor reads, terminator included
pub const STRING_DESCRIPTOR_CAPACITY: usize = 127;

/// Identity the probe looks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
}

/// Why a candidate was rejected
#[derive(Debug, Error)]
pub enum MatchRejected {
    #[error("device descriptor unavailable: {0}")]
    InvalidCandidate(#[source] rusb::Error),

    #[error("VID/PID {vendor_id:04x}:{product_id:04x} did not match")]
    IdentityMismatch { vendor_id: u16, product_id: u16 },

    #[error("failed to open the device: {0}")]
    OpenFailed(#[source] rusb::Error),

    #[error("manufacturer {found:?} did not match")]
    ManufacturerMismatch { found: Option<String> },

    #[error("product name {found:?} did not match")]
    ProductMismatch { found: Option<String> },
}

/// Match predicate over enumerated devices
#[derive(Debug, Clone)]
pub struct DeviceMatcher {
    identity: DeviceIdentity,
}

impl DeviceMatcher {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Check a candidate, reporting the first step that failed
    ///
    /// The transient session used for string reads is closed before
    /// returning, whatever the outcome.
    pub fn check<H: UsbHost>(&self, host: &H, candidate: &H::Device) -> Result<(), MatchRejected> {
        let summary = host
            .device_summary(candidate)
            .map_err(MatchRejected::InvalidCandidate)?;

        if summary.vendor_id != self.identity.vendor_id
            || summary.product_id != self.identity.product_id
        {
            return Err(MatchRejected::IdentityMismatch {
                vendor_id: summary.vendor_id,
                product_id: summary.product_id,
            });
        }

        let session = host.open(candidate).map_err(MatchRejected::OpenFailed)?;

        let manufacturer = read_bounded_string(&session, summary.manufacturer_index);
        if manufacturer.as_deref() != Some(self.identity.manufacturer.as_str()) {
            return Err(MatchRejected::ManufacturerMismatch {
                found: manufacturer,
            });
        }

        let product = read_bounded_string(&session, summary.product_index);
        if product.as_deref() != Some(self.identity.product.as_str()) {
            return Err(MatchRejected::ProductMismatch { found: product });
        }

        drop(session);
        Ok(())
    }

    /// Predicate form of [`check`](Self::check)
    pub fn matches<H: UsbHost>(&self, host: &H, candidate: &H::Device) -> bool {
        match self.check(host, candidate) {
            Ok(()) => true,
            Err(reason) => {
                debug!("{}: {}", host.describe(candidate), reason);
                false
            }
        }
    }
}

/// Read an ASCII string descriptor the way a fixed C buffer would hold it
///
/// Absent indices and failed reads yield `None`. Text longer than the buffer
/// is cut to `STRING_DESCRIPTOR_CAPACITY - 1` characters.
pub fn read_bounded_string<S: UsbSession>(session: &S, index: Option<u8>) -> Option<String> {
    let index = index?;
    let mut text = session.read_string_ascii(index).ok()?;

    if let Some((cut, _)) = text.char_indices().nth(STRING_DESCRIPTOR_CAPACITY - 1) {
        text.truncate(cut);
    }
    Some(text)
}
