//! Common utilities for the vendor USB probe
//!
//! This crate provides the host USB stack boundary (traits plus the libusb
//! implementation), shared descriptor types, error handling and logging
//! setup, and an in-memory host stack for tests (`test-utils` feature).

pub mod error;
pub mod host;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use error::{Error, Result};
pub use host::{HostCapabilities, RusbHost, UsbHost, UsbSession};
pub use logging::setup_logging;
pub use usb_types::{DeviceSpeed, DeviceSummary, EndpointDirection, TransferCategory};
