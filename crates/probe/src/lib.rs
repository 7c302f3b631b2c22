//! Vendor USB probe
//!
//! Locates one vendor-specific USB peripheral, maps its endpoints by transfer
//! type, claims its interfaces and polls its bulk IN endpoint.

pub mod config;
pub mod report;
pub mod usb;
