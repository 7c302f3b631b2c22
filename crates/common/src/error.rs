//! Common error types

use crate::usb_types::{EndpointDirection, TransferCategory};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Failed to enumerate USB devices: {0}")]
    Enumeration(#[source] rusb::Error),

    #[error("No matching vendor device found")]
    NotFound,

    #[error("Failed to read configuration descriptor {index}: {source}")]
    Descriptor {
        index: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Failed to open device: {0}")]
    Open(#[source] rusb::Error),

    #[error("Device handle has already been released")]
    Released,

    #[error("Device exposes no {direction} endpoint for {category} transfers")]
    NoEndpoint {
        category: TransferCategory,
        direction: EndpointDirection,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
