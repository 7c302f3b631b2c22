//! Bulk read loop
//!
//! Polls the device's bulk IN endpoint with a buffer pre-filled with a
//! counter-tagged sentinel. The transfer status is classified first; the
//! sentinel only decides whether a completed transfer actually carried data.

use crate::usb::device::VendorDevice;
use common::{Error, Result, UsbHost};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest sentinel tag written into the buffer, terminator included
pub const TAG_CAPACITY: usize = 100;

/// Result of one synchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Completed with this many bytes
    Received(usize),
    Timeout,
    /// Endpoint halted
    Stall,
    Disconnected,
    Failed(rusb::Error),
}

impl TransferOutcome {
    pub fn from_result(result: std::result::Result<usize, rusb::Error>) -> Self {
        match result {
            Ok(len) => TransferOutcome::Received(len),
            Err(rusb::Error::Timeout) => TransferOutcome::Timeout,
            Err(rusb::Error::Pipe) => TransferOutcome::Stall,
            Err(rusb::Error::NoDevice) => TransferOutcome::Disconnected,
            Err(e) => TransferOutcome::Failed(e),
        }
    }
}

/// What one poll of the device produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReport {
    /// The device answered with this text
    Response(String),
    /// Timed out, or completed without touching the sentinel
    NoResponse,
    /// The transfer itself failed
    Failed(TransferOutcome),
}

/// Read loop parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadLoopSettings {
    pub buffer_len: usize,
    pub timeout: Duration,
    pub sentinel: String,
    /// Stop after this many polls; `None` runs until the process ends
    pub count: Option<u64>,
}

impl Default for ReadLoopSettings {
    fn default() -> Self {
        Self {
            buffer_len: 1024,
            timeout: Duration::from_millis(1000),
            sentinel: "deadbeef: ".to_string(),
            count: None,
        }
    }
}

/// Polls one device over bulk IN
pub struct BulkReader {
    settings: ReadLoopSettings,
    counter: u64,
    buffer: Vec<u8>,
}

impl BulkReader {
    pub fn new(settings: ReadLoopSettings) -> Self {
        let buffer = vec![0u8; settings.buffer_len];
        Self {
            settings,
            counter: 0,
            buffer,
        }
    }

    /// Number of polls issued so far
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Issue one bulk IN transfer and interpret it
    ///
    /// A disconnected device is an error; everything else is reported.
    pub fn poll<H: UsbHost>(&mut self, device: &VendorDevice<H>) -> Result<PollReport> {
        self.counter += 1;
        self.write_tag();

        let outcome = device.read_bulk(&mut self.buffer, self.settings.timeout)?;
        debug!("Bulk poll {}: {:?}", self.counter, outcome);

        let report = match outcome {
            TransferOutcome::Received(len) if len > 0 && !self.sentinel_intact() => {
                PollReport::Response(text_of(&self.buffer[..len]))
            }
            TransferOutcome::Received(_) | TransferOutcome::Timeout => PollReport::NoResponse,
            TransferOutcome::Disconnected => return Err(Error::Usb(rusb::Error::NoDevice)),
            TransferOutcome::Stall | TransferOutcome::Failed(_) => {
                warn!("Bulk transfer failed: {:?}", outcome);
                PollReport::Failed(outcome)
            }
        };

        Ok(report)
    }

    fn write_tag(&mut self) {
        self.buffer.fill(0);
        let tag = format!("{}{}", self.settings.sentinel, self.counter);
        let len = tag
            .len()
            .min(TAG_CAPACITY - 1)
            .min(self.buffer.len());
        self.buffer[..len].copy_from_slice(&tag.as_bytes()[..len]);
    }

    fn sentinel_intact(&self) -> bool {
        self.buffer.starts_with(self.settings.sentinel.as_bytes())
    }
}

/// Text up to the first NUL byte
fn text_of(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Run the read loop, reporting each poll to `out`
///
/// Returns the number of polls issued.
pub fn run_read_loop<H: UsbHost, W: Write>(
    device: &VendorDevice<H>,
    settings: ReadLoopSettings,
    out: &mut W,
) -> Result<u64> {
    let limit = settings.count;
    let mut reader = BulkReader::new(settings);

    while limit.is_none_or(|limit| reader.counter() < limit) {
        match reader.poll(device)? {
            PollReport::Response(text) => writeln!(out, "host received: {}", text)?,
            PollReport::NoResponse => writeln!(out, "device hasn't responded")?,
            PollReport::Failed(outcome) => writeln!(out, "transfer failed: {:?}", outcome)?,
        }
    }

    Ok(reader.counter())
}
