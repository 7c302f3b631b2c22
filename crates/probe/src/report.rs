//! Device metadata reporting

use crate::usb::device::{ClaimAction, ClaimReport, VendorDevice};
use crate::usb::discovery::CandidateVerdict;
use common::{TransferCategory, UsbHost};
use std::io::{self, Write};

/// Print strings, device descriptor fields, speed and port
pub fn write_device_report<H: UsbHost, W: Write>(
    device: &VendorDevice<H>,
    out: &mut W,
) -> io::Result<()> {
    let strings = device.read_strings();
    let desc = device.summary();
    let unknown = "<unavailable>";

    writeln!(
        out,
        "Manufacturer: {}",
        strings.manufacturer.as_deref().unwrap_or(unknown)
    )?;
    writeln!(
        out,
        "Product Name: {}",
        strings.product.as_deref().unwrap_or(unknown)
    )?;
    writeln!(
        out,
        "Product Serial: {}",
        strings.serial_number.as_deref().unwrap_or(unknown)
    )?;

    writeln!(out, "bLength: {}", desc.length())?;
    writeln!(out, "bDescriptorType: {}", desc.descriptor_type())?;
    writeln!(out, "bcdUSB: {:X}", desc.usb_version)?;
    writeln!(out, "bDeviceClass: {}", desc.class_code)?;
    writeln!(out, "bDeviceSubClass: {}", desc.sub_class_code)?;
    writeln!(out, "bDeviceProtocol: {}", desc.protocol_code)?;
    writeln!(out, "bMaxPacketSize0: {}", desc.max_packet_size0)?;
    writeln!(out, "idVendor: {:04X}", desc.vendor_id)?;
    writeln!(out, "idProduct: {:04X}", desc.product_id)?;
    writeln!(out, "bcdDevice: {:X}", desc.device_version)?;
    writeln!(out, "bNumConfigurations: {}", desc.num_configurations)?;
    writeln!(out, "{}", device.speed().describe())?;
    writeln!(out, "Device located on port: {}", device.port())?;

    Ok(())
}

/// Print one line per transfer category of the endpoint map
pub fn write_endpoint_table<H: UsbHost, W: Write>(
    device: &VendorDevice<H>,
    out: &mut W,
) -> io::Result<()> {
    writeln!(
        out,
        "{:<12} {:>5} {:>4} {:>6} {:>6} {:>8} {:>6}",
        "category", "iface", "alt", "in", "out", "interval", "mps"
    )?;

    for category in [
        TransferCategory::Bulk,
        TransferCategory::Isochronous,
        TransferCategory::Interrupt,
    ] {
        let set = device.endpoints().get(category);
        if set.is_empty() {
            writeln!(out, "{:<12} {:>5}", category.to_string(), "-")?;
            continue;
        }

        writeln!(
            out,
            "{:<12} {:>5} {:>4} {:>6} {:>6} {:>8} {:>6}",
            category.to_string(),
            set.interface_number,
            set.alt_setting,
            format_endpoint(set.in_endpoint()),
            format_endpoint(set.out_endpoint()),
            set.poll_interval,
            set.max_packet_size
        )?;
    }

    Ok(())
}

/// Print the failed steps of a claim attempt
pub fn write_claim_failures<W: Write>(report: &ClaimReport, out: &mut W) -> io::Result<()> {
    if let Some(Err(e)) = &report.auto_detach {
        writeln!(out, "kernel driver auto-detach unavailable: {}", e)?;
    }

    for step in report.failures() {
        let action = match step.action {
            ClaimAction::Claim => "claim".to_string(),
            ClaimAction::SelectAltSetting(alt) => format!("alt setting {}", alt),
        };
        if let Err(e) = &step.result {
            writeln!(
                out,
                "{} interface {} ({}): {}",
                action, step.interface, step.category, e
            )?;
        }
    }

    Ok(())
}

/// Print the match verdict of every enumerated device
pub fn write_survey<W: Write>(verdicts: &[CandidateVerdict], out: &mut W) -> io::Result<()> {
    if verdicts.is_empty() {
        writeln!(out, "No USB devices found.")?;
        return Ok(());
    }

    writeln!(out, "Found {} USB device(s):\n", verdicts.len())?;
    for verdict in verdicts {
        let ids = match (verdict.vendor_id, verdict.product_id) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => "????:????".to_string(),
        };
        match &verdict.verdict {
            Ok(()) => writeln!(out, "  {} {} - match", verdict.label, ids)?,
            Err(reason) => writeln!(out, "  {} {} - {}", verdict.label, ids, reason)?,
        }
    }

    Ok(())
}

fn format_endpoint(endpoint: Option<u8>) -> String {
    endpoint
        .map(|ep| format!("{:#04x}", ep))
        .unwrap_or_else(|| "-".to_string())
}
