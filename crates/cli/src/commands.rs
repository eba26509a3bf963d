//! `list` and `probe` subcommands
//!
//! Both talk to USB only through `Session` entry points.

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};
use usbproxy::{ControlSetup, Device, DeviceDescriptor, Session, UsbError};

/// Timeout of the control requests issued by `probe`
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Standard GET_CONFIGURATION request
const GET_CONFIGURATION: ControlSetup = ControlSetup {
    request_type: 0x80,
    request: 0x08,
    value: 0,
    index: 0,
};

/// Device as printed by `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub index: usize,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class_code: u8,
    pub usb_version: u16,
    pub num_configurations: u8,
}

impl DeviceSummary {
    fn new(index: usize, d: &DeviceDescriptor) -> Self {
        Self {
            index,
            vendor_id: d.vendor_id,
            product_id: d.product_id,
            class_code: d.class_code,
            usb_version: d.usb_version,
            num_configurations: d.num_configurations,
        }
    }
}

/// Result of `probe`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub configuration: Option<u8>,
}

/// Parse `VID:PID` in hex, e.g. `046d:c31c`
pub fn parse_vid_pid(s: &str) -> Result<(u16, u16)> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("Expected VID:PID, got '{}'", s))?;
    let vid = u16::from_str_radix(vid.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid vendor id '{}'", vid))?;
    let pid = u16::from_str_radix(pid.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid product id '{}'", pid))?;
    Ok((vid, pid))
}

/// Enumerate devices with their descriptors
pub fn list_devices(session: &Session) -> Result<Vec<DeviceSummary>> {
    let ctx = session.init().context("Failed to initialize USB")?;
    let list = session
        .get_device_list(&ctx)
        .context("Failed to enumerate devices")?;

    let mut summaries = Vec::with_capacity(list.len());
    for (index, device) in list.iter().enumerate() {
        match session.get_device_descriptor(device) {
            Ok(descriptor) => summaries.push(DeviceSummary::new(index, &descriptor)),
            Err(e) => debug!("Skipping device {}: {}", index, e),
        }
    }
    session.free_device_list(list, true);
    Ok(summaries)
}

pub fn run_list(session: &Session, json: bool, out: &mut impl Write) -> Result<()> {
    let devices = list_devices(session)?;

    if json {
        serde_json::to_writer_pretty(&mut *out, &devices)?;
        writeln!(out)?;
        return Ok(());
    }

    if devices.is_empty() {
        writeln!(out, "No USB devices found")?;
        return Ok(());
    }
    for d in &devices {
        writeln!(
            out,
            "{:3}  {:04x}:{:04x}  class {:02x}  usb {:x}.{:02x}",
            d.index,
            d.vendor_id,
            d.product_id,
            d.class_code,
            d.usb_version >> 8,
            d.usb_version & 0xff
        )?;
    }
    Ok(())
}

fn find_device(session: &Session, vendor_id: u16, product_id: u16) -> Result<Device> {
    let ctx = session.init().context("Failed to initialize USB")?;
    let list = session
        .get_device_list(&ctx)
        .context("Failed to enumerate devices")?;

    for device in list.iter() {
        let descriptor = match session.get_device_descriptor(device) {
            Ok(d) => d,
            Err(_) => continue,
        };
        if descriptor.vendor_id == vendor_id && descriptor.product_id == product_id {
            return Ok(*device);
        }
    }
    bail!("No device {:04x}:{:04x} found", vendor_id, product_id)
}

fn read_string(
    session: &Session,
    handle: &usbproxy::DeviceHandle,
    index: u8,
) -> Option<String> {
    if index == 0 {
        return None;
    }
    let mut buf = [0u8; 256];
    match session.get_string_descriptor_ascii(handle, index, &mut buf) {
        Ok(len) => Some(String::from_utf8_lossy(&buf[..len]).into_owned()),
        Err(e) => {
            debug!("String descriptor {}: {}", index, e);
            None
        }
    }
}

/// Open a device, read its strings and active configuration, close it
pub fn probe(session: &Session, vendor_id: u16, product_id: u16) -> Result<ProbeReport> {
    let device = find_device(session, vendor_id, product_id)?;
    let descriptor = session.get_device_descriptor(&device)?;
    let handle = session
        .open(&device)
        .with_context(|| format!("Failed to open {:04x}:{:04x}", vendor_id, product_id))?;
    info!("Opened {:04x}:{:04x}", vendor_id, product_id);

    let mut config = [0u8; 1];
    let configuration = match session.control_transfer(
        &handle,
        GET_CONFIGURATION,
        &mut config,
        CONTROL_TIMEOUT,
    ) {
        Ok(1) => Some(config[0]),
        Ok(_) => None,
        Err(UsbError::Pipe) => None,
        Err(e) => {
            session.close(&handle);
            return Err(e).context("GET_CONFIGURATION failed");
        }
    };

    let report = ProbeReport {
        vendor_id,
        product_id,
        manufacturer: read_string(session, &handle, descriptor.manufacturer_string_index),
        product: read_string(session, &handle, descriptor.product_string_index),
        serial_number: read_string(session, &handle, descriptor.serial_number_string_index),
        configuration,
    };

    session.close(&handle);
    Ok(report)
}

pub fn run_probe(session: &Session, target: &str, json: bool, out: &mut impl Write) -> Result<()> {
    let (vendor_id, product_id) = parse_vid_pid(target)?;
    let report = probe(session, vendor_id, product_id)?;

    if json {
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
        return Ok(());
    }

    let unknown = || "-".to_string();
    writeln!(out, "Device:        {:04x}:{:04x}", report.vendor_id, report.product_id)?;
    writeln!(out, "Manufacturer:  {}", report.manufacturer.clone().unwrap_or_else(unknown))?;
    writeln!(out, "Product:       {}", report.product.clone().unwrap_or_else(unknown))?;
    writeln!(out, "Serial:        {}", report.serial_number.clone().unwrap_or_else(unknown))?;
    match report.configuration {
        Some(0) => writeln!(out, "Configuration: unconfigured")?,
        Some(value) => writeln!(out, "Configuration: {}", value)?,
        None => writeln!(out, "Configuration: unknown")?,
    }
    Ok(())
}
