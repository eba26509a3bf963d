//! USB type definitions
//!
//! Descriptors, transfer kinds and transfer completion statuses as the native
//! library reports them.

use crate::error::UsbError;
use serde::{Deserialize, Serialize};

/// Direction bit of an endpoint address or `bmRequestType`
pub const ENDPOINT_IN: u8 = 0x80;

/// Whether an endpoint address (or request type) is device-to-host
pub fn is_in_endpoint(address: u8) -> bool {
    address & ENDPOINT_IN != 0
}

/// Completion status of an asynchronous transfer
///
/// Discriminants follow the native `libusb_transfer_status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TransferStatus {
    /// Transfer completed without error (may still be short)
    Completed = 0,
    /// Transfer failed
    Error = 1,
    /// Transfer timed out
    TimedOut = 2,
    /// Transfer was cancelled
    Cancelled = 3,
    /// Endpoint stalled (halt condition)
    Stall = 4,
    /// Device was disconnected or closed
    NoDevice = 5,
    /// Device sent more data than requested
    Overflow = 6,
}

impl TransferStatus {
    /// Map a completion status to the result a synchronous call reports
    pub fn into_result(self) -> Result<(), UsbError> {
        match self {
            TransferStatus::Completed => Ok(()),
            TransferStatus::TimedOut => Err(UsbError::Timeout),
            TransferStatus::Stall => Err(UsbError::Pipe),
            TransferStatus::Overflow => Err(UsbError::Overflow),
            TransferStatus::NoDevice => Err(UsbError::NoDevice),
            TransferStatus::Error | TransferStatus::Cancelled => Err(UsbError::Io),
        }
    }

    /// Like [`TransferStatus::into_result`], treating a missing status as
    /// unrecognized
    pub fn result_of(status: Option<TransferStatus>) -> Result<(), UsbError> {
        status.map_or(Err(UsbError::Other), TransferStatus::into_result)
    }
}

/// Transfer type of an asynchronous transfer
///
/// Isochronous transfers are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control transfer on endpoint 0
    Control,
    /// Bulk transfer
    Bulk,
    /// Interrupt transfer
    Interrupt,
}

/// Setup packet of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
}

impl ControlSetup {
    /// Whether the data stage is device-to-host
    pub fn is_in(&self) -> bool {
        is_in_endpoint(self.request_type)
    }
}

/// Standard USB device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// `bcdUSB`
    pub usb_version: u16,
    /// `bDeviceClass`
    pub class_code: u8,
    /// `bDeviceSubClass`
    pub sub_class_code: u8,
    /// `bDeviceProtocol`
    pub protocol_code: u8,
    /// `bMaxPacketSize0`
    pub max_packet_size: u8,
    /// `idVendor`
    pub vendor_id: u16,
    /// `idProduct`
    pub product_id: u16,
    /// `bcdDevice`
    pub device_version: u16,
    /// `iManufacturer`
    pub manufacturer_string_index: u8,
    /// `iProduct`
    pub product_string_index: u8,
    /// `iSerialNumber`
    pub serial_number_string_index: u8,
    /// `bNumConfigurations`
    pub num_configurations: u8,
}
