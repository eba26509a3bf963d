//! Native USB vocabulary shared by the proxy and its callers
//!
//! This crate defines the libusb-shaped types that cross the boundary between
//! caller threads and the USB worker: result codes, transfer statuses,
//! descriptors and control setup packets. Every error keeps its native
//! negative code so results can be rendered in the 0-or-negative convention
//! that unmodified client code expects.
//!
//! # Example
//!
//! ```
//! use abi::{UsbError, TransferStatus, result_code};
//!
//! let stalled = TransferStatus::Stall.into_result();
//! assert_eq!(stalled, Err(UsbError::Pipe));
//! assert_eq!(result_code(&stalled), -9);
//! assert_eq!(result_code(&Ok(())), 0);
//! ```

pub mod error;
pub mod types;
pub mod version;

pub use error::{Result, UsbError, result_code};
pub use types::{
    ControlSetup, DeviceDescriptor, ENDPOINT_IN, TransferKind, TransferStatus, is_in_endpoint,
};
pub use version::{LibraryVersion, version};
