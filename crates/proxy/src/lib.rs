//! usbproxy
//!
//! Serializes all access to a native USB library onto one dedicated worker
//! thread. Callers on any thread use a [`Session`]: each entry point is
//! turned into a command for the worker, executed there, and its native
//! result handed back to the blocked caller. Handles returned to callers are
//! tagged with their role and the worker that owns them, and synchronous
//! bulk/interrupt transfers are emulated on top of the asynchronous
//! submit/poll/complete cycle.

pub mod backend;
pub mod clock;
pub mod config;
pub mod device_list;
pub mod handle;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfer;
mod worker;

pub use abi::{
    ControlSetup, DeviceDescriptor, ENDPOINT_IN, LibraryVersion, TransferKind, TransferStatus,
    UsbError, version,
};
pub use backend::{BackendFactory, RusbBackend, UsbBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProxyConfig;
pub use device_list::DeviceList;
pub use handle::{ContextHandle, Device, DeviceHandle, HandleRole, OwnerId, RawHandle, TypedHandle};
pub use session::{Session, SessionBuilder};
pub use transfer::{CompletionFlag, Transfer, TransferCallback, TransferId, TransferRecord};
