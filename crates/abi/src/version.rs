//! Library version reporting

use serde::Serialize;

/// Version of the proxy library, reported without a worker round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LibraryVersion {
    pub major: u16,
    pub minor: u16,
    pub micro: u16,
    pub describe: &'static str,
}

const CURRENT: LibraryVersion = LibraryVersion {
    major: 1,
    minor: 0,
    micro: 27,
    describe: "usb-proxy",
};

/// Version of the native API surface this library emulates
///
/// Not proxied: it is answered on the calling thread.
pub fn version() -> &'static LibraryVersion {
    &CURRENT
}
