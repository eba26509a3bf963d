//! Handle wrapper model
//!
//! Every handle a caller holds has the same physical shape, a [`RawHandle`]:
//! the role it plays, the worker that owns the native object, and the native
//! reference on that worker. The typed wrappers ([`ContextHandle`],
//! [`Device`], [`DeviceHandle`]) can only be obtained from a raw handle whose
//! role matches, and every entry point re-checks role and owner before the
//! call reaches the worker.

use abi::UsbError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of the worker that owns a handle (one per session)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub(crate) fn next() -> Self {
        static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Native device reference on the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeDevice(pub u32);

/// Native open-device reference on the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u32);

/// Role a handle plays at the API surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleRole {
    /// Library context returned by `init`
    Context,
    /// Enumerated device, not opened
    Device,
    /// Opened device (an I/O session)
    Session,
}

/// Untyped handle as an embedding layer would store it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub role: HandleRole,
    pub owner: OwnerId,
    pub native: u32,
}

/// A handle with a fixed role
pub trait TypedHandle {
    /// Role every value of this type must carry
    const ROLE: HandleRole;

    /// The underlying raw handle
    fn raw(&self) -> RawHandle;
}

fn check_role(raw: RawHandle, role: HandleRole) -> Result<RawHandle, UsbError> {
    if raw.role == role {
        Ok(raw)
    } else {
        Err(UsbError::InvalidParam)
    }
}

/// Library context handle
///
/// Exactly one exists per session once `init` has succeeded. Two context
/// handles are equal when they name the same worker.
#[derive(Debug, Clone, Copy)]
pub struct ContextHandle {
    raw: RawHandle,
    started: bool,
}

impl ContextHandle {
    pub(crate) fn new(owner: OwnerId, started: bool) -> Self {
        Self {
            raw: RawHandle {
                role: HandleRole::Context,
                owner,
                native: 0,
            },
            started,
        }
    }

    /// Whether the owning worker had started when the handle was issued
    ///
    /// A raw handle does not carry the flag, so a context rebuilt with
    /// `TryFrom<RawHandle>` reports `false`.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Owning worker
    pub fn owner(&self) -> OwnerId {
        self.raw.owner
    }
}

impl TypedHandle for ContextHandle {
    const ROLE: HandleRole = HandleRole::Context;

    fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl TryFrom<RawHandle> for ContextHandle {
    type Error = UsbError;

    fn try_from(raw: RawHandle) -> Result<Self, Self::Error> {
        let raw = check_role(raw, HandleRole::Context)?;
        Ok(Self {
            raw,
            started: false,
        })
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ContextHandle {}

impl std::hash::Hash for ContextHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

/// Enumerated USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    raw: RawHandle,
}

impl Device {
    pub(crate) fn new(owner: OwnerId, native: NativeDevice) -> Self {
        Self {
            raw: RawHandle {
                role: HandleRole::Device,
                owner,
                native: native.0,
            },
        }
    }

    /// Native device reference on the owning worker
    pub fn native(&self) -> NativeDevice {
        NativeDevice(self.raw.native)
    }

    /// Owning worker
    pub fn owner(&self) -> OwnerId {
        self.raw.owner
    }
}

impl TypedHandle for Device {
    const ROLE: HandleRole = HandleRole::Device;

    fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl TryFrom<RawHandle> for Device {
    type Error = UsbError;

    fn try_from(raw: RawHandle) -> Result<Self, Self::Error> {
        check_role(raw, HandleRole::Device).map(|raw| Self { raw })
    }
}

/// Opened USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    raw: RawHandle,
}

impl DeviceHandle {
    pub(crate) fn new(owner: OwnerId, native: NativeHandle) -> Self {
        Self {
            raw: RawHandle {
                role: HandleRole::Session,
                owner,
                native: native.0,
            },
        }
    }

    /// Native open-device reference on the owning worker
    pub fn native(&self) -> NativeHandle {
        NativeHandle(self.raw.native)
    }

    /// Owning worker
    pub fn owner(&self) -> OwnerId {
        self.raw.owner
    }
}

impl TypedHandle for DeviceHandle {
    const ROLE: HandleRole = HandleRole::Session;

    fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl TryFrom<RawHandle> for DeviceHandle {
    type Error = UsbError;

    fn try_from(raw: RawHandle) -> Result<Self, Self::Error> {
        check_role(raw, HandleRole::Session).map(|raw| Self { raw })
    }
}

/// Validate a handle against the session that received it
///
/// Returns the native reference when role and owner both match.
pub(crate) fn resolve<H: TypedHandle>(handle: &H, owner: OwnerId) -> Result<u32, UsbError> {
    let raw = check_role(handle.raw(), H::ROLE)?;
    if raw.owner != owner {
        return Err(UsbError::InvalidParam);
    }
    Ok(raw.native)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_ids_are_unique() {
        let a = OwnerId::next();
        let b = OwnerId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_try_from_checks_role() {
        let owner = OwnerId::next();
        let device = Device::new(owner, NativeDevice(3));

        assert_eq!(Device::try_from(device.raw()), Ok(device));
        assert_eq!(DeviceHandle::try_from(device.raw()), Err(UsbError::InvalidParam));
        assert_eq!(ContextHandle::try_from(device.raw()), Err(UsbError::InvalidParam));
    }

    #[test]
    fn test_resolve_checks_owner() {
        let owner = OwnerId::next();
        let other = OwnerId::next();
        let handle = DeviceHandle::new(owner, NativeHandle(7));

        assert_eq!(resolve(&handle, owner), Ok(7));
        assert_eq!(resolve(&handle, other), Err(UsbError::InvalidParam));
    }

    #[test]
    fn test_context_handle_started_flag() {
        let ctx = ContextHandle::new(OwnerId::next(), true);
        assert!(ctx.is_started());
        assert_eq!(ctx.raw().role, HandleRole::Context);

        let rebuilt = ContextHandle::try_from(ctx.raw()).unwrap();
        assert!(!rebuilt.is_started());
        assert_eq!(rebuilt, ctx);
    }
}
