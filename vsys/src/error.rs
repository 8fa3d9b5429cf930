//! Error types for vsys operations

use std::ffi::CString;
use std::io;

use thiserror::Error;

use crate::permissions::{CapabilityKind, Domain};

/// Result type for vsys operations
pub type VsysResult<T> = Result<T, VsysError>;

/// Error type for vsys operations
///
/// Everything except [`VsysError::StoreCorruption`] is recoverable and is
/// surfaced to script code as a catchable exception.
#[derive(Debug, Error)]
pub enum VsysError {
    /// The permission store refused the request
    #[error("Permission denied: {capability} access to \"{scope}\"")]
    PermissionDenied {
        capability: CapabilityKind,
        scope: String,
    },
    /// Module specifier could not be resolved
    #[error("Cannot resolve module '{specifier}': {reason}")]
    ResolutionFailed { specifier: String, reason: String },
    /// I/O error from the underlying backend
    #[error("{domain} I/O error: {source}")]
    Io {
        domain: Domain,
        #[source]
        source: io::Error,
    },
    /// File or resource not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Operation not supported by this vsys implementation
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Module loading error
    #[error("Cannot load module '{path}': {message}")]
    ModuleLoad { path: String, message: String },
    /// The permission store can no longer be trusted
    #[error("Permission store corrupted: {0}")]
    StoreCorruption(String),
}

impl VsysError {
    /// Wrap an I/O error raised by a backend of `domain`
    pub fn io(domain: Domain, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => VsysError::NotFound(e.to_string()),
            _ => VsysError::Io { domain, source: e },
        }
    }

    pub fn denied(capability: CapabilityKind, scope: impl Into<String>) -> Self {
        VsysError::PermissionDenied {
            capability,
            scope: scope.into(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, VsysError::PermissionDenied { .. })
    }

    /// Fatal errors must terminate the owning runtime instead of being
    /// handed to script code.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VsysError::StoreCorruption(_))
    }
}

// C ABI compatible error representation
#[repr(C)]
pub struct CVsysError {
    pub code: i32,
    pub message: *mut std::ffi::c_char, // C string, release with `CVsysError::free`
}

impl CVsysError {
    pub const OK: i32 = 0;
    pub const ERR_IO: i32 = -1;
    pub const ERR_PERMISSION_DENIED: i32 = -2;
    pub const ERR_NOT_FOUND: i32 = -3;
    pub const ERR_NOT_SUPPORTED: i32 = -4;
    pub const ERR_INVALID_ARGUMENT: i32 = -5;
    pub const ERR_MODULE_RESOLUTION: i32 = -6;
    pub const ERR_MODULE_LOAD: i32 = -7;
    pub const ERR_STORE_CORRUPTION: i32 = -8;

    pub fn ok() -> Self {
        Self {
            code: Self::OK,
            message: std::ptr::null_mut(),
        }
    }

    pub fn from_error(e: &VsysError) -> Self {
        let code = match e {
            VsysError::Io { .. } => Self::ERR_IO,
            VsysError::PermissionDenied { .. } => Self::ERR_PERMISSION_DENIED,
            VsysError::NotFound(_) => Self::ERR_NOT_FOUND,
            VsysError::NotSupported(_) => Self::ERR_NOT_SUPPORTED,
            VsysError::InvalidArgument(_) => Self::ERR_INVALID_ARGUMENT,
            VsysError::ResolutionFailed { .. } => Self::ERR_MODULE_RESOLUTION,
            VsysError::ModuleLoad { .. } => Self::ERR_MODULE_LOAD,
            VsysError::StoreCorruption(_) => Self::ERR_STORE_CORRUPTION,
        };

        // Interior NULs would make CString::new fail
        let msg = e.to_string().replace('\0', "");
        let message = CString::new(msg)
            .map(CString::into_raw)
            .unwrap_or(std::ptr::null_mut());
        Self { code, message }
    }

    /// Release the message buffer.
    ///
    /// # Safety
    ///
    /// `message` must be null or a pointer produced by [`CVsysError::from_error`]
    /// that has not been freed yet.
    pub unsafe fn free(self) {
        if !self.message.is_null() {
            drop(CString::from_raw(self.message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = VsysError::io(
            Domain::Fs,
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert!(matches!(err, VsysError::NotFound(_)));

        let err = VsysError::io(Domain::Net, io::Error::other("connection refused"));
        assert!(matches!(err, VsysError::Io { domain: Domain::Net, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_denied_display() {
        let err = VsysError::denied(CapabilityKind::FsRead, "/etc/passwd");
        assert!(err.is_permission_denied());
        assert_eq!(
            err.to_string(),
            "Permission denied: FsRead access to \"/etc/passwd\""
        );
    }

    #[test]
    fn test_c_error_codes() {
        let err = VsysError::StoreCorruption("lock poisoned".into());
        assert!(err.is_fatal());
        let c = CVsysError::from_error(&err);
        assert_eq!(c.code, CVsysError::ERR_STORE_CORRUPTION);
        let text = unsafe { CStr::from_ptr(c.message) }.to_str().unwrap().to_owned();
        assert!(text.contains("lock poisoned"));
        unsafe { c.free() };

        let c = CVsysError::from_error(&VsysError::denied(CapabilityKind::NetConnect, "a\0b"));
        assert_eq!(c.code, CVsysError::ERR_PERMISSION_DENIED);
        assert!(!c.message.is_null());
        unsafe { c.free() };

        let ok = CVsysError::ok();
        assert_eq!(ok.code, CVsysError::OK);
        unsafe { ok.free() };
    }
}
