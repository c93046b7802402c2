//! Error types for hook and watch registration.

use axerrno::AxError;

/// Error types returned by the registration and lifecycle API.
#[derive(Debug, Clone)]
pub enum Error {
    /// The OS refused to change the protection of the page holding `address`.
    ProtectionChangeFailed {
        /// Address passed by the caller.
        address: usize,
        /// Page base derived from `address`.
        page: usize,
        /// Error reported by the platform backend.
        cause: AxError,
    },
    /// A hook already redirects this origin address.
    DuplicateHookOrigin(usize),
    /// `init()` has not been called (or `shutdown()` ran since).
    NotInitialized,
    /// The process-wide fault handler could not be installed.
    HandlerInstallFailed(AxError),
    /// No hook or watch maps to the page holding this address.
    NotGuarded(usize),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ProtectionChangeFailed {
                address,
                page,
                cause,
            } => write!(
                f,
                "Protection change failed for {:#x} (page {:#x}): {:?}",
                address, page, cause
            ),
            Self::DuplicateHookOrigin(origin) => {
                write!(f, "Hook already registered at {:#x}", origin)
            }
            Self::NotInitialized => write!(f, "Fault handler not initialized"),
            Self::HandlerInstallFailed(cause) => {
                write!(f, "Failed to install fault handler: {:?}", cause)
            }
            Self::NotGuarded(addr) => write!(f, "No entry guards the page of {:#x}", addr),
        }
    }
}

impl core::error::Error for Error {}
