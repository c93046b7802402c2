//! Fallback backend for targets without a fault interception mechanism.

use axerrno::AxResult;

use super::PageOps;

/// Native page operations (none available on this target).
#[derive(Debug, Default)]
pub struct NativePlatform;

impl NativePlatform {
    pub const fn new() -> Self {
        Self
    }
}

impl PageOps for NativePlatform {
    fn page_size(&self) -> usize {
        0x1000
    }

    fn set_guard(&self, _page: usize, _len: usize, _guarded: bool) -> AxResult {
        axerrno::ax_err!(Unsupported, "guard pages are not supported on this target")
    }

    fn thread_id(&self) -> u64 {
        0
    }
}

pub fn install_handler(_first: bool) -> AxResult {
    axerrno::ax_err!(Unsupported, "fault handling is not supported on this target")
}

pub fn remove_handler() -> AxResult {
    Ok(())
}
