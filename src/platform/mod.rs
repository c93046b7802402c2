//! Platform abstraction layer for page protection and fault delivery.
//!
//! The engine only needs three things from the OS: the page size, a way to
//! add or remove the guard attribute on one page, and an identifier for the
//! faulting thread. [`PageOps`] captures those so the engine can run against
//! the native backend or the instrumented [`mock::MockPlatform`].

use axerrno::AxResult;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(all(windows, target_arch = "x86_64"))]
mod windows;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux;

#[cfg(not(any(
    all(windows, target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "x86_64")
)))]
mod unsupported;

/// Page operations consumed by the engine.
pub trait PageOps: Send + Sync {
    /// Page size of the current architecture.
    fn page_size(&self) -> usize;

    /// Add (`guarded = true`) or remove the guard attribute on `len` bytes at
    /// `page`, keeping the page's other access rights.
    fn set_guard(&self, page: usize, len: usize, guarded: bool) -> AxResult;

    /// Identifier of the calling thread.
    fn thread_id(&self) -> u64;
}

/// Round `addr` down to the start of its page. `page_size` must be a power of two.
#[inline]
pub fn page_base(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

// =============================================================================
// Native Backend Selection
// =============================================================================

#[cfg(all(windows, target_arch = "x86_64"))]
pub use self::windows::{NativePlatform, install_handler, remove_handler};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use self::linux::{NativePlatform, install_handler, remove_handler};

#[cfg(not(any(
    all(windows, target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "x86_64")
)))]
pub use self::unsupported::{NativePlatform, install_handler, remove_handler};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_base() {
        assert_eq!(page_base(0x1234, 0x1000), 0x1000);
        assert_eq!(page_base(0x1000, 0x1000), 0x1000);
        assert_eq!(page_base(0x1fff, 0x1000), 0x1000);
        assert_eq!(page_base(0x2_0000 + 5, 0x1_0000), 0x2_0000);
    }
}
