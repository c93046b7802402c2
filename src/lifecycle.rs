//! Process-wide engine and its lifecycle.
//!
//! The OS fault handler is process global, so the crate keeps one
//! [`Engine`] over the native platform. `init()` installs the handler;
//! registration calls fail with [`Error::NotInitialized`] until it has run.

use alloc::vec::Vec;
use core::sync::atomic::AtomicUsize;
use spin::{Lazy, Mutex};

use crate::config::GuardConfig;
use crate::engine::Engine;
use crate::error::Error;
use crate::frame::{Disposition, FaultKind, TrapFrame};
use crate::hook::HookInfo;
use crate::platform::{self, NativePlatform};
use crate::watch::{AccessMask, WatchCallback, WatchInfo};

static ENGINE: Lazy<Engine<NativePlatform>> = Lazy::new(|| Engine::new(NativePlatform::new()));

/// Whether the fault handler is installed. Also serializes init/shutdown.
static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Install the fault handler with the default configuration.
pub fn init() -> Result<(), Error> {
    init_with(GuardConfig::default())
}

/// Install the fault handler. Calling it again only applies `config`.
pub fn init_with(config: GuardConfig) -> Result<(), Error> {
    let mut installed = INSTALLED.lock();
    ENGINE.configure(&config);

    if *installed {
        return Ok(());
    }
    platform::install_handler(config.first_handler).map_err(Error::HandlerInstallFailed)?;
    *installed = true;

    info!(
        "pageguard: initialized (page size {:#x}, rearm_watches={})",
        ENGINE.page_size(),
        config.rearm_watches
    );
    Ok(())
}

/// Unguard every page, drop all hooks and watches, and remove the handler.
///
/// Safe to call repeatedly, or without a prior `init()`.
pub fn shutdown() {
    let mut installed = INSTALLED.lock();
    ENGINE.clear();

    if *installed {
        if let Err(err) = platform::remove_handler() {
            warn!("pageguard: removing fault handler failed: {:?}", err);
        }
        *installed = false;
        info!("pageguard: shut down");
    }
}

pub fn is_initialized() -> bool {
    *INSTALLED.lock()
}

/// Toggle re-guarding of watch-only pages after their trap fires.
pub fn set_rearm_watches(enabled: bool) {
    ENGINE.set_rearm_watches(enabled);
}

fn engine() -> Result<&'static Engine<NativePlatform>, Error> {
    if is_initialized() {
        Ok(&ENGINE)
    } else {
        Err(Error::NotInitialized)
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Redirect execution of `origin` to `target`, publishing the original entry
/// point into `original` on every redirection.
pub fn create_hook(
    origin: usize,
    target: usize,
    original: &'static AtomicUsize,
) -> Result<(), Error> {
    engine()?.create_hook(origin, target, original)
}

/// Remove the hook at `origin`.
pub fn remove_hook(origin: usize) -> Result<(), Error> {
    engine()?.remove_hook(origin)
}

/// Invoke `callback` when `address` is accessed in a way `mask` selects.
pub fn create_watch(address: usize, mask: AccessMask, callback: WatchCallback) -> Result<(), Error> {
    engine()?.create_watch(address, mask, callback)
}

/// Remove every watch at `address`.
pub fn remove_watch(address: usize) -> Result<(), Error> {
    engine()?.remove_watch(address)
}

/// Re-guard the page of `address` after its guard lapsed.
pub fn rearm(address: usize) -> Result<(), Error> {
    engine()?.rearm(address)
}

pub fn hooks() -> Vec<HookInfo> {
    ENGINE.hooks()
}

pub fn watches() -> Vec<WatchInfo> {
    ENGINE.watches()
}

/// Entry point for the platform fault handler.
#[cfg_attr(
    not(any(
        all(windows, target_arch = "x86_64"),
        all(target_os = "linux", target_arch = "x86_64")
    )),
    allow(dead_code)
)]
pub(crate) fn dispatch(fault: FaultKind, frame: &mut dyn TrapFrame) -> Disposition {
    ENGINE.dispatch(fault, frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    static SLOT: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_registration_requires_init() {
        if is_initialized() {
            return;
        }
        assert!(matches!(
            create_hook(0x1000, 0x2000, &SLOT),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(remove_watch(0x1000), Err(Error::NotInitialized)));
        assert!(matches!(rearm(0x1000), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_shutdown_without_init() {
        shutdown();
        shutdown();
        assert!(hooks().is_empty());
    }
}
