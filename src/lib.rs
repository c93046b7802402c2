//! Fault-driven function hooks and memory-access watches.
//!
//! Code bytes are never patched. A hook or watch marks its page as a guard
//! page; the first access raises a fault, which the dispatcher services by
//! redirecting the instruction pointer (hooks) or running callbacks (watches).
//! It then single-steps the faulting instruction so the page can be guarded
//! again.
//!
//! # Features
//!
//! - `test-utils` - Exposes [`MockPlatform`] and [`SimFrame`] for driving an
//!   [`Engine`] with simulated faults
//!
//! # Quick Start
//!
//! ```ignore
//! use core::sync::atomic::{AtomicUsize, Ordering};
//! use pageguard::{Access, AccessMask, TrapFrame};
//!
//! static ORIGINAL: AtomicUsize = AtomicUsize::new(0);
//!
//! extern "C" fn detour(x: u64) -> u64 {
//!     let original: extern "C" fn(u64) -> u64 =
//!         unsafe { core::mem::transmute(ORIGINAL.load(Ordering::SeqCst)) };
//!     original(x) + 1
//! }
//!
//! fn on_write(frame: &mut dyn TrapFrame, access: Access) {
//!     log::info!("{} from {:#x}", access.label(), frame.instruction_pointer());
//! }
//!
//! pageguard::init()?;
//! pageguard::create_hook(target_fn as usize, detour as usize, &ORIGINAL)?;
//! pageguard::create_watch(&COUNTER as *const _ as usize, AccessMask::WRITE, on_write)?;
//! // ...
//! pageguard::shutdown();
//! ```

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction
// =============================================================================

pub mod platform;

// =============================================================================
// Core Types
// =============================================================================

pub mod config;
pub mod error;
pub mod frame;

// =============================================================================
// Registries
// =============================================================================

pub mod hook;
pub mod page;
pub mod watch;

// =============================================================================
// Fault Engine
// =============================================================================

mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod slots;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::GuardConfig;
pub use engine::Engine;
pub use error::Error;
pub use frame::{Access, Disposition, FaultKind, TrapFrame};
pub use hook::HookInfo;
pub use lifecycle::{
    create_hook, create_watch, hooks, init, init_with, is_initialized, rearm, remove_hook,
    remove_watch, set_rearm_watches, shutdown, watches,
};
pub use page::GuardState;
pub use platform::PageOps;
pub use watch::{AccessMask, WatchCallback, WatchInfo};

#[cfg(feature = "test-utils")]
pub use frame::SimFrame;
#[cfg(feature = "test-utils")]
pub use platform::mock::MockPlatform;
