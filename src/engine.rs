//! Hook and watch registration.
//!
//! [`Engine`] owns both registries, the page tally, and the per-thread trap
//! records behind a single lock. Registration, removal, and the fault
//! dispatcher all go through that lock. Every mutation is applied together
//! with its protection change: if the OS refuses the change, the registries
//! are rolled back before the error is returned.
//!
//! Registries are written before a page is guarded, never after. Watched
//! memory must not share a page with the engine's own heap storage: a write
//! to a guarded page while the lock is held faults into a dispatcher that
//! waits on that same lock.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::config::GuardConfig;
use crate::error::Error;
use crate::hook::{HookInfo, HookRegistry};
use crate::page::{GuardState, Owner, PageTable, Protector};
use crate::platform::PageOps;
use crate::slots::{NUM_TOKEN_SLOTS, NUM_TRAP_SLOTS, Slots};
use crate::watch::{AccessMask, WatchCallback, WatchInfo, WatchRegistry};

/// A single-step trap requested on a thread, waiting to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingTrap {
    /// Faulting thread.
    pub thread: u64,
    /// Page whose guard the servicing fault cleared.
    pub page: usize,
    /// Hook origin if a hook armed the trap.
    pub origin: Option<usize>,
    /// Re-apply the guard when the trap fires.
    pub reguard: bool,
}

/// Lets a redirected thread run the original entry point once, from inside
/// the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallThrough {
    pub thread: u64,
    pub origin: usize,
    /// Stack pointer at the redirected entry. Calls made by the target run
    /// below it.
    pub sp: usize,
}

/// Everything guarded by the engine lock.
#[derive(Default)]
pub(crate) struct State {
    pub hooks: HookRegistry,
    pub watches: WatchRegistry,
    pub pages: PageTable,
    pub traps: Slots<PendingTrap, NUM_TRAP_SLOTS>,
    pub call_through: Slots<CallThrough, NUM_TOKEN_SLOTS>,
}

/// Fault-driven hook and watch engine over a platform backend.
pub struct Engine<P: PageOps> {
    pub(crate) protector: Protector<P>,
    rearm_watches: AtomicBool,
    pub(crate) state: Mutex<State>,
}

impl<P: PageOps> Engine<P> {
    /// Engine with the default configuration.
    pub fn new(platform: P) -> Self {
        Self::with_config(platform, GuardConfig::default())
    }

    pub fn with_config(platform: P, config: GuardConfig) -> Self {
        Self {
            protector: Protector::new(platform),
            rearm_watches: AtomicBool::new(config.rearm_watches),
            state: Mutex::new(State::default()),
        }
    }

    /// Apply the runtime part of `config`.
    pub fn configure(&self, config: &GuardConfig) {
        self.set_rearm_watches(config.rearm_watches);
    }

    pub fn platform(&self) -> &P {
        self.protector.platform()
    }

    /// Cached page size.
    pub fn page_size(&self) -> usize {
        self.protector.page_size()
    }

    /// Page base holding `address`.
    pub fn page_of(&self, address: usize) -> usize {
        self.protector.page_of(address)
    }

    pub fn set_rearm_watches(&self, enabled: bool) {
        self.rearm_watches.store(enabled, Ordering::SeqCst);
    }

    pub fn rearm_watches(&self) -> bool {
        self.rearm_watches.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Watches
    // =========================================================================

    /// Watch `address` for the accesses in `mask`.
    ///
    /// Several watches may share an address. The page is guarded if no other
    /// entry of either registry already maps to it, or if its guard lapsed
    /// and no trap is pending to restore it.
    pub fn create_watch(
        &self,
        address: usize,
        mask: AccessMask,
        callback: WatchCallback,
    ) -> Result<(), Error> {
        let page = self.page_of(address);
        let mut state = self.state.lock();

        state.watches.push(address, mask, callback);
        if let Err(err) = self.track(&mut state, page, Owner::Watch, address) {
            state.watches.pop();
            log::warn!("pageguard: watch at {:#x} rejected: {}", address, err);
            return Err(err);
        }
        self.check(&state);

        log::debug!("pageguard: watching {:#x} ({:?})", address, mask);
        Ok(())
    }

    /// Remove every watch at exactly `address`. Nothing to remove is not an error.
    pub fn remove_watch(&self, address: usize) -> Result<(), Error> {
        let page = self.page_of(address);
        let mut state = self.state.lock();

        let snapshot = state.watches.clone();
        let removed = state.watches.remove_all(address);
        if removed == 0 {
            return Ok(());
        }

        let prior = state.pages.get(page).copied();
        if state.pages.release(page, Owner::Watch, removed) {
            if let Err(err) = self.protector.unguard(address) {
                state.watches = snapshot;
                Self::retrack(&mut state, page, Owner::Watch, removed, prior.map(|e| e.state));
                log::warn!("pageguard: unwatch of {:#x} rolled back: {}", address, err);
                return Err(err);
            }
        }
        self.check(&state);

        log::debug!("pageguard: removed {} watch(es) at {:#x}", removed, address);
        Ok(())
    }

    /// Registered watches in registration order.
    pub fn watches(&self) -> Vec<WatchInfo> {
        self.state.lock().watches.list()
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Redirect execution reaching `origin` to `target`.
    ///
    /// On every redirection the original entry point is stored into
    /// `original` so the target can call through to it.
    pub fn create_hook(
        &self,
        origin: usize,
        target: usize,
        original: &'static AtomicUsize,
    ) -> Result<(), Error> {
        let page = self.page_of(origin);
        let mut state = self.state.lock();

        if state.hooks.contains(origin) {
            log::debug!("pageguard: hook at {:#x} already registered", origin);
            return Err(Error::DuplicateHookOrigin(origin));
        }

        state.hooks.insert(origin, target, original);
        if let Err(err) = self.track(&mut state, page, Owner::Hook, origin) {
            state.hooks.remove(origin);
            log::warn!("pageguard: hook at {:#x} rejected: {}", origin, err);
            return Err(err);
        }
        self.check(&state);

        log::debug!("pageguard: hooked {:#x} -> {:#x}", origin, target);
        Ok(())
    }

    /// Remove the hook at `origin`. Nothing to remove is not an error.
    pub fn remove_hook(&self, origin: usize) -> Result<(), Error> {
        let page = self.page_of(origin);
        let mut state = self.state.lock();

        let Some(entry) = state.hooks.remove(origin) else {
            return Ok(());
        };

        let prior = state.pages.get(page).copied();
        if state.pages.release(page, Owner::Hook, 1) {
            if let Err(err) = self.protector.unguard(origin) {
                state.hooks.restore(entry);
                Self::retrack(&mut state, page, Owner::Hook, 1, prior.map(|e| e.state));
                log::warn!("pageguard: unhook of {:#x} rolled back: {}", origin, err);
                return Err(err);
            }
        }
        state.call_through.retain(|t| t.origin != origin);
        self.check(&state);

        log::debug!("pageguard: unhooked {:#x}", origin);
        Ok(())
    }

    /// Registered hooks ordered by origin.
    pub fn hooks(&self) -> Vec<HookInfo> {
        self.state.lock().hooks.list()
    }

    /// The hook at `origin`, if any.
    pub fn hook(&self, origin: usize) -> Option<HookInfo> {
        let state = self.state.lock();
        state.hooks.get(origin).map(|h| HookInfo {
            origin: h.origin,
            target: h.target,
            hits: h.hits,
            reentry_suppressed: h.reentry_suppressed,
        })
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Re-apply the guard on the page holding `address`.
    ///
    /// Used to re-arm a watch page whose guard lapsed after a fault.
    pub fn rearm(&self, address: usize) -> Result<(), Error> {
        let page = self.page_of(address);
        let mut state = self.state.lock();

        if !state.pages.contains(page) {
            return Err(Error::NotGuarded(address));
        }
        self.protector.guard(address)?;
        state.pages.set_state(page, GuardState::Guarded);

        log::debug!("pageguard: re-armed page {:#x}", page);
        Ok(())
    }

    /// Pages currently tracked, ascending.
    pub fn tracked_pages(&self) -> Vec<usize> {
        self.state.lock().pages.pages()
    }

    /// Protection state of the page holding `address`, if tracked.
    pub fn page_state(&self, address: usize) -> Option<GuardState> {
        let page = self.page_of(address);
        self.state.lock().pages.get(page).map(|e| e.state)
    }

    /// Unguard every tracked page and empty both registries.
    ///
    /// Protection failures are logged and skipped so teardown always completes.
    pub fn clear(&self) {
        let mut state = self.state.lock();

        for page in state.pages.pages() {
            if let Err(err) = self.protector.unguard(page) {
                log::warn!("pageguard: teardown could not unguard: {}", err);
            }
        }

        let (hooks, watches) = (state.hooks.len(), state.watches.len());
        state.hooks.clear();
        state.watches.clear();
        state.pages.clear();
        state.traps.clear();
        state.call_through.clear();

        if hooks + watches > 0 {
            log::info!("pageguard: cleared {} hook(s), {} watch(es)", hooks, watches);
        }
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Count one more `owner` entry on `page`, guarding it if it was untracked
    /// or its guard lapsed with no trap pending. The count is dropped again if
    /// the guard fails.
    fn track(
        &self,
        state: &mut State,
        page: usize,
        owner: Owner,
        address: usize,
    ) -> Result<(), Error> {
        let fresh = state.pages.acquire(page, owner);
        let lapsed = !fresh
            && state.pages.get(page).is_some_and(|e| e.state == GuardState::TrapArmed)
            && !state.traps.any(|t| t.page == page);
        if !fresh && !lapsed {
            return Ok(());
        }

        if let Err(err) = self.protector.guard(address) {
            state.pages.release(page, owner, 1);
            return Err(err);
        }
        if lapsed {
            state.pages.set_state(page, GuardState::Guarded);
            log::debug!("pageguard: re-guarded lapsed page {:#x}", page);
        }
        Ok(())
    }

    fn retrack(
        state: &mut State,
        page: usize,
        owner: Owner,
        count: usize,
        prior: Option<GuardState>,
    ) {
        for _ in 0..count {
            state.pages.acquire(page, owner);
        }
        if let Some(prior) = prior {
            state.pages.set_state(page, prior);
        }
    }

    /// The tally must agree with a re-scan of both registries.
    fn check(&self, state: &State) {
        debug_assert!(
            state.pages.matches(
                state.hooks.iter().map(|h| self.page_of(h.origin)),
                state.watches.iter().map(|w| self.page_of(w.address)),
            ),
            "page tally out of sync with registries"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Access, TrapFrame};
    use crate::platform::mock::MockPlatform;

    fn on_access(_frame: &mut dyn TrapFrame, _access: Access) {}

    static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_watch_guard_and_unguard() {
        let engine = Engine::new(MockPlatform::new());
        engine
            .create_watch(0x1010, AccessMask::READ, on_access)
            .unwrap();
        assert!(engine.platform().is_guarded(0x1000));

        engine.remove_watch(0x1010).unwrap();
        assert!(!engine.platform().is_guarded(0x1000));
        assert!(engine.tracked_pages().is_empty());
    }

    #[test]
    fn test_hook_and_watch_share_page() {
        let engine = Engine::new(MockPlatform::new());
        engine.create_hook(0x4000, 0x9000, &ORIGINAL).unwrap();
        engine
            .create_watch(0x4800, AccessMask::WRITE, on_access)
            .unwrap();
        assert_eq!(engine.platform().call_count(), 1);

        engine.remove_hook(0x4000).unwrap();
        assert!(engine.platform().is_guarded(0x4000));

        engine.remove_watch(0x4800).unwrap();
        assert!(!engine.platform().is_guarded(0x4000));
    }

    #[test]
    fn test_failed_watch_leaves_earlier_watches() {
        let engine = Engine::new(MockPlatform::new());
        engine.create_watch(0x1000, AccessMask::READ, on_access).unwrap();
        engine.platform().fail_on(0x2000);

        assert!(engine.create_watch(0x2000, AccessMask::READ, on_access).is_err());
        let addresses: Vec<usize> = engine.watches().iter().map(|w| w.address).collect();
        assert_eq!(addresses, [0x1000]);
        assert_eq!(engine.tracked_pages(), [0x1000]);
    }

    #[test]
    fn test_new_entry_reguards_lapsed_page() {
        let engine = Engine::new(MockPlatform::new());
        engine.create_watch(0x6010, AccessMask::READ, on_access).unwrap();

        // Watch-only page after a trapped access, re-arming off.
        engine.platform().trip(0x6000);
        engine.state.lock().pages.set_state(0x6000, GuardState::TrapArmed);

        engine.create_hook(0x6000, 0x9000, &ORIGINAL).unwrap();
        assert!(engine.platform().is_guarded(0x6000));
        assert_eq!(engine.page_state(0x6000), Some(GuardState::Guarded));
    }

    #[test]
    fn test_lapsed_page_with_pending_trap_is_left_alone() {
        let engine = Engine::new(MockPlatform::new());
        engine.create_watch(0x7010, AccessMask::READ, on_access).unwrap();

        engine.platform().trip(0x7000);
        {
            let mut state = engine.state.lock();
            state.pages.set_state(0x7000, GuardState::TrapArmed);
            state.traps.insert(PendingTrap {
                thread: 1,
                page: 0x7000,
                origin: None,
                reguard: true,
            });
        }

        // The pending trap restores the guard one instruction later.
        engine.create_watch(0x7020, AccessMask::WRITE, on_access).unwrap();
        assert!(!engine.platform().is_guarded(0x7000));
        assert_eq!(engine.page_state(0x7000), Some(GuardState::TrapArmed));
    }

    #[test]
    fn test_failed_reguard_rolls_back_hook() {
        let engine = Engine::new(MockPlatform::new());
        engine.create_watch(0x8010, AccessMask::READ, on_access).unwrap();
        engine.platform().trip(0x8000);
        engine.state.lock().pages.set_state(0x8000, GuardState::TrapArmed);
        engine.platform().fail_on(0x8000);

        assert!(engine.create_hook(0x8000, 0x9000, &ORIGINAL).is_err());
        assert!(engine.hooks().is_empty());
        let entry = *engine.state.lock().pages.get(0x8000).unwrap();
        assert_eq!((entry.hooks, entry.watches), (0, 1));
        assert_eq!(entry.state, GuardState::TrapArmed);
    }

    #[test]
    fn test_rearm_untracked_page() {
        let engine = Engine::new(MockPlatform::new());
        assert!(matches!(engine.rearm(0x1000), Err(Error::NotGuarded(0x1000))));
    }
}
