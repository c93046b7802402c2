//! Fault dispatcher for guard-page and single-step events.
//!
//! The interception flow per guarded page:
//! 1. Any access to the page raises a guard fault, and the OS clears the
//!    guard attribute as part of delivering it.
//! 2. The dispatcher services the fault (redirects a hooked entry point or
//!    runs the matching watch callbacks), records a pending trap for the
//!    faulting thread and sets the trap flag.
//! 3. One instruction later the single-step fault fires and the dispatcher
//!    re-applies the guard, unless the page only hosts watches and watch
//!    re-arming is off.
//!
//! A redirected thread may call the original function through its slot: an
//! entry at the origin on the same thread, with a stack pointer below the
//! one the redirection saw, runs the original code once. Stacks are assumed
//! to grow down.
//!
//! Backends classify the OS event into a [`FaultKind`] and hand the
//! dispatcher a [`TrapFrame`]; the answer tells them whether the fault was
//! consumed. Nothing on this path allocates.

use crate::engine::{CallThrough, Engine, PendingTrap, State};
use crate::frame::{Access, Disposition, FaultKind, TrapFrame};
use crate::page::GuardState;
use crate::platform::PageOps;
use crate::watch::Fired;

impl<P: PageOps> Engine<P> {
    /// Service one fault raised on the calling thread.
    pub fn dispatch(&self, fault: FaultKind, frame: &mut dyn TrapFrame) -> Disposition {
        match fault {
            FaultKind::Guard {
                access: Access::Execute,
                ..
            } => self.on_execute(frame),
            FaultKind::Guard { access, address } => self.on_access(access, address, frame),
            FaultKind::SingleStep => self.on_single_step(frame),
        }
    }

    /// Read or write on a guarded page.
    fn on_access(&self, access: Access, address: usize, frame: &mut dyn TrapFrame) -> Disposition {
        let page = self.page_of(address);
        let thread = self.platform().thread_id();

        let mut fired = Fired::new();
        let (dropped, armed) = {
            let mut state = self.state.lock();
            if !state.pages.contains(page) {
                return Disposition::ContinueSearch;
            }

            let reguard = state.pages.has_hooks(page) || self.rearm_watches();
            state.pages.set_state(page, GuardState::TrapArmed);
            let armed = Self::arm(
                &mut state,
                PendingTrap {
                    thread,
                    page,
                    origin: None,
                    reguard,
                },
            );
            (state.watches.fire(address, access, &mut fired), armed)
        };

        if dropped > 0 {
            log::warn!("dispatch: skipped {} callback(s) at {:#x}", dropped, address);
        }
        log::trace!(
            "dispatch: {} at {:#x} (ip {:#x}), {} callback(s)",
            access.label(),
            address,
            frame.instruction_pointer(),
            fired.len()
        );

        // Callbacks may register or remove entries, so the lock is released.
        for &callback in fired.iter() {
            callback(frame, access);
        }

        if armed {
            frame.set_single_step();
        }
        Disposition::ContinueExecution
    }

    /// Instruction fetch on a guarded page.
    fn on_execute(&self, frame: &mut dyn TrapFrame) -> Disposition {
        let ip = frame.instruction_pointer();
        let sp = frame.stack_pointer();
        let page = self.page_of(ip);
        let thread = self.platform().thread_id();

        let mut state = self.state.lock();
        if !state.pages.contains(page) {
            return Disposition::ContinueSearch;
        }

        let room = !state.traps.is_full();
        // A token left by an earlier redirection only admits calls made from
        // deeper in the stack, i.e. from inside the target.
        let passes = state
            .call_through
            .take(|t| t.thread == thread && t.origin == ip)
            .is_some_and(|t| sp < t.sp);
        let mut redirected = false;
        let origin = match state.hooks.get_mut(ip) {
            Some(hook) if hook.reentry_suppressed => {
                hook.reentry_suppressed = false;
                log::trace!("dispatch: suppressed re-entry at {:#x}", ip);
                Some(ip)
            }
            Some(_) if passes => {
                log::trace!("dispatch: call-through at {:#x}", ip);
                Some(ip)
            }
            Some(hook) => {
                hook.publish_original(ip);
                // Cleared by the single step, which needs a trap slot.
                hook.reentry_suppressed = room;
                hook.hits += 1;
                frame.set_instruction_pointer(hook.target);
                redirected = true;
                log::trace!("dispatch: redirect {:#x} -> {:#x}", ip, hook.target);
                Some(ip)
            }
            None => None,
        };
        if redirected {
            let token = CallThrough {
                thread,
                origin: ip,
                sp,
            };
            if let Some(evicted) = state.call_through.insert_evicting(token) {
                log::debug!(
                    "dispatch: dropped call-through token for {:#x} (thread {})",
                    evicted.origin,
                    evicted.thread
                );
            }
        }

        let reguard = state.pages.has_hooks(page) || self.rearm_watches();
        state.pages.set_state(page, GuardState::TrapArmed);
        let armed = Self::arm(
            &mut state,
            PendingTrap {
                thread,
                page,
                origin,
                reguard,
            },
        );
        drop(state);

        if armed {
            frame.set_single_step();
        }
        Disposition::ContinueExecution
    }

    /// The trap armed by an earlier fault on this thread fired.
    fn on_single_step(&self, frame: &mut dyn TrapFrame) -> Disposition {
        let thread = self.platform().thread_id();
        let mut state = self.state.lock();

        let mut ours = false;
        while let Some(trap) = state.traps.take(|t| t.thread == thread) {
            ours = true;
            // The redirected instruction has retired.
            if let Some(origin) = trap.origin {
                if let Some(hook) = state.hooks.get_mut(origin) {
                    hook.reentry_suppressed = false;
                }
            }
            // Entries may have been removed while the trap was pending.
            if !trap.reguard || !state.pages.contains(trap.page) {
                continue;
            }
            match self.protector.guard(trap.page) {
                Ok(()) => state.pages.set_state(trap.page, GuardState::Guarded),
                Err(err) => log::error!(
                    "dispatch: re-guard after step failed (origin {:?}): {}",
                    trap.origin,
                    err
                ),
            }
        }
        drop(state);

        if !ours {
            return Disposition::ContinueSearch;
        }
        frame.clear_single_step();
        Disposition::ContinueExecution
    }

    /// Record `trap` for the thread's next single step. Returns false when
    /// every slot is taken; the page then stays lapsed until re-armed.
    fn arm(state: &mut State, trap: PendingTrap) -> bool {
        if state.traps.insert(trap) {
            return true;
        }
        log::error!(
            "dispatch: no free trap slot, page {:#x} left unguarded",
            trap.page
        );
        false
    }
}
