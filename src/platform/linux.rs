//! Linux x86_64 backend.
//!
//! Linux has no guard-page attribute for user mappings, so it is emulated:
//! a guarded page is mapped `PROT_NONE`, and the SIGSEGV handler restores the
//! page's saved protection before dispatching, which clears the guard exactly
//! once per fault like the native attribute does. Single-step traps arrive as
//! SIGTRAP with `si_code == TRAP_TRACE`.
//!
//! Signals the engine does not claim are forwarded to whatever action was
//! installed before ours.

use alloc::collections::BTreeMap;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use axerrno::AxResult;
use libc::{c_int, siginfo_t, ucontext_t};

use super::{PageOps, page_base};
use crate::frame::{Access, Disposition, FaultKind, TRAP_FLAG, TrapFrame};

/// `si_code` of a SIGTRAP raised by the trap flag.
const TRAP_TRACE: c_int = 2;

/// Page-fault error code bits.
const PF_WRITE: i64 = 1 << 1;
const PF_INSTR: i64 = 1 << 4;

/// Saved protection of an emulated guard page.
#[derive(Debug, Clone, Copy)]
struct SavedPage {
    prot: c_int,
    armed: bool,
}

static SAVED: Mutex<BTreeMap<usize, SavedPage>> = Mutex::new(BTreeMap::new());

/// Signal actions replaced by ours: (SIGSEGV, SIGTRAP).
static PREVIOUS: Mutex<Option<(libc::sigaction, libc::sigaction)>> = Mutex::new(None);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Native page operations.
#[derive(Debug, Default)]
pub struct NativePlatform;

impl NativePlatform {
    pub const fn new() -> Self {
        Self
    }
}

impl PageOps for NativePlatform {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 0x1000 }
    }

    fn set_guard(&self, page: usize, len: usize, guarded: bool) -> AxResult {
        let mut saved = SAVED.lock();

        if guarded {
            let prot = match saved.get(&page) {
                Some(entry) => entry.prot,
                None => mapping_prot(page)?,
            };
            protect(page, len, libc::PROT_NONE)?;
            saved.insert(page, SavedPage { prot, armed: true });
        } else if let Some(entry) = saved.get(&page).copied() {
            protect(page, len, entry.prot)?;
            saved.remove(&page);
        }
        Ok(())
    }

    fn thread_id(&self) -> u64 {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
}

fn protect(page: usize, len: usize, prot: c_int) -> AxResult {
    // SAFETY: `page` is page aligned; callers only pass pages of live mappings.
    let ret = unsafe { libc::mprotect(page as *mut c_void, len, prot) };
    if ret != 0 {
        return axerrno::ax_err!(PermissionDenied, "mprotect failed");
    }
    Ok(())
}

/// Current protection of the mapping containing `page`, from `/proc/self/maps`.
fn mapping_prot(page: usize) -> AxResult<c_int> {
    let maps = match std::fs::read_to_string("/proc/self/maps") {
        Ok(maps) => maps,
        Err(_) => return axerrno::ax_err!(Io, "cannot read /proc/self/maps"),
    };

    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            continue;
        };
        if (start..end).contains(&page) {
            return Ok(parse_perms(perms));
        }
    }
    axerrno::ax_err!(BadAddress, "address is not mapped")
}

fn parse_perms(perms: &str) -> c_int {
    let bytes = perms.as_bytes();
    let mut prot = libc::PROT_NONE;
    if bytes.first() == Some(&b'r') {
        prot |= libc::PROT_READ;
    }
    if bytes.get(1) == Some(&b'w') {
        prot |= libc::PROT_WRITE;
    }
    if bytes.get(2) == Some(&b'x') {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// What a SIGSEGV at some address means for the emulated guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lapse {
    /// Not a page we guard.
    Foreign,
    /// The guard was armed and is now cleared: a guard fault to dispatch.
    Cleared,
    /// Another thread cleared the guard between this fault and its handler.
    /// Retrying the instruction is enough.
    Raced,
}

fn permits(prot: c_int, access: Access) -> bool {
    let needed = match access {
        Access::Read => libc::PROT_READ,
        Access::Write => libc::PROT_WRITE,
        Access::Execute => libc::PROT_EXEC,
    };
    prot & needed != 0
}

/// Undo the emulated guard on the page holding `addr` if it is armed.
///
/// A fault on a page whose guard is already cleared is a race only if the
/// restored protection allows `access`; otherwise it is a genuine fault.
fn lapse(addr: usize, access: Access) -> Lapse {
    let page_size = NativePlatform.page_size();
    let page = page_base(addr, page_size);

    let mut saved = SAVED.lock();
    let Some(entry) = saved.get_mut(&page) else {
        return Lapse::Foreign;
    };
    if !entry.armed {
        return if permits(entry.prot, access) {
            Lapse::Raced
        } else {
            Lapse::Foreign
        };
    }
    if protect(page, page_size, entry.prot).is_err() {
        return Lapse::Foreign;
    }
    entry.armed = false;
    Lapse::Cleared
}

// =============================================================================
// Register Context
// =============================================================================

/// [`TrapFrame`] over the `ucontext_t` the kernel saved for the signal.
struct UnixFrame<'a> {
    ctx: &'a mut ucontext_t,
}

impl UnixFrame<'_> {
    fn reg(&self, idx: c_int) -> u64 {
        self.ctx.uc_mcontext.gregs[idx as usize] as u64
    }

    fn set_reg(&mut self, idx: c_int, value: u64) {
        self.ctx.uc_mcontext.gregs[idx as usize] = value as i64;
    }
}

impl TrapFrame for UnixFrame<'_> {
    fn instruction_pointer(&self) -> usize {
        self.reg(libc::REG_RIP) as usize
    }

    fn set_instruction_pointer(&mut self, ip: usize) {
        self.set_reg(libc::REG_RIP, ip as u64);
    }

    fn stack_pointer(&self) -> usize {
        self.reg(libc::REG_RSP) as usize
    }

    /// System V argument registers.
    fn arg(&self, idx: usize) -> u64 {
        match idx {
            0 => self.reg(libc::REG_RDI),
            1 => self.reg(libc::REG_RSI),
            2 => self.reg(libc::REG_RDX),
            3 => self.reg(libc::REG_RCX),
            4 => self.reg(libc::REG_R8),
            5 => self.reg(libc::REG_R9),
            _ => 0,
        }
    }

    fn set_single_step(&mut self) {
        let flags = self.reg(libc::REG_EFL);
        self.set_reg(libc::REG_EFL, flags | TRAP_FLAG);
    }

    fn clear_single_step(&mut self) {
        let flags = self.reg(libc::REG_EFL);
        self.set_reg(libc::REG_EFL, flags & !TRAP_FLAG);
    }

    fn single_step(&self) -> bool {
        self.reg(libc::REG_EFL) & TRAP_FLAG != 0
    }
}

// =============================================================================
// Signal Handling
// =============================================================================

unsafe extern "C" fn on_signal(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    if info.is_null() || ctx.is_null() {
        forward(sig, info, ctx);
        return;
    }

    // SAFETY: the kernel passes a valid ucontext_t for SA_SIGINFO handlers.
    let mut frame = UnixFrame {
        ctx: unsafe { &mut *(ctx as *mut ucontext_t) },
    };

    let fault = match sig {
        libc::SIGSEGV => {
            // SAFETY: si_addr is valid for SIGSEGV.
            let addr = unsafe { (*info).si_addr() } as usize;
            let err = frame.ctx.uc_mcontext.gregs[libc::REG_ERR as usize];
            let access = if err & PF_INSTR != 0 || addr == frame.instruction_pointer() {
                Access::Execute
            } else if err & PF_WRITE != 0 {
                Access::Write
            } else {
                Access::Read
            };
            match lapse(addr, access) {
                Lapse::Cleared => {}
                Lapse::Raced => return,
                Lapse::Foreign => {
                    forward(sig, info, ctx);
                    return;
                }
            }
            FaultKind::Guard {
                access,
                address: addr,
            }
        }
        // SAFETY: info was checked non-null above.
        libc::SIGTRAP if unsafe { (*info).si_code } == TRAP_TRACE => FaultKind::SingleStep,
        _ => {
            forward(sig, info, ctx);
            return;
        }
    };

    if crate::lifecycle::dispatch(fault, &mut frame) == Disposition::ContinueSearch {
        forward(sig, info, ctx);
    }
}

/// Hand a signal we do not claim to the action installed before ours.
fn forward(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let previous = match *PREVIOUS.lock() {
        Some((segv, trap)) => {
            if sig == libc::SIGSEGV {
                segv
            } else {
                trap
            }
        }
        None => return,
    };

    if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
        // The faulting instruction re-executes and takes the default action.
        let fallback = fallback_action(&previous);
        // SAFETY: `fallback` is a copy of an action returned by sigaction.
        unsafe { libc::sigaction(sig, &fallback, core::ptr::null_mut()) };
        return;
    }

    if previous.sa_flags & libc::SA_SIGINFO != 0 {
        // SAFETY: SA_SIGINFO means sa_sigaction holds a three-argument handler.
        let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
            unsafe { core::mem::transmute(previous.sa_sigaction) };
        handler(sig, info, ctx);
    } else {
        // SAFETY: without SA_SIGINFO sa_sigaction holds a one-argument handler.
        let handler: extern "C" fn(c_int) = unsafe { core::mem::transmute(previous.sa_sigaction) };
        handler(sig);
    }
}

/// Action to reinstate for a signal whose previous action was not a handler.
///
/// An ignored fault would re-execute forever, so `SIG_IGN` becomes `SIG_DFL`.
fn fallback_action(previous: &libc::sigaction) -> libc::sigaction {
    let mut action = *previous;
    if action.sa_sigaction == libc::SIG_IGN {
        action.sa_sigaction = libc::SIG_DFL;
    }
    action
}

/// Install the SIGSEGV and SIGTRAP handlers.
///
/// Signal handlers have no chain order, so `_first` is ignored: ours always
/// runs and forwards what it does not claim.
pub fn install_handler(_first: bool) -> AxResult {
    if INSTALLED.load(Ordering::SeqCst) {
        return Ok(());
    }

    // SAFETY: zeroed sigaction is a valid starting value; every field we rely
    // on is set below.
    let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
    action.sa_sigaction = on_signal as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    // SAFETY: sa_mask is a plain sigset_t owned by `action`.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    // SAFETY: as above.
    let mut old_segv: libc::sigaction = unsafe { core::mem::zeroed() };
    let mut old_trap: libc::sigaction = unsafe { core::mem::zeroed() };

    // SAFETY: both pointers reference live sigaction values.
    if unsafe { libc::sigaction(libc::SIGSEGV, &action, &mut old_segv) } != 0 {
        return axerrno::ax_err!(BadState, "sigaction(SIGSEGV) failed");
    }
    // SAFETY: as above.
    if unsafe { libc::sigaction(libc::SIGTRAP, &action, &mut old_trap) } != 0 {
        // SAFETY: restoring the action just replaced.
        unsafe { libc::sigaction(libc::SIGSEGV, &old_segv, core::ptr::null_mut()) };
        return axerrno::ax_err!(BadState, "sigaction(SIGTRAP) failed");
    }

    *PREVIOUS.lock() = Some((old_segv, old_trap));
    INSTALLED.store(true, Ordering::SeqCst);
    log::debug!("linux: SIGSEGV/SIGTRAP handlers installed");
    Ok(())
}

/// Reinstate the signal actions replaced by [`install_handler`].
pub fn remove_handler() -> AxResult {
    if !INSTALLED.swap(false, Ordering::SeqCst) {
        return Ok(());
    }

    if let Some((segv, trap)) = PREVIOUS.lock().take() {
        // SAFETY: both values were returned by sigaction.
        unsafe {
            libc::sigaction(libc::SIGSEGV, &segv, core::ptr::null_mut());
            libc::sigaction(libc::SIGTRAP, &trap, core::ptr::null_mut());
        }
    }
    log::debug!("linux: signal handlers removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_perms() {
        assert_eq!(parse_perms("r-xp"), libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(parse_perms("rw-p"), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(parse_perms("---p"), libc::PROT_NONE);
    }

    #[test]
    fn test_ignored_fault_falls_back_to_default() {
        // SAFETY: zeroed sigaction is a valid value.
        let mut ignored: libc::sigaction = unsafe { core::mem::zeroed() };
        ignored.sa_sigaction = libc::SIG_IGN;
        assert_eq!(fallback_action(&ignored).sa_sigaction, libc::SIG_DFL);

        // SAFETY: as above.
        let mut default: libc::sigaction = unsafe { core::mem::zeroed() };
        default.sa_sigaction = libc::SIG_DFL;
        default.sa_flags = libc::SA_RESTART;
        let fallback = fallback_action(&default);
        assert_eq!(fallback.sa_sigaction, libc::SIG_DFL);
        assert_eq!(fallback.sa_flags, libc::SA_RESTART);
    }

    #[test]
    fn test_lapse_classifies_faults() {
        let platform = NativePlatform::new();
        let size = platform.page_size();

        // SAFETY: fresh anonymous read-only mapping, unmapped at the end of
        // the test.
        let page = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        let page = page as usize;

        assert_eq!(lapse(page + 8, Access::Read), Lapse::Foreign);
        platform.set_guard(page, size, true).unwrap();
        assert_eq!(lapse(page + 8, Access::Read), Lapse::Cleared);
        // A second thread faulting on the same page before the re-guard.
        assert_eq!(lapse(page + 16, Access::Read), Lapse::Raced);
        // The restored protection still refuses writes.
        assert_eq!(lapse(page + 16, Access::Write), Lapse::Foreign);

        platform.set_guard(page, size, false).unwrap();
        assert_eq!(lapse(page, Access::Read), Lapse::Foreign);
        // SAFETY: the page is unguarded and owned by this test.
        unsafe { libc::munmap(page as *mut c_void, size) };
    }

    #[test]
    fn test_guard_round_trip_on_owned_page() {
        let platform = NativePlatform::new();
        let size = platform.page_size();

        // SAFETY: fresh anonymous mapping, unmapped at the end of the test.
        let page = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        let page = page as usize;

        platform.set_guard(page, size, true).unwrap();
        assert!(SAVED.lock().get(&page).is_some_and(|e| e.armed));
        platform.set_guard(page, size, false).unwrap();
        assert!(SAVED.lock().get(&page).is_none());

        // Protection is back to read/write.
        // SAFETY: the page is mapped read/write again.
        unsafe {
            (page as *mut u8).write_volatile(7);
            assert_eq!((page as *const u8).read_volatile(), 7);
            libc::munmap(page as *mut c_void, size);
        }
    }
}
