//! Windows x86_64 backend.
//!
//! Guard pages are native here: `PAGE_GUARD` is OR-ed into the page's current
//! protection and the OS clears it when it raises `STATUS_GUARD_PAGE_VIOLATION`.
//! Faults reach the engine through a vectored exception handler.

use core::ffi::c_void;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::AxResult;
use windows::Win32::Foundation::{EXCEPTION_SINGLE_STEP, STATUS_GUARD_PAGE_VIOLATION};
use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, CONTEXT, EXCEPTION_POINTERS, RemoveVectoredExceptionHandler,
};
use windows::Win32::System::Memory::{
    MEMORY_BASIC_INFORMATION, PAGE_GUARD, PAGE_PROTECTION_FLAGS, VirtualProtect, VirtualQuery,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::Threading::GetCurrentThreadId;

use super::PageOps;
use crate::frame::{Access, Disposition, FaultKind, TRAP_FLAG, TrapFrame};

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// `ExceptionInformation[0]` of an access violation.
const ACCESS_READ: usize = 0;
const ACCESS_WRITE: usize = 1;
const ACCESS_EXECUTE: usize = 8;

/// Handle returned by `AddVectoredExceptionHandler` (0 when not installed).
static HANDLER: AtomicUsize = AtomicUsize::new(0);

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
        let mut info = SYSTEM_INFO::default();
        // SAFETY: `info` is a valid out pointer.
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    fn set_guard(&self, page: usize, len: usize, guarded: bool) -> AxResult {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();
        // SAFETY: `mbi` is a valid out buffer of the size passed.
        let written = unsafe {
            VirtualQuery(
                Some(page as *const c_void),
                &mut mbi,
                core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return axerrno::ax_err!(BadAddress, "VirtualQuery failed");
        }

        let protect = if guarded {
            PAGE_PROTECTION_FLAGS(mbi.Protect.0 | PAGE_GUARD.0)
        } else {
            PAGE_PROTECTION_FLAGS(mbi.Protect.0 & !PAGE_GUARD.0)
        };

        let mut old = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: `page` lies in a committed region reported by VirtualQuery.
        if unsafe { VirtualProtect(page as *const c_void, len, protect, &mut old) }.is_err() {
            return axerrno::ax_err!(PermissionDenied, "VirtualProtect failed");
        }
        Ok(())
    }

    fn thread_id(&self) -> u64 {
        // SAFETY: no preconditions.
        unsafe { GetCurrentThreadId() as u64 }
    }
}

// =============================================================================
// Register Context
// =============================================================================

/// [`TrapFrame`] over the `CONTEXT` record of the faulting thread.
struct WindowsFrame<'a> {
    ctx: &'a mut CONTEXT,
}

impl TrapFrame for WindowsFrame<'_> {
    fn instruction_pointer(&self) -> usize {
        self.ctx.Rip as usize
    }

    fn set_instruction_pointer(&mut self, ip: usize) {
        self.ctx.Rip = ip as u64;
    }

    fn stack_pointer(&self) -> usize {
        self.ctx.Rsp as usize
    }

    /// Microsoft x64 argument registers.
    fn arg(&self, idx: usize) -> u64 {
        match idx {
            0 => self.ctx.Rcx,
            1 => self.ctx.Rdx,
            2 => self.ctx.R8,
            3 => self.ctx.R9,
            _ => 0,
        }
    }

    fn set_single_step(&mut self) {
        self.ctx.EFlags |= TRAP_FLAG as u32;
    }

    fn clear_single_step(&mut self) {
        self.ctx.EFlags &= !(TRAP_FLAG as u32);
    }

    fn single_step(&self) -> bool {
        self.ctx.EFlags & TRAP_FLAG as u32 != 0
    }
}

// =============================================================================
// Exception Handling
// =============================================================================

unsafe extern "system" fn on_exception(info: *mut EXCEPTION_POINTERS) -> i32 {
    if info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    // SAFETY: the OS passes valid exception pointers to vectored handlers.
    let (record, context) = unsafe { ((*info).ExceptionRecord, (*info).ContextRecord) };
    if record.is_null() || context.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    // SAFETY: checked non-null; both records live until the handler returns.
    let (record, context) = unsafe { (&*record, &mut *context) };

    let fault = if record.ExceptionCode == STATUS_GUARD_PAGE_VIOLATION {
        if record.NumberParameters < 2 {
            return EXCEPTION_CONTINUE_SEARCH;
        }
        let access = match record.ExceptionInformation[0] {
            ACCESS_READ => Access::Read,
            ACCESS_WRITE => Access::Write,
            ACCESS_EXECUTE => Access::Execute,
            _ => return EXCEPTION_CONTINUE_SEARCH,
        };
        FaultKind::Guard {
            access,
            address: record.ExceptionInformation[1],
        }
    } else if record.ExceptionCode == EXCEPTION_SINGLE_STEP {
        FaultKind::SingleStep
    } else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    let mut frame = WindowsFrame { ctx: context };
    match crate::lifecycle::dispatch(fault, &mut frame) {
        Disposition::ContinueExecution => EXCEPTION_CONTINUE_EXECUTION,
        Disposition::ContinueSearch => EXCEPTION_CONTINUE_SEARCH,
    }
}

/// Register the vectored exception handler, at the front of the chain when
/// `first` is set.
pub fn install_handler(first: bool) -> AxResult {
    if HANDLER.load(Ordering::SeqCst) != 0 {
        return Ok(());
    }

    // SAFETY: `on_exception` has the signature the OS expects.
    let handle = unsafe { AddVectoredExceptionHandler(first as u32, Some(on_exception)) };
    if handle.is_null() {
        return axerrno::ax_err!(BadState, "AddVectoredExceptionHandler failed");
    }
    HANDLER.store(handle as usize, Ordering::SeqCst);
    log::debug!("windows: vectored handler installed (first = {})", first);
    Ok(())
}

/// Unregister the vectored exception handler.
pub fn remove_handler() -> AxResult {
    let handle = HANDLER.swap(0, Ordering::SeqCst);
    if handle == 0 {
        return Ok(());
    }

    // SAFETY: `handle` came from AddVectoredExceptionHandler.
    if unsafe { RemoveVectoredExceptionHandler(handle as *const c_void) } == 0 {
        return axerrno::ax_err!(BadState, "RemoveVectoredExceptionHandler failed");
    }
    log::debug!("windows: vectored handler removed");
    Ok(())
}
