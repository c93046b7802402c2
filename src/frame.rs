//! Fault description and the register context of the faulting thread.
//!
//! The dispatcher never touches OS context records directly: every register
//! read or write goes through [`TrapFrame`], which each platform backend
//! implements over its own saved context (a Windows `CONTEXT`, a Linux
//! `ucontext_t`). Tests drive the dispatcher with [`SimFrame`].

/// Kind of memory access that raised a guard fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Execute,
}

impl Access {
    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Execute => "execute",
        }
    }
}

/// A fault as classified by the platform backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Access to a guarded page.
    ///
    /// `address` is the accessed byte for reads and writes; for instruction
    /// fetches the dispatcher uses the frame's instruction pointer.
    Guard { access: Access, address: usize },
    /// The single-instruction trap armed by a previous fault fired.
    SingleStep,
}

/// What the backend should tell the OS after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The fault was serviced; resume the faulting thread.
    ContinueExecution,
    /// Not ours; let other handlers in the process look at it.
    ContinueSearch,
}

/// Mutable view of the faulting thread's registers.
pub trait TrapFrame {
    /// Current instruction pointer.
    fn instruction_pointer(&self) -> usize;

    /// Redirect the thread to `ip` when it resumes.
    fn set_instruction_pointer(&mut self, ip: usize);

    /// Current stack pointer.
    fn stack_pointer(&self) -> usize;

    /// Integer argument register `idx` of the platform calling convention.
    /// Returns 0 past the register-passed arguments.
    fn arg(&self, idx: usize) -> u64;

    /// Request a trap after the next instruction executes.
    fn set_single_step(&mut self);

    /// Drop a pending single-instruction trap request.
    fn clear_single_step(&mut self);

    /// Whether a single-instruction trap is requested.
    fn single_step(&self) -> bool;
}

/// EFLAGS trap flag bit on x86.
pub const TRAP_FLAG: u64 = 0x100;

/// A plain register snapshot used to simulate faults.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimFrame {
    pub ip: usize,
    pub sp: usize,
    pub args: [u64; 4],
    pub flags: u64,
}

#[cfg(any(test, feature = "test-utils"))]
impl SimFrame {
    /// Frame positioned at `ip`.
    pub fn at(ip: usize) -> Self {
        Self {
            ip,
            sp: 0x7fff_0000,
            ..Default::default()
        }
    }

    /// Set arguments.
    pub fn with_args(mut self, args: [u64; 4]) -> Self {
        self.args = args;
        self
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl TrapFrame for SimFrame {
    fn instruction_pointer(&self) -> usize {
        self.ip
    }

    fn set_instruction_pointer(&mut self, ip: usize) {
        self.ip = ip;
    }

    fn stack_pointer(&self) -> usize {
        self.sp
    }

    fn arg(&self, idx: usize) -> u64 {
        self.args.get(idx).copied().unwrap_or(0)
    }

    fn set_single_step(&mut self) {
        self.flags |= TRAP_FLAG;
    }

    fn clear_single_step(&mut self) {
        self.flags &= !TRAP_FLAG;
    }

    fn single_step(&self) -> bool {
        self.flags & TRAP_FLAG != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_frame_trap_flag() {
        let mut frame = SimFrame::at(0x1000);
        assert!(!frame.single_step());

        frame.set_single_step();
        assert!(frame.single_step());
        assert_eq!(frame.flags, TRAP_FLAG);

        frame.clear_single_step();
        assert!(!frame.single_step());
    }

    #[test]
    fn test_sim_frame_args() {
        let frame = SimFrame::at(0x1000).with_args([1, 2, 3, 4]);
        assert_eq!(frame.arg(0), 1);
        assert_eq!(frame.arg(3), 4);
        assert_eq!(frame.arg(4), 0);
    }
}
