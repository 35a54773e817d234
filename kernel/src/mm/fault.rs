//! Page-fault dispatch
//!
//! The architecture trap stub reads CR2 and the CPU-pushed error code,
//! builds a [`PageFaultInfo`], and calls [`fault_action`] — a pure
//! function deciding what happens next. Kernel-mode faults consult the
//! exception table first (a fault inside a user-copy routine resumes at
//! its fix-up); everything else goes to the current address space's VMA
//! servicer. What cannot be resolved is a SIGSEGV for user mode and a
//! panic for kernel mode.

use super::vma::AddressSpace;
use crate::mm;

/// Decoded page-fault state.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// Faulting linear address (CR2).
    pub addr: usize,
    /// Bit 0 of the error code: the page was present.
    pub present: bool,
    /// Bit 1: the access was a write.
    pub write: bool,
    /// Bit 2: the access came from user mode.
    pub user: bool,
    /// Bit 4: the access was an instruction fetch.
    pub instruction_fetch: bool,
    /// EIP at the time of the fault.
    pub eip: usize,
}

impl PageFaultInfo {
    /// Decode the x86 page-fault error code.
    pub fn from_error_code(cr2: usize, error_code: u32, eip: usize) -> Self {
        Self {
            addr: cr2,
            present: error_code & 1 != 0,
            write: error_code & 2 != 0,
            user: error_code & 4 != 0,
            instruction_fetch: error_code & 16 != 0,
            eip,
        }
    }
}

/// What the trap stub should do after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// The mapping was repaired; re-run the faulting instruction.
    Resolved,
    /// Rewrite the saved EIP to this fix-up address and IRET.
    Resume(usize),
    /// Unresolvable user fault: deliver the segmentation fault.
    Segv { addr: usize },
    /// Unresolvable kernel fault.
    Panic { addr: usize },
}

/// Dispatch against an explicit address space (the testable core).
pub fn fault_action_for(mm: Option<&AddressSpace>, info: &PageFaultInfo) -> FaultAction {
    // Kernel-mode faults get the fix-up table first: a fault inside a
    // user-copy routine must resume at its fix-up and report a residual,
    // not grow into VMA servicing.
    if !info.user {
        if let Some(fixup) = super::user::exception_fixup(info.eip) {
            return FaultAction::Resume(fixup);
        }
    }

    match mm {
        Some(mm) => match mm.handle_fault(info) {
            Ok(()) => FaultAction::Resolved,
            Err(_) if info.user => FaultAction::Segv { addr: info.addr },
            Err(_) => FaultAction::Panic { addr: info.addr },
        },
        None if info.user => FaultAction::Segv { addr: info.addr },
        None => FaultAction::Panic { addr: info.addr },
    }
}

/// Dispatch against the current process's address space.
pub fn fault_action(info: &PageFaultInfo) -> FaultAction {
    fault_action_for(mm::current_mm(), info)
}

/// Entry point for the architecture trap stub: decode, dispatch, and
/// either return the fix-up EIP to install or panic in place.
pub fn handle_page_fault(error_code: u32, eip: usize) -> Option<usize> {
    let cr2 = crate::arch::read_cr2();
    let info = PageFaultInfo::from_error_code(cr2, error_code, eip);
    match fault_action(&info) {
        FaultAction::Resolved => None,
        FaultAction::Resume(fixup) => Some(fixup),
        FaultAction::Segv { addr } => {
            // The process layer turns this into process termination; there
            // is no process layer in this crate, so log and stop the task
            // by panicking in its context.
            panic!("SIGSEGV: user fault at {:#x} (eip {:#x})", addr, eip);
        }
        FaultAction::Panic { addr } => {
            panic!("unhandled kernel page fault at {:#x} (eip {:#x})", addr, eip);
        }
    }
}
