//! Architecture support
//!
//! The memory subsystem calls through this module for everything that
//! touches hardware: TLB maintenance, control registers, the PSE probe,
//! and interrupt flag save/restore. On the host target the operations
//! degenerate to no-ops so the allocators and page-table code can run
//! under the standard test harness.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use x86::{
    interrupts_restore, interrupts_save_disable, invalidate_page, pse_supported, read_cr2,
    read_cr3, set_cr4_pse, tlb_flush_all, write_cr3_and_enable_paging,
};

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod host {
    //! Host stand-ins. TLB and control-register traffic has no meaning
    //! off-target; the paging layer still performs all of its bookkeeping.

    pub fn invalidate_page(_vaddr: usize) {}

    pub fn tlb_flush_all() {}

    pub fn read_cr2() -> usize {
        0
    }

    pub fn read_cr3() -> usize {
        0
    }

    pub fn write_cr3_and_enable_paging(_pd_phys: usize) {}

    /// The host "CPU" reports PSE so tests cover the 4 MiB mapping paths.
    pub fn pse_supported() -> bool {
        true
    }

    pub fn set_cr4_pse() {}

    pub fn interrupts_save_disable() -> u32 {
        0
    }

    pub fn interrupts_restore(_flags: u32) {}
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::{
    interrupts_restore, interrupts_save_disable, invalidate_page, pse_supported, read_cr2,
    read_cr3, set_cr4_pse, tlb_flush_all, write_cr3_and_enable_paging,
};
