//! RISC-V 64 architecture support: CSR access, hart identity, SBI calls,
//! the kernel trap vector, and device-tree parsing.

pub mod dtb;
pub mod sbi;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod trap;

/// Saved user/trap register state.
///
/// Register indices follow the RISC-V integer register numbering
/// (`regs[1]` = ra, `regs[2]` = sp, `regs[10]` = a0, ...).
#[repr(C)]
#[derive(Clone)]
pub struct TrapFrame {
    pub regs: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
}

/// Index of a0 in `TrapFrame::regs`.
pub const REG_A0: usize = 10;
/// Index of sp in `TrapFrame::regs`.
pub const REG_SP: usize = 2;
/// Index of tp in `TrapFrame::regs`.
pub const REG_TP: usize = 4;

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 32],
            sepc: 0,
            sstatus: 0,
        }
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Get the current hart id.
///
/// The boot path stores the hart id in `tp` before any of this code runs
/// (kernel threads never touch `tp`).
#[inline]
pub fn cpu_id() -> usize {
    #[cfg(target_arch = "riscv64")]
    {
        let id: usize;
        unsafe { core::arch::asm!("mv {}, tp", out(reg) id) };
        id
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Store the hart id in `tp`. Called once per hart, before interrupts.
#[cfg(target_arch = "riscv64")]
pub unsafe fn set_cpu_id(hartid: usize) {
    unsafe { core::arch::asm!("mv tp, {}", in(reg) hartid) };
}

/// Are device interrupts enabled on this hart?
#[inline]
pub fn intr_get() -> bool {
    #[cfg(target_arch = "riscv64")]
    {
        riscv::register::sstatus::read().sie()
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        false
    }
}

/// Enable device interrupts.
#[inline]
pub fn intr_on() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        riscv::register::sstatus::set_sie()
    }
}

/// Disable device interrupts.
#[inline]
pub fn intr_off() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        riscv::register::sstatus::clear_sie()
    }
}

/// Read the monotonic `time` CSR (counts at the platform timebase).
#[inline]
pub fn read_time() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        riscv::register::time::read64()
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Stall until the next interrupt (or a bounded spin on hosted builds).
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("wfi")
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}

/// Read the current frame pointer (s0).
#[inline]
pub fn read_fp() -> usize {
    #[cfg(target_arch = "riscv64")]
    {
        let fp: usize;
        unsafe { core::arch::asm!("mv {}, s0", out(reg) fp) };
        fp
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

/// Raise a supervisor software interrupt pending bit locally (used by tests
/// of the IPI bookkeeping; real IPIs arrive via SBI).
#[cfg(target_arch = "riscv64")]
pub fn clear_soft_pending() {
    unsafe { riscv::register::sip::clear_ssoft() };
}
