//! Supervisor trap vector for in-kernel interrupts.
//!
//! Only two sources reach the core: the platform timer tick and the
//! software-interrupt IPI. Everything else in supervisor mode is a bug.

use core::arch::{asm, global_asm};

global_asm!(
    "
    .globl kernelvec
    .align 4
kernelvec:
    addi sp, sp, -256
    sd ra, 0(sp)
    sd gp, 8(sp)
    sd t0, 16(sp)
    sd t1, 24(sp)
    sd t2, 32(sp)
    sd s0, 40(sp)
    sd s1, 48(sp)
    sd a0, 56(sp)
    sd a1, 64(sp)
    sd a2, 72(sp)
    sd a3, 80(sp)
    sd a4, 88(sp)
    sd a5, 96(sp)
    sd a6, 104(sp)
    sd a7, 112(sp)
    sd s2, 120(sp)
    sd s3, 128(sp)
    sd s4, 136(sp)
    sd s5, 144(sp)
    sd s6, 152(sp)
    sd s7, 160(sp)
    sd s8, 168(sp)
    sd s9, 176(sp)
    sd s10, 184(sp)
    sd s11, 192(sp)
    sd t3, 200(sp)
    sd t4, 208(sp)
    sd t5, 216(sp)
    sd t6, 224(sp)

    call kernel_trap

    ld ra, 0(sp)
    ld gp, 8(sp)
    ld t0, 16(sp)
    ld t1, 24(sp)
    ld t2, 32(sp)
    ld s0, 40(sp)
    ld s1, 48(sp)
    ld a0, 56(sp)
    ld a1, 64(sp)
    ld a2, 72(sp)
    ld a3, 80(sp)
    ld a4, 88(sp)
    ld a5, 96(sp)
    ld a6, 104(sp)
    ld a7, 112(sp)
    ld s2, 120(sp)
    ld s3, 128(sp)
    ld s4, 136(sp)
    ld s5, 144(sp)
    ld s6, 152(sp)
    ld s7, 160(sp)
    ld s8, 168(sp)
    ld s9, 176(sp)
    ld s10, 184(sp)
    ld s11, 192(sp)
    ld t3, 200(sp)
    ld t4, 208(sp)
    ld t5, 216(sp)
    ld t6, 224(sp)
    addi sp, sp, 256
    sret
"
);

extern "C" {
    fn kernelvec();
}

const SCAUSE_INTERRUPT: usize = 1 << 63;
const IRQ_S_SOFT: usize = 1;
const IRQ_S_TIMER: usize = 5;

/// Install the trap vector and enable the timer/soft interrupt sources.
/// Per-hart, before `intr_on`.
pub unsafe fn init_hart() {
    unsafe {
        asm!("csrw stvec, {}", in(reg) kernelvec as usize);
        // SIE.STIE | SIE.SSIE
        asm!("csrs sie, {}", in(reg) (1usize << 5) | (1usize << 1));
    }
}

#[no_mangle]
extern "C" fn kernel_trap() {
    let sepc: usize;
    let sstatus: usize;
    let scause: usize;
    let stval: usize;
    unsafe {
        asm!("csrr {}, sepc", out(reg) sepc);
        asm!("csrr {}, sstatus", out(reg) sstatus);
        asm!("csrr {}, scause", out(reg) scause);
        asm!("csrr {}, stval", out(reg) stval);
    }

    if scause & SCAUSE_INTERRUPT == 0 {
        panic!(
            "kernel exception: scause={:#x} sepc={:#x} stval={:#x}",
            scause, sepc, stval
        );
    }

    match scause & !SCAUSE_INTERRUPT {
        IRQ_S_TIMER => crate::sched::timer::on_timer_interrupt(),
        IRQ_S_SOFT => {
            super::clear_soft_pending();
            crate::smp::ipi::handle_ipi();
        }
        other => panic!("unexpected interrupt: cause {}", other),
    }

    // Preemption point: this may switch away and return much later.
    crate::sched::maybe_preempt();

    // The yield above may have taken other traps on other threads; restore
    // the CSRs the return path needs.
    unsafe {
        asm!("csrw sepc, {}", in(reg) sepc);
        asm!("csrw sstatus, {}", in(reg) sstatus);
    }
}
