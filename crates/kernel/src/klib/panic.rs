// Kernel panic path: halt the offending hart, freeze the others.

use core::sync::atomic::{AtomicBool, Ordering};

static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn in_panic() -> bool {
    PANICKING.load(Ordering::Relaxed)
}

/// Park a hart that received a freeze IPI from a panicking peer.
pub fn freeze_this_cpu() -> ! {
    crate::arch::intr_off();
    loop {
        crate::arch::wait_for_interrupt();
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::arch::intr_off();
    if !PANICKING.swap(true, Ordering::SeqCst) {
        crate::error!("kernel panic on hart {}: {}", crate::smp::cpu_id(), info);
        crate::smp::ipi::send_freeze_all_but_self();
    }
    loop {
        crate::arch::wait_for_interrupt();
    }
}
