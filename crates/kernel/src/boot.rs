//! Boot and initialization.
//!
//! The boot hart enters `kmain` with its hart id and the DTB physical
//! address (SBI boot protocol). Secondary harts park in `kmain_secondary`
//! until the boot hart has the allocators and scheduler up, then come
//! online through the same idle-thread path.
//!
//! Linker contract (bare metal): `_kernel_end` marks the first byte past
//! the loaded image; memory below it is never handed to the page
//! allocator.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Once;

use crate::arch::riscv64::{dtb, sbi};
use crate::mm::PhysAddr;
use crate::sched::entity::{make_priority, DEFAULT_PRIORITY, HIGH_MAJOR};

pub struct BootInfo {
    pub hartid: usize,
    pub dtb: dtb::DtbInfo,
}

static BOOT_HARTID: AtomicUsize = AtomicUsize::new(0);
static BOOT_INFO: Once<BootInfo> = Once::new();
static SECONDARY_GATE: AtomicBool = AtomicBool::new(false);

pub fn boot_hartid() -> usize {
    BOOT_HARTID.load(Ordering::Relaxed)
}

pub fn boot_info() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}

fn console_sink(bytes: &[u8]) {
    sbi::console_write(bytes);
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn kernel_end() -> u64 {
    extern "C" {
        static _kernel_end: u8;
    }
    unsafe { core::ptr::addr_of!(_kernel_end) as u64 }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn kernel_end() -> u64 {
    0
}

/// Subtract reserved windows (kernel image, DTB, initrd) from the RAM
/// ranges before they reach the page allocator.
fn clip_ranges(
    ranges: &[(u64, u64)],
    reserved: &[(u64, u64)],
) -> heapless::Vec<(PhysAddr, usize), 8> {
    let mut out: heapless::Vec<(PhysAddr, usize), 8> = heapless::Vec::new();
    let mut pending: heapless::Vec<(u64, u64), 8> = heapless::Vec::new();
    for &(base, size) in ranges {
        let _ = pending.push((base, base + size));
    }

    for &(rs, re) in reserved {
        if re <= rs {
            continue;
        }
        let mut next: heapless::Vec<(u64, u64), 8> = heapless::Vec::new();
        for &(s, e) in pending.iter() {
            if re <= s || rs >= e {
                let _ = next.push((s, e));
                continue;
            }
            if rs > s {
                let _ = next.push((s, rs));
            }
            if re < e {
                let _ = next.push((re, e));
            }
        }
        pending = next;
    }

    for &(s, e) in pending.iter() {
        if e > s {
            let _ = out.push((s, (e - s) as usize));
        }
    }
    out
}

fn rcu_worker_entry(cpu: usize) {
    crate::sync::rcu::rcu_worker(cpu);
}

/// First real thread: run the validation suite when asked, then sit
/// reaping orphans.
fn init_main(_arg: usize) {
    crate::info!("init: running");

    #[cfg(feature = "selftest")]
    crate::selftest::run_all();

    loop {
        match crate::process::do_wait(-1, 0) {
            Ok((tid, status)) => {
                crate::debug!("init: reaped {} status {:#x}", tid, status);
            }
            Err(_) => {
                let _ = crate::sched::sleep_ms(1000);
            }
        }
    }
}

/// Boot-hart entry point.
///
/// # Safety
/// Called exactly once, on the boot hart, with a valid DTB address and
/// identity-mapped memory.
pub unsafe fn kmain(hartid: usize, dtb_pa: usize) -> ! {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        crate::arch::riscv64::set_cpu_id(hartid)
    };
    BOOT_HARTID.store(hartid, Ordering::SeqCst);
    crate::klib::printk::set_console_sink(console_sink);
    crate::time::init_boot_timestamp();
    unsafe { crate::heap::init_heap() };

    crate::info!("cobalt kernel booting on hart {}", hartid);

    let info = unsafe { dtb::parse_from_pa(dtb_pa) }.unwrap_or_else(|_| {
        crate::warn!("boot: unusable DTB at {:#x}, assuming defaults", dtb_pa);
        dtb::DtbInfo::default()
    });
    if let Some(freq) = info.timebase_freq {
        crate::time::set_timebase_freq(freq);
    }
    let nharts = info.nharts.clamp(1, crate::smp::MAX_CPUS);
    crate::info!(
        "boot: {} hart(s), {} memory range(s), initrd {:?}",
        nharts,
        info.memory.len(),
        info.initrd
    );

    // Page allocator over RAM minus the image, the DTB and the initrd
    let mut reserved: heapless::Vec<(u64, u64), 4> = heapless::Vec::new();
    let _ = reserved.push((0, kernel_end()));
    let _ = reserved.push((dtb_pa as u64, dtb_pa as u64 + 0x10000));
    if let Some((s, e)) = info.initrd {
        let _ = reserved.push((s, e));
    }
    let ranges = clip_ranges(&info.memory, &reserved);
    crate::mm::init_buddy(&ranges).expect("boot: no managed memory");
    crate::mm::slab::init();

    // Scheduler: classes, this hart's idle thread, the trap vector
    crate::sched::init_classes();
    crate::sched::idle_thread_init(hartid);
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        crate::arch::riscv64::trap::init_hart()
    };

    // init must exist before any other spawn so it gets tid 1
    crate::process::kthread_spawn("init", init_main, 0, DEFAULT_PRIORITY)
        .expect("boot: cannot spawn init");

    // Per-CPU RCU workers, pinned before their first run
    for cpu in 0..nharts {
        let w = crate::process::kthread_create(
            "rcud",
            rcu_worker_entry,
            cpu,
            make_priority(HIGH_MAJOR, 1),
        )
        .expect("boot: cannot spawn rcu worker");
        w.sched.set_affinity(1 << cpu);
        crate::sched::wakeup_thread(&w);
    }

    // Timer workqueue thread
    crate::sched::timer::init();

    // Ramdisk over the initrd image
    if let Some((s, e)) = info.initrd {
        crate::block::ramdisk::init_from_initrd(s, e);
    }

    BOOT_INFO.call_once(|| BootInfo {
        hartid,
        dtb: info,
    });

    // Secondaries may proceed once everything above is in place
    SECONDARY_GATE.store(true, Ordering::SeqCst);

    crate::sched::timer::start_hart_timer();
    crate::sched::scheduler_run()
}

/// Secondary-hart entry point.
///
/// # Safety
/// Called once per non-boot hart after the loader parked it here.
pub unsafe fn kmain_secondary(hartid: usize) -> ! {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        crate::arch::riscv64::set_cpu_id(hartid)
    };
    while !SECONDARY_GATE.load(Ordering::SeqCst) {
        core::hint::spin_loop();
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        crate::arch::riscv64::trap::init_hart()
    };
    crate::sched::idle_thread_init(hartid);
    crate::sched::timer::start_hart_timer();
    crate::info!("boot: hart {} joining", hartid);
    crate::sched::scheduler_run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipping_carves_reserved_windows_out() {
        let ranges = [(0x8000_0000u64, 0x1000_0000u64)];
        let reserved = [
            (0x8000_0000u64, 0x8020_0000u64), // image
            (0x8800_0000u64, 0x8810_0000u64), // initrd
        ];
        let out = clip_ranges(&ranges, &reserved);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (0x8020_0000, (0x8800_0000u64 - 0x8020_0000) as usize));
        assert_eq!(out[1], (0x8810_0000, (0x9000_0000u64 - 0x8810_0000) as usize));
    }

    #[test]
    fn clipping_keeps_untouched_ranges() {
        let ranges = [(0x8000_0000u64, 0x100_0000u64)];
        let reserved = [(0x1000u64, 0x2000u64)];
        let out = clip_ranges(&ranges, &reserved);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], (0x8000_0000, 0x100_0000));
    }

    #[test]
    fn clipping_drops_fully_reserved_ranges() {
        let ranges = [(0x8000_0000u64, 0x1000u64)];
        let reserved = [(0x8000_0000u64, 0x8000_2000u64)];
        let out = clip_ranges(&ranges, &reserved);
        assert!(out.is_empty());
    }
}
