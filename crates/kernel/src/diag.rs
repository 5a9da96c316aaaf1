//! Diagnostics: thread dumps, memory statistics, and the frame-pointer
//! backtracer with its sorted symbol table.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::process::pid;
use crate::sync::SpinLock;

// ── Symbol table ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Symbol {
    pub addr: usize,
    pub name: String,
}

static SYMBOLS: SpinLock<Vec<Symbol>> = SpinLock::new("symtab", Vec::new());

/// Install the symbol table (boot, from the loader-provided blob).
/// Entries are sorted by address for binary search.
pub fn register_symbols(mut symbols: Vec<Symbol>) {
    symbols.sort_by_key(|s| s.addr);
    *SYMBOLS.lock() = symbols;
}

/// Resolve an address to (symbol name, offset into it).
pub fn resolve_symbol(addr: usize) -> Option<(String, usize)> {
    let table = SYMBOLS.lock();
    if table.is_empty() {
        return None;
    }
    let idx = match table.binary_search_by_key(&addr, |s| s.addr) {
        Ok(i) => i,
        Err(0) => return None,
        Err(i) => i - 1,
    };
    let sym = &table[idx];
    Some((sym.name.clone(), addr - sym.addr))
}

// ── Frame-pointer walk ──────────────────────────────────────────────────

/// Walk a RISC-V frame-pointer chain: at `fp`, the return address sits at
/// `fp - 8` and the caller's frame pointer at `fp - 16`.
///
/// # Safety
/// Every frame in the chain must lie in readable stack memory bounded by
/// `stack_low..stack_high`.
pub unsafe fn walk_frames(
    mut fp: usize,
    stack_low: usize,
    stack_high: usize,
    mut visit: impl FnMut(usize),
) {
    const MAX_FRAMES: usize = 32;
    for _ in 0..MAX_FRAMES {
        if fp < stack_low + 16 || fp > stack_high || fp % 8 != 0 {
            break;
        }
        let ra = unsafe { core::ptr::read((fp - 8) as *const usize) };
        let prev_fp = unsafe { core::ptr::read((fp - 16) as *const usize) };
        if ra == 0 {
            break;
        }
        visit(ra);
        if prev_fp <= fp {
            break;
        }
        fp = prev_fp;
    }
}

/// Log a backtrace starting from the given frame pointer.
pub fn print_backtrace_from(fp: usize, stack_low: usize, stack_high: usize) {
    let mut depth = 0;
    unsafe {
        walk_frames(fp, stack_low, stack_high, |ra| {
            match resolve_symbol(ra) {
                Some((name, off)) => crate::info!("  #{} {:#x} {}+{:#x}", depth, ra, name, off),
                None => crate::info!("  #{} {:#x}", depth, ra),
            }
            depth += 1;
        });
    }
}

/// Backtrace of the calling context (bare metal only; hosted builds have
/// no readable fp chain in this format).
pub fn print_backtrace() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let fp = crate::arch::riscv64::read_fp();
        // Frames live on the current kernel stack
        if let Some(t) = crate::smp::current_thread() {
            if t.kstack.base != 0 {
                print_backtrace_from(fp, t.kstack.base as usize, t.kstack.top());
            }
        }
    }
}

// ── Thread and memory dumps ─────────────────────────────────────────────

/// Print one line per thread, traversing the table under the read lock.
pub fn procdump() {
    let table = pid::table().read();
    crate::info!("procdump: {} threads", table.count());
    for t in table.iter() {
        crate::info!(
            "  tid {:>5} tgid {:>5} prio {:#04x} cpu {} {:>8} {}",
            t.tid,
            t.tgid,
            t.sched.priority(),
            t.sched.cpu(),
            t.state().as_str(),
            t.name()
        );
    }
}

/// procdump plus a saved-context backtrace per sleeping thread.
pub fn procdump_bt() {
    let table = pid::table().read();
    let threads: Vec<Arc<crate::process::task::Thread>> = table.iter().cloned().collect();
    drop(table);

    for t in threads {
        crate::info!(
            "tid {:>5} {:>8} {}",
            t.tid,
            t.state().as_str(),
            t.name()
        );
        if t.state().is_sleeping() && t.kstack.base != 0 {
            // The saved callee frame: s0 is the frame pointer at switch-out
            let ctx = unsafe { &*t.sched.context_ptr() };
            print_backtrace_from(ctx.s[0], t.kstack.base as usize, t.kstack.top());
        }
    }
}

/// Memory statistics: buddy census plus per-cache slab counters.
pub fn memstat() {
    if let Some(stats) = crate::mm::get_stats() {
        crate::info!(
            "memstat: {} pages total, {} free, {} allocated",
            stats.total_pages,
            stats.free_pages,
            stats.allocated_pages
        );
    }
    for s in crate::mm::slab::all_stats() {
        crate::info!(
            "  cache {:<12} obj {:>4}B {}/{} active, {} slabs ({} free {} partial {} full)",
            s.name,
            s.obj_size,
            s.obj_active,
            s.obj_total,
            s.slab_total,
            s.free_slabs,
            s.partial_slabs,
            s.full_slabs
        );
    }
    crate::info!(
        "  heap: {} allocs, {} frees",
        crate::heap::alloc_count(),
        crate::heap::free_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_resolution_finds_enclosing_symbol() {
        register_symbols(alloc::vec![
            Symbol {
                addr: 0x8020_0000,
                name: String::from("kmain"),
            },
            Symbol {
                addr: 0x8020_1000,
                name: String::from("scheduler_run"),
            },
            Symbol {
                addr: 0x8020_4000,
                name: String::from("timer_worker"),
            },
        ]);

        let (name, off) = resolve_symbol(0x8020_1040).unwrap();
        assert_eq!(name, "scheduler_run");
        assert_eq!(off, 0x40);

        let (name, _) = resolve_symbol(0x8020_0000).unwrap();
        assert_eq!(name, "kmain");

        assert!(resolve_symbol(0x100).is_none());
    }

    #[test]
    fn frame_walk_follows_the_chain() {
        // Fabricate a three-frame stack in the RISC-V layout: the stack
        // grows down, so callers sit at higher addresses
        let mut stack = alloc::vec![0usize; 64];
        let base = stack.as_ptr() as usize;

        // Outermost frame, fp = base + 48, terminates the chain
        stack[5] = 0x1111; // ra at fp-8
        stack[4] = 0; // caller fp
        let fp_outer = base + 48;

        // Middle frame, fp = base + 32
        stack[3] = 0x2222;
        stack[2] = fp_outer;

        // Innermost frame, fp = base + 16
        stack[1] = 0x3333;
        stack[0] = base + 32;
        let fp_inner = base + 16;

        let mut seen = alloc::vec::Vec::new();
        unsafe {
            walk_frames(fp_inner, base, base + 64 * 8, |ra| seen.push(ra));
        }
        assert_eq!(seen, alloc::vec![0x3333, 0x2222, 0x1111]);
    }
}
