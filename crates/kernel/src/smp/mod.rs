//! SMP subsystem: per-CPU data and inter-processor interrupts.

pub mod ipi;
pub mod percpu;

pub use percpu::{
    cpu, cpu_id, current_thread, is_cpu_online, online_mask, pop_off, push_off, set_online,
    this_cpu, with_current, Cpu, MAX_CPUS,
};
