//! Architecture support.
//!
//! Only RISC-V 64 is implemented; hosted builds get inert fallbacks so the
//! portable kernel logic (and its unit tests) compile off-target.

pub mod riscv64;

pub use riscv64::{
    cpu_id, intr_get, intr_off, intr_on, read_time, wait_for_interrupt, TrapFrame,
};
