//! Kern subsystem - kernel services around the VM core
//!
//! - error: errno values and the fatal/recoverable error split
//! - kalloc: whole-page kernel allocation
//! - trap: fault entry from the exception handler

pub mod error;
pub mod kalloc;
pub mod trap;
