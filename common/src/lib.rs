//! Shared building blocks for interrupt-driven drivers.
//!
//! - [`sync`]: interrupt masking, IRQ-safe locks and cells
//! - [`mem`]: allocation-free buffer primitives (block pool, double buffer)
//! - [`arch`]: the interrupt-masking backend for the current target

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod mem;
pub mod sync;
