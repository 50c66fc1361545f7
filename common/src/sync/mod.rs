//! Synchronisation between interrupt and task context.
//!
//! Nothing here blocks. Shared state is either an atomic, an [`IrqCell`]
//! (read-modify-write inside a critical section) or an [`IrqSpinLock`]
//! (a short critical section around a larger structure).

pub mod irq;
pub mod irq_cell;
pub mod irq_spinlock;

pub use irq::{IrqControl, critical_section};
pub use irq_cell::IrqCell;
pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
