use core::fmt::Debug;

/// Architecture-specific interrupt masking interface.
///
/// Implemented by the backends in [`crate::arch`].
pub trait IrqControl {
    /// Saved interrupt state
    type State: Copy + Debug;

    /// Disable interrupts and return the previous state.
    fn disable() -> Self::State;

    /// Restore interrupts to a previous state.
    fn restore(state: Self::State);
}

/// Run `f` with interrupts masked.
///
/// The previous mask state is restored afterwards, so critical sections
/// nest. Keep `f` short: it delays every pending interrupt.
#[inline]
pub fn critical_section<I: IrqControl, R>(f: impl FnOnce() -> R) -> R {
    let state = I::disable();
    let result = f();
    I::restore(state);
    result
}
