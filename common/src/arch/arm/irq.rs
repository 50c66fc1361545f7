use crate::sync::irq::IrqControl;

/// IRQ disable bit in the A/R-profile CPSR.
#[cfg(not(target_feature = "mclass"))]
const CPSR_I_BIT: u32 = 1 << 7;

/// Interrupt control for ARM cores.
///
/// `State` is `true` when IRQs were enabled before [`IrqControl::disable`],
/// so nested critical sections only re-enable at the outermost level.
///
/// - A/R profile (ARM11, Cortex-A): reads CPSR, then `cpsid i`.
/// - M profile (Cortex-M): reads PRIMASK, then `cpsid i`.
///
/// The `asm!` blocks double as compiler barriers, so neither may use `nomem`.
pub struct ArmIrq;

#[cfg(not(target_feature = "mclass"))]
impl IrqControl for ArmIrq {
    type State = bool;

    #[inline(always)]
    fn disable() -> bool {
        let cpsr: u32;
        unsafe {
            core::arch::asm!(
                "mrs {0}, cpsr",
                "cpsid i",
                out(reg) cpsr,
                options(nostack, preserves_flags)
            );
        }
        cpsr & CPSR_I_BIT == 0
    }

    #[inline(always)]
    fn restore(prev_enabled: bool) {
        if prev_enabled {
            unsafe {
                core::arch::asm!("cpsie i", options(nostack, preserves_flags));
            }
        }
    }
}

#[cfg(target_feature = "mclass")]
impl IrqControl for ArmIrq {
    type State = bool;

    #[inline(always)]
    fn disable() -> bool {
        let primask: u32;
        unsafe {
            core::arch::asm!(
                "mrs {0}, PRIMASK",
                "cpsid i",
                out(reg) primask,
                options(nostack, preserves_flags)
            );
        }
        // PRIMASK bit 0 set means exceptions were already masked.
        primask & 1 == 0
    }

    #[inline(always)]
    fn restore(prev_enabled: bool) {
        if prev_enabled {
            unsafe {
                core::arch::asm!("cpsie i", options(nostack, preserves_flags));
            }
        }
    }
}
