use core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::irq::IrqControl;

static IRQS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Software interrupt mask for hosted targets.
///
/// There are no real interrupts on the host; "interrupt context" is whatever
/// thread a test or simulator uses to call the ISR entry points. The mask is
/// a process-wide flag that mirrors the save/restore discipline of the ARM
/// backend so nesting bugs show up the same way. The mask does not exclude
/// other threads; state shared with an "ISR" thread must still be atomic.
pub struct HostIrq;

impl IrqControl for HostIrq {
    type State = bool;

    #[inline]
    fn disable() -> bool {
        IRQS_ENABLED.swap(false, Ordering::AcqRel)
    }

    #[inline]
    fn restore(prev_enabled: bool) {
        if prev_enabled {
            IRQS_ENABLED.store(true, Ordering::Release);
        }
    }
}
