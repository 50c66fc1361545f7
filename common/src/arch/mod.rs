//! Interrupt-masking backend selection.
//!
//! Bare-metal ARM targets mask IRQs in hardware. Every other target (host
//! builds, unit tests, simulators) gets a software mask with the same
//! semantics so that driver code is exercised unchanged.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        pub mod arm;
        pub use arm::irq::ArmIrq as CurrentIrq;
    } else {
        pub mod host;
        pub use host::HostIrq as CurrentIrq;
    }
}
