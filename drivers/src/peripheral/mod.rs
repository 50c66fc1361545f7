//! Peripheral Drivers
//!
//! Serial ports implementing [`DmaSerialPort`](crate::hal::serial::DmaSerialPort).
//!
//! # Available Peripherals
//!
//! - [`loopback`]: in-memory port for host simulation and tests
//! - `pl011`: ARM PrimeCell PL011 UART (feature `pl011`)

pub mod loopback;

pub use loopback::LoopbackPort;

cfg_if::cfg_if! {
    if #[cfg(feature = "pl011")] {
        pub mod pl011;
        pub use pl011::Pl011Dma;
    }
}
