//! Hardware Abstraction Layer (HAL) - Platform-Independent Traits
//!
//! The serial link talks to hardware only through these traits, so the same
//! link code drives a PL011 on the board and an in-memory port on the host.
//!
//! # Available Interfaces
//!
//! - [`serial`]: DMA-capable serial port (UART)

pub mod serial;
