//! Interrupt-driven serial transport.
//!
//! # Module Organization
//!
//! - [`hal`]: the port contract the link drives
//! - [`link`]: the framed serial link and its interrupt trampolines
//! - [`peripheral`]: port implementations
//!
//! Buffers are allocated once when a link is built; the interrupt paths
//! never allocate, block or log.
//!
//! # Usage Example
//!
//! ```
//! use drivers::link::{Framing, LinkConfig, SerialLink};
//! use drivers::peripheral::LoopbackPort;
//!
//! let link: SerialLink<LoopbackPort> =
//!     SerialLink::new(LoopbackPort::echo(), LinkConfig::new(Framing::Slip)).unwrap();
//! link.start_receive().unwrap();
//!
//! link.write_packet(1, b"ping").unwrap();
//! link.with_port(|port| port.complete_transmit());
//! while link.on_interrupt() > 0 {}
//!
//! let packet = link.read_packet().unwrap().unwrap();
//! assert_eq!(packet.payload(), b"ping");
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod hal;
pub mod link;
pub mod peripheral;

// Re-export commonly used types
pub use hal::serial::{DmaEvent, DmaSerialPort, LineErrors, SerialConfig, SerialError};
pub use link::{Framing, LinkConfig, LinkError, LinkStatus, Packet, SerialLink};
