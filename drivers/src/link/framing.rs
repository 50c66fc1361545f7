//! Link packet framing.
//!
//! A link packet is a 1-byte type, a 4-byte little-endian payload length and
//! the payload. On the wire it is either sent as is (TLV, delimited by its
//! own length field) or SLIP-escaped and terminated by `END`.
//!
//! The [`Framer`] turns received bytes into packets stored in pool blocks.
//! It keeps its state between calls, so a frame may arrive in any number of
//! pieces.

use common::mem::{BlockIndex, BlockPool};
use log::{debug, warn};

use super::config::Framing;
use super::packet::{PacketRing, release};

pub const HEADER_SIZE: usize = 5;

/// SLIP special bytes.
pub mod slip {
    pub const END: u8 = 0xC0;
    pub const ESC: u8 = 0xDB;
    pub const ESC_END: u8 = 0xDC;
    pub const ESC_ESC: u8 = 0xDD;
}

pub fn encode_header(packet_type: u8, payload_len: u32) -> [u8; HEADER_SIZE] {
    let len = payload_len.to_le_bytes();
    [packet_type, len[0], len[1], len[2], len[3]]
}

/// Payload length announced by a header.
pub fn header_payload_len(header: &[u8; HEADER_SIZE]) -> usize {
    u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize
}

/// SLIP-escape `bytes`. No `END` is appended.
pub fn slip_escape(bytes: &[u8]) -> impl Iterator<Item = u8> + '_ {
    bytes.iter().flat_map(|&byte| {
        let (out, n) = match byte {
            slip::END => ([slip::ESC, slip::ESC_END], 2),
            slip::ESC => ([slip::ESC, slip::ESC_ESC], 2),
            _ => ([byte, 0], 1),
        };
        out.into_iter().take(n)
    })
}

/// Length of `bytes` once escaped.
pub fn slip_escaped_len(bytes: &[u8]) -> usize {
    bytes.len()
        + bytes
            .iter()
            .filter(|&&b| b == slip::END || b == slip::ESC)
            .count()
}

/// Counters kept by the framer.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Packets published to the ready ring.
    pub frames: usize,
    /// Frames rejected as malformed.
    pub frame_errors: usize,
    /// Well-formed frames lost to pool or ring exhaustion.
    pub dropped: usize,
}

pub(crate) struct Framer {
    framing: Framing,
    block_size: usize,
    header: [u8; HEADER_SIZE],
    /// Decoded bytes of the current frame, header included.
    filled: usize,
    /// Full framed length once the header is known.
    expected: usize,
    block: Option<BlockIndex>,
    /// TLV payload bytes left to skip for a frame with no block.
    skip: usize,
    escaped: bool,
    /// SLIP: ignore everything up to the next `END`.
    discarding: bool,
    stats: FramerStats,
}

impl Framer {
    pub fn new(framing: Framing, block_size: usize) -> Self {
        Self {
            framing,
            block_size,
            header: [0; HEADER_SIZE],
            filled: 0,
            expected: 0,
            block: None,
            skip: 0,
            escaped: false,
            discarding: false,
            stats: FramerStats::default(),
        }
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Drop any partial frame.
    pub fn reset(&mut self, pool: &BlockPool) {
        if let Some(block) = self.block.take() {
            release(pool, block);
        }
        self.filled = 0;
        self.expected = 0;
        self.skip = 0;
        self.escaped = false;
        self.discarding = false;
    }

    /// Run `bytes` through the framer. Every byte is consumed.
    pub fn feed(&mut self, bytes: &[u8], pool: &BlockPool, packets: &mut PacketRing) {
        match self.framing {
            Framing::Tlv => bytes.iter().for_each(|&b| self.tlv_byte(b, pool, packets)),
            Framing::Slip => bytes.iter().for_each(|&b| self.slip_byte(b, pool, packets)),
        }
    }

    fn tlv_byte(&mut self, byte: u8, pool: &BlockPool, packets: &mut PacketRing) {
        if self.skip > 0 {
            self.skip -= 1;
            if self.skip == 0 {
                self.reset(pool);
            }
            return;
        }

        if self.filled < HEADER_SIZE {
            self.header[self.filled] = byte;
            self.filled += 1;
            if self.filled == HEADER_SIZE {
                self.tlv_header(pool, packets);
            }
            return;
        }

        self.store(byte, pool);
        if self.filled == self.expected {
            self.publish(pool, packets);
        }
    }

    fn tlv_header(&mut self, pool: &BlockPool, packets: &mut PacketRing) {
        let payload_len = header_payload_len(&self.header);
        let Some(expected) = HEADER_SIZE
            .checked_add(payload_len)
            .filter(|&len| len <= self.block_size)
        else {
            warn!("TLV frame size error: payload {} bytes", payload_len);
            self.stats.frame_errors += 1;
            self.reset(pool);
            return;
        };
        self.expected = expected;

        match pool.reserve() {
            Ok(block) => {
                self.block = Some(block);
                self.filled = 0;
                let header = self.header;
                header.iter().for_each(|&b| self.store(b, pool));
                if self.filled == self.expected {
                    self.publish(pool, packets);
                }
            }
            Err(err) => {
                debug!("dropping {} byte frame: {}", expected, err);
                self.stats.dropped += 1;
                self.skip = payload_len;
                if self.skip == 0 {
                    self.reset(pool);
                }
            }
        }
    }

    fn slip_byte(&mut self, byte: u8, pool: &BlockPool, packets: &mut PacketRing) {
        if byte == slip::END {
            self.slip_end(pool, packets);
            return;
        }
        if self.discarding {
            return;
        }

        let decoded = if self.escaped {
            self.escaped = false;
            match byte {
                slip::ESC_END => slip::END,
                slip::ESC_ESC => slip::ESC,
                other => {
                    warn!("SLIP bad escape 0x{:02x}", other);
                    self.corrupt(pool);
                    return;
                }
            }
        } else if byte == slip::ESC {
            self.escaped = true;
            return;
        } else {
            byte
        };

        if self.filled >= self.block_size {
            warn!("SLIP frame overflow error");
            self.corrupt(pool);
            return;
        }

        if self.block.is_none() {
            match pool.reserve() {
                Ok(block) => self.block = Some(block),
                Err(err) => {
                    debug!("dropping SLIP frame: {}", err);
                    self.stats.dropped += 1;
                    self.discard(pool);
                    return;
                }
            }
        }

        if self.filled < HEADER_SIZE {
            self.header[self.filled] = decoded;
        }
        self.store(decoded, pool);

        if self.filled == HEADER_SIZE {
            let payload_len = header_payload_len(&self.header);
            match HEADER_SIZE.checked_add(payload_len) {
                Some(expected) if expected <= self.block_size => self.expected = expected,
                _ => {
                    warn!("SLIP frame size error: payload {} bytes", payload_len);
                    self.corrupt(pool);
                }
            }
        }
    }

    fn slip_end(&mut self, pool: &BlockPool, packets: &mut PacketRing) {
        if self.discarding {
            self.reset(pool);
            return;
        }
        if self.filled == 0 {
            self.escaped = false;
            return;
        }

        if self.filled >= HEADER_SIZE && self.filled == self.expected {
            self.publish(pool, packets);
        } else {
            warn!(
                "SLIP frame length error: got {} bytes, header says {}",
                self.filled, self.expected
            );
            self.stats.frame_errors += 1;
            self.reset(pool);
        }
    }

    fn corrupt(&mut self, pool: &BlockPool) {
        self.stats.frame_errors += 1;
        self.discard(pool);
    }

    fn discard(&mut self, pool: &BlockPool) {
        self.reset(pool);
        self.discarding = true;
    }

    fn store(&mut self, byte: u8, pool: &BlockPool) {
        if let Some(block) = self.block {
            // SAFETY: the framer owns `block` until it is published or released.
            let bytes = unsafe { pool.block_mut(block) };
            if let Some(slot) = bytes.get_mut(self.filled) {
                *slot = byte;
            }
        }
        self.filled += 1;
    }

    fn publish(&mut self, pool: &BlockPool, packets: &mut PacketRing) {
        if let Some(block) = self.block.take() {
            if packets.push(block, self.filled, pool) {
                self.stats.frames += 1;
            } else {
                debug!("packet ring full, dropping frame");
                self.stats.dropped += 1;
            }
        }
        self.reset(pool);
    }
}
