use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use common::mem::{Block, BlockIndex, BlockPool};
use log::warn;

use super::framing::HEADER_SIZE;

/// One slot of the ready-packet ring.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct PacketDescriptor {
    pub ready: bool,
    pub block: Option<BlockIndex>,
    /// Framed length: header plus payload.
    pub len: usize,
}

/// Reassembled packets waiting for the consumer, oldest first.
pub(crate) struct PacketRing {
    slots: Box<[PacketDescriptor]>,
    head: usize,
    count: usize,
}

impl PacketRing {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<PacketDescriptor> = (0..capacity).map(|_| PacketDescriptor::default()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Publish a complete packet.
    ///
    /// When the ring is full the block goes straight back to the pool and
    /// `false` is returned.
    pub fn push(&mut self, block: BlockIndex, len: usize, pool: &BlockPool) -> bool {
        if self.count == self.capacity() {
            release(pool, block);
            return false;
        }

        let tail = (self.head + self.count) % self.capacity();
        self.slots[tail] = PacketDescriptor {
            ready: true,
            block: Some(block),
            len,
        };
        self.count += 1;
        true
    }

    /// Take the oldest ready packet.
    pub fn pop(&mut self) -> Option<PacketDescriptor> {
        if self.count == 0 || !self.slots[self.head].ready {
            return None;
        }

        let descriptor = core::mem::take(&mut self.slots[self.head]);
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        Some(descriptor)
    }

    /// Drop every queued packet, returning its block to the pool.
    pub fn clear(&mut self, pool: &BlockPool) {
        for slot in self.slots.iter_mut() {
            if let Some(block) = core::mem::take(slot).block {
                release(pool, block);
            }
        }
        self.head = 0;
        self.count = 0;
    }
}

pub(crate) fn release(pool: &BlockPool, block: BlockIndex) {
    if let Err(err) = pool.release(block) {
        warn!("releasing packet block {}: {}", block.get(), err);
    }
}

/// A received packet: `[type: u8][length: u32 LE][payload]`.
///
/// Holds its pool block until dropped.
pub struct Packet<'a> {
    block: Block<'a>,
    len: usize,
}

impl<'a> Packet<'a> {
    pub(crate) fn new(block: Block<'a>, len: usize) -> Self {
        Self { block, len }
    }

    pub fn packet_type(&self) -> u8 {
        self.block[0]
    }

    pub fn payload_len(&self) -> usize {
        self.len - HEADER_SIZE
    }

    pub fn payload(&self) -> &[u8] {
        &self.block[HEADER_SIZE..self.len]
    }

    /// Header and payload as received.
    pub fn as_bytes(&self) -> &[u8] {
        &self.block[..self.len]
    }

    pub fn block_index(&self) -> BlockIndex {
        self.block.index()
    }
}

impl fmt::Debug for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("type", &self.packet_type())
            .field("payload_len", &self.payload_len())
            .field("block", &self.block_index().get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ring_releases_the_block() {
        let pool = BlockPool::new(3, 16);
        let mut ring = PacketRing::new(2);

        for _ in 0..2 {
            let block = pool.reserve().unwrap();
            assert!(ring.push(block, 5, &pool));
        }
        let extra = pool.reserve().unwrap();
        assert!(!ring.push(extra, 5, &pool));
        assert!(!pool.is_busy(extra));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn pops_in_arrival_order_across_wrap() {
        let pool = BlockPool::new(4, 16);
        let mut ring = PacketRing::new(2);

        let a = pool.reserve().unwrap();
        let b = pool.reserve().unwrap();
        ring.push(a, 6, &pool);
        assert_eq!(ring.pop().unwrap().block, Some(a));

        let c = pool.reserve().unwrap();
        ring.push(b, 7, &pool);
        ring.push(c, 8, &pool);
        assert_eq!(ring.pop().unwrap().len, 7);
        assert_eq!(ring.pop().unwrap().len, 8);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn clear_returns_blocks() {
        let pool = BlockPool::new(2, 16);
        let mut ring = PacketRing::new(4);
        ring.push(pool.reserve().unwrap(), 5, &pool);
        ring.push(pool.reserve().unwrap(), 5, &pool);
        assert_eq!(pool.available(), 0);

        ring.clear(&pool);
        assert_eq!(pool.available(), 2);
        assert!(ring.pop().is_none());
    }
}
