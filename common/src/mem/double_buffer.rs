//! Two-slot producer/consumer handoff.
//!
//! The producer fills the back slot while the consumer reads the front slot;
//! [`DoubleBuffer::swap`] exchanges the roles without copying. Because the
//! producer only ever gets the back slot, the consumer never sees a slot that
//! is being written.
//!
//! Swapping takes `&mut self`, so exclusion between the two sides comes from
//! whatever owns the buffer: a single task, or an
//! [`IrqSpinLock`](crate::sync::IrqSpinLock) when the producer is an ISR.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;

/// Stable identity of a slot, independent of its current role.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotId {
    A,
    B,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// More elements than a slot can hold.
    TooLarge,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::TooLarge => f.write_str("data larger than buffer slot"),
        }
    }
}

/// One half of a [`DoubleBuffer`].
///
/// `tag` carries per-buffer metadata the consumer needs alongside the data,
/// e.g. the data/command line level of a display row.
pub struct Slot<T, M = ()> {
    id: SlotId,
    /// Advisory: set by the producer once the slot holds a complete buffer.
    pub is_ready: bool,
    /// Number of valid elements.
    pub len: usize,
    pub tag: M,
    data: Box<[T]>,
}

impl<T, M> Slot<T, M> {
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// The valid prefix, `data[..len]`.
    pub fn filled(&self) -> &[T] {
        &self.data[..self.len.min(self.data.len())]
    }

    /// Full backing storage.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<T, M: fmt::Debug> fmt::Debug for Slot<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("is_ready", &self.is_ready)
            .field("len", &self.len)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

pub struct DoubleBuffer<T, M = ()> {
    slots: [Slot<T, M>; 2],
    front: usize,
}

impl<T: Copy + Default, M: Copy + Default> DoubleBuffer<T, M> {
    /// Allocate both slots with room for `buffer_size` elements each.
    pub fn new(buffer_size: usize) -> Self {
        let slot = |id| Slot {
            id,
            is_ready: false,
            len: 0,
            tag: M::default(),
            data: vec![T::default(); buffer_size].into_boxed_slice(),
        };

        // Slot A starts as the back (producer) slot.
        Self {
            slots: [slot(SlotId::A), slot(SlotId::B)],
            front: 1,
        }
    }
}

impl<T, M> DoubleBuffer<T, M> {
    /// Exchange roles and return the new front (the previous back).
    ///
    /// Only call once the producer has finished the back slot; no readiness
    /// check is made here.
    pub fn swap(&mut self) -> &Slot<T, M> {
        self.front ^= 1;
        &self.slots[self.front]
    }

    /// Swap only if the back slot is flagged ready.
    ///
    /// The slot handed back to the producer has its flag cleared.
    pub fn try_swap(&mut self) -> Option<&Slot<T, M>> {
        if !self.back_is_ready() {
            return None;
        }
        self.front ^= 1;
        self.slots[self.front ^ 1].is_ready = false;
        Some(&self.slots[self.front])
    }

    pub fn front(&self) -> &Slot<T, M> {
        &self.slots[self.front]
    }

    pub fn back(&self) -> &Slot<T, M> {
        &self.slots[self.front ^ 1]
    }

    pub fn back_mut(&mut self) -> &mut Slot<T, M> {
        &mut self.slots[self.front ^ 1]
    }

    pub fn back_is_ready(&self) -> bool {
        self.back().is_ready
    }

    pub fn buffer_size(&self) -> usize {
        self.slots[0].capacity()
    }
}

impl<T: Copy, M> DoubleBuffer<T, M> {
    /// Copy `data` into the back slot and set its length and ready flag.
    pub fn write_back(&mut self, data: &[T], is_ready: bool) -> Result<(), BufferError> {
        let back = self.back_mut();
        if data.len() > back.capacity() {
            return Err(BufferError::TooLarge);
        }

        back.data[..data.len()].copy_from_slice(data);
        back.len = data.len();
        back.is_ready = is_ready;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn swap_exposes_previous_back() {
        let mut buf: DoubleBuffer<i16> = DoubleBuffer::new(4);
        let back = buf.back().id();

        let front = buf.swap().id();
        assert_eq!(front, back);
        assert_ne!(buf.back().id(), front);
    }

    #[test]
    fn written_back_becomes_front_after_swap() {
        let mut buf: DoubleBuffer<u8> = DoubleBuffer::new(8);
        buf.write_back(&[1, 2, 3], true).unwrap();
        assert!(buf.back_is_ready());

        let front = buf.swap();
        assert_eq!(front.filled(), &[1, 2, 3]);
        assert!(front.is_ready);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let mut buf: DoubleBuffer<u8> = DoubleBuffer::new(2);
        assert_eq!(buf.write_back(&[0; 3], true), Err(BufferError::TooLarge));
        assert_eq!(buf.back().len, 0);
        assert!(!buf.back_is_ready());
    }

    #[test]
    fn try_swap_waits_for_ready_back() {
        let mut buf: DoubleBuffer<u8> = DoubleBuffer::new(2);
        let first_front = buf.front().id();
        assert!(buf.try_swap().is_none());
        assert_eq!(buf.front().id(), first_front);

        buf.back_mut().is_ready = true;
        assert!(buf.try_swap().is_some());
        assert_ne!(buf.front().id(), first_front);
        assert!(!buf.back_is_ready());
    }

    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    enum LineLevel {
        #[default]
        Command,
        Data,
    }

    #[test]
    fn tag_travels_with_slot() {
        let mut buf: DoubleBuffer<u16, LineLevel> = DoubleBuffer::new(16);
        buf.back_mut().tag = LineLevel::Data;
        assert_eq!(buf.swap().tag, LineLevel::Data);
        assert_eq!(buf.back().tag, LineLevel::Command);
    }

    #[test]
    fn consumer_never_sees_partial_rows() {
        use crate::arch::host::HostIrq;
        use crate::sync::IrqSpinLock;
        use std::sync::Arc;

        const ROWS: u32 = 500;
        let shared: Arc<IrqSpinLock<DoubleBuffer<u32>, HostIrq>> =
            Arc::new(IrqSpinLock::new(DoubleBuffer::new(32)));

        let producer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let mut row = 1;
                while row <= ROWS {
                    let mut buf = shared.lock();
                    if buf.back_is_ready() {
                        continue;
                    }
                    let back = buf.back_mut();
                    back.data_mut().fill(row);
                    back.len = back.capacity();
                    back.is_ready = true;
                    row += 1;
                }
            })
        };

        let mut last = 0;
        while last < ROWS {
            let mut buf = shared.lock();
            if let Some(front) = buf.try_swap() {
                let first = front.filled()[0];
                assert!(front.filled().iter().all(|&x| x == first));
                assert!(first > last, "rows arrive in order");
                last = first;
            }
        }
        producer.join().unwrap();
    }

    proptest! {
        #[test]
        fn double_swap_is_identity(swaps in 0usize..16) {
            let mut buf: DoubleBuffer<u8> = DoubleBuffer::new(1);
            for _ in 0..swaps {
                buf.swap();
            }
            let (front, back) = (buf.front().id(), buf.back().id());

            buf.swap();
            buf.swap();
            prop_assert_eq!(buf.front().id(), front);
            prop_assert_eq!(buf.back().id(), back);
        }
    }
}
