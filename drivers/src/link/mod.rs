//! Framed serial link over a DMA-capable UART.
//!
//! # Receive
//!
//! The DMA engine writes into a fixed ring and reports its write position.
//! [`SerialLink::rx_isr`] only moves `write_idx` and grows `unread`. Task
//! code then either reads raw bytes ([`peek`](SerialLink::peek) and
//! [`update_read_head`](SerialLink::update_read_head)) or asks for whole
//! packets with [`read_packet`](SerialLink::read_packet). Use one style per
//! link, not both.
//!
//! # Transmit
//!
//! [`write`](SerialLink::write) queues bytes and arms a DMA transfer when the
//! transmitter is idle. [`tx_isr`](SerialLink::tx_isr) re-arms the next
//! contiguous span until the queue is empty.
//!
//! # Contexts
//!
//! The `*_isr` and [`on_interrupt`](SerialLink::on_interrupt) entry points
//! are interrupt-safe: bounded, allocation free, and they never log.
//! Everything else is task-level.

mod config;
mod error;
mod framing;
pub mod isr;
mod packet;
mod rx;
mod tx;

pub use config::{Framing, LinkConfig};
pub use error::{LinkError, LinkStatus};
pub use framing::{
    FramerStats, HEADER_SIZE, encode_header, header_payload_len, slip, slip_escape,
    slip_escaped_len,
};
pub use packet::Packet;

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use common::arch::CurrentIrq;
use common::mem::BlockPool;
use common::sync::{IrqControl, IrqSpinLock, critical_section};
use log::{debug, trace, warn};

use crate::hal::serial::{DmaEvent, DmaSerialPort, LineErrors};
use framing::Framer;
use packet::PacketRing;
use rx::RxRing;
use tx::TxQueue;

/// Upper bound on events serviced by one [`SerialLink::on_interrupt`] call.
pub const MAX_EVENTS_PER_IRQ: usize = 8;

/// Single-byte positive reply, see [`SerialLink::reply_ack`].
pub const ACK: u8 = 0x82;
/// Single-byte negative reply, see [`SerialLink::reply_nack`].
pub const NACK: u8 = 0x83;

/// Counters for diagnostics.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rx_overflows: usize,
    pub line_errors: usize,
    pub tx_faults: usize,
    /// Reassembled packets not yet taken by [`SerialLink::read_packet`].
    pub ready_packets: usize,
    pub framer: FramerStats,
}

struct RxState {
    framer: Framer,
    packets: PacketRing,
}

/// A serial link bound to one port.
pub struct SerialLink<P: DmaSerialPort, I: IrqControl = CurrentIrq> {
    config: LinkConfig,
    port: IrqSpinLock<P, I>,
    rx: RxRing<I>,
    tx: IrqSpinLock<TxQueue, I>,
    rx_state: spin::Mutex<RxState>,
    pool: BlockPool,
    status: AtomicU8,
    line_errors: AtomicU8,
    rx_overflows: AtomicUsize,
    line_error_events: AtomicUsize,
    tx_faults: AtomicUsize,
}

impl<P: DmaSerialPort, I: IrqControl> SerialLink<P, I> {
    /// Allocate every buffer the link will ever use.
    ///
    /// The receive is not armed yet; call [`start_receive`](Self::start_receive).
    pub fn new(port: P, config: LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;
        let pool = BlockPool::try_new(config.pool_blocks, config.block_size)?;

        Ok(Self {
            port: IrqSpinLock::new(port),
            rx: RxRing::new(config.rx_buffer_size),
            tx: IrqSpinLock::new(TxQueue::new(config.tx_buffer_size)),
            rx_state: spin::Mutex::new(RxState {
                framer: Framer::new(config.framing, config.block_size),
                packets: PacketRing::new(config.max_packets),
            }),
            pool,
            status: AtomicU8::new(0),
            line_errors: AtomicU8::new(0),
            rx_overflows: AtomicUsize::new(0),
            line_error_events: AtomicUsize::new(0),
            tx_faults: AtomicUsize::new(0),
            config,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Pool backing packet reassembly.
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Run `f` with exclusive access to the port, interrupts masked.
    pub fn with_port<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.port.lock())
    }

    /// Arm the circular DMA receive into the receive ring.
    pub fn start_receive(&self) -> Result<(), LinkError> {
        let (buffer, len) = self.rx.dma_target();
        // SAFETY: the ring is heap allocated, lives as long as the link, and
        // the receive is aborted before the link drops it.
        let result = unsafe { self.port.lock().start_receive(buffer, len) };
        result.map_err(|err| {
            warn!("arming receive failed: {:?}", err);
            LinkError::Port
        })
    }

    // ---- receive, interrupt context ----

    /// The DMA write position moved to `fifo_idx`.
    ///
    /// Returns the number of new bytes. On overflow the ring is clamped and
    /// `RxOverflow` is returned; the next [`read_packet`](Self::read_packet)
    /// resynchronises.
    pub fn rx_isr(&self, fifo_idx: usize) -> Result<usize, LinkError> {
        match self.rx.on_dma_progress(fifo_idx) {
            Ok(progress) if progress.overflowed => {
                self.rx_overflows.fetch_add(1, Ordering::Relaxed);
                self.raise(LinkStatus::RX_OVERFLOW);
                Err(LinkError::RxOverflow)
            }
            Ok(progress) => Ok(progress.received),
            Err(err) => {
                self.raise(LinkStatus::RX_DESYNC);
                Err(err)
            }
        }
    }

    /// The UART latched line errors.
    pub fn line_error_isr(&self, errors: LineErrors) {
        if errors.is_empty() {
            return;
        }
        self.line_errors.fetch_or(errors.bits(), Ordering::AcqRel);
        self.line_error_events.fetch_add(1, Ordering::Relaxed);
        self.raise(LinkStatus::LINE_ERROR);
    }

    // ---- receive, task context ----

    /// Bytes received and not yet acknowledged.
    pub fn unread(&self) -> usize {
        self.rx.unread()
    }

    pub fn write_idx(&self) -> usize {
        self.rx.write_idx()
    }

    pub fn read_idx(&self) -> usize {
        self.rx.read_idx()
    }

    /// Copy up to `buf.len()` unread bytes without consuming them.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        self.rx.peek(buf)
    }

    /// Look at the unread bytes up to the end of the ring, without copying.
    pub fn peek_contiguous<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.rx.peek_contiguous(f)
    }

    /// Acknowledge `amount` bytes.
    pub fn update_read_head(&self, amount: usize) -> Result<(), LinkError> {
        self.rx.update_read_head(amount)
    }

    /// Frame the unread bytes and return the oldest complete packet.
    ///
    /// An overflow or line error raised since the last call resets the
    /// receive path first and is reported once as an error.
    pub fn read_packet(&self) -> Result<Option<Packet<'_>>, LinkError> {
        self.resync_if_needed()?;

        let mut state = self.rx_state.lock();
        let RxState { framer, packets } = &mut *state;

        // The unread bytes span at most two contiguous runs of the ring.
        for _ in 0..2 {
            let consumed = self.rx.peek_contiguous(|bytes| {
                framer.feed(bytes, &self.pool, packets);
                bytes.len()
            });
            if consumed == 0 {
                break;
            }
            self.rx.update_read_head(consumed)?;
        }

        let Some(descriptor) = packets.pop() else {
            return Ok(None);
        };
        let Some(index) = descriptor.block else {
            return Ok(None);
        };
        // SAFETY: the descriptor owned the block and was just removed from the ring.
        let block = unsafe { self.pool.claim(index) }?;
        trace!("packet ready: {} bytes in block {}", descriptor.len, index.get());
        Ok(Some(Packet::new(block, descriptor.len)))
    }

    /// Reinitialise the receive path: abort the DMA, drop queued and partial
    /// packets, rewind the ring, and re-arm the receive.
    ///
    /// Packets already handed out keep their blocks.
    pub fn reset(&self) -> Result<(), LinkError> {
        self.port.lock().abort_receive().map_err(|err| {
            warn!("aborting receive failed: {:?}", err);
            LinkError::Port
        })?;

        {
            let mut state = self.rx_state.lock();
            state.framer.reset(&self.pool);
            state.packets.clear(&self.pool);
        }
        critical_section::<I, _>(|| self.rx.reset());

        debug!("receive path reset");
        self.start_receive()
    }

    /// Read and clear latched line errors, then [`reset`](Self::reset).
    pub fn reset_recv(&self) -> Result<LineErrors, LinkError> {
        let mut errors = self.port.lock().take_line_errors();
        errors |= LineErrors::from_bits_truncate(self.line_errors.swap(0, Ordering::AcqRel));
        if !errors.is_empty() {
            warn!("line errors: {:?}", errors);
        }
        if let Err(err) = self.reset() {
            self.line_errors.fetch_or(errors.bits(), Ordering::AcqRel);
            return Err(err);
        }
        Ok(errors)
    }

    fn resync_if_needed(&self) -> Result<(), LinkError> {
        let raised = LinkStatus::from_bits_truncate(
            self.status
                .fetch_and(!LinkStatus::NEEDS_RESYNC.bits(), Ordering::AcqRel),
        );
        if !raised.intersects(LinkStatus::NEEDS_RESYNC) {
            return Ok(());
        }

        let errors = match self.reset_recv() {
            Ok(errors) => errors,
            Err(err) => {
                // The ring still holds suspect bytes; try again next read.
                self.raise(raised & LinkStatus::NEEDS_RESYNC);
                return Err(err);
            }
        };
        if raised.contains(LinkStatus::RX_OVERFLOW) {
            warn!("receive overflow, buffered data discarded");
            Err(LinkError::RxOverflow)
        } else if raised.contains(LinkStatus::LINE_ERROR) {
            Err(LinkError::LineError(errors))
        } else {
            warn!("receive DMA out of sync, buffered data discarded");
            Err(LinkError::InvalidFifoIndex)
        }
    }

    // ---- transmit ----

    /// Queue `bytes` for sending; all of them or none.
    pub fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.enqueue(bytes.len(), bytes.iter().copied())
    }

    /// [`write`](Self::write), retrying up to `attempts` times while the
    /// queue is full and calling `backoff` between tries.
    pub fn write_retrying(
        &self,
        bytes: &[u8],
        attempts: usize,
        mut backoff: impl FnMut(),
    ) -> Result<(), LinkError> {
        let mut tries = 1;
        loop {
            match self.write(bytes) {
                Err(LinkError::TxFull) if tries < attempts => {
                    tries += 1;
                    backoff();
                }
                result => return result,
            }
        }
    }

    /// Frame and queue one packet. The whole frame is queued or nothing.
    pub fn write_packet(&self, packet_type: u8, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > self.config.max_payload() {
            return Err(LinkError::PacketTooLarge);
        }
        let header = encode_header(packet_type, payload.len() as u32);

        match self.config.framing {
            Framing::Tlv => self.enqueue(
                HEADER_SIZE + payload.len(),
                header.iter().chain(payload).copied(),
            ),
            Framing::Slip => {
                let len = slip_escaped_len(&header) + slip_escaped_len(payload) + 1;
                let frame = slip_escape(&header)
                    .chain(slip_escape(payload))
                    .chain(core::iter::once(slip::END));
                self.enqueue(len, frame)
            }
        }
    }

    /// Queue part of a frame, encoded for the link's framing.
    ///
    /// With SLIP the bytes are escaped and `end_frame` closes the frame, so
    /// one frame can be built from several calls. TLV frames delimit
    /// themselves and the bytes go out unchanged.
    pub fn write_frame_part(&self, bytes: &[u8], end_frame: bool) -> Result<(), LinkError> {
        match self.config.framing {
            Framing::Tlv => self.write(bytes),
            Framing::Slip => {
                let len = slip_escaped_len(bytes) + usize::from(end_frame);
                if len == 0 {
                    return Ok(());
                }
                self.enqueue(len, slip_escape(bytes).chain(end_frame.then_some(slip::END)))
            }
        }
    }

    /// Send the one-byte [`ACK`] reply.
    pub fn reply_ack(&self) -> Result<(), LinkError> {
        self.write_frame_part(&[ACK], true)
    }

    /// Send the one-byte [`NACK`] reply.
    pub fn reply_nack(&self) -> Result<(), LinkError> {
        self.write_frame_part(&[NACK], true)
    }

    fn enqueue(&self, len: usize, bytes: impl IntoIterator<Item = u8>) -> Result<(), LinkError> {
        let mut tx = self.tx.lock();
        tx.push(len, bytes)?;
        if tx.in_flight() {
            return Ok(());
        }
        if self.arm(&mut tx) {
            Ok(())
        } else {
            Err(LinkError::Port)
        }
    }

    /// Start sending the next span, if any. `false` if the port refused.
    fn arm(&self, tx: &mut TxQueue) -> bool {
        let Some((data, len)) = tx.next_span() else {
            return true;
        };
        // SAFETY: the span stays untouched in the queue until `complete`.
        let result = unsafe { self.port.lock().start_transmit(data, len) };
        if result.is_err() {
            tx.disarm();
            self.tx_faults.fetch_add(1, Ordering::Relaxed);
            self.raise(LinkStatus::TX_FAULT);
            return false;
        }
        true
    }

    /// Transfer complete: drop the sent span and arm the next one.
    ///
    /// Also arms bytes left queued after the port refused a transfer.
    pub fn tx_isr(&self) {
        let mut tx = self.tx.lock();
        if tx.in_flight() {
            tx.complete();
        }
        self.arm(&mut tx);
    }

    /// Whether no transmission is in flight.
    pub fn is_free(&self) -> bool {
        !self.tx.lock().in_flight()
    }

    /// Force the transmitter free after a timeout.
    ///
    /// The port's transfer is aborted and the in-flight span dropped; bytes
    /// queued behind it are armed next. If the port cannot abort, the span
    /// stays in flight and `Port` is returned.
    pub fn free(&self) -> Result<(), LinkError> {
        let mut tx = self.tx.lock();
        if !tx.in_flight() {
            return Ok(());
        }
        self.port.lock().abort_transmit().map_err(|err| {
            warn!("aborting transmit failed: {:?}", err);
            LinkError::Port
        })?;

        let dropped = tx.complete();
        debug!("transmitter forced free, {} bytes abandoned", dropped);
        if self.arm(&mut tx) {
            Ok(())
        } else {
            Err(LinkError::Port)
        }
    }

    /// Bytes queued for sending, including the span in flight.
    pub fn tx_pending(&self) -> usize {
        self.tx.lock().unsent()
    }

    // ---- interrupt dispatch ----

    /// Service the port's interrupt: drain its events into the ISR entry
    /// points. Returns the number of events handled.
    pub fn on_interrupt(&self) -> usize {
        let mut handled = 0;
        while handled < MAX_EVENTS_PER_IRQ {
            let event = self.port.lock().poll_event();
            let Some(event) = event else {
                break;
            };
            handled += 1;

            match event {
                DmaEvent::RxProgress { fifo_idx } => {
                    // Failures are latched in the status for task level.
                    let _ = self.rx_isr(fifo_idx);
                }
                DmaEvent::TxComplete => self.tx_isr(),
                DmaEvent::LineError(errors) => self.line_error_isr(errors),
            }
        }
        handled
    }

    // ---- status ----

    /// Conditions raised from interrupt context and not yet handled.
    pub fn status(&self) -> LinkStatus {
        LinkStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    /// Clear a transmit fault once it has been dealt with.
    pub fn clear_tx_fault(&self) {
        self.status
            .fetch_and(!LinkStatus::TX_FAULT.bits(), Ordering::AcqRel);
    }

    pub fn stats(&self) -> LinkStats {
        let state = self.rx_state.lock();
        LinkStats {
            rx_overflows: self.rx_overflows.load(Ordering::Relaxed),
            line_errors: self.line_error_events.load(Ordering::Relaxed),
            tx_faults: self.tx_faults.load(Ordering::Relaxed),
            ready_packets: state.packets.len(),
            framer: state.framer.stats(),
        }
    }

    fn raise(&self, status: LinkStatus) {
        self.status.fetch_or(status.bits(), Ordering::AcqRel);
    }
}

impl<P: DmaSerialPort, I: IrqControl> Drop for SerialLink<P, I> {
    fn drop(&mut self) {
        // The rings must not be freed while the DMA engine still uses them.
        let port = self.port.get_mut();
        let _ = port.abort_transmit();
        let _ = port.abort_receive();
    }
}
