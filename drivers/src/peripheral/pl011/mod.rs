//! ARM PrimeCell PL011 UART as a [`DmaSerialPort`].
//!
//! The PL011 on the BCM2835 has no DMA channel wired for us, so transfers
//! are moved by the UART interrupt itself: each service call drains the RX
//! FIFO into the armed receive buffer and refills the TX FIFO from the armed
//! transmit span. The receive-timeout interrupt fires when the line goes
//! idle with bytes in the FIFO, which is exactly the idle-line progress
//! event the link expects.
//!
//! # Example
//!
//! ```no_run
//! use drivers::hal::serial::SerialConfig;
//! use drivers::link::{LinkConfig, SerialLink};
//! use drivers::peripheral::pl011::Pl011Dma;
//!
//! let mut uart = unsafe { Pl011Dma::new(0x2020_1000) };
//! uart.configure(SerialConfig::new_8n1(115200)).unwrap();
//! let link: SerialLink<Pl011Dma> = SerialLink::new(uart, LinkConfig::default()).unwrap();
//! link.start_receive().unwrap();
//! ```

use core::ptr::{NonNull, read_volatile, write_volatile};

use crate::hal::serial::{
    DataBits, DmaEvent, DmaSerialPort, LineErrors, Parity, SerialConfig, SerialError, StopBits,
};

/// PL011 clock frequency
const PL011_CLOCK_HZ: u32 = 48_000_000;

// Register offsets
const DR_OFFSET: usize = 0x00;
const RSR_ECR_OFFSET: usize = 0x04;
const FR_OFFSET: usize = 0x18;
const IBRD_OFFSET: usize = 0x24;
const FBRD_OFFSET: usize = 0x28;
const LCRH_OFFSET: usize = 0x2C;
const CR_OFFSET: usize = 0x30;
const IFLS_OFFSET: usize = 0x34;
const IMSC_OFFSET: usize = 0x38;
const MIS_OFFSET: usize = 0x40;
const ICR_OFFSET: usize = 0x44;

// Flag Register (FR) bits
const FR_BUSY: u32 = 1 << 3;
const FR_RXFE: u32 = 1 << 4;
const FR_TXFF: u32 = 1 << 5;

// Control Register (CR) bits
const CR_UARTEN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;
const CR_RXE: u32 = 1 << 9;

// Line Control Register (LCRH) bits
const LCRH_WLEN_8: u32 = 0b11 << 5;
const LCRH_FEN: u32 = 1 << 4;

// Interrupt bits, shared by IMSC, MIS and ICR
const INT_RX: u32 = 1 << 4;
const INT_TX: u32 = 1 << 5;
const INT_RT: u32 = 1 << 6;
const INT_FE: u32 = 1 << 7;
const INT_PE: u32 = 1 << 8;
const INT_BE: u32 = 1 << 9;
const INT_OE: u32 = 1 << 10;
const INT_ERRORS: u32 = INT_FE | INT_PE | INT_BE | INT_OE;
const INT_ALL: u32 = 0x07FF;

// FIFO level select: RX at 1/2 full, TX at 1/8 full
const IFLS_RX_1_2: u32 = 0b010 << 3;
const IFLS_TX_1_8: u32 = 0b000;

#[derive(Debug, Copy, Clone)]
struct Transfer {
    ptr: NonNull<u8>,
    len: usize,
    pos: usize,
}

/// PL011 UART moving its "DMA" transfers from the interrupt handler.
pub struct Pl011Dma {
    base: usize,
    rx: Option<Transfer>,
    tx: Option<Transfer>,
    /// Span fully queued while arming; reported on the next service call.
    tx_done: bool,
    line_errors: LineErrors,
}

impl Pl011Dma {
    /// Create a new PL011 UART instance.
    ///
    /// # Safety
    ///
    /// - `base` must point to a valid PL011 peripheral
    /// - Only one instance should exist per UART hardware
    /// - Memory must be properly mapped as device memory
    pub const unsafe fn new(base: usize) -> Self {
        Self {
            base,
            rx: None,
            tx: None,
            tx_done: false,
            line_errors: LineErrors::empty(),
        }
    }

    #[inline]
    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write_reg(&mut self, offset: usize, value: u32) {
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn modify_imsc(&mut self, set: u32, clear: u32) {
        let imsc = self.read_reg(IMSC_OFFSET);
        self.write_reg(IMSC_OFFSET, (imsc & !clear) | set);
    }

    /// Wait for the UART to finish transmitting.
    fn wait_idle(&self) {
        while self.read_reg(FR_OFFSET) & FR_BUSY != 0 {
            core::hint::spin_loop();
        }
    }

    /// Calculate baud rate divisors.
    fn calculate_divisors(baud_rate: u32) -> Result<(u32, u32), SerialError> {
        if baud_rate == 0 {
            return Err(SerialError::InvalidConfig);
        }

        // BAUDDIV = FUARTCLK / (16 * baud), fraction in 1/64ths
        let divisor = ((PL011_CLOCK_HZ as u64) << 6) / (16 * baud_rate as u64);

        let integer = (divisor >> 6) as u32;
        let fractional = (divisor & 0x3F) as u32;

        if integer == 0 || integer > 0xFFFF {
            return Err(SerialError::InvalidConfig);
        }

        Ok((integer, fractional))
    }

    /// Program line settings. Only 8N1 is supported.
    ///
    /// Leaves every interrupt masked; arming a transfer unmasks what it needs.
    pub fn configure(&mut self, config: SerialConfig) -> Result<(), SerialError> {
        if !matches!(config.data_bits, DataBits::Eight)
            || !matches!(config.parity, Parity::None)
            || !matches!(config.stop_bits, StopBits::One)
        {
            return Err(SerialError::InvalidConfig);
        }
        let (ibrd, fbrd) = Self::calculate_divisors(config.baud_rate)?;

        // Disable UART
        let cr = self.read_reg(CR_OFFSET);
        self.write_reg(CR_OFFSET, cr & !CR_UARTEN);

        self.wait_idle();

        // Flush FIFOs
        let lcrh = self.read_reg(LCRH_OFFSET);
        self.write_reg(LCRH_OFFSET, lcrh & !LCRH_FEN);

        self.write_reg(IBRD_OFFSET, ibrd);
        self.write_reg(FBRD_OFFSET, fbrd);
        self.write_reg(LCRH_OFFSET, LCRH_WLEN_8 | LCRH_FEN);
        self.write_reg(IFLS_OFFSET, IFLS_RX_1_2 | IFLS_TX_1_8);

        self.write_reg(ICR_OFFSET, INT_ALL);
        self.write_reg(IMSC_OFFSET, 0);
        self.rx = None;
        self.tx = None;
        self.tx_done = false;

        self.write_reg(CR_OFFSET, CR_UARTEN | CR_TXE | CR_RXE);
        Ok(())
    }

    fn read_line_errors(&mut self) -> LineErrors {
        let rsr = self.read_reg(RSR_ECR_OFFSET);
        // Any write clears the receive status register.
        self.write_reg(RSR_ECR_OFFSET, 0);
        LineErrors::from_bits_truncate((rsr & 0x0F) as u8)
    }

    /// Move bytes from the RX FIFO into the receive buffer.
    ///
    /// Stops early when the buffer wraps so the wrap is reported on its own.
    fn drain_rx(&mut self) -> Option<DmaEvent> {
        let mut moved = false;
        while self.read_reg(FR_OFFSET) & FR_RXFE == 0 {
            let byte = (self.read_reg(DR_OFFSET) & 0xFF) as u8;
            let Some(rx) = self.rx.as_mut() else {
                continue;
            };

            // SAFETY: `pos < len`, and the buffer is valid while the receive is armed.
            unsafe { rx.ptr.as_ptr().add(rx.pos).write(byte) };
            rx.pos += 1;
            moved = true;

            if rx.pos == rx.len {
                rx.pos = 0;
                return Some(DmaEvent::RxProgress { fifo_idx: rx.len });
            }
        }

        self.write_reg(ICR_OFFSET, INT_RX | INT_RT);
        match self.rx {
            Some(rx) if moved => Some(DmaEvent::RxProgress { fifo_idx: rx.pos }),
            _ => None,
        }
    }

    /// Refill the TX FIFO; `TxComplete` once the span is fully queued.
    ///
    /// With nothing armed the interrupt is cleared and masked.
    fn fill_tx(&mut self) -> Option<DmaEvent> {
        let Some(mut tx) = self.tx else {
            self.write_reg(ICR_OFFSET, INT_TX);
            self.modify_imsc(0, INT_TX);
            return None;
        };
        while tx.pos < tx.len && self.read_reg(FR_OFFSET) & FR_TXFF == 0 {
            // SAFETY: the span is valid for reads until completion is reported.
            let byte = unsafe { tx.ptr.as_ptr().add(tx.pos).read() };
            self.write_reg(DR_OFFSET, byte as u32);
            tx.pos += 1;
        }

        self.write_reg(ICR_OFFSET, INT_TX);
        if tx.pos < tx.len {
            self.tx = Some(tx);
            return None;
        }

        self.tx = None;
        self.modify_imsc(0, INT_TX);
        Some(DmaEvent::TxComplete)
    }
}

impl DmaSerialPort for Pl011Dma {
    type Error = SerialError;

    unsafe fn start_receive(&mut self, buffer: NonNull<u8>, len: usize) -> Result<(), SerialError> {
        if self.rx.is_some() {
            return Err(SerialError::Busy);
        }
        if len == 0 {
            return Err(SerialError::InvalidBuffer);
        }

        self.rx = Some(Transfer {
            ptr: buffer,
            len,
            pos: 0,
        });
        self.write_reg(ICR_OFFSET, INT_RX | INT_RT | INT_ERRORS);
        self.modify_imsc(INT_RX | INT_RT | INT_ERRORS, 0);
        Ok(())
    }

    fn abort_receive(&mut self) -> Result<(), SerialError> {
        self.modify_imsc(0, INT_RX | INT_RT | INT_ERRORS);
        self.rx = None;
        Ok(())
    }

    unsafe fn start_transmit(&mut self, data: NonNull<u8>, len: usize) -> Result<(), SerialError> {
        if self.tx.is_some() || self.tx_done {
            return Err(SerialError::Busy);
        }
        if len == 0 {
            return Err(SerialError::InvalidBuffer);
        }

        self.tx = Some(Transfer {
            ptr: data,
            len,
            pos: 0,
        });
        // Prime the FIFO; the TX interrupt takes over once it drains.
        if self.fill_tx().is_some() {
            self.tx_done = true;
        }
        self.modify_imsc(INT_TX, 0);
        Ok(())
    }

    fn abort_transmit(&mut self) -> Result<(), SerialError> {
        self.modify_imsc(0, INT_TX);
        self.write_reg(ICR_OFFSET, INT_TX);
        self.tx = None;
        self.tx_done = false;
        Ok(())
    }

    fn take_line_errors(&mut self) -> LineErrors {
        let latched = core::mem::take(&mut self.line_errors);
        latched | self.read_line_errors()
    }

    fn poll_event(&mut self) -> Option<DmaEvent> {
        let mis = self.read_reg(MIS_OFFSET);

        if mis & INT_ERRORS != 0 {
            self.write_reg(ICR_OFFSET, mis & INT_ERRORS);
            let errors = self.read_line_errors();
            if !errors.is_empty() {
                self.line_errors |= errors;
                return Some(DmaEvent::LineError(errors));
            }
        }

        if mis & (INT_RX | INT_RT) != 0 {
            if let Some(event) = self.drain_rx() {
                return Some(event);
            }
        }

        if core::mem::take(&mut self.tx_done) {
            self.write_reg(ICR_OFFSET, INT_TX);
            self.modify_imsc(0, INT_TX);
            return Some(DmaEvent::TxComplete);
        }

        if mis & INT_TX != 0 {
            return self.fill_tx();
        }

        None
    }
}

// SAFETY: PL011 wraps memory-mapped hardware; the transfer buffers are only
// touched through `&mut self` under the `DmaSerialPort` contracts.
unsafe impl Send for Pl011Dma {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap-backed stand-in for the register block.
    struct FakeRegs(Box<[u32]>);

    impl FakeRegs {
        fn new() -> Self {
            let mut regs = Self(vec![0; ICR_OFFSET / 4 + 1].into_boxed_slice());
            // Nothing to receive.
            regs.set(FR_OFFSET, FR_RXFE);
            regs
        }

        fn base(&mut self) -> usize {
            self.0.as_mut_ptr() as usize
        }

        fn get(&mut self, offset: usize) -> u32 {
            unsafe { read_volatile((self.base() + offset) as *const u32) }
        }

        fn set(&mut self, offset: usize, value: u32) {
            unsafe { write_volatile((self.base() + offset) as *mut u32, value) }
        }
    }

    fn span(data: &[u8]) -> NonNull<u8> {
        NonNull::new(data.as_ptr() as *mut u8).unwrap()
    }

    #[test]
    fn span_that_fits_the_fifo_still_completes() {
        let mut regs = FakeRegs::new();
        let mut uart = unsafe { Pl011Dma::new(regs.base()) };
        let data = *b"ping";

        unsafe { uart.start_transmit(span(&data), data.len()).unwrap() };
        assert_eq!(regs.get(DR_OFFSET), b'g' as u32);
        assert_ne!(regs.get(IMSC_OFFSET) & INT_TX, 0);
        assert_eq!(
            unsafe { uart.start_transmit(span(&data), data.len()) },
            Err(SerialError::Busy)
        );

        regs.set(MIS_OFFSET, INT_TX);
        assert_eq!(uart.poll_event(), Some(DmaEvent::TxComplete));
        assert_eq!(regs.get(IMSC_OFFSET) & INT_TX, 0);

        // A stray TX interrupt with nothing armed is silenced.
        regs.set(IMSC_OFFSET, INT_TX);
        assert_eq!(uart.poll_event(), None);
        assert_eq!(regs.get(IMSC_OFFSET) & INT_TX, 0);
    }

    #[test]
    fn long_span_finishes_from_the_interrupt() {
        let mut regs = FakeRegs::new();
        let mut uart = unsafe { Pl011Dma::new(regs.base()) };
        let data = *b"hello";

        regs.set(FR_OFFSET, FR_RXFE | FR_TXFF);
        unsafe { uart.start_transmit(span(&data), data.len()).unwrap() };
        regs.set(MIS_OFFSET, INT_TX);
        assert_eq!(uart.poll_event(), None);

        regs.set(FR_OFFSET, FR_RXFE);
        assert_eq!(uart.poll_event(), Some(DmaEvent::TxComplete));
        assert_eq!(regs.get(DR_OFFSET), b'o' as u32);
        assert_eq!(regs.get(IMSC_OFFSET) & INT_TX, 0);
    }

    #[test]
    fn aborted_transmit_reports_nothing() {
        let mut regs = FakeRegs::new();
        let mut uart = unsafe { Pl011Dma::new(regs.base()) };
        let data = *b"ok";

        unsafe { uart.start_transmit(span(&data), data.len()).unwrap() };
        uart.abort_transmit().unwrap();
        assert_eq!(regs.get(IMSC_OFFSET) & INT_TX, 0);

        regs.set(MIS_OFFSET, INT_TX);
        assert_eq!(uart.poll_event(), None);
        unsafe { uart.start_transmit(span(&data), data.len()).unwrap() };
    }

    #[test]
    fn divisors_for_common_rates() {
        assert_eq!(Pl011Dma::calculate_divisors(115_200), Ok((26, 2)));
        assert_eq!(Pl011Dma::calculate_divisors(9_600), Ok((312, 32)));
    }

    #[test]
    fn rejects_unreachable_rates() {
        assert_eq!(
            Pl011Dma::calculate_divisors(0),
            Err(SerialError::InvalidConfig)
        );
        assert_eq!(
            Pl011Dma::calculate_divisors(4_000_000),
            Err(SerialError::InvalidConfig)
        );
    }
}
