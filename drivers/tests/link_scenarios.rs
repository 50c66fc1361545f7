use core::ptr::NonNull;

use common::arch::host::HostIrq;
use drivers::hal::serial::{DmaEvent, DmaSerialPort, LineErrors, SerialError};
use drivers::link::{
    ACK, Framing, LinkConfig, LinkError, LinkStatus, NACK, SerialLink, encode_header, slip,
};
use drivers::peripheral::LoopbackPort;

type Link = SerialLink<LoopbackPort, HostIrq>;

fn small_config(framing: Framing) -> LinkConfig {
    LinkConfig::new(framing)
        .with_rx_buffer_size(64)
        .with_tx_buffer_size(64)
        .with_packets(4, 4)
        .with_block_size(32)
}

fn armed(port: LoopbackPort, config: LinkConfig) -> Link {
    let link = Link::new(port, config).unwrap();
    link.start_receive().unwrap();
    link
}

fn pump(link: &Link) {
    while link.on_interrupt() > 0 {}
}

/// Let the port finish every queued transmission.
fn flush(link: &Link) {
    while link.with_port(|port| port.complete_transmit()) > 0 {
        pump(link);
    }
}

fn tlv(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = encode_header(packet_type, payload.len() as u32).to_vec();
    out.extend_from_slice(payload);
    out
}

#[test]
fn dma_progress_then_acknowledge() {
    let link = armed(LoopbackPort::new(), LinkConfig::default().with_rx_buffer_size(1024));

    assert_eq!(link.rx_isr(10), Ok(10));
    assert_eq!(link.rx_isr(30), Ok(20));
    assert_eq!(link.rx_isr(35), Ok(5));
    assert_eq!(link.unread(), 35);
    assert_eq!(link.write_idx(), 35);

    link.update_read_head(35).unwrap();
    assert_eq!(link.unread(), 0);
    assert_eq!(link.read_idx(), 35);
}

#[test]
fn raw_bytes_can_be_peeked_then_consumed() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));
    link.with_port(|port| port.inject(b"hello"));
    pump(&link);

    let mut buf = [0u8; 8];
    assert_eq!(link.peek(&mut buf), 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(link.unread(), 5);

    assert_eq!(link.update_read_head(6), Err(LinkError::OverConsumed));
    link.update_read_head(2).unwrap();
    assert_eq!(link.peek_contiguous(|bytes| bytes.to_vec()), b"llo");
}

#[test]
fn tlv_packets_echo_back() {
    let link = armed(LoopbackPort::echo(), small_config(Framing::Tlv));

    link.write_packet(3, b"hello").unwrap();
    link.write_packet(4, b"").unwrap();
    flush(&link);

    let first = link.read_packet().unwrap().unwrap();
    assert_eq!(first.packet_type(), 3);
    assert_eq!(first.payload(), b"hello");
    assert_eq!(first.as_bytes(), tlv(3, b"hello").as_slice());

    let second = link.read_packet().unwrap().unwrap();
    assert_eq!(second.packet_type(), 4);
    assert_eq!(second.payload_len(), 0);

    assert!(link.read_packet().unwrap().is_none());
    assert_eq!(link.pool().available(), 2);
    drop((first, second));
    assert_eq!(link.pool().available(), 4);
}

#[test]
fn slip_packets_survive_special_bytes() {
    let link = armed(LoopbackPort::echo(), small_config(Framing::Slip));
    let payload = [slip::END, 1, slip::ESC, slip::ESC_END];

    link.write_packet(9, &payload).unwrap();
    flush(&link);

    let sent = link.with_port(|port| port.take_transmitted());
    assert_eq!(sent.last(), Some(&slip::END));
    assert!(!sent[..sent.len() - 1].contains(&slip::END));

    let packet = link.read_packet().unwrap().unwrap();
    assert_eq!(packet.packet_type(), 9);
    assert_eq!(packet.payload(), payload);
}

#[test]
fn oversize_packet_is_refused() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));
    let payload = [0u8; 28];
    assert_eq!(link.write_packet(1, &payload), Err(LinkError::PacketTooLarge));
    assert_eq!(link.tx_pending(), 0);
    link.write_packet(1, &payload[..27]).unwrap();
}

#[test]
fn transmit_spans_wrap_the_ring() {
    let link = armed(
        LoopbackPort::new(),
        small_config(Framing::Tlv).with_tx_buffer_size(16),
    );

    link.write(b"0123456789").unwrap();
    assert!(!link.is_free());
    flush(&link);
    assert!(link.is_free());

    link.write(b"abcdefghij").unwrap();
    assert_eq!(link.with_port(|port| port.complete_transmit()), 6);
    pump(&link);
    assert!(!link.is_free());
    flush(&link);

    let sent = link.with_port(|port| port.take_transmitted());
    assert_eq!(sent, b"0123456789abcdefghij");
    assert_eq!(link.tx_pending(), 0);
}

#[test]
fn full_transmit_ring_applies_backpressure() {
    let link = armed(
        LoopbackPort::new(),
        small_config(Framing::Tlv).with_tx_buffer_size(8),
    );

    link.write(b"abcdef").unwrap();
    assert_eq!(link.write(b"ghi"), Err(LinkError::TxFull));
    assert_eq!(link.tx_pending(), 6);
    assert_eq!(link.write(b""), Ok(()));

    let mut backoffs = 0;
    link.write_retrying(b"ghi", 3, || {
        backoffs += 1;
        flush(&link);
    })
    .unwrap();
    assert_eq!(backoffs, 1);

    flush(&link);
    assert_eq!(link.with_port(|port| port.take_transmitted()), b"abcdefghi");
}

#[test]
fn retrying_gives_up_after_the_last_attempt() {
    let link = armed(
        LoopbackPort::new(),
        small_config(Framing::Tlv).with_tx_buffer_size(4),
    );
    link.write(b"full").unwrap();

    let mut backoffs = 0;
    assert_eq!(
        link.write_retrying(b"x", 3, || backoffs += 1),
        Err(LinkError::TxFull)
    );
    assert_eq!(backoffs, 2);
}

#[test]
fn forced_free_drops_the_span_in_flight() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));
    link.write(b"stuck").unwrap();
    link.write(b"next").unwrap();
    assert!(!link.is_free());

    link.free().unwrap();
    assert_eq!(link.tx_pending(), 4);
    assert!(link.with_port(|port| port.is_transmitting()));

    flush(&link);
    assert!(link.is_free());
    assert_eq!(link.with_port(|port| port.take_transmitted()), b"next");
    link.free().unwrap();
}

#[test]
fn overflow_is_reported_once_then_recovered() {
    let link = armed(
        LoopbackPort::new(),
        small_config(Framing::Tlv).with_rx_buffer_size(16),
    );

    link.with_port(|port| port.inject(&[0xAA; 20]));
    pump(&link);
    assert_eq!(link.unread(), 16);
    assert!(link.status().contains(LinkStatus::RX_OVERFLOW));

    assert!(matches!(link.read_packet(), Err(LinkError::RxOverflow)));
    assert_eq!(link.unread(), 0);
    assert!(link.status().is_empty());
    assert_eq!(link.stats().rx_overflows, 1);

    link.with_port(|port| port.inject(&tlv(2, b"ok")));
    pump(&link);
    let packet = link.read_packet().unwrap().unwrap();
    assert_eq!(packet.payload(), b"ok");
}

#[test]
fn line_errors_reset_the_receiver() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));
    link.with_port(|port| {
        port.inject(&[1, 2, 3]);
        port.raise_line_error(LineErrors::FRAMING | LineErrors::OVERRUN);
    });
    pump(&link);

    assert_eq!(
        link.read_packet().unwrap_err(),
        LinkError::LineError(LineErrors::FRAMING | LineErrors::OVERRUN)
    );
    assert_eq!(link.unread(), 0);
    assert!(link.with_port(|port| port.is_receiving()));
    assert!(link.read_packet().unwrap().is_none());
}

#[test]
fn impossible_dma_index_forces_resync() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));
    assert_eq!(link.rx_isr(65), Err(LinkError::InvalidFifoIndex));
    assert_eq!(link.unread(), 0);
    assert!(link.status().contains(LinkStatus::RX_DESYNC));

    assert_eq!(link.read_packet().unwrap_err(), LinkError::InvalidFifoIndex);
    assert!(link.read_packet().unwrap().is_none());
}

#[test]
fn reset_clears_everything_but_handed_out_packets() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));

    let mut stream = tlv(1, b"a");
    stream.extend(tlv(2, b"b"));
    stream.extend(&encode_header(3, 10));
    link.with_port(|port| port.inject(&stream));
    pump(&link);

    let held = link.read_packet().unwrap().unwrap();
    link.with_port(|port| port.inject(b"tail"));
    pump(&link);
    assert!(link.unread() > 0);

    link.reset().unwrap();
    assert_eq!(link.unread(), 0);
    assert_eq!(link.read_idx(), 0);
    assert_eq!(link.write_idx(), 0);
    assert_eq!(link.pool().available(), 3);
    assert!(link.read_packet().unwrap().is_none());

    assert_eq!(held.payload(), b"a");
    drop(held);
    assert_eq!(link.pool().available(), 4);
}

#[test]
fn exhausted_pool_drops_frames_without_blocking() {
    let link = armed(
        LoopbackPort::new(),
        small_config(Framing::Tlv).with_packets(4, 1),
    );

    let mut stream = tlv(1, b"kept");
    stream.extend(tlv(2, b"lost"));
    link.with_port(|port| port.inject(&stream));
    pump(&link);

    let packet = link.read_packet().unwrap().unwrap();
    assert_eq!(packet.payload(), b"kept");
    assert!(link.read_packet().unwrap().is_none());
    assert_eq!(link.stats().framer.dropped, 1);
}

#[test]
fn invalid_config_is_rejected() {
    let config = LinkConfig::default().with_rx_buffer_size(0);
    assert!(matches!(
        Link::new(LoopbackPort::new(), config),
        Err(LinkError::InvalidConfig(_))
    ));
}

#[test]
fn refused_transfer_goes_out_after_the_next_completion() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));

    // Another user holds the transmitter.
    let foreign: &'static [u8] = b"a";
    let span = NonNull::new(foreign.as_ptr() as *mut u8).unwrap();
    link.with_port(|port| unsafe { port.start_transmit(span, foreign.len()) })
        .unwrap();

    assert_eq!(link.write(b"b"), Err(LinkError::Port));
    assert!(link.status().contains(LinkStatus::TX_FAULT));
    assert_eq!(link.stats().tx_faults, 1);
    assert_eq!(link.tx_pending(), 1);
    assert!(link.is_free());

    flush(&link);
    assert_eq!(link.with_port(|port| port.take_transmitted()), b"ab");
    assert_eq!(link.tx_pending(), 0);

    link.clear_tx_fault();
    assert!(link.status().is_empty());
}

#[test]
fn replies_and_partial_frames_follow_the_framing() {
    let link = armed(LoopbackPort::new(), small_config(Framing::Slip));
    link.write_frame_part(&[1, slip::END], false).unwrap();
    link.write_frame_part(&[2], true).unwrap();
    link.reply_nack().unwrap();
    flush(&link);
    assert_eq!(
        link.with_port(|port| port.take_transmitted()),
        [1, slip::ESC, slip::ESC_END, 2, slip::END, NACK, slip::END]
    );

    let link = armed(LoopbackPort::new(), small_config(Framing::Tlv));
    link.reply_ack().unwrap();
    link.write_frame_part(&[7], false).unwrap();
    link.write_frame_part(&[], true).unwrap();
    flush(&link);
    assert_eq!(link.with_port(|port| port.take_transmitted()), [ACK, 7]);
}

/// Loopback whose receive abort can be made to fail.
#[derive(Default)]
struct StuckAbortPort {
    inner: LoopbackPort,
    refuse_abort: bool,
}

impl DmaSerialPort for StuckAbortPort {
    type Error = SerialError;

    unsafe fn start_receive(&mut self, buffer: NonNull<u8>, len: usize) -> Result<(), SerialError> {
        unsafe { self.inner.start_receive(buffer, len) }
    }

    fn abort_receive(&mut self) -> Result<(), SerialError> {
        if self.refuse_abort {
            return Err(SerialError::Busy);
        }
        self.inner.abort_receive()
    }

    unsafe fn start_transmit(&mut self, data: NonNull<u8>, len: usize) -> Result<(), SerialError> {
        unsafe { self.inner.start_transmit(data, len) }
    }

    fn abort_transmit(&mut self) -> Result<(), SerialError> {
        self.inner.abort_transmit()
    }

    fn take_line_errors(&mut self) -> LineErrors {
        self.inner.take_line_errors()
    }

    fn poll_event(&mut self) -> Option<DmaEvent> {
        self.inner.poll_event()
    }
}

#[test]
fn failed_resync_is_retried() {
    let port = StuckAbortPort {
        refuse_abort: true,
        ..StuckAbortPort::default()
    };
    let config = small_config(Framing::Tlv).with_rx_buffer_size(16);
    let link: SerialLink<StuckAbortPort, HostIrq> = SerialLink::new(port, config).unwrap();
    link.start_receive().unwrap();

    link.with_port(|port| port.inner.inject(&[0xAA; 20]));
    while link.on_interrupt() > 0 {}

    assert_eq!(link.read_packet().unwrap_err(), LinkError::Port);
    assert!(link.status().contains(LinkStatus::RX_OVERFLOW));
    assert_eq!(link.unread(), 16);
    assert_eq!(link.stats().framer.frames, 0);

    link.with_port(|port| port.refuse_abort = false);
    assert_eq!(link.read_packet().unwrap_err(), LinkError::RxOverflow);
    assert_eq!(link.unread(), 0);
    assert!(link.status().is_empty());
    assert!(link.read_packet().unwrap().is_none());
}
