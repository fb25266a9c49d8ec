//! Segment emission: what to send next and with which header.

use super::congestion::LIMITED_THRESH;
use super::tcb::{MAX_WINDOW, Tcb};
use super::State;
use crate::config::SACK_MAX_BLOCK_COUNT;
use crate::time::Instant;
use crate::wire::{IpEndpoint, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber};

/// The reset answering `packet`, or nothing if it is itself a reset.
///
/// A segment without ACK is answered with `<SEQ=0><ACK=SEG.SEQ+SEG.LEN><RST,ACK>`,
/// anything else with `<SEQ=SEG.ACK><RST>` (RFC 793 page 36).
pub(super) fn rst_reply(packet: &TcpPacket<&[u8]>) -> Option<TcpRepr<'static>> {
    let flags = packet.flags();
    if flags.contains(TcpFlags::RST) {
        return None;
    }

    let mut reply = TcpRepr {
        src_port: packet.dst_port(),
        dst_port: packet.src_port(),
        flags: TcpFlags::RST,
        seq_number: packet.ack_number(),
        ack_number: TcpSeqNumber(0),
        window_len: 0,
        urgent_at: 0,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None; SACK_MAX_BLOCK_COUNT],
        payload: &[],
    };
    if !flags.contains(TcpFlags::ACK) {
        reply.flags |= TcpFlags::ACK;
        reply.seq_number = TcpSeqNumber(0);
        reply.ack_number = packet.seq_number() + packet.segment_len();
    }
    Some(reply)
}

impl Tcb {
    /// Rewind for a zero window probe and leave any recovery in progress.
    fn probe_closed_window(&mut self) {
        if self.rxmit_timer.is_none() {
            self.send_next = self.send_una;
        }
        self.rtt_timing = None;
        self.exit_recovery();
        self.fast_rxmit = false;
    }

    /// Octets from `send_next` on that could go out, ignoring the windows.
    /// Negative once the FIN is accounted for as sent.
    fn sendable(&mut self, hole: &mut Option<usize>) -> isize {
        if self.in_recovery() {
            if self.sack {
                *hole = self.next_hole();
                if let Some(i) = *hole {
                    self.send_next = self.scoreboard.holes[i].rxmit;
                }
            } else if self.fast_rxmit {
                self.send_next = self.send_una;
            }
        }

        let mut sendable =
            self.tx_buffer.len() as isize - (self.send_next - self.send_una) as isize;
        if let Some(i) = *hole {
            let hole = &self.scoreboard.holes[i];
            sendable = sendable.min(hole.end.distance_from(hole.rxmit) as isize);
        }
        sendable
    }

    /// Whether the receive window has opened far enough to be worth
    /// announcing (RFC 1122 4.2.3.3).
    pub(super) fn window_reopens(&self) -> bool {
        // Without window scaling no more than MAX_WINDOW can ever be announced.
        let window = self.rx_buffer.window().min(MAX_WINDOW);
        let reduction = window.saturating_sub(self.recv_win);
        let threshold = (self.rx_buffer.capacity() / 2).min(2 * self.mss);
        (0 < reduction && threshold <= reduction)
            || (self.mss <= reduction && self.recv_win < self.mss)
    }

    /// Whether there is data, a SYN or a FIN waiting that the windows let out.
    pub(super) fn wants_transmit(&self) -> bool {
        match self.state {
            State::SynSent | State::SynReceived => self.send_next == self.iss,
            State::Closed | State::Listen | State::TimeWait => false,
            _ => {
                let queued = self.tx_buffer.len();
                let in_flight = self.send_next.distance_from(self.send_una);
                let window = self.send_win.min(self.c_win);
                let fin_unsent = matches!(
                    self.state,
                    State::FinWait1 | State::Closing | State::LastAck
                ) && self.send_max.distance_from(self.send_una) <= queued;
                (in_flight < queued && in_flight < window) || fin_unsent
            }
        }
    }

    /// Emit at most one segment. Returns whether one went out.
    pub(super) fn dispatch<F, E>(&mut self, now: Instant, emit: F) -> Result<bool, E>
    where
        F: FnOnce((IpEndpoint, IpEndpoint, TcpRepr)) -> Result<(), E>,
    {
        let Some(tuple) = self.tuple else {
            return Ok(false);
        };

        match self.state {
            State::Listen => return Ok(false),
            State::Closed => {
                if !self.rst_pending {
                    return Ok(false);
                }
                let repr = TcpRepr {
                    src_port: tuple.local.port,
                    dst_port: tuple.remote.port,
                    flags: TcpFlags::RST,
                    seq_number: self.send_max,
                    ack_number: TcpSeqNumber(0),
                    window_len: 0,
                    urgent_at: 0,
                    max_seg_size: None,
                    sack_permitted: false,
                    sack_ranges: [None; SACK_MAX_BLOCK_COUNT],
                    payload: &[],
                };
                emit((tuple.local, tuple.remote, repr))?;
                self.rst_pending = false;
                net_debug!("sent RST to {}", tuple.remote);
                return Ok(true);
            }
            _ => (),
        }

        let synchronizing = matches!(self.state, State::SynSent | State::SynReceived);
        let sends_fin = matches!(self.state, State::FinWait1 | State::Closing | State::LastAck);
        if !synchronizing && self.send_win == 0 && !self.tx_buffer.is_empty() {
            self.probe_closed_window();
        }

        let onxt = self.send_next;
        let mut hole = None;
        let mut flags = TcpFlags::empty();
        let data = if synchronizing {
            // The SYN never carries data.
            if self.send_next == self.iss {
                flags |= TcpFlags::SYN;
            }
            0
        } else {
            self.sendable(&mut hole)
        };
        if sends_fin && 0 <= data && hole.is_none() {
            flags |= TcpFlags::FIN;
        }
        let sendable = data + flags.intersects(TcpFlags::SYN | TcpFlags::FIN) as isize;

        let mss = self.mss;
        let limited = self.config.limited_transmit && self.dup_acks == LIMITED_THRESH;
        let mut win = self.send_win.min(self.c_win);
        if (self.in_recovery() && self.sack) || limited {
            win = self.send_win;
        }
        if flags.contains(TcpFlags::SYN) {
            win = win.max(1);
        } else if win == 0 && 0 < sendable && self.rxmit_timer.is_none() {
            // Zero window probe.
            self.persist = true;
            self.ack_now = true;
            win = 1;
        }

        let mut useable = ((self.send_una + win) - self.send_next).max(0) as isize;
        if self.sack
            && self.in_recovery()
            && !self.fast_rxmit
            && self.c_win.saturating_sub(self.send_awin) < mss
        {
            useable = 0;
        }
        if limited {
            let allowance = (self.c_win + 2 * mss).saturating_sub(self.send_awin);
            useable = useable.min(allowance as isize);
        }

        let sack_blocks = if self.sack && !synchronizing && !self.assembler.is_empty() {
            self.assembler.iter_data(0).take(SACK_MAX_BLOCK_COUNT).count()
        } else {
            0
        };
        let option_len = if sack_blocks > 0 { 4 + 8 * sack_blocks } else { 0 };

        let room = mss.saturating_sub(option_len) as isize;
        let mut len = room.min(sendable).min(useable).max(0) as usize;
        if flags.contains(TcpFlags::FIN) && (len as isize) < sendable {
            flags.remove(TcpFlags::FIN);
        }
        let mut text = len;
        if flags.contains(TcpFlags::SYN) {
            text -= len.min(1);
        }
        if flags.contains(TcpFlags::FIN) {
            text -= 1;
        }
        if 0 < text && text as isize == data && hole.is_none() {
            flags |= TcpFlags::PSH;
        }

        let window_update = self.window_reopens();
        if window_update {
            self.recv_win = self.rx_buffer.window().min(MAX_WINDOW);
        }

        if len == 0 && !self.ack_now && !window_update {
            if self.send_next < onxt {
                self.send_next = onxt;
            }
            if self.recv_acked < self.recv_next {
                self.start_ack_timer(now);
            }
            return Ok(false);
        }

        let ack_number = if self.state == State::SynReceived {
            self.irs + 1
        } else {
            self.recv_next
        };
        let seq_number = if 0 < len { self.send_next } else { self.send_max };
        if self.state != State::SynSent {
            flags |= TcpFlags::ACK;
        }

        let mut repr = TcpRepr {
            src_port: tuple.local.port,
            dst_port: tuple.remote.port,
            flags,
            seq_number,
            ack_number: if flags.contains(TcpFlags::ACK) {
                ack_number
            } else {
                TcpSeqNumber(0)
            },
            window_len: self.recv_win.min(MAX_WINDOW) as u16,
            urgent_at: 0,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None; SACK_MAX_BLOCK_COUNT],
            payload: &[],
        };
        if flags.contains(TcpFlags::SYN) {
            repr.max_seg_size = Some(mss.min(u16::MAX as usize) as u16);
            repr.sack_permitted = match self.state {
                State::SynSent => self.config.sack,
                _ => self.sack,
            };
        } else if sack_blocks > 0 {
            let blocks = self.assembler.iter_data(0);
            for (range, (start, end)) in repr.sack_ranges.iter_mut().zip(blocks) {
                let left = self.recv_next + start;
                let right = self.recv_next + end;
                *range = Some((left.0 as u32, right.0 as u32));
            }
        }

        if 0 < text {
            let offset = self.send_next.distance_from(self.send_una);
            let payload = self.tx_buffer.get_allocated(offset, text);
            if payload.len() < text {
                // The ring wrapped, the rest goes in the next segment.
                len -= text - payload.len();
                text = payload.len();
                if repr.flags.contains(TcpFlags::FIN) {
                    repr.flags.remove(TcpFlags::FIN);
                    len -= 1;
                }
                repr.flags.remove(TcpFlags::PSH);
            }
            repr.payload = payload;
        }
        let sent_flags = repr.flags;

        tcp_trace!(
            "sending seq={} ack={} len={} win={} flags={:?}",
            repr.seq_number,
            repr.ack_number,
            text,
            repr.window_len,
            repr.flags
        );
        emit((tuple.local, tuple.remote, repr))?;

        self.recv_acked = ack_number;
        self.ack_now = false;
        self.ack_timer = None;

        self.send_next += len;
        if self.send_max < self.send_next {
            self.send_max = self.send_next;
            // Only new data is timed.
            if self.rtt_timing.is_none() {
                self.rtt_timing = Some(now);
                self.rtt_seq = seq_number;
            }
        }
        if self.send_next != self.send_una {
            self.start_rxmit_timer(now);
        }
        if let Some(i) = hole {
            self.scoreboard.holes[i].rxmit += len;
            self.rxmit_data += len;
        }
        self.send_awin = self.send_max.distance_from(self.send_fack) + self.rxmit_data;
        if sent_flags.contains(TcpFlags::FIN) {
            net_debug!("sent FIN at {}", self.send_next - 1usize);
        }
        self.fast_rxmit = false;
        if self.send_next < onxt {
            self.send_next = onxt;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::tcp::Config;
    use crate::storage::RingBuffer;
    use crate::socket::tcp::tcb::Tuple;
    use core::net::Ipv4Addr;

    const LOCAL_SEQ: TcpSeqNumber = TcpSeqNumber(1_000);
    const REMOTE_SEQ: TcpSeqNumber = TcpSeqNumber(-1_000);
    const MSS: usize = 500;

    fn tuple() -> Tuple {
        Tuple {
            local: IpEndpoint::new(Ipv4Addr::new(10, 0, 0, 1).into(), 80),
            remote: IpEndpoint::new(Ipv4Addr::new(10, 0, 0, 2).into(), 49500),
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Sent {
        flags: TcpFlags,
        seq: TcpSeqNumber,
        ack: TcpSeqNumber,
        win: u16,
        mss: Option<u16>,
        sack_permitted: bool,
        sack: Vec<(u32, u32)>,
        payload: Vec<u8>,
    }

    fn dispatch(tcb: &mut Tcb) -> Option<Sent> {
        let mut sent = None;
        let result: Result<bool, ()> = tcb.dispatch(Instant::from_secs(1), |(local, remote, repr)| {
            assert_eq!(local, tuple().local);
            assert_eq!(remote, tuple().remote);
            sent = Some(Sent {
                flags: repr.flags,
                seq: repr.seq_number,
                ack: repr.ack_number,
                win: repr.window_len,
                mss: repr.max_seg_size,
                sack_permitted: repr.sack_permitted,
                sack: repr.sack_ranges.iter().flatten().copied().collect(),
                payload: repr.payload.to_vec(),
            });
            Ok(())
        });
        assert_eq!(result, Ok(sent.is_some()));
        sent
    }

    fn dispatch_all(tcb: &mut Tcb) -> Vec<Sent> {
        let mut segments = Vec::new();
        while let Some(sent) = dispatch(tcb) {
            segments.push(sent);
            assert!(segments.len() < 100);
        }
        segments
    }

    fn tcb_established() -> Tcb {
        let mut tcb = Tcb::new(Config::default());
        tcb.tuple = Some(tuple());
        tcb.mss = MSS;
        tcb.c_win = 4 * MSS;
        tcb.set_iss(LOCAL_SEQ);
        tcb.send_una = LOCAL_SEQ + 1;
        tcb.send_next = LOCAL_SEQ + 1;
        tcb.send_max = LOCAL_SEQ + 1;
        tcb.send_fack = LOCAL_SEQ + 1;
        tcb.send_recover = LOCAL_SEQ + 1;
        tcb.set_irs(REMOTE_SEQ);
        tcb.recv_acked = REMOTE_SEQ + 1;
        tcb.send_win = 8 * MSS;
        tcb.state = State::Established;
        tcb
    }

    #[test]
    fn test_rst_reply() {
        let repr = TcpRepr {
            src_port: 49500,
            dst_port: 80,
            flags: TcpFlags::SYN,
            seq_number: REMOTE_SEQ,
            ack_number: TcpSeqNumber(0),
            window_len: 1024,
            urgent_at: 0,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None; SACK_MAX_BLOCK_COUNT],
            payload: &[],
        };
        let mut buffer = vec![0; repr.buffer_len()];
        repr.emit(&mut TcpPacket::new_unchecked(&mut buffer[..]));
        let reply = rst_reply(&TcpPacket::new_unchecked(&buffer[..])).unwrap();
        assert_eq!(reply.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(reply.seq_number, TcpSeqNumber(0));
        assert_eq!(reply.ack_number, REMOTE_SEQ + 1);
        assert_eq!((reply.src_port, reply.dst_port), (80, 49500));

        let repr = TcpRepr {
            flags: TcpFlags::ACK,
            ack_number: LOCAL_SEQ,
            payload: b"abc",
            ..repr
        };
        let mut buffer = vec![0; repr.buffer_len()];
        repr.emit(&mut TcpPacket::new_unchecked(&mut buffer[..]));
        let reply = rst_reply(&TcpPacket::new_unchecked(&buffer[..])).unwrap();
        assert_eq!(reply.flags, TcpFlags::RST);
        assert_eq!(reply.seq_number, LOCAL_SEQ);

        let repr = TcpRepr {
            flags: TcpFlags::RST,
            ..repr
        };
        let mut buffer = vec![0; repr.buffer_len()];
        repr.emit(&mut TcpPacket::new_unchecked(&mut buffer[..]));
        assert_eq!(rst_reply(&TcpPacket::new_unchecked(&buffer[..])), None);
    }

    #[test]
    fn test_syn() {
        let mut tcb = Tcb::new(Config::default());
        tcb.tuple = Some(tuple());
        tcb.mss = 1460;
        tcb.set_iss(LOCAL_SEQ);
        tcb.state = State::SynSent;
        tcb.tx_buffer.enqueue_slice(b"early");

        let sent = dispatch_all(&mut tcb);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flags, TcpFlags::SYN);
        assert_eq!(sent[0].seq, LOCAL_SEQ);
        assert_eq!(sent[0].mss, Some(1460));
        assert!(sent[0].sack_permitted);
        assert!(sent[0].payload.is_empty());
        assert_eq!(tcb.send_max, LOCAL_SEQ + 1);
        assert!(tcb.rxmit_timer.is_some());
        assert!(tcb.rtt_timing.is_some());
    }

    #[test]
    fn test_syn_ack() {
        let mut tcb = Tcb::new(Config::default());
        tcb.tuple = Some(tuple());
        tcb.set_iss(LOCAL_SEQ);
        tcb.set_irs(REMOTE_SEQ);
        tcb.state = State::SynReceived;

        let sent = dispatch_all(&mut tcb);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(sent[0].ack, REMOTE_SEQ + 1);
        // Only offered when the peer offered it.
        assert!(!sent[0].sack_permitted);
    }

    #[test]
    fn test_segments_limited_by_windows() {
        let mut tcb = tcb_established();
        tcb.tx_buffer.enqueue_slice(&[0x55; 10 * MSS]);

        let sent = dispatch_all(&mut tcb);
        assert_eq!(sent.len(), 4);
        for (i, segment) in sent.iter().enumerate() {
            assert_eq!(segment.seq, LOCAL_SEQ + 1 + i * MSS);
            assert_eq!(segment.payload.len(), MSS);
            assert_eq!(segment.flags, TcpFlags::ACK);
        }
        assert_eq!(tcb.send_max, LOCAL_SEQ + 1 + 4 * MSS);
        assert_eq!(tcb.rtt_seq, LOCAL_SEQ + 1);
    }

    #[test]
    fn test_push_on_last_segment() {
        let mut tcb = tcb_established();
        tcb.tx_buffer.enqueue_slice(&[0x55; MSS + 10]);

        let sent = dispatch_all(&mut tcb);
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].flags.contains(TcpFlags::PSH));
        assert!(sent[1].flags.contains(TcpFlags::PSH));
        assert_eq!(sent[1].payload.len(), 10);
    }

    #[test]
    fn test_fin_with_data() {
        let mut tcb = tcb_established();
        tcb.tx_buffer.enqueue_slice(b"bye");
        tcb.shut_wr = true;
        tcb.state = State::FinWait1;

        let sent = dispatch_all(&mut tcb);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].flags.contains(TcpFlags::FIN));
        assert_eq!(sent[0].payload, b"bye");
        assert_eq!(tcb.send_max, LOCAL_SEQ + 5);
    }

    #[test]
    fn test_pure_ack() {
        let mut tcb = tcb_established();
        tcb.recv_next = REMOTE_SEQ + 11;
        assert!(dispatch(&mut tcb).is_none());
        assert!(tcb.ack_timer.is_some());

        tcb.ack_now = true;
        let sent = dispatch(&mut tcb).unwrap();
        assert_eq!(sent.flags, TcpFlags::ACK);
        assert_eq!(sent.seq, LOCAL_SEQ + 1);
        assert_eq!(sent.ack, REMOTE_SEQ + 11);
        assert!(tcb.ack_timer.is_none());
        assert_eq!(tcb.recv_acked, REMOTE_SEQ + 11);
        assert!(dispatch(&mut tcb).is_none());
    }

    #[test]
    fn test_retransmit_not_timed() {
        let mut tcb = tcb_established();
        tcb.tx_buffer.enqueue_slice(&[0x55; 2 * MSS]);
        assert_eq!(dispatch_all(&mut tcb).len(), 2);
        tcb.rtt_timing = None;

        // As after a timeout.
        tcb.send_next = tcb.send_una;
        tcb.rxmit_timer = None;
        let sent = dispatch(&mut tcb).unwrap();
        assert_eq!(sent.seq, LOCAL_SEQ + 1);
        assert!(tcb.rtt_timing.is_none());
    }

    #[test]
    fn test_fast_retransmit_resumes() {
        let mut tcb = tcb_established();
        tcb.tx_buffer.enqueue_slice(&[0x55; 3 * MSS]);
        assert_eq!(dispatch_all(&mut tcb).len(), 3);

        tcb.dup_acks = 3;
        tcb.fast_rxmit = true;
        let sent = dispatch(&mut tcb).unwrap();
        assert_eq!(sent.seq, LOCAL_SEQ + 1);
        assert_eq!(sent.payload.len(), MSS);
        assert_eq!(tcb.send_next, LOCAL_SEQ + 1 + 3 * MSS);
        assert!(!tcb.fast_rxmit);
    }

    #[test]
    fn test_zero_window_probe() {
        let mut tcb = tcb_established();
        tcb.send_win = 0;
        tcb.tx_buffer.enqueue_slice(b"probe");

        let sent = dispatch(&mut tcb).unwrap();
        assert_eq!(sent.payload, b"p");
        assert!(tcb.persist);
        assert!(tcb.rxmit_timer.is_some());
        assert!(dispatch(&mut tcb).is_none());
    }

    #[test]
    fn test_sack_blocks_reported() {
        let mut tcb = tcb_established();
        tcb.sack = true;
        assert_eq!(tcb.rx_buffer.write_unallocated(10, b"abc"), 3);
        tcb.assembler.add(10, 3).unwrap();
        tcb.ack_now = true;

        let sent = dispatch(&mut tcb).unwrap();
        let left = (REMOTE_SEQ + 11).0 as u32;
        assert_eq!(sent.sack, vec![(left, left + 3)]);
    }

    #[test]
    fn test_window_update() {
        let mut tcb = tcb_established();
        let capacity = tcb.rx_buffer.capacity();
        tcb.rx_buffer.enqueue_slice(&vec![0; capacity]);
        tcb.recv_win = 0;
        assert!(dispatch(&mut tcb).is_none());

        let mut data = vec![0; capacity];
        tcb.rx_buffer.dequeue_slice(&mut data);
        let sent = dispatch(&mut tcb).unwrap();
        assert_eq!(sent.win as usize, capacity.min(MAX_WINDOW));
        assert!(dispatch(&mut tcb).is_none());
    }

    #[test]
    fn test_window_update_beyond_max_window() {
        let mut tcb = tcb_established();
        let capacity = 2 * MAX_WINDOW + 2;
        tcb.rx_buffer = RingBuffer::new(vec![0; capacity]);
        tcb.recv_win = MAX_WINDOW;
        assert!(!tcb.window_reopens());
        assert!(dispatch(&mut tcb).is_none());

        tcb.rx_buffer.enqueue_slice(&vec![0; capacity]);
        tcb.recv_win = 0;
        assert!(dispatch(&mut tcb).is_none());

        let mut data = vec![0; capacity];
        tcb.rx_buffer.dequeue_slice(&mut data);
        let sent = dispatch_all(&mut tcb);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].win as usize, MAX_WINDOW);
        assert!(!tcb.window_reopens());
    }

    #[test]
    fn test_pending_rst() {
        let mut tcb = tcb_established();
        tcb.send_max = LOCAL_SEQ + 7;
        tcb.err = Some(crate::socket::tcp::Error::ConnectionAborted);
        tcb.abort();
        tcb.rst_pending = true;

        let sent = dispatch_all(&mut tcb);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].flags, TcpFlags::RST);
        assert_eq!(sent[0].seq, LOCAL_SEQ + 7);
    }
}
