//! Inbound segment processing, one handler per connection state.
//!
//! Every handler has the same shape: RST and SYN preconditions first, then
//! [Tcb::trim], options, the acknowledgment ([Tcb::ack]), the urgent
//! pointer, the payload, and finally the FIN.

use super::options::Options;
use super::tcb::{Tcb, Tuple, isn};
use super::{Error, State};
use crate::socket::Context;
use crate::time::Instant;
use crate::wire::{TcpFlags, TcpPacket, TcpSeqNumber};

/// The fields of an inbound segment that the handlers consume and trim.
#[derive(Debug, Clone, Copy)]
pub(super) struct Segment<'a> {
    pub flags: TcpFlags,
    pub seq: TcpSeqNumber,
    pub ack: TcpSeqNumber,
    pub win: usize,
    pub urg: usize,
    /// Length in sequence space, SYN and FIN included.
    pub len: usize,
    /// Octets trimmed off the front of `payload`.
    pub offset: usize,
    pub payload: &'a [u8],
    pub options: &'a [u8],
}

impl<'a> Segment<'a> {
    pub fn new(packet: &TcpPacket<&'a [u8]>) -> Segment<'a> {
        Segment {
            flags: packet.flags(),
            seq: packet.seq_number(),
            ack: packet.ack_number(),
            win: packet.window_len() as usize,
            urg: packet.urgent_at() as usize,
            len: packet.segment_len(),
            offset: 0,
            payload: packet.payload(),
            options: packet.options(),
        }
    }

    /// Octets of data left in the segment.
    pub fn text(&self) -> usize {
        let mut len = self.len;
        if self.flags.contains(TcpFlags::SYN) {
            len = len.saturating_sub(1);
        }
        if self.flags.contains(TcpFlags::FIN) {
            len = len.saturating_sub(1);
        }
        len
    }

    pub fn data(&self) -> &'a [u8] {
        self.payload
            .get(self.offset..self.offset + self.text())
            .unwrap_or(&[])
    }
}

/// What the socket layer has to do after a segment went through a handler.
#[derive(Debug, Default)]
pub(super) struct Outcome {
    /// Answer the segment with a reset.
    pub reset: bool,
    /// Call dispatch, there is something to send.
    pub output: bool,
    /// A passively opened connection just completed its handshake.
    pub established: bool,
    /// A connection spawned by a listener, in SYN-RECEIVED.
    pub spawned: Option<Tcb>,
}

impl Outcome {
    fn dropped() -> Outcome {
        Outcome::default()
    }

    fn output() -> Outcome {
        Outcome {
            output: true,
            ..Outcome::default()
        }
    }

    fn reset() -> Outcome {
        Outcome {
            reset: true,
            ..Outcome::default()
        }
    }
}

impl Tcb {
    /// Run one inbound segment through the state machine.
    ///
    /// `tuple` is the connection the segment belongs to, seen from this end.
    /// The packet must have passed `TcpPacket::check_len`.
    pub(super) fn input(&mut self, cx: &Context, tuple: Tuple, packet: &TcpPacket<&[u8]>) -> Outcome {
        let mut seg = Segment::new(packet);
        let now = cx.now();
        tcp_trace!(
            "{}: seq={} ack={} len={} flags={:?}",
            self.state,
            seg.seq,
            seg.ack,
            seg.len,
            seg.flags
        );

        match self.state {
            State::Closed => {
                if seg.flags.contains(TcpFlags::RST) {
                    Outcome::dropped()
                } else {
                    Outcome::reset()
                }
            }
            State::Listen => self.listen_input(cx, tuple, &seg),
            State::SynSent => self.syn_sent_input(now, &mut seg),
            State::SynReceived => self.syn_received_input(now, &mut seg),
            State::TimeWait => self.time_wait_input(now, &mut seg),
            State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait
            | State::Closing
            | State::LastAck => self.synchronized_input(now, &mut seg),
        }
    }

    fn listen_input(&mut self, cx: &Context, tuple: Tuple, seg: &Segment) -> Outcome {
        if seg.flags.contains(TcpFlags::RST) {
            return Outcome::dropped();
        }
        if seg.flags.contains(TcpFlags::ACK) {
            return Outcome::reset();
        }
        if !seg.flags.contains(TcpFlags::SYN) {
            return Outcome::dropped();
        }

        let options = Options::parse(seg.flags, seg.options);
        let mut child = Tcb::new(self.config);
        child.tuple = Some(tuple);
        child.listen_endpoint = self.listen_endpoint;
        child.init_mss(cx, &tuple.remote.addr);
        child.set_iss(isn(cx, &tuple));
        child.set_irs(seg.seq);
        child.apply_options(&options, seg.flags, seg.ack);
        child.set_state(State::SynReceived);
        net_debug!("SYN from {} to {}", tuple.remote, tuple.local);

        Outcome {
            spawned: Some(child),
            ..Outcome::default()
        }
    }

    fn syn_sent_input(&mut self, now: Instant, seg: &mut Segment) -> Outcome {
        let has_ack = seg.flags.contains(TcpFlags::ACK);
        if has_ack && (seg.ack <= self.iss || self.send_max < seg.ack) {
            net_debug!("unacceptable ACK {} in SYN-SENT", seg.ack);
            return Outcome::reset();
        }
        if seg.flags.contains(TcpFlags::RST) {
            if has_ack {
                self.err = Some(Error::ConnectionReset);
                self.abort();
            }
            return Outcome::dropped();
        }
        if !seg.flags.contains(TcpFlags::SYN) {
            return Outcome::dropped();
        }

        self.set_irs(seg.seq);
        let options = Options::parse(seg.flags, seg.options);
        self.apply_options(&options, seg.flags, seg.ack);

        if has_ack && self.iss < seg.ack {
            if self.rtt_timing.is_some() && self.rtt_seq < seg.ack {
                self.update_rto(now);
            }
            // Our SYN is acknowledged, data the ACK covers is left to ack().
            self.send_una += 1;
            if self.send_next < self.send_una {
                self.send_next = self.send_una;
            }
            self.set_state(State::Established);
            self.send_win = seg.win;
            self.send_wl1 = seg.seq;
            self.send_wl2 = seg.ack;
            self.send_max_win = seg.win;
            self.ack_now = true;
        } else {
            // Simultaneous open: answer with SYN,ACK.
            self.set_state(State::SynReceived);
            self.send_next = self.send_una;
        }

        if !self.trim(seg) || !has_ack {
            return Outcome::output();
        }
        self.process(now, seg)
    }

    fn syn_received_input(&mut self, now: Instant, seg: &mut Segment) -> Outcome {
        let has_ack = seg.flags.contains(TcpFlags::ACK);
        // The ACK test comes before anything else, an ACK of something other
        // than our SYN must not be answered with an ACK.
        if has_ack && (seg.ack < self.send_una || self.send_max < seg.ack) {
            return Outcome::reset();
        }
        if seg.seq < self.irs {
            return Outcome::reset();
        }
        if seg.flags.contains(TcpFlags::RST) {
            self.reset(seg.seq, Some(Error::ConnectionRefused));
            return Outcome::dropped();
        }
        if !self.trim(seg) {
            return Outcome::output();
        }
        if seg.flags.contains(TcpFlags::SYN) {
            self.err = Some(Error::ConnectionAborted);
            self.abort();
            return Outcome::reset();
        }

        let mut established = false;
        if has_ack {
            let mut sent = seg.ack.distance_from(self.send_una);
            if self.iss < seg.ack {
                if self.send_una == self.iss {
                    sent -= 1;
                }
                if self.shut_wr {
                    self.set_state(State::FinWait1);
                } else {
                    self.set_state(State::Established);
                }
                self.send_win = seg.win;
                self.send_wl1 = seg.seq;
                self.send_wl2 = seg.ack;
                self.send_max_win = seg.win;
                established = self.listening.is_some();
            }

            let options = Options::parse(seg.flags, seg.options);
            self.apply_options(&options, seg.flags, seg.ack);
            self.ack(now, seg.seq, seg.ack, seg.win, sent, seg.len);
        }

        let mut outcome = self.receive(now, seg);
        outcome.established = established;
        outcome
    }

    fn synchronized_input(&mut self, now: Instant, seg: &mut Segment) -> Outcome {
        if seg.flags.contains(TcpFlags::RST) {
            // Our FIN is out, a reset is as good as its acknowledgment.
            let err = match self.state {
                State::Closing | State::LastAck => None,
                _ => Some(Error::ConnectionReset),
            };
            self.reset(seg.seq, err);
            return Outcome::dropped();
        }
        if !self.trim(seg) {
            return Outcome::output();
        }
        if seg.flags.contains(TcpFlags::SYN) {
            net_debug!("SYN in window, aborting");
            self.err = Some(Error::ConnectionAborted);
            self.abort();
            return Outcome::reset();
        }
        if !seg.flags.contains(TcpFlags::ACK) {
            return Outcome::dropped();
        }
        self.process(now, seg)
    }

    fn time_wait_input(&mut self, now: Instant, seg: &mut Segment) -> Outcome {
        if seg.flags.contains(TcpFlags::RST) {
            self.reset(seg.seq, None);
            return Outcome::dropped();
        }
        // RFC 1122 4.2.2.13: a new SYN may end TIME-WAIT early.
        if seg.flags.contains(TcpFlags::SYN)
            && !seg.flags.contains(TcpFlags::ACK)
            && self.recv_next <= seg.seq
        {
            net_debug!("new SYN in TIME-WAIT, closing");
            self.abort();
            return Outcome::dropped();
        }
        if !self.trim(seg) {
            return Outcome::output();
        }
        if seg.flags.contains(TcpFlags::SYN) {
            self.abort();
            return Outcome::reset();
        }
        if !seg.flags.contains(TcpFlags::ACK) {
            return Outcome::dropped();
        }
        if self.send_max < seg.ack {
            self.ack_now = true;
            return Outcome::output();
        }

        let options = Options::parse(seg.flags, seg.options);
        self.apply_options(&options, seg.flags, seg.ack);
        let sent = seg.ack.distance_from(self.send_una);
        self.ack(now, seg.seq, seg.ack, seg.win, sent, seg.len);

        // Acknowledge and wait another 2*MSL.
        self.ack_now = true;
        self.rtte.set_time_wait();
        self.reset_rxmit_timer(now);
        Outcome::output()
    }

    /// Acknowledgment and everything after it, for an accepted segment with ACK.
    fn process(&mut self, now: Instant, seg: &mut Segment) -> Outcome {
        if self.send_max < seg.ack {
            // Acknowledges something not yet sent.
            self.ack_now = true;
            return Outcome::output();
        }

        let options = Options::parse(seg.flags, seg.options);
        self.apply_options(&options, seg.flags, seg.ack);
        let sent = seg.ack.distance_from(self.send_una);
        let fin_acked = self.ack(now, seg.seq, seg.ack, seg.win, sent, seg.len);

        match self.state {
            State::FinWait1 if fin_acked => self.set_state(State::FinWait2),
            State::Closing if fin_acked => self.time_wait(now),
            State::LastAck if fin_acked => {
                self.err = None;
                self.abort();
                return Outcome::dropped();
            }
            _ => (),
        }

        match self.state {
            // The peer's FIN is in, nothing more to receive.
            State::CloseWait | State::Closing | State::LastAck | State::TimeWait => {
                Outcome::output()
            }
            _ => self.receive(now, seg),
        }
    }

    /// Urgent pointer, payload and FIN of an accepted segment.
    fn receive(&mut self, now: Instant, seg: &mut Segment) -> Outcome {
        if seg.flags.contains(TcpFlags::URG) {
            self.urg(seg);
        }
        if !self.text(seg) {
            return Outcome::reset();
        }
        if seg.flags.contains(TcpFlags::FIN) {
            self.recv_next += 1;
            self.ack_now = true;
            match self.state {
                State::FinWait1 => self.set_state(State::Closing),
                State::FinWait2 => self.time_wait(now),
                _ => self.set_state(State::CloseWait),
            }
        }
        Outcome::output()
    }

    fn urg(&mut self, seg: &Segment) {
        let up = seg.seq + seg.urg;
        if self.recv_up < up {
            self.recv_up = up;
        }
        if seg.urg <= seg.text() {
            self.have_urg = true;
        }
    }

    /// Copy the payload into the receive ring. Returns false if the
    /// connection was aborted for receiving data after input was shut down.
    fn text(&mut self, seg: &mut Segment) -> bool {
        let data = seg.data();
        if self.shut_rd && !data.is_empty() {
            net_debug!("data after input shutdown, aborting");
            self.err = Some(Error::ConnectionAborted);
            self.abort();
            return false;
        }

        if self.recv_next == seg.seq {
            if data.is_empty() {
                return true;
            }
            if seg.flags.contains(TcpFlags::PSH) {
                self.ack_now = true;
            }
            let written = self.rx_buffer.write_unallocated(0, data);
            // In-order data always joins the front.
            let front = self
                .assembler
                .add_then_remove_front(0, written)
                .unwrap_or(written);
            self.rx_buffer.enqueue_unallocated(front);
            self.recv_next += front;
            self.recv_win = self.recv_win.saturating_sub(front);
            self.wake = true;
            tcp_trace!(
                "rx buffer: received {} octets, {} in order (now {})",
                written,
                front,
                self.rx_buffer.len()
            );
        } else {
            debug_assert!(self.recv_next < seg.seq);
            // RFC 5681 4.2: out-of-order data is acknowledged immediately.
            if !data.is_empty() {
                self.ack_now = true;
            }
            let offset = seg.seq.distance_from(self.recv_next);
            let written = self.rx_buffer.write_unallocated(offset, data);
            match self.assembler.add(offset, written) {
                Ok(()) => tcp_trace!("assembler: {}", self.assembler),
                Err(_) => net_debug!("assembler: too many holes, dropping {} octets", written),
            }
            // The FIN is taken again once the gap is filled.
            if seg.flags.contains(TcpFlags::FIN) {
                seg.flags.remove(TcpFlags::FIN);
                seg.len -= 1;
            }
        }
        true
    }
}
