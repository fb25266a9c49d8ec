//! NewReno congestion control with the SACK based loss recovery of RFC 6675.
//!
//! `c_win` grows in slow start below `ss_thresh` and by one MSS per window in
//! congestion avoidance. Three duplicate ACKs start fast retransmit. Partial
//! ACKs keep the connection in fast recovery (RFC 6582) until everything
//! outstanding at its start is acknowledged.

use super::tcb::{MAX_WINDOW, Tcb};
use crate::time::Instant;
use crate::wire::TcpSeqNumber;

/// Duplicate ACKs that trigger fast retransmit.
pub(super) const RXMIT_THRESH: u32 = 3;
/// Duplicate ACKs at which limited transmit lets new data out (RFC 3042).
pub(super) const LIMITED_THRESH: u32 = 2;
pub(super) const DEF_SSTHRESH: usize = 65535;

impl Tcb {
    pub(super) fn in_recovery(&self) -> bool {
        RXMIT_THRESH <= self.dup_acks
    }

    /// Halve the slow start threshold relative to the data in flight.
    pub(super) fn cut_thresh(&mut self) {
        let flight = self.send_max.distance_from(self.send_una);
        self.ss_thresh = (flight / 2).max(2 * self.mss);
        tcp_trace!("ssthresh={}", self.ss_thresh);
    }

    /// Forget fast recovery and the scoreboard, e.g. after a timeout.
    pub(super) fn exit_recovery(&mut self) {
        self.dup_acks = 0;
        self.send_recover = self.send_max;
        self.scoreboard.clear();
        self.send_fack = self.send_una;
        self.rxmit_data = 0;
        self.send_awin = 0;
    }

    fn clamp_window(&mut self) {
        self.c_win = self.c_win.max(self.mss).min(MAX_WINDOW);
    }

    /// Grow the congestion window for an ACK that advances `send_una` to `ack`.
    pub(super) fn open_window(&mut self, ack: TcpSeqNumber) {
        let acked = ack.distance_from(self.send_una);

        if self.in_recovery() {
            // With SACK the window stays put during recovery. Otherwise deflate
            // by what was acked and give back one MSS per MSS acked.
            if !self.sack {
                self.c_win = self.c_win.saturating_sub(acked);
                self.c_acked += acked;
                while self.mss <= self.c_acked {
                    self.c_acked -= self.mss;
                    self.c_win += self.mss;
                }
                self.clamp_window();
            }
            return;
        }

        if self.c_win < self.ss_thresh {
            self.c_win += acked.min(self.mss);
            if self.ss_thresh <= self.c_win {
                self.c_acked = 0;
            }
        } else {
            self.c_acked += acked;
            while self.c_win <= self.c_acked {
                self.c_acked -= self.c_win;
                self.c_win += self.mss;
            }
        }
        self.clamp_window();
        tcp_trace!("cwnd={} ssthresh={}", self.c_win, self.ss_thresh);
    }

    /// Process the acknowledgment carried by an accepted segment.
    ///
    /// `sent` is the number of octets the ACK covers above `send_una`, not
    /// counting a SYN. Returns whether the ACK covers our FIN.
    pub(super) fn ack(
        &mut self,
        now: Instant,
        seq: TcpSeqNumber,
        ack: TcpSeqNumber,
        win: usize,
        sent: usize,
        len: usize,
    ) -> bool {
        let mut fin_acked = false;
        if ack <= self.send_una {
            self.duplicate_ack(now, ack, win, len);
            if ack < self.send_una {
                return false;
            }
        } else {
            fin_acked = self.new_ack(now, ack, sent);
        }

        if self.send_wl1 < seq
            || (self.send_wl1 == seq && self.send_wl2 <= ack)
            || (self.send_wl2 == ack && self.send_win < win)
        {
            self.send_win = win;
            self.send_wl1 = seq;
            self.send_wl2 = ack;
            self.send_max_win = self.send_max_win.max(win);
        }

        if self.send_win == 0 && !self.tx_buffer.is_empty() {
            // The retransmission timer paces the window probes.
            tcp_trace!("zero window, persisting");
            self.persist = true;
            self.r0 = now;
            self.reset_rxmit_timer(now);
        } else {
            self.persist = false;
        }

        if self.send_una == self.send_max {
            self.stop_rxmit_timer();
        }

        fin_acked
    }

    fn duplicate_ack(&mut self, now: Instant, ack: TcpSeqNumber, win: usize, len: usize) {
        if self.dup_acks < RXMIT_THRESH {
            if self.send_una == self.send_max {
                self.dup_acks = 0;
                return;
            }
            // Window updates, segments with data and reordered ACKs do not count.
            if win != self.send_win || len != 0 || ack != self.send_una {
                return;
            }
        }

        let mss = self.mss;
        let sacked = self.send_fack.distance_from(self.send_una);
        self.dup_acks += 1;
        if RXMIT_THRESH < self.dup_acks {
            if !self.sack {
                self.c_win = (self.c_win + mss).min(MAX_WINDOW);
            }
            tcp_trace!("dup ack #{}, cwnd={}", self.dup_acks, self.c_win);
        } else if self.dup_acks == RXMIT_THRESH
            || (self.sack && RXMIT_THRESH as usize * mss < sacked)
        {
            // Not again for the loss a timeout already repaired (RFC 6582 4.1).
            if ack < self.send_recover {
                self.dup_acks = 0;
                return;
            }

            net_debug!("fast retransmit from {}", ack);
            self.cut_thresh();
            self.send_recover = self.send_max;
            self.fast_rxmit = true;
            self.rtt_timing = None;
            self.reset_rxmit_timer(now);
            if self.sack {
                self.dup_acks = RXMIT_THRESH;
                self.c_win = self.ss_thresh;
            } else {
                self.c_win = self.ss_thresh + 3 * mss;
                self.c_acked = 0;
            }
            self.clamp_window();
        } else if self.config.limited_transmit
            && (self.dup_acks == LIMITED_THRESH
                || (self.sack && LIMITED_THRESH as usize * mss < sacked))
        {
            if ack < self.send_recover {
                self.dup_acks = 0;
                return;
            }
            self.dup_acks = LIMITED_THRESH;
        }
    }

    fn new_ack(&mut self, now: Instant, ack: TcpSeqNumber, mut sent: usize) -> bool {
        if self.in_recovery() {
            self.rtt_timing = None;
            if ack < self.send_recover {
                // Partial ACK: the next hole is lost too.
                self.fast_rxmit = true;
                if self.dup_acks == RXMIT_THRESH {
                    self.reset_rxmit_timer(now);
                }
                self.dup_acks += 1;
                self.open_window(ack);
            } else {
                let flight = if self.sack {
                    self.send_awin
                } else {
                    self.send_max.distance_from(ack)
                };
                self.c_win = self.ss_thresh.min(flight + self.mss);
                self.clamp_window();
                self.dup_acks = 0;
                tcp_trace!("recovery done, cwnd={}", self.c_win);
            }
        } else {
            self.dup_acks = 0;
            self.reset_rxmit_timer(now);
            self.open_window(ack);
        }

        self.send_una = ack;
        if self.send_recover < self.send_una {
            self.send_recover = self.send_una;
        }
        if self.send_next < self.send_una {
            self.send_next = self.send_una;
        }
        self.delete_sack_holes(ack);
        if self.send_fack < self.send_una {
            self.send_fack = self.send_una;
            self.send_awin = self.send_next.distance_from(self.send_fack) + self.rxmit_data;
        }

        let queued = self.tx_buffer.len();
        let fin_acked = queued < sent;
        if fin_acked {
            sent -= 1;
        }
        let retired = sent.min(queued);
        if 0 < retired {
            self.tx_buffer.dequeue_allocated(retired);
            self.wake = true;
        }

        if self.rtt_timing.is_some() && self.rtt_seq < ack {
            self.update_rto(now);
        }

        fin_acked
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rand::Rand;
    use crate::socket::tcp::{Config, State};
    use crate::time::Duration;

    const ISS: TcpSeqNumber = TcpSeqNumber(-100);
    const PEER: TcpSeqNumber = TcpSeqNumber(5000);
    const MSS: usize = 1000;

    /// An established connection with `segments` full segments in flight.
    fn tcb_sending(segments: usize) -> Tcb {
        let mut tcb = Tcb::new(Config::default());
        tcb.state = State::Established;
        tcb.mss = MSS;
        tcb.c_win = 10 * MSS;
        tcb.set_iss(ISS);
        tcb.set_irs(PEER - 1);
        let data = vec![0xa5; segments * MSS];
        assert_eq!(tcb.tx_buffer.enqueue_slice(&data), data.len());
        tcb.send_next = ISS + segments * MSS;
        tcb.send_max = tcb.send_next;
        tcb.send_win = 8000;
        tcb.send_max_win = 8000;
        tcb.send_wl1 = PEER;
        tcb.send_wl2 = ISS;
        tcb
    }

    fn ack(tcb: &mut Tcb, ack: TcpSeqNumber) -> bool {
        let sent = ack.distance_from(tcb.send_una);
        let win = tcb.send_win;
        tcb.ack(Instant::from_secs(1), PEER, ack, win, sent, 0)
    }

    #[test]
    fn test_slow_start() {
        let mut tcb = tcb_sending(4);
        tcb.c_win = 2 * MSS;
        assert!(!ack(&mut tcb, ISS + MSS));
        assert_eq!(tcb.c_win, 3 * MSS);
        assert_eq!(tcb.send_una, ISS + MSS);
        assert_eq!(tcb.tx_buffer.len(), 3 * MSS);
        assert!(tcb.rxmit_timer.is_some());

        // At most one MSS per ACK.
        assert!(!ack(&mut tcb, ISS + 3 * MSS));
        assert_eq!(tcb.c_win, 4 * MSS);
    }

    #[test]
    fn test_congestion_avoidance() {
        let mut tcb = tcb_sending(8);
        tcb.c_win = 4 * MSS;
        tcb.ss_thresh = 4 * MSS;
        for i in 1..=3 {
            ack(&mut tcb, ISS + i * MSS);
            assert_eq!(tcb.c_win, 4 * MSS);
        }
        ack(&mut tcb, ISS + 4 * MSS);
        assert_eq!(tcb.c_win, 5 * MSS);
        assert_eq!(tcb.c_acked, 0);
    }

    #[test]
    fn test_all_acked_stops_timer() {
        let mut tcb = tcb_sending(2);
        ack(&mut tcb, ISS + 2 * MSS);
        assert!(tcb.tx_buffer.is_empty());
        assert_eq!(tcb.rxmit_timer, None);
    }

    #[test]
    fn test_fast_retransmit_once() {
        let mut tcb = tcb_sending(6);
        tcb.rtt_timing = Some(Instant::from_millis(500));
        tcb.rtt_seq = ISS;

        ack(&mut tcb, ISS);
        ack(&mut tcb, ISS);
        assert_eq!(tcb.dup_acks, 2);
        assert!(!tcb.fast_rxmit);
        assert_eq!(tcb.ss_thresh, DEF_SSTHRESH);

        ack(&mut tcb, ISS);
        assert!(tcb.fast_rxmit);
        assert_eq!(tcb.ss_thresh, 3 * MSS);
        assert_eq!(tcb.c_win, 6 * MSS);
        assert_eq!(tcb.send_recover, ISS + 6 * MSS);
        assert_eq!(tcb.rtt_timing, None);

        // Further duplicates inflate the window, nothing else.
        tcb.fast_rxmit = false;
        ack(&mut tcb, ISS);
        assert!(!tcb.fast_rxmit);
        assert_eq!(tcb.ss_thresh, 3 * MSS);
        assert_eq!(tcb.c_win, 7 * MSS);
    }

    #[test]
    fn test_dup_ack_filters() {
        let mut tcb = tcb_sending(6);
        // A window update is not a duplicate.
        tcb.ack(Instant::from_secs(1), PEER, ISS, 9000, 0, 0);
        assert_eq!(tcb.dup_acks, 0);
        assert_eq!(tcb.send_win, 9000);
        // Neither is a segment carrying data.
        tcb.ack(Instant::from_secs(1), PEER, ISS, 9000, 0, 100);
        assert_eq!(tcb.dup_acks, 0);
    }

    #[test]
    fn test_no_recovery_after_timeout() {
        let mut tcb = tcb_sending(6);
        tcb.config.limited_transmit = false;
        tcb.send_recover = tcb.send_max;
        for _ in 0..3 {
            ack(&mut tcb, ISS);
        }
        assert!(!tcb.fast_rxmit);
        assert_eq!(tcb.dup_acks, 0);
    }

    #[test]
    fn test_partial_and_full_ack() {
        let mut tcb = tcb_sending(6);
        for _ in 0..3 {
            ack(&mut tcb, ISS);
        }
        tcb.fast_rxmit = false;
        assert_eq!(tcb.c_win, 6 * MSS);

        // Partial ACK: deflate by 2 MSS, give one back per MSS acked.
        ack(&mut tcb, ISS + 2 * MSS);
        assert!(tcb.fast_rxmit);
        assert!(tcb.in_recovery());
        assert_eq!(tcb.c_win, 6 * MSS);

        // Full ACK: out of recovery with cwnd = min(ssthresh, flight + mss).
        ack(&mut tcb, ISS + 6 * MSS);
        assert!(!tcb.in_recovery());
        assert_eq!(tcb.c_win, MSS);
        assert_eq!(tcb.dup_acks, 0);
    }

    #[test]
    fn test_limited_transmit() {
        let mut tcb = tcb_sending(6);
        tcb.sack = true;
        tcb.send_fack = ISS + 2 * MSS + 500;
        ack(&mut tcb, ISS);
        assert_eq!(tcb.dup_acks, LIMITED_THRESH);

        let mut tcb = tcb_sending(6);
        tcb.config.limited_transmit = false;
        tcb.sack = true;
        tcb.send_fack = ISS + 2 * MSS + 500;
        ack(&mut tcb, ISS);
        assert_eq!(tcb.dup_acks, 1);
    }

    #[test]
    fn test_sack_enters_recovery_early() {
        let mut tcb = tcb_sending(6);
        tcb.sack = true;
        tcb.send_fack = ISS + 5 * MSS;
        ack(&mut tcb, ISS);
        assert_eq!(tcb.dup_acks, RXMIT_THRESH);
        assert!(tcb.fast_rxmit);
        assert_eq!(tcb.c_win, tcb.ss_thresh);
    }

    #[test]
    fn test_fin_acked() {
        let mut tcb = tcb_sending(1);
        // FIN sent after the data.
        tcb.send_next = tcb.send_next + 1;
        tcb.send_max = tcb.send_next;
        assert!(ack(&mut tcb, ISS + MSS + 1));
        assert!(tcb.tx_buffer.is_empty());
    }

    #[test]
    fn test_duplicate_never_acks_fin() {
        let mut tcb = tcb_sending(1);
        tcb.send_next = tcb.send_next + 1;
        tcb.send_max = tcb.send_next;
        assert!(!ack(&mut tcb, ISS));
    }

    #[test]
    fn test_window_update_rules() {
        let mut tcb = tcb_sending(2);
        // Older segment: ignored.
        tcb.ack(Instant::from_secs(1), PEER - 10, ISS + MSS, 100, MSS, 0);
        assert_eq!(tcb.send_win, 8000);
        // Newer segment: taken.
        tcb.ack(Instant::from_secs(1), PEER + 10, ISS + MSS, 4000, 0, 0);
        assert_eq!(tcb.send_win, 4000);
        assert_eq!(tcb.send_wl1, PEER + 10);
        assert_eq!(tcb.send_max_win, 8000);
    }

    #[test]
    fn test_zero_window_persists() {
        let mut tcb = tcb_sending(2);
        tcb.ack(Instant::from_secs(1), PEER + 1, ISS + MSS, 0, MSS, 0);
        assert!(tcb.persist);
        assert_eq!(tcb.r0, Instant::from_secs(1));
        assert!(tcb.rxmit_timer.is_some());

        tcb.ack(Instant::from_secs(2), PEER + 2, ISS + MSS, 2000, 0, 0);
        assert!(!tcb.persist);
    }

    #[test]
    fn test_rtt_sample() {
        let mut tcb = tcb_sending(2);
        tcb.rtt_timing = Some(Instant::from_millis(200));
        tcb.rtt_seq = ISS;
        ack(&mut tcb, ISS + MSS);
        assert_eq!(tcb.rtt_timing, None);
        // 800 ms sample: rto = 800 + 4 * 400.
        assert_eq!(
            tcb.rtte.retransmission_timeout(),
            Duration::from_millis(2400)
        );
    }

    #[test]
    fn test_cwnd_bounds() {
        let mut rand = Rand::new(0x1234);
        let mut tcb = tcb_sending(8);
        tcb.c_win = 2 * MSS;
        for _ in 0..2000 {
            let in_flight = tcb.send_max.distance_from(tcb.send_una);
            if in_flight == 0 || tcb.tx_buffer.len() < MSS {
                tcb = tcb_sending(8);
                tcb.c_win = 2 * MSS;
                continue;
            }
            let ack_to = match rand.rand_u32() % 4 {
                0 => tcb.send_una,
                _ => tcb.send_una + (rand.rand_u32() as usize % in_flight + 1),
            };
            ack(&mut tcb, ack_to);
            assert!(0 < tcb.c_win && tcb.c_win <= MAX_WINDOW, "cwnd={}", tcb.c_win);
        }
    }
}
