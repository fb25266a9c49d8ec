use super::State;
use super::tcb::{Tcb, default_mss};
use crate::time::{Duration, Instant};

/// Lower bound of the retransmission timeout.
pub(super) const RTT_MIN: Duration = Duration::from_secs(1);
/// Maximum segment lifetime.
pub(super) const MSL: Duration = Duration::from_secs(120);
/// Upper bound of the retransmission timeout.
pub(super) const RTT_MAX: Duration = Duration::from_secs(240);
/// Timeout used before the first RTT sample (RFC 1122 4.2.3.1).
pub(super) const RTT_DEFAULT: Duration = Duration::from_secs(3);

/// Retransmissions after which the connection may time out (RFC 1122 4.2.3.5).
pub(super) const R1: u32 = 3;
/// Time without progress after which a synchronized connection times out.
pub(super) const R2: Duration = Duration::from_secs(100);
/// Time without progress after which a connection attempt times out.
pub(super) const R2_SYN: Duration = Duration::from_secs(180);
/// Retransmissions after which an established connection falls back to the default MSS.
pub(super) const PMTUD_BACKOFF: u32 = 4;
pub(super) const MAX_BACKOFF: u32 = 16;
/// How long a zero window may stay closed before the connection is dropped.
pub(super) const PERSIST_MAX: Duration = Duration::from_secs(240 * 16);

/// Delay before acknowledging data that did not ask for an immediate ACK.
pub(super) const ACK_DELAY: Duration = Duration::from_millis(200);

/// Retransmission timeout estimator, RFC 6298 with integer gains.
#[derive(Debug, Clone, Copy)]
pub(super) struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    /// Expiries since the last forward progress.
    rxmit_count: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: RTT_DEFAULT / 4,
            rto: RTT_DEFAULT,
            rxmit_count: 0,
        }
    }
}

impl RttEstimator {
    pub fn retransmission_timeout(&self) -> Duration {
        self.rto
    }

    pub fn rxmit_count(&self) -> u32 {
        self.rxmit_count
    }

    pub fn sample(&mut self, rtt: Duration) {
        let srtt = match self.srtt {
            Some(srtt) => {
                let delta = rtt.total_micros() as i64 - srtt.total_micros() as i64;
                let srtt = (srtt.total_micros() as i64 + delta / 8).max(0);
                let rttvar = self.rttvar.total_micros() as i64;
                let rttvar = rttvar + (delta.abs() - rttvar) / 4;
                self.rttvar = Duration::from_micros(rttvar.max(0) as u64);
                Duration::from_micros(srtt as u64)
            }
            None => {
                self.rttvar = rtt / 2;
                rtt
            }
        };
        self.srtt = Some(srtt);
        self.rto = (srtt + self.rttvar * 4).clamp(RTT_MIN, RTT_MAX);
        self.rxmit_count = 0;

        tcp_trace!(
            "rtte: sample={} srtt={} rttvar={} rto={}",
            rtt,
            srtt,
            self.rttvar,
            self.rto
        );
    }

    /// Double the timeout after an expiry.
    pub fn back_off(&mut self) {
        self.rxmit_count = (self.rxmit_count + 1).min(MAX_BACKOFF);
        self.rto = (self.rto * 2).min(RTT_MAX);
        tcp_trace!("rtte: backing off, rto={} count={}", self.rto, self.rxmit_count);
    }

    pub fn reset_count(&mut self) {
        self.rxmit_count = 0;
    }

    /// TIME-WAIT reuses the retransmission timer for its 2*MSL wait.
    pub fn set_time_wait(&mut self) {
        self.rto = MSL * 2;
    }
}

impl Tcb {
    /// Fold the round trip of the timed segment into the estimator.
    pub(super) fn update_rto(&mut self, now: Instant) {
        if let Some(sent_at) = self.rtt_timing.take() {
            self.rtte.sample(now - sent_at);
        }
    }

    pub(super) fn start_rxmit_timer(&mut self, now: Instant) {
        if self.rxmit_timer.is_some() {
            return;
        }
        if self.rtte.rxmit_count() == 0 {
            self.r0 = now;
        }
        self.rxmit_timer = Some(now + self.rtte.retransmission_timeout());
    }

    pub(super) fn stop_rxmit_timer(&mut self) {
        self.rtte.reset_count();
        self.rxmit_timer = None;
    }

    pub(super) fn reset_rxmit_timer(&mut self, now: Instant) {
        self.stop_rxmit_timer();
        self.start_rxmit_timer(now);
    }

    pub(super) fn start_ack_timer(&mut self, now: Instant) {
        if self.ack_timer.is_none() {
            self.ack_timer = Some(now + ACK_DELAY);
        }
    }

    /// Run whichever timers are due. Returns whether output is requested.
    pub(super) fn timer_fired(&mut self, now: Instant) -> bool {
        let mut output = false;
        if self.ack_timer.is_some_and(|at| at <= now) {
            self.ack_timer = None;
            output |= self.recv_acked < self.recv_next;
        }
        if self.rxmit_timer.is_some_and(|at| at <= now) {
            self.rxmit_timer = None;
            output |= self.rxmit_expired(now);
        }
        output
    }

    fn rxmit_expired(&mut self, now: Instant) -> bool {
        match self.state {
            State::TimeWait => {
                net_debug!("TIME-WAIT timer expired");
                self.abort();
                return false;
            }
            State::Closed | State::Listen => return false,
            _ => (),
        }

        self.rtte.back_off();
        let count = self.rtte.rxmit_count();
        if !self.persist {
            if count == PMTUD_BACKOFF && self.has_been_established() {
                if let Some(tuple) = self.tuple {
                    self.mss = self.mss.min(default_mss(&tuple.remote.addr));
                }
            }
            if R1 < count && self.r2 <= now - self.r0 {
                net_debug!("retransmission timeout after {} attempts", count);
                self.err.get_or_insert(super::Error::TimedOut);
                self.abort();
                return false;
            }
        } else if PERSIST_MAX <= now - self.r0 {
            net_debug!("persist timeout");
            self.err.get_or_insert(super::Error::TimedOut);
            self.abort();
            return false;
        }

        net_debug!("retransmitting from {}", self.send_una);
        self.send_next = self.send_una;
        self.rtt_timing = None;
        self.cut_thresh();
        self.c_win = self.mss;
        self.exit_recovery();
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::socket::tcp::tcb::{DEFAULT_MSS, Tuple};
    use crate::socket::tcp::{Config, Error};
    use crate::wire::IpEndpoint;
    use core::net::Ipv4Addr;

    const START: Instant = Instant::from_millis_const(10_000);

    fn tcb(state: State) -> Tcb {
        let mut tcb = Tcb::new(Config::default());
        tcb.tuple = Some(Tuple {
            local: IpEndpoint::new(Ipv4Addr::new(10, 0, 0, 1).into(), 80),
            remote: IpEndpoint::new(Ipv4Addr::new(10, 0, 0, 2).into(), 49500),
        });
        tcb.mss = 1460;
        tcb.set_state(state);
        tcb
    }

    /// Let the retransmission timer expire, resending each time, until the
    /// connection gives up. Returns the number of expiries and when it gave up.
    fn expire_until_closed(tcb: &mut Tcb) -> (u32, Instant) {
        tcb.start_rxmit_timer(START);
        let mut expiries = 0;
        let mut now = START;
        while tcb.state != State::Closed {
            now = tcb.rxmit_timer.expect("no retransmission timer");
            expiries += 1;
            if tcb.timer_fired(now) {
                tcb.start_rxmit_timer(now);
            }
            assert!(expiries < 100);
        }
        (expiries, now)
    }

    #[test]
    fn test_syn_sent_times_out() {
        let mut tcb = tcb(State::SynSent);
        let (expiries, at) = expire_until_closed(&mut tcb);
        // 3 + 6 + 12 + 24 + 48 + 96 seconds: the first expiry past R2_SYN
        // once more than R1 retransmissions went out.
        assert_eq!(expiries, 6);
        assert_eq!(at - START, Duration::from_secs(189));
        assert!(R2_SYN <= at - START);
        assert_eq!(tcb.err, Some(Error::TimedOut));
        assert_eq!(tcb.mss, 1460);
    }

    #[test]
    fn test_established_times_out() {
        let mut tcb = tcb(State::Established);
        tcb.rtte.sample(Duration::from_secs(2));
        let (expiries, at) = expire_until_closed(&mut tcb);
        // 6 + 12 + 24 + 48 + 96 seconds.
        assert_eq!(expiries, 5);
        assert_eq!(at - START, Duration::from_secs(186));
        assert!(R2 <= at - START);
        assert_eq!(tcb.err, Some(Error::TimedOut));
    }

    #[test]
    fn test_no_timeout_before_r1() {
        let mut tcb = tcb(State::Established);
        tcb.r2 = Duration::ZERO;
        tcb.start_rxmit_timer(START);
        for _ in 0..R1 {
            let now = tcb.rxmit_timer.unwrap();
            assert!(tcb.timer_fired(now));
            tcb.start_rxmit_timer(now);
        }
        assert_eq!(tcb.state, State::Established);
        let now = tcb.rxmit_timer.unwrap();
        assert!(!tcb.timer_fired(now));
        assert_eq!(tcb.state, State::Closed);
    }

    #[test]
    fn test_mss_falls_back_on_fourth_backoff() {
        let mut tcb = tcb(State::Established);
        tcb.start_rxmit_timer(START);
        for count in 1..=PMTUD_BACKOFF {
            let now = tcb.rxmit_timer.unwrap();
            assert!(tcb.timer_fired(now));
            tcb.start_rxmit_timer(now);
            if count < PMTUD_BACKOFF {
                assert_eq!(tcb.mss, 1460);
            }
        }
        assert_eq!(tcb.mss, DEFAULT_MSS);
        assert_eq!(tcb.c_win, DEFAULT_MSS);
        assert_eq!(tcb.state, State::Established);
    }

    #[test]
    fn test_persist_outlives_r2() {
        let mut tcb = tcb(State::Established);
        tcb.persist = true;
        let (expiries, at) = expire_until_closed(&mut tcb);
        assert!(R1 + 3 < expiries);
        assert!(PERSIST_MAX <= at - START);
        assert!(at - START < PERSIST_MAX + RTT_MAX);
        assert_eq!(tcb.err, Some(Error::TimedOut));
        // Probing keeps the path MSS.
        assert_eq!(tcb.mss, 1460);
    }

    #[test]
    fn test_time_wait_expiry_is_clean() {
        let mut tcb = tcb(State::Established);
        tcb.time_wait(START);
        assert_eq!(tcb.rxmit_timer, Some(START + MSL * 2));
        assert!(!tcb.timer_fired(START + MSL * 2));
        assert_eq!(tcb.state, State::Closed);
        assert_eq!(tcb.err, None);
    }

    #[test]
    fn test_initial_rto() {
        let rtte = RttEstimator::default();
        assert_eq!(rtte.retransmission_timeout(), RTT_DEFAULT);
    }

    #[test]
    fn test_sample_clamps_to_minimum() {
        let mut rtte = RttEstimator::default();
        rtte.sample(Duration::from_millis(100));
        // srtt 100 ms, rttvar 50 ms: 300 ms is below the floor.
        assert_eq!(rtte.retransmission_timeout(), RTT_MIN);
    }

    #[test]
    fn test_sample_smoothing() {
        let mut rtte = RttEstimator::default();
        rtte.sample(Duration::from_millis(800));
        assert_eq!(rtte.retransmission_timeout(), Duration::from_millis(2400));

        // delta = 800 ms: srtt 900 ms, rttvar 400 + (800 - 400) / 4 = 500 ms.
        rtte.sample(Duration::from_millis(1600));
        assert_eq!(rtte.srtt, Some(Duration::from_millis(900)));
        assert_eq!(rtte.rttvar, Duration::from_millis(500));
        assert_eq!(rtte.retransmission_timeout(), Duration::from_millis(2900));
    }

    #[test]
    fn test_back_off() {
        let mut rtte = RttEstimator::default();
        for _ in 0..10 {
            rtte.back_off();
        }
        assert_eq!(rtte.retransmission_timeout(), RTT_MAX);
        assert_eq!(rtte.rxmit_count(), 10);

        for _ in 0..10 {
            rtte.back_off();
        }
        assert_eq!(rtte.rxmit_count(), MAX_BACKOFF);

        rtte.sample(Duration::from_secs(2));
        assert_eq!(rtte.rxmit_count(), 0);
    }
}
