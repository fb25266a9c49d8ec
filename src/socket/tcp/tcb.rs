use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Weak;

use super::listen::Listener;
use super::rtte::{R2, R2_SYN, RttEstimator};
use super::sack::Scoreboard;
use super::{Config, Error, State};
use crate::socket::Context;
use crate::storage::{Assembler, RingBuffer};
use crate::time::{Duration, Instant};
use crate::wire::{IpAddress, IpEndpoint, TCP_HEADER_LEN, TcpSeqNumber};

/// MSS assumed for an IPv4 peer that announces none (RFC 1122 4.2.2.6).
pub(super) const DEFAULT_MSS: usize = 536;
/// MSS assumed for an IPv6 peer that announces none (RFC 8200 minimum MTU).
pub(super) const DEFAULT_MSS_V6: usize = 1220;
/// Smallest MSS accepted from a peer. It leaves room for a full SACK option.
pub(super) const MIN_MSS: usize = 64;
/// Largest window representable without window scaling.
pub(super) const MAX_WINDOW: usize = 65535;

/// The MSS to fall back to when nothing better is known about the path.
pub(super) fn default_mss(addr: &IpAddress) -> usize {
    match addr {
        IpAddress::V4(_) => DEFAULT_MSS,
        IpAddress::V6(_) => DEFAULT_MSS_V6,
    }
}

/// The MSS a path MTU allows towards `addr`.
pub(super) fn path_mss(mtu: usize, addr: &IpAddress) -> usize {
    let ip_header_len = match addr {
        IpAddress::V4(_) => 20,
        IpAddress::V6(_) => 40,
    };
    mtu.saturating_sub(ip_header_len + TCP_HEADER_LEN)
        .max(default_mss(addr))
}

/// Local and remote endpoints of a synchronized or synchronizing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) struct Tuple {
    pub local: IpEndpoint,
    pub remote: IpEndpoint,
}

/// Choose an initial sequence number as in RFC 6528: a keyed hash of the
/// connection identity plus a clock ticking every 4 microseconds.
pub(super) fn isn(cx: &Context, tuple: &Tuple) -> TcpSeqNumber {
    let mut hasher = DefaultHasher::new();
    cx.isn_secret().hash(&mut hasher);
    for endpoint in [tuple.local, tuple.remote] {
        let (octets, len) = endpoint.addr_octets();
        octets[..len].hash(&mut hasher);
        endpoint.port.hash(&mut hasher);
    }
    let hash = hasher.finish();
    let clock = (cx.now().total_micros() / 4) as u32;
    TcpSeqNumber(((hash as u32) ^ ((hash >> 32) as u32)).wrapping_add(clock) as i32)
}

/// The transmission control block: everything one connection knows.
///
/// Field names follow RFC 793 (`SND.UNA` is `send_una` and so on). Window
/// and length quantities are octet counts.
#[derive(Debug)]
pub(super) struct Tcb {
    pub state: State,
    pub config: Config,
    pub tuple: Option<Tuple>,
    pub listen_endpoint: Option<IpEndpoint>,

    pub rx_buffer: RingBuffer<'static, u8>,
    pub tx_buffer: RingBuffer<'static, u8>,
    /// Blocks received above `recv_next`, stored in `rx_buffer` past its
    /// allocated part.
    pub assembler: Assembler,

    pub recv_next: TcpSeqNumber,
    pub recv_win: usize,
    pub recv_up: TcpSeqNumber,
    pub recv_acked: TcpSeqNumber,
    pub irs: TcpSeqNumber,
    pub have_urg: bool,

    pub send_una: TcpSeqNumber,
    pub send_next: TcpSeqNumber,
    pub send_max: TcpSeqNumber,
    pub send_win: usize,
    pub send_wl1: TcpSeqNumber,
    pub send_wl2: TcpSeqNumber,
    pub send_up: TcpSeqNumber,
    pub iss: TcpSeqNumber,
    pub send_max_win: usize,

    pub c_win: usize,
    pub ss_thresh: usize,
    pub c_acked: usize,
    pub dup_acks: u32,
    pub send_recover: TcpSeqNumber,
    pub send_fack: TcpSeqNumber,
    pub send_awin: usize,
    pub rxmit_data: usize,
    pub mss: usize,
    pub sack: bool,
    pub fast_rxmit: bool,
    pub scoreboard: Scoreboard,

    pub rtt_timing: Option<Instant>,
    pub rtt_seq: TcpSeqNumber,
    pub rtte: RttEstimator,
    pub rxmit_timer: Option<Instant>,
    pub ack_timer: Option<Instant>,
    pub persist: bool,
    pub r0: Instant,
    pub r2: Duration,

    pub shut_rd: bool,
    pub shut_wr: bool,
    pub ack_now: bool,
    /// An application abort still owes the peer a reset.
    pub rst_pending: bool,
    /// Blocked readers, writers or connectors have something to look at.
    pub wake: bool,
    pub err: Option<Error>,

    /// The listener that spawned this connection, until it is accepted.
    pub listening: Option<Weak<Listener>>,
}

impl Tcb {
    pub fn new(config: Config) -> Tcb {
        let rx_buffer = RingBuffer::new(vec![0; config.rx_buffer_size]);
        let tx_buffer = RingBuffer::new(vec![0; config.tx_buffer_size]);
        let recv_win = rx_buffer.window().min(MAX_WINDOW);
        Tcb {
            state: State::Closed,
            config,
            tuple: None,
            listen_endpoint: None,

            rx_buffer,
            tx_buffer,
            assembler: Assembler::new(),

            recv_next: TcpSeqNumber::default(),
            recv_win,
            recv_up: TcpSeqNumber::default(),
            recv_acked: TcpSeqNumber::default(),
            irs: TcpSeqNumber::default(),
            have_urg: false,

            send_una: TcpSeqNumber::default(),
            send_next: TcpSeqNumber::default(),
            send_max: TcpSeqNumber::default(),
            send_win: 0,
            send_wl1: TcpSeqNumber::default(),
            send_wl2: TcpSeqNumber::default(),
            send_up: TcpSeqNumber::default(),
            iss: TcpSeqNumber::default(),
            send_max_win: 0,

            c_win: 2 * DEFAULT_MSS,
            ss_thresh: super::congestion::DEF_SSTHRESH,
            c_acked: 0,
            dup_acks: 0,
            send_recover: TcpSeqNumber::default(),
            send_fack: TcpSeqNumber::default(),
            send_awin: 0,
            rxmit_data: 0,
            mss: DEFAULT_MSS,
            sack: false,
            fast_rxmit: false,
            scoreboard: Scoreboard::default(),

            rtt_timing: None,
            rtt_seq: TcpSeqNumber::default(),
            rtte: RttEstimator::default(),
            rxmit_timer: None,
            ack_timer: None,
            persist: false,
            r0: Instant::ZERO,
            r2: R2_SYN,

            shut_rd: false,
            shut_wr: false,
            ack_now: false,
            rst_pending: false,
            wake: false,
            err: None,

            listening: None,
        }
    }

    /// Seed every send sequence variable from a fresh initial sequence number.
    pub fn set_iss(&mut self, iss: TcpSeqNumber) {
        self.iss = iss;
        self.send_una = iss;
        self.send_next = iss;
        self.send_max = iss;
        self.send_up = iss;
        self.send_recover = iss;
        self.send_fack = iss;
        self.scoreboard.last_sack = iss;
    }

    /// Record the peer's initial sequence number carried by its SYN.
    pub fn set_irs(&mut self, irs: TcpSeqNumber) {
        self.irs = irs;
        self.recv_acked = irs;
        self.recv_next = irs + 1;
        self.recv_up = self.recv_next;
    }

    /// Path derived MSS for a fresh connection, with the initial window that goes with it.
    pub fn init_mss(&mut self, cx: &Context, remote: &IpAddress) {
        self.mss = path_mss(cx.mtu(), remote);
        self.c_win = 2 * self.mss;
        self.ss_thresh = super::congestion::DEF_SSTHRESH;
    }

    pub fn set_state(&mut self, state: State) {
        if self.state != state {
            tcp_trace!("state={}=>{}", self.state, state);
        }
        self.state = state;

        match state {
            State::Established => {
                self.r2 = R2;
                self.wake = true;
            }
            State::CloseWait | State::Closing | State::TimeWait => {
                self.shut_rd = true;
                self.wake = true;
            }
            _ => (),
        }
    }

    /// Enter TIME-WAIT, with the retransmission timer counting down 2*MSL.
    pub fn time_wait(&mut self, now: Instant) {
        self.set_state(State::TimeWait);
        self.stop_rxmit_timer();
        self.ack_timer = None;
        self.rtte.set_time_wait();
        self.start_rxmit_timer(now);
    }

    /// Tear the connection down without telling the peer.
    ///
    /// Pending output and out-of-order data are discarded. Data already
    /// received in order stays readable unless the connection failed.
    pub fn abort(&mut self) {
        net_debug!("aborting in state {} err={:?}", self.state, self.err);

        if self.state == State::SynReceived {
            if let Some(listener) = self.listening.take().and_then(|weak| weak.upgrade()) {
                listener.release_partial();
            }
        }
        self.listening = None;

        self.state = State::Closed;
        self.stop_rxmit_timer();
        self.ack_timer = None;
        self.persist = false;
        self.ack_now = false;
        self.fast_rxmit = false;
        self.shut_rd = true;
        self.shut_wr = true;
        self.tx_buffer.clear();
        self.assembler.clear();
        self.scoreboard.clear();
        if self.err.is_some() {
            self.rx_buffer.clear();
        }
        self.wake = true;
    }

    /// Abort on an inbound RST, provided its sequence number is in the window.
    pub fn reset(&mut self, seq: TcpSeqNumber, err: Option<Error>) {
        let acceptable = if self.recv_win == 0 {
            seq == self.recv_next
        } else {
            self.recv_next <= seq && seq < self.recv_next + self.recv_win
        };
        if !acceptable {
            net_debug!("ignoring RST outside the window (seq={})", seq);
            return;
        }
        if err.is_some() {
            self.err = err;
        }
        self.abort();
    }

    /// Whether the three-way handshake has completed at some point.
    pub fn has_been_established(&self) -> bool {
        !matches!(
            self.state,
            State::Closed | State::Listen | State::SynSent | State::SynReceived
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rand::Rand;
    use core::net::{Ipv4Addr, Ipv6Addr};

    fn tuple(port: u16) -> Tuple {
        Tuple {
            local: IpEndpoint::new(Ipv4Addr::new(192, 168, 1, 1).into(), 80),
            remote: IpEndpoint::new(Ipv4Addr::new(192, 168, 1, 2).into(), port),
        }
    }

    #[test]
    fn test_path_mss() {
        let v4: IpAddress = Ipv4Addr::LOCALHOST.into();
        let v6: IpAddress = Ipv6Addr::LOCALHOST.into();
        assert_eq!(path_mss(1500, &v4), 1460);
        assert_eq!(path_mss(1500, &v6), 1440);
        assert_eq!(path_mss(300, &v4), DEFAULT_MSS);
    }

    #[test]
    fn test_isn_depends_on_tuple_and_clock() {
        let mut cx = Context::new(Instant::from_secs(10), &mut Rand::new(7));
        let a = isn(&cx, &tuple(49152));
        let b = isn(&cx, &tuple(49153));
        assert_ne!(a, b);
        assert_eq!(a, isn(&cx, &tuple(49152)));

        cx.set_now(Instant::from_secs(10) + Duration::from_micros(400));
        assert_eq!(isn(&cx, &tuple(49152)) - a, 100);
    }

    #[test]
    fn test_reset_acceptance() {
        let mut tcb = Tcb::new(Config::default());
        tcb.state = State::Established;
        tcb.set_irs(TcpSeqNumber(1000));
        tcb.recv_win = 100;

        tcb.reset(TcpSeqNumber(1000), Some(Error::ConnectionReset));
        assert_eq!(tcb.state, State::Established);
        assert_eq!(tcb.err, None);

        tcb.reset(TcpSeqNumber(1101), Some(Error::ConnectionReset));
        assert_eq!(tcb.state, State::Established);

        tcb.reset(TcpSeqNumber(1050), Some(Error::ConnectionReset));
        assert_eq!(tcb.state, State::Closed);
        assert_eq!(tcb.err, Some(Error::ConnectionReset));
    }

    #[test]
    fn test_reset_zero_window() {
        let mut tcb = Tcb::new(Config::default());
        tcb.state = State::Established;
        tcb.set_irs(TcpSeqNumber(1000));
        tcb.recv_win = 0;

        tcb.reset(TcpSeqNumber(1002), None);
        assert_eq!(tcb.state, State::Established);
        tcb.reset(TcpSeqNumber(1001), None);
        assert_eq!(tcb.state, State::Closed);
        assert_eq!(tcb.err, None);
    }

    #[test]
    fn test_abort_keeps_clean_data() {
        let mut tcb = Tcb::new(Config::default());
        tcb.state = State::LastAck;
        tcb.rx_buffer.enqueue_slice(b"abc");
        tcb.tx_buffer.enqueue_slice(b"def");
        tcb.abort();
        assert_eq!(tcb.state, State::Closed);
        assert_eq!(tcb.rx_buffer.len(), 3);
        assert!(tcb.tx_buffer.is_empty());

        let mut tcb = Tcb::new(Config::default());
        tcb.state = State::Established;
        tcb.rx_buffer.enqueue_slice(b"abc");
        tcb.err = Some(Error::ConnectionReset);
        tcb.abort();
        assert!(tcb.rx_buffer.is_empty());
    }
}
