// Heads up! Before working on this file you should read, at least, RFC 793 and
// the parts of RFC 1122 that discuss TCP, as well as RFC 5681, RFC 6582 and
// RFC 6675 for congestion control and SACK based loss recovery.

use core::fmt::Display;
use core::{fmt, mem};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::socket::{Context, PollAt};
use crate::wire::{IpAddress, IpEndpoint, TcpPacket, TcpRepr};

macro_rules! tcp_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

mod congestion;
mod input;
mod listen;
mod options;
mod output;
mod rtte;
mod sack;
mod tcb;
mod trim;

use self::listen::Listener;
use self::tcb::{Tcb, Tuple, isn};

/// Why a connection failed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The peer reset the connection.
    ConnectionReset,
    /// The peer answered our SYN with a reset.
    ConnectionRefused,
    /// The connection was torn down locally or after a protocol violation.
    ConnectionAborted,
    /// Retransmissions or window probes went unanswered for too long.
    TimedOut,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::ConnectionRefused => write!(f, "connection refused"),
            Error::ConnectionAborted => write!(f, "connection aborted"),
            Error::TimedOut => write!(f, "connection timed out"),
        }
    }
}

impl core::error::Error for Error {}

/// Error returned by [`Socket::listen`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ListenError {
    InvalidState,
    Unaddressable,
}

impl Display for ListenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ListenError::InvalidState => write!(f, "invalid state"),
            ListenError::Unaddressable => write!(f, "unaddressable destination"),
        }
    }
}

impl core::error::Error for ListenError {}

/// Error returned by [`Socket::connect`] and [`Socket::wait_connected`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnectError {
    InvalidState,
    Unaddressable,
    Failed(Error),
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ConnectError::InvalidState => write!(f, "invalid state"),
            ConnectError::Unaddressable => write!(f, "unaddressable destination"),
            ConnectError::Failed(err) => write!(f, "connection failed: {err}"),
        }
    }
}

impl core::error::Error for ConnectError {}

/// Error returned by [`Socket::write`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    InvalidState,
    Aborted(Error),
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SendError::InvalidState => write!(f, "invalid state"),
            SendError::Aborted(err) => write!(f, "aborted: {err}"),
        }
    }
}

impl core::error::Error for SendError {}

/// Error returned by [`Socket::read`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    InvalidState,
    Finished,
    Aborted(Error),
}

impl Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RecvError::InvalidState => write!(f, "invalid state"),
            RecvError::Finished => write!(f, "operation finished"),
            RecvError::Aborted(err) => write!(f, "aborted: {err}"),
        }
    }
}

impl core::error::Error for RecvError {}

/// Error returned by [`Socket::accept`]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AcceptError {
    InvalidState,
}

impl Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            AcceptError::InvalidState => write!(f, "invalid state"),
        }
    }
}

impl core::error::Error for AcceptError {}

/// The state of a TCP socket, according to [RFC 793].
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::Closing => write!(f, "CLOSING"),
            State::LastAck => write!(f, "LAST-ACK"),
            State::TimeWait => write!(f, "TIME-WAIT"),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Config {
    /// Size of the receive ring, and so the largest window ever advertised.
    pub rx_buffer_size: usize,
    pub tx_buffer_size: usize,
    /// Offer and accept selective acknowledgments (RFC 2018).
    pub sack: bool,
    /// Send new data on the first two duplicate ACKs (RFC 3042).
    pub limited_transmit: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rx_buffer_size: DEFAULT_BUFFER_SIZE,
            tx_buffer_size: DEFAULT_BUFFER_SIZE,
            sack: true,
            limited_transmit: true,
        }
    }
}

/// A segment for the IP layer: local endpoint, remote endpoint and the segment.
pub type Reply = (IpEndpoint, IpEndpoint, TcpRepr<'static>);

/// What to do after [`Socket::input`].
#[derive(Debug, Default)]
pub struct Input {
    /// A reset to send back to the source of the segment.
    pub reset: Option<Reply>,
    /// The connection has output pending: call [`Socket::dispatch`] on it, or
    /// on `child` if there is one.
    pub output: bool,
    /// A connection a listener spawned for an incoming SYN. It becomes
    /// reachable through [`Socket::accept`] once its handshake completes;
    /// until then segments for it have to be delivered to it directly.
    pub child: Option<Arc<Socket>>,
}

/// A Transmission Control Protocol socket.
///
/// Every operation locks the connection for its duration, so segment input,
/// timer expiry and application calls may come from different threads. The
/// blocking calls ([read], [write], [accept], [wait_connected]) sleep on the
/// connection's monitor until input or a timer wakes them.
///
/// Segments are never sent on the socket's own initiative: after [input]
/// or [timer_fired] report output, or whenever [poll_at] says so, the
/// caller drains [dispatch].
///
/// [read]: Socket::read
/// [write]: Socket::write
/// [accept]: Socket::accept
/// [wait_connected]: Socket::wait_connected
/// [input]: Socket::input
/// [timer_fired]: Socket::timer_fired
/// [poll_at]: Socket::poll_at
/// [dispatch]: Socket::dispatch
#[derive(Debug)]
pub struct Socket {
    tcb: Mutex<Tcb>,
    monitor: Condvar,
    /// Replaced on every `listen`, so children of an earlier session cannot
    /// reach the current accept queue.
    listener: Mutex<Arc<Listener>>,
}

impl Socket {
    /// Create a closed socket.
    pub fn new(config: Config) -> Arc<Socket> {
        Socket::with_tcb(Tcb::new(config))
    }

    fn with_tcb(tcb: Tcb) -> Arc<Socket> {
        Arc::new(Socket {
            tcb: Mutex::new(tcb),
            monitor: Condvar::new(),
            listener: Mutex::new(Arc::new(Listener::default())),
        })
    }

    fn listener(&self) -> Arc<Listener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, tcb: MutexGuard<'a, Tcb>) -> MutexGuard<'a, Tcb> {
        self.monitor
            .wait(tcb)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, tcb: &mut Tcb) {
        if mem::take(&mut tcb.wake) {
            self.monitor.notify_all();
        }
    }

    /// Return the connection state, in terms of the TCP state machine.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Return why the connection failed, if it did.
    pub fn error(&self) -> Option<Error> {
        self.lock().err
    }

    /// Return the local endpoint, or None if not connected.
    pub fn local_endpoint(&self) -> Option<IpEndpoint> {
        self.lock().tuple.map(|tuple| tuple.local)
    }

    /// Return the remote endpoint, or None if not connected.
    pub fn remote_endpoint(&self) -> Option<IpEndpoint> {
        self.lock().tuple.map(|tuple| tuple.remote)
    }

    /// Return the endpoint this socket, or the listener that spawned it, listens on.
    pub fn listen_endpoint(&self) -> Option<IpEndpoint> {
        self.lock().listen_endpoint
    }

    /// Start listening on the given endpoint.
    ///
    /// At most `backlog` connections may be half open or waiting for
    /// [accept](#method.accept) at a time; zero picks a default.
    ///
    /// This function returns `Err(ListenError::InvalidState)` if the socket is
    /// not closed, and `Err(ListenError::Unaddressable)` if the port in the
    /// given endpoint is zero.
    pub fn listen(&self, local_endpoint: IpEndpoint, backlog: usize) -> Result<(), ListenError> {
        if local_endpoint.port == 0 {
            return Err(ListenError::Unaddressable);
        }

        let mut tcb = self.lock();
        if tcb.state != State::Closed {
            return Err(ListenError::InvalidState);
        }

        let mut fresh = Tcb::new(tcb.config);
        fresh.listen_endpoint = Some(local_endpoint);
        fresh.set_state(State::Listen);
        *tcb = fresh;
        let listener = Arc::new(Listener::default());
        listener.open(backlog);
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = listener;
        net_debug!("listening on {}", local_endpoint);
        Ok(())
    }

    /// Dequeue an established connection, waiting until there is one.
    ///
    /// Fails once the socket stops listening.
    pub fn accept(&self) -> Result<Arc<Socket>, AcceptError> {
        self.listener()
            .accept(true)?
            .ok_or(AcceptError::InvalidState)
    }

    /// Dequeue an established connection if there is one.
    pub fn try_accept(&self) -> Result<Option<Arc<Socket>>, AcceptError> {
        self.listener().accept(false)
    }

    /// Start connecting `local_endpoint` to `remote_endpoint`.
    ///
    /// The SYN goes out on the next [dispatch](#method.dispatch). Use
    /// [wait_connected](#method.wait_connected) to wait for the handshake.
    ///
    /// This function returns an error if the socket is not closed, if either
    /// port is zero, if the remote address is unspecified, or if the two
    /// addresses belong to different IP versions.
    pub fn connect(
        &self,
        cx: &Context,
        local_endpoint: IpEndpoint,
        remote_endpoint: IpEndpoint,
    ) -> Result<(), ConnectError> {
        if remote_endpoint.port == 0 || remote_endpoint.addr.is_unspecified() {
            return Err(ConnectError::Unaddressable);
        }
        if local_endpoint.port == 0 || local_endpoint.addr.is_unspecified() {
            return Err(ConnectError::Unaddressable);
        }
        if local_endpoint.addr.is_ipv4() != remote_endpoint.addr.is_ipv4() {
            return Err(ConnectError::Unaddressable);
        }

        let mut tcb = self.lock();
        if tcb.state != State::Closed {
            return Err(ConnectError::InvalidState);
        }

        let tuple = Tuple {
            local: local_endpoint,
            remote: remote_endpoint,
        };
        let mut fresh = Tcb::new(tcb.config);
        fresh.tuple = Some(tuple);
        fresh.init_mss(cx, &remote_endpoint.addr);
        fresh.set_iss(isn(cx, &tuple));
        fresh.set_state(State::SynSent);
        *tcb = fresh;
        net_debug!("connecting {} to {}", local_endpoint, remote_endpoint);
        Ok(())
    }

    /// Wait for the handshake started by [connect](#method.connect) to finish.
    pub fn wait_connected(&self) -> Result<(), ConnectError> {
        let mut tcb = self.lock();
        loop {
            match tcb.state {
                State::SynSent | State::SynReceived => tcb = self.wait(tcb),
                State::Closed | State::Listen => {
                    return Err(tcb.err.map_or(ConnectError::InvalidState, ConnectError::Failed));
                }
                _ => return Ok(()),
            }
        }
    }

    fn recv_slice(tcb: &mut Tcb, data: &mut [u8]) -> Result<usize, RecvError> {
        if !tcb.rx_buffer.is_empty() {
            let size = tcb.rx_buffer.dequeue_slice(data);
            tcp_trace!(
                "rx buffer: dequeued {} octets (now {})",
                size,
                tcb.rx_buffer.len()
            );
            return Ok(size);
        }
        if let Some(err) = tcb.err {
            return Err(RecvError::Aborted(err));
        }
        if tcb.shut_rd {
            return Err(RecvError::Finished);
        }
        match tcb.state {
            State::Closed | State::Listen => Err(RecvError::InvalidState),
            _ => Ok(0),
        }
    }

    /// Dequeue received octets into `data`, waiting until there are some.
    ///
    /// Once the peer has closed its half of the connection and everything it
    /// sent has been read, `Err(RecvError::Finished)` is returned. A failed
    /// connection returns `Err(RecvError::Aborted)`.
    pub fn read(&self, data: &mut [u8]) -> Result<usize, RecvError> {
        let mut tcb = self.lock();
        loop {
            let size = Socket::recv_slice(&mut tcb, data)?;
            if 0 < size || data.is_empty() {
                return Ok(size);
            }
            tcb = self.wait(tcb);
        }
    }

    /// Dequeue received octets into `data` without waiting.
    ///
    /// This function returns the amount of octets actually dequeued, which is limited
    /// by the amount of occupied space in the receive buffer; down to zero.
    pub fn try_read(&self, data: &mut [u8]) -> Result<usize, RecvError> {
        Socket::recv_slice(&mut self.lock(), data)
    }

    fn send_slice(tcb: &mut Tcb, data: &[u8]) -> Result<usize, SendError> {
        if let Some(err) = tcb.err {
            return Err(SendError::Aborted(err));
        }
        if tcb.shut_wr {
            return Err(SendError::InvalidState);
        }
        match tcb.state {
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => (),
            _ => return Err(SendError::InvalidState),
        }

        let size = tcb.tx_buffer.enqueue_slice(data);
        if 0 < size {
            tcp_trace!(
                "tx buffer: enqueued {} octets (now {})",
                size,
                tcb.tx_buffer.len()
            );
        }
        Ok(size)
    }

    /// Enqueue octets from `data` for sending, waiting for room if the
    /// transmit buffer is full.
    pub fn write(&self, data: &[u8]) -> Result<usize, SendError> {
        let mut tcb = self.lock();
        loop {
            let size = Socket::send_slice(&mut tcb, data)?;
            if 0 < size || data.is_empty() {
                return Ok(size);
            }
            tcb = self.wait(tcb);
        }
    }

    /// Enqueue octets from `data` for sending without waiting.
    ///
    /// This function returns the amount of octets actually enqueued, which is limited
    /// by the amount of free space in the transmit buffer; down to zero.
    pub fn try_write(&self, data: &[u8]) -> Result<usize, SendError> {
        Socket::send_slice(&mut self.lock(), data)
    }

    /// Close both halves of the connection.
    ///
    /// Queued data is still delivered and followed by a FIN. Data arriving
    /// afterwards aborts the connection with a reset. Closing a listener
    /// aborts every connection nobody accepted.
    pub fn close(&self) {
        let mut tcb = self.lock();
        tcb.shut_rd = true;
        self.shutdown(&mut tcb);
    }

    /// Close the transmit half of the connection: a FIN follows the queued data.
    pub fn shutdown_output(&self) {
        let mut tcb = self.lock();
        self.shutdown(&mut tcb);
    }

    /// Close the receive half of the connection: further data from the peer
    /// aborts the connection with a reset.
    pub fn shutdown_input(&self) {
        let mut tcb = self.lock();
        tcb.shut_rd = true;
        tcb.wake = true;
        self.notify(&mut tcb);
    }

    fn shutdown(&self, tcb: &mut Tcb) {
        tcb.shut_wr = true;
        match tcb.state {
            // In the LISTEN state there is no established connection.
            State::Listen => {
                tcb.abort();
                self.close_listener();
            }
            // In the SYN-SENT state the remote endpoint is not yet synchronized and, upon
            // receiving an RST, will abort the connection.
            State::SynSent => tcb.abort(),
            // In the SYN-RECEIVED state the FIN follows once our SYN is acknowledged.
            State::SynReceived => (),
            // In the ESTABLISHED and CLOSE-WAIT states the transmit half
            // of the connection is open, and needs to be explicitly closed with a FIN.
            State::Established => tcb.set_state(State::FinWait1),
            State::CloseWait => tcb.set_state(State::LastAck),
            // In the FIN-WAIT-1, FIN-WAIT-2, CLOSING, LAST-ACK, TIME-WAIT and CLOSED states,
            // the transmit half of the connection is already closed, and no further
            // action is needed.
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::TimeWait
            | State::LastAck
            | State::Closed => (),
        }
        tcb.wake = true;
        self.notify(tcb);
    }

    /// Aborts the connection, if any.
    ///
    /// The socket moves to the `CLOSED` state with `Error::ConnectionAborted`.
    /// A synchronized peer is sent one reset on the next
    /// [dispatch](#method.dispatch).
    pub fn abort(&self) {
        let mut tcb = self.lock();
        let state = tcb.state;
        if state == State::Closed {
            return;
        }

        tcb.rst_pending = matches!(
            state,
            State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
        );
        tcb.err = Some(Error::ConnectionAborted);
        tcb.abort();
        if state == State::Listen {
            self.close_listener();
        }
        self.notify(&mut tcb);
    }

    fn close_listener(&self) {
        for child in self.listener().close() {
            child.abort();
        }
    }

    /// Process one inbound segment addressed from `src_addr` to `dst_addr`.
    ///
    /// The packet must have passed [`TcpPacket::new_checked`] and its
    /// checksum must have been verified by the caller.
    pub fn input(
        self: &Arc<Self>,
        cx: &Context,
        src_addr: IpAddress,
        dst_addr: IpAddress,
        packet: &TcpPacket<&[u8]>,
    ) -> Input {
        let tuple = Tuple {
            local: IpEndpoint::new(dst_addr, packet.dst_port()),
            remote: IpEndpoint::new(src_addr, packet.src_port()),
        };

        let mut tcb = self.lock();
        let outcome = tcb.input(cx, tuple, packet);
        let mut input = Input {
            reset: None,
            output: outcome.output,
            child: None,
        };
        if outcome.reset {
            input.reset = output::rst_reply(packet).map(|repr| (tuple.local, tuple.remote, repr));
        }
        if outcome.established {
            let listener = tcb.listening.take().and_then(|weak| weak.upgrade());
            if !listener.is_some_and(|listener| listener.complete(Arc::clone(self))) {
                net_debug!("listener closed, resetting {}", tuple.remote);
                tcb.err = Some(Error::ConnectionAborted);
                tcb.rst_pending = true;
                tcb.abort();
                input.output = true;
            }
        }
        self.notify(&mut tcb);
        let Some(mut child) = outcome.spawned else {
            return input;
        };
        let listener = self.listener();
        drop(tcb);

        if !listener.reserve() {
            net_debug!("backlog full, dropping SYN from {}", tuple.remote);
            child.abort();
            return input;
        }
        child.listening = Some(Arc::downgrade(&listener));
        let child = Socket::with_tcb(child);
        let child_input = child.input(cx, src_addr, dst_addr, packet);
        Input {
            reset: child_input.reset,
            output: child_input.output,
            child: Some(child),
        }
    }

    /// Run the timers that are due. Returns whether output is pending.
    pub fn timer_fired(&self, cx: &Context) -> bool {
        let mut tcb = self.lock();
        let output = tcb.timer_fired(cx.now());
        self.notify(&mut tcb);
        output
    }

    /// Build at most one outgoing segment and pass it to `emit`.
    ///
    /// Returns whether a segment was emitted; call again until it returns
    /// false. If `emit` fails, the connection state is left as if nothing had
    /// been sent.
    pub fn dispatch<F, E>(&self, cx: &Context, emit: F) -> Result<bool, E>
    where
        F: FnOnce((IpEndpoint, IpEndpoint, TcpRepr)) -> Result<(), E>,
    {
        let mut tcb = self.lock();
        tcb.dispatch(cx.now(), emit)
    }

    /// Return when the socket next needs [dispatch](#method.dispatch) or
    /// [timer_fired](#method.timer_fired).
    pub fn poll_at(&self) -> PollAt {
        let tcb = self.lock();
        if tcb.state == State::Closed {
            return if tcb.rst_pending {
                PollAt::Now
            } else {
                PollAt::Ingress
            };
        }
        if tcb.ack_now || tcb.wants_transmit() || tcb.window_reopens() {
            return PollAt::Now;
        }
        [tcb.rxmit_timer, tcb.ack_timer]
            .into_iter()
            .flatten()
            .min()
            .map_or(PollAt::Ingress, PollAt::Time)
    }

    /// Return the amount of octets queued in the transmit buffer.
    pub fn send_queue(&self) -> usize {
        self.lock().tx_buffer.len()
    }

    /// Return the amount of octets queued in the receive buffer.
    pub fn recv_queue(&self) -> usize {
        self.lock().rx_buffer.len()
    }
}
