/*! Communication between endpoints.

The `socket` module deals with *connection state* and *buffering*.
It provides interfaces for accessing the send and receive buffers of a
TCP connection, and the protocol state machine that fills and empties them.

Unlike the Berkeley interface, the engine does not own a network device or a
clock. Every entry point takes a [Context] carrying the current time, and the
caller decides when segments leave the host by calling
[tcp::Socket::dispatch] after [tcp::Socket::poll_at] says so.
*/

use crate::rand::Rand;
use crate::time::Instant;

pub mod tcp;

/// Gives an indication on the next time the socket should be polled.
#[derive(Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]
pub enum PollAt {
    /// The socket needs to be polled immediately.
    Now,
    /// The socket needs to be polled at given [Instant][struct.Instant].
    Time(Instant),
    /// The socket does not need to be polled unless there are external changes.
    Ingress,
}

/// Per-stack state shared by every connection.
#[derive(Debug, Clone)]
pub struct Context {
    now: Instant,
    isn_secret: u64,
    mtu: usize,
}

impl Context {
    /// Ethernet payload size, the default path MTU.
    pub const DEFAULT_MTU: usize = 1500;

    /// Create a context, drawing the initial sequence number secret from `rand`.
    pub fn new(now: Instant, rand: &mut Rand) -> Context {
        Context {
            now,
            isn_secret: rand.rand_u64(),
            mtu: Self::DEFAULT_MTU,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn set_now(&mut self, now: Instant) {
        self.now = now
    }

    /// The path MTU new connections derive their MSS from.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu
    }

    pub(crate) fn isn_secret(&self) -> u64 {
        self.isn_secret
    }
}
