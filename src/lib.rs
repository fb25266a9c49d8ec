/*! The receive side of a TCP stream and its congestion control engine.

`tcpstream` decides, for every inbound TCP segment, how a connection evolves:
whether the segment is acceptable at all and which part of it falls inside the
receive window, how the eleven connection states of [RFC 793] transition, how
acknowledgments move the send window, and how the congestion window follows
slow start, congestion avoidance, fast retransmit and fast recovery ([RFC 5681],
[RFC 6582], [RFC 6675]).

The crate is organized like a network stack, leaf first:

 * [wire] extracts and inserts TCP header fields, including the MSS,
   SACK-permitted and SACK options, and provides modular sequence arithmetic;
 * [storage] holds the ring buffers and the out-of-order reassembler;
 * [socket] holds the connection record, the state machine, the passive-open
   manager and the blocking application interface.

Segment transmission, routing and timer scheduling are left to the caller:
[socket::tcp::Socket::input] hands back reset replies and output requests,
[socket::tcp::Socket::dispatch] builds outgoing segments on demand, and
[socket::tcp::Socket::poll_at] tells when [socket::tcp::Socket::timer_fired]
has to run.

[RFC 793]: https://tools.ietf.org/html/rfc793
[RFC 5681]: https://tools.ietf.org/html/rfc5681
[RFC 6582]: https://tools.ietf.org/html/rfc6582
[RFC 6675]: https://tools.ietf.org/html/rfc6675
*/

#![deny(unsafe_code)]

#[macro_use]
mod macros;

pub mod config;
pub mod rand;
pub mod socket;
pub mod storage;
pub mod time;
pub mod wire;
