/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens in the
   [TcpPacket] structure.
 * Second, in cases where the space of valid field values is much smaller than the space
   of possible field values, it provides a compact, high-level representation
   of packet data that can be parsed from and emitted into a sequence of octets.
   This happens through [TcpRepr].

The `Packet` family of data structures guarantees that, if the `Packet::check_len()` method
returned `Ok(())`, then no accessor or setter method will panic; however, the guarantee
provided by `Packet::check_len()` may no longer hold after changing certain fields,
which are listed in the documentation for the specific packet.

When parsing untrusted input, it is *necessary* to use `Packet::new_checked()`;
so long as the buffer is not modified, no accessor will fail.

# Examples

To emit a TCP header into an octet buffer, and then parse it back:

```rust
use tcpstream::wire::*;
let repr = TcpRepr {
    src_port: 49500,
    dst_port: 80,
    flags: TcpFlags::SYN,
    seq_number: TcpSeqNumber(1000),
    ack_number: TcpSeqNumber(0),
    window_len: 8192,
    urgent_at: 0,
    max_seg_size: Some(1460),
    sack_permitted: true,
    sack_ranges: [None; 4],
    payload: &[],
};
let mut buffer = vec![0; repr.buffer_len()];
repr.emit(&mut TcpPacket::new_unchecked(&mut buffer));
let packet = TcpPacket::new_checked(&buffer).expect("truncated packet");
assert_eq!(TcpRepr::parse(&packet).expect("malformed packet"), repr);
```
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
    pub type Rest = ::core::ops::RangeFrom<usize>;
}

pub(crate) mod ip;
pub(crate) mod tcp;

use core::fmt;

pub use self::ip::{Address as IpAddress, Endpoint as IpEndpoint};

pub use self::tcp::{
    Flags as TcpFlags, Packet as TcpPacket, Repr as TcpRepr, SeqNumber as TcpSeqNumber,
    TcpOption, HEADER_LEN as TCP_HEADER_LEN,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
