use core::fmt;

/// An internetworking address, either IPv4 or IPv6.
pub type Address = core::net::IpAddr;

/// An internet endpoint address.
///
/// `Endpoint` always fully specifies both the address and the port.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Endpoint {
    pub addr: Address,
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint address from given address and port.
    pub const fn new(addr: Address, port: u16) -> Endpoint {
        Endpoint { addr, port }
    }

    /// Octets of the address, used when keying sequence numbers.
    pub(crate) fn addr_octets(&self) -> ([u8; 16], usize) {
        let mut bytes = [0u8; 16];
        match self.addr {
            Address::V4(addr) => {
                bytes[..4].copy_from_slice(&addr.octets());
                (bytes, 4)
            }
            Address::V6(addr) => {
                bytes.copy_from_slice(&addr.octets());
                (bytes, 16)
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            Address::V4(_) => write!(f, "{}:{}", self.addr, self.port),
            Address::V6(_) => write!(f, "[{}]:{}", self.addr, self.port),
        }
    }
}

impl<T: Into<Address>> From<(T, u16)> for Endpoint {
    fn from((addr, port): (T, u16)) -> Endpoint {
        Endpoint {
            addr: addr.into(),
            port,
        }
    }
}
