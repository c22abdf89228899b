//! Address and subnet value types.
//!
//! Addresses are plain `Ipv4Addr`s. A subnet is a single composite value
//! (`Ipv4Net`: address + prefix length); everything subnet-specific is a
//! free function here rather than a method on a subtype.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// A 4-byte network address.
pub type Address = Ipv4Addr;

/// An address plus a prefix length in `[0, 32]`.
pub type Subnet = Ipv4Net;

/// The null address.
pub const NULL_ADDRESS: Address = Ipv4Addr::UNSPECIFIED;

/// Subnet parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnetError {
    #[error("invalid address in subnet '{0}'")]
    Address(String),

    #[error("invalid prefix length in subnet '{0}'")]
    PrefixLen(String),

    #[error("non-contiguous netmask in subnet '{0}'")]
    Netmask(String),
}

/// Build a subnet, clearing the host bits of `address`.
pub fn subnet(address: Address, prefix_len: u8) -> Option<Subnet> {
    Ipv4Net::new(address, prefix_len).ok().map(|net| net.trunc())
}

/// The default-route sentinel: `0.0.0.0/0`.
pub fn default_route() -> Subnet {
    Ipv4Net::default()
}

pub fn is_default_route(subnet: &Subnet) -> bool {
    subnet.prefix_len() == 0 && subnet.addr() == NULL_ADDRESS
}

/// The /32 subnet holding exactly `address`.
pub fn host_subnet(address: Address) -> Subnet {
    // A /32 never fails and has no host bits to clear.
    Ipv4Net::from(address)
}

/// Containment test; both operands are masked to the subnet's prefix.
pub fn contains(subnet: &Subnet, address: Address) -> bool {
    subnet.contains(&address)
}

/// Prefix length of a dotted netmask, if its bits are contiguous.
pub fn netmask_prefix_len(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    let len = bits.leading_ones();
    (bits.count_ones() == len).then_some(len as u8)
}

/// Parse `default`, `a.b.c.d`, `a.b.c.d/len` or `a.b.c.d/a.b.c.d`.
///
/// A bare address is taken as a host route.
pub fn parse_subnet(text: &str) -> Result<Subnet, SubnetError> {
    let text = text.trim();
    if text == "default" {
        return Ok(default_route());
    }

    let (addr, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (text, None),
    };
    let address: Address = addr
        .parse()
        .map_err(|_| SubnetError::Address(text.to_string()))?;

    let prefix_len = match prefix {
        None => 32,
        Some(p) if p.contains('.') => {
            let mask: Ipv4Addr = p
                .parse()
                .map_err(|_| SubnetError::Netmask(text.to_string()))?;
            netmask_prefix_len(mask).ok_or_else(|| SubnetError::Netmask(text.to_string()))?
        }
        Some(p) => p
            .parse::<u8>()
            .map_err(|_| SubnetError::PrefixLen(text.to_string()))?,
    };

    subnet(address, prefix_len).ok_or_else(|| SubnetError::PrefixLen(text.to_string()))
}

/// Renders the default route as `default`, anything else as `a.b.c.d/len`.
pub struct SubnetDisplay<'a>(&'a Subnet);

impl fmt::Display for SubnetDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if is_default_route(self.0) {
            f.write_str("default")
        } else {
            write!(f, "{}/{}", self.0.addr(), self.0.prefix_len())
        }
    }
}

pub fn display(subnet: &Subnet) -> SubnetDisplay<'_> {
    SubnetDisplay(subnet)
}
