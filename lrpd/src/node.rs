//! Node identity: bound interface, own address, network prefix and role.

use crate::address::{self, Address, Subnet};
use crate::{Error, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::{InterfaceFlags, if_nametoindex};
use std::fmt;
use tracing::info;

/// Position of the node in the sink-oriented topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Router,
    /// Root of the routing tree, with its own route out of the network.
    Sink,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Router => f.write_str("router"),
            Role::Sink => f.write_str("sink"),
        }
    }
}

/// Who this node is on the LRP network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Interface name (e.g., "eth0")
    pub interface: String,
    /// Interface index
    pub index: u32,
    pub address: Address,
    /// The LRP network this node belongs to.
    pub prefix: Subnet,
    pub role: Role,
}

impl NodeIdentity {
    /// Look up `interface` and derive the identity from its IPv4 address.
    ///
    /// The network prefix comes from the interface netmask unless
    /// `prefix` overrides it.
    pub fn resolve(interface: &str, role: Role, prefix: Option<Subnet>) -> Result<Self> {
        let index =
            if_nametoindex(interface).map_err(|_| Error::UnknownInterface(interface.to_string()))?;
        let (address, prefix_len) = interface_address(interface)?;
        let prefix = match prefix {
            Some(prefix) => prefix,
            None => address::subnet(address, prefix_len)
                .ok_or_else(|| Error::NoAddress(interface.to_string()))?,
        };

        let identity = NodeIdentity {
            interface: interface.to_string(),
            index,
            address,
            prefix,
            role,
        };
        info!(
            interface = %identity.interface,
            index,
            %address,
            prefix = %address::display(&prefix),
            role = %role,
            "Node identity resolved"
        );
        Ok(identity)
    }
}

/// First IPv4 address of `interface` and its netmask length.
fn interface_address(interface: &str) -> Result<(Address, u8)> {
    for entry in getifaddrs()? {
        if entry.interface_name != interface {
            continue;
        }
        let Some(addr) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let prefix_len = entry
            .netmask
            .as_ref()
            .and_then(|mask| mask.as_sockaddr_in())
            .and_then(|mask| address::netmask_prefix_len(mask.ip()))
            .unwrap_or(32);
        return Ok((addr.ip(), prefix_len));
    }
    Err(Error::NoAddress(interface.to_string()))
}

/// The single non-loopback interface carrying an IPv4 address.
pub fn detect_interface() -> Result<String> {
    let mut candidates = Vec::new();
    for entry in getifaddrs()? {
        let is_ipv4 = entry
            .address
            .as_ref()
            .is_some_and(|a| a.as_sockaddr_in().is_some());
        if is_ipv4 && !entry.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            candidates.push(entry.interface_name);
        }
    }
    pick_interface(candidates)
}

fn pick_interface(mut candidates: Vec<String>) -> Result<String> {
    candidates.sort();
    candidates.dedup();
    match candidates.len() {
        0 => Err(Error::NoUsableInterface),
        1 => Ok(candidates.remove(0)),
        _ => Err(Error::AmbiguousInterface(candidates)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_single_interface() {
        let picked = pick_interface(vec!["eth0".to_string(), "eth0".to_string()]).unwrap();
        assert_eq!(picked, "eth0");
    }

    #[test]
    fn test_pick_interface_errors() {
        assert!(matches!(pick_interface(vec![]), Err(Error::NoUsableInterface)));

        let err = pick_interface(vec!["eth1".to_string(), "eth0".to_string()]).unwrap_err();
        match err {
            Error::AmbiguousInterface(names) => assert_eq!(names, vec!["eth0", "eth1"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_interface() {
        let err = NodeIdentity::resolve("lrpd-no-such0", Role::Router, None).unwrap_err();
        assert!(matches!(err, Error::UnknownInterface(name) if name == "lrpd-no-such0"));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Sink.to_string(), "sink");
        assert_eq!(Role::Router.to_string(), "router");
    }
}
