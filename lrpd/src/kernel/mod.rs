//! Host kernel boundary: forwarding table and neighbour cache.
//!
//! `Kernel` is the seam between the kernel-synchronized routing table and
//! the host. `NetlinkKernel` talks rtnetlink; tests use an in-memory fake.

pub mod netlink;

pub use netlink::NetlinkKernel;

use crate::address::{self, Address, Subnet};
use smoltcp::wire::EthernetAddress;
use std::fmt;
use std::io;
use thiserror::Error;

/// Kernel boundary errors.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Failed to open netlink connection: {0}")]
    Connection(io::Error),

    #[error("netlink request failed: {0}")]
    Netlink(String),

    #[error("route towards {} is not multipath", address::display(.0))]
    NotMultipath(Subnet),

    #[error("no kernel route towards {}", address::display(.0))]
    NoRoute(Subnet),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Scope of a kernel route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Reachable through gateways.
    Universe,
    /// Directly connected on the interface.
    Link,
    Other(u8),
}

/// A main-table IPv4 route as seen by (or handed to) the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub destination: Subnet,
    /// Parallel gateways; empty for on-link routes.
    pub gateways: Vec<Address>,
    pub scope: Scope,
    /// Route-owner protocol number (`RTPROT_*`).
    pub protocol: u8,
    /// Output interface index.
    pub interface: Option<u32>,
}

impl KernelRoute {
    /// A gatewayed route with a single next hop.
    pub fn via(destination: Subnet, gateway: Address, interface: u32, protocol: u8) -> Self {
        KernelRoute {
            destination,
            gateways: vec![gateway],
            scope: Scope::Universe,
            protocol,
            interface: Some(interface),
        }
    }

    /// A directly connected route through `interface`.
    pub fn on_link(destination: Subnet, interface: u32, protocol: u8) -> Self {
        KernelRoute {
            destination,
            gateways: Vec::new(),
            scope: Scope::Link,
            protocol,
            interface: Some(interface),
        }
    }

    pub fn is_link_scope(&self) -> bool {
        self.scope == Scope::Link
    }

    pub fn has_gateway(&self, gateway: Address) -> bool {
        self.gateways.contains(&gateway)
    }
}

impl fmt::Display for KernelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", address::display(&self.destination))?;
        for gateway in &self.gateways {
            write!(f, " nexthop via {gateway}")?;
        }
        if self.is_link_scope() {
            write!(f, " scope link")?;
        }
        write!(f, " proto {}", self.protocol)
    }
}

/// One entry of the neighbour (ARP) cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbour {
    pub address: Address,
    pub link_address: EthernetAddress,
}

/// Access to the host's forwarding table and neighbour cache.
///
/// Every read goes to the kernel: callers never act on a cached snapshot.
pub trait Kernel {
    /// The main-table route towards exactly `destination`, if any.
    fn route(&mut self, destination: Subnet) -> Result<Option<KernelRoute>>;

    fn add_route(&mut self, route: &KernelRoute) -> Result<()>;

    /// Add `gateway` as an extra parallel next hop of `route`.
    fn add_gateway(&mut self, route: &KernelRoute, gateway: Address) -> Result<()>;

    /// Remove `gateway` from a multipath route.
    ///
    /// Fails with `KernelError::NotMultipath` when `route` has a single gateway:
    /// the caller decides whether to delete the route instead.
    fn remove_gateway(&mut self, route: &KernelRoute, gateway: Address) -> Result<()>;

    fn del_route(&mut self, route: &KernelRoute) -> Result<()>;

    /// Delete every main-table route tagged with `protocol`. Returns how many.
    fn purge_routes(&mut self, protocol: u8) -> Result<usize>;

    /// Neighbour cache entries of the bound interface.
    fn neighbours(&mut self) -> Result<Vec<Neighbour>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{default_route, host_subnet};
    use std::net::Ipv4Addr;

    #[test]
    fn test_kernel_route_display() {
        let mut route = KernelRoute::via(default_route(), Ipv4Addr::new(10, 0, 0, 1), 2, 43);
        route.gateways.push(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            route.to_string(),
            "default nexthop via 10.0.0.1 nexthop via 10.0.0.2 proto 43"
        );

        let route = KernelRoute::on_link(host_subnet(Ipv4Addr::new(10, 0, 0, 3)), 2, 43);
        assert_eq!(route.to_string(), "10.0.0.3/32 scope link proto 43");
        assert!(route.is_link_scope());
        assert!(!route.has_gateway(Ipv4Addr::new(10, 0, 0, 3)));
    }
}
