//! Test utilities for lrpd unit and integration tests.
//!
//! Provides in-memory stand-ins for the kernel, the firewall and the node
//! endpoints, so the routing table and the event loop run without
//! CAP_NET_ADMIN.

pub mod endpoints;
pub mod firewall;
pub mod kernel;
pub mod packets;

pub use endpoints::{Scripted, ScriptedEndpoints};
pub use firewall::FakeFirewall;
pub use kernel::FakeKernel;
pub use packets::*;

use crate::address;
use crate::node::{NodeIdentity, Role};
use std::net::Ipv4Addr;

/// Identity of a node at `address` on 10.0.0.0/8, interface index 2.
pub fn test_identity(address: Ipv4Addr, role: Role) -> NodeIdentity {
    NodeIdentity {
        interface: "lrp0".to_string(),
        index: 2,
        address,
        prefix: address::subnet(address, 8).unwrap_or_default(),
        role,
    }
}
