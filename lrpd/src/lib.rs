//! lrpd: node agent for the LRP sink-oriented routing protocol.
//!
//! The node keeps a destination -> next hops table, projects it onto the
//! kernel forwarding table, and guards forwarding with a loop-avoidance
//! firewall chain that diverts unexpected traffic back to the protocol.
//!
//! # Architecture
//!
//! ```text
//! Protocol <-- EventLoop <-- NodeSockets (unicast, multicast, signals)
//!    |                            +--> DiversionQueue (NFQUEUE over netlink)
//!    |
//!    +--> RouteTable = KernelRoutingTable
//!                        +--> RoutingTable (in memory)
//!                        +--> Kernel   (rtnetlink: routes, neighbours)
//!                        +--> Firewall (nftables: loop-avoidance chain)
//! ```

pub mod address;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod event_loop;
pub mod firewall;
pub mod kernel;
pub mod kernel_table;
pub mod node;
pub mod observer;
pub mod queue;
pub mod routing;
pub mod scheduler;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use address::{Address, Subnet};
pub use config::Settings;
pub use endpoints::{Endpoints, NodeSockets, Transmit};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, Node, Protocol, WireMessage};
pub use firewall::{Firewall, NftFirewall};
pub use kernel::{Kernel, NetlinkKernel};
pub use kernel_table::{KernelRoutingTable, KernelTableOptions, LinkResolver};
pub use node::{NodeIdentity, Role};
pub use observer::Observer;
pub use routing::{Metric, RouteTable, RoutingTable};
pub use scheduler::{Scheduler, TimerId};
