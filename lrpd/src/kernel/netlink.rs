//! rtnetlink implementation of the kernel boundary.
//!
//! rtnetlink is async; the event loop is not. The connection lives on a
//! private current-thread runtime and each request is driven to completion
//! with `block_on`, so callers stay on a single thread.

use super::{Kernel, KernelError, KernelRoute, Neighbour, Result, Scope};
use crate::address::{self, Address};
use futures::TryStreamExt;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteNextHop, RouteProtocol, RouteScope, RouteType,
};
use rtnetlink::{Handle, IpVersion};
use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// `RT_TABLE_MAIN`
const MAIN_TABLE: u8 = 254;

/// Handle for netlink operations on one interface.
pub struct NetlinkKernel {
    runtime: Runtime,
    handle: Handle,
    interface: u32,
}

impl NetlinkKernel {
    /// Open a netlink connection scoped to interface `interface`.
    pub fn connect(interface: u32) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(KernelError::Connection)?;

        let (connection, handle, _) = {
            let _guard = runtime.enter();
            rtnetlink::new_connection().map_err(KernelError::Connection)?
        };
        runtime.spawn(connection);

        Ok(Self {
            runtime,
            handle,
            interface,
        })
    }

    fn dump_routes(&self) -> Result<Vec<KernelRoute>> {
        let handle = self.handle.clone();
        let messages: Vec<RouteMessage> = self
            .runtime
            .block_on(async move {
                handle
                    .route()
                    .get(IpVersion::V4)
                    .execute()
                    .try_collect()
                    .await
            })
            .map_err(netlink_error)?;

        Ok(messages.iter().filter_map(parse_route).collect())
    }

    /// Create (or with `replace`, overwrite) `route` with the given gateways.
    fn install(&self, route: &KernelRoute, gateways: &[Address], replace: bool) -> Result<()> {
        let handle = self.handle.clone();
        let destination = route.destination;
        let protocol = RouteProtocol::from(route.protocol);
        let scope = route_scope(route.scope);
        let interface = route.interface;
        let gateways = gateways.to_vec();

        self.runtime
            .block_on(async move {
                let mut request = handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(destination.addr(), destination.prefix_len())
                    .protocol(protocol)
                    .scope(scope);
                if replace {
                    request = request.replace();
                }

                match gateways.as_slice() {
                    [] => {
                        if let Some(index) = interface {
                            request = request.output_interface(index);
                        }
                    }
                    [gateway] => {
                        request = request.gateway(*gateway);
                        if let Some(index) = interface {
                            request = request.output_interface(index);
                        }
                    }
                    many => {
                        let hops = many
                            .iter()
                            .map(|gateway| next_hop(*gateway, interface))
                            .collect();
                        request
                            .message_mut()
                            .attributes
                            .push(RouteAttribute::MultiPath(hops));
                    }
                }

                request.execute().await
            })
            .map_err(netlink_error)
    }
}

impl Kernel for NetlinkKernel {
    fn route(&mut self, destination: address::Subnet) -> Result<Option<KernelRoute>> {
        Ok(self
            .dump_routes()?
            .into_iter()
            .find(|route| route.destination == destination))
    }

    fn add_route(&mut self, route: &KernelRoute) -> Result<()> {
        debug!(%route, "netlink: add route");
        self.install(route, &route.gateways, false)
    }

    fn add_gateway(&mut self, route: &KernelRoute, gateway: Address) -> Result<()> {
        let mut gateways = route.gateways.clone();
        if !gateways.contains(&gateway) {
            gateways.push(gateway);
        }
        debug!(%route, %gateway, "netlink: add gateway");
        self.install(route, &gateways, true)
    }

    fn remove_gateway(&mut self, route: &KernelRoute, gateway: Address) -> Result<()> {
        if route.gateways.len() <= 1 {
            return Err(KernelError::NotMultipath(route.destination));
        }
        let gateways: Vec<Address> = route
            .gateways
            .iter()
            .copied()
            .filter(|gw| *gw != gateway)
            .collect();
        debug!(%route, %gateway, "netlink: remove gateway");
        self.install(route, &gateways, true)
    }

    fn del_route(&mut self, route: &KernelRoute) -> Result<()> {
        debug!(%route, "netlink: delete route");
        let handle = self.handle.clone();
        let message = route_message(route);
        self.runtime
            .block_on(async move { handle.route().del(message).execute().await })
            .map_err(netlink_error)
    }

    fn purge_routes(&mut self, protocol: u8) -> Result<usize> {
        let owned: Vec<KernelRoute> = self
            .dump_routes()?
            .into_iter()
            .filter(|route| route.protocol == protocol)
            .collect();
        for route in &owned {
            self.del_route(route)?;
        }
        Ok(owned.len())
    }

    fn neighbours(&mut self) -> Result<Vec<Neighbour>> {
        let handle = self.handle.clone();
        let messages: Vec<NeighbourMessage> = self
            .runtime
            .block_on(async move { handle.neighbours().get().execute().try_collect().await })
            .map_err(netlink_error)?;

        Ok(messages
            .iter()
            .filter(|message| message.header.ifindex == self.interface)
            .filter_map(parse_neighbour)
            .collect())
    }
}

fn netlink_error(error: rtnetlink::Error) -> KernelError {
    KernelError::Netlink(error.to_string())
}

fn route_scope(scope: Scope) -> RouteScope {
    match scope {
        Scope::Universe => RouteScope::Universe,
        Scope::Link => RouteScope::Link,
        Scope::Other(value) => RouteScope::from(value),
    }
}

fn next_hop(gateway: Address, interface: Option<u32>) -> RouteNextHop {
    let mut hop = RouteNextHop::default();
    hop.interface_index = interface.unwrap_or_default();
    hop.attributes = vec![RouteAttribute::Gateway(RouteAddress::Inet(gateway))];
    hop
}

/// Message identifying `route` for deletion.
fn route_message(route: &KernelRoute) -> RouteMessage {
    let mut message = RouteMessage::default();
    message.header.address_family = AddressFamily::Inet;
    message.header.destination_prefix_length = route.destination.prefix_len();
    message.header.table = MAIN_TABLE;
    message.header.protocol = RouteProtocol::from(route.protocol);
    message.header.scope = route_scope(route.scope);
    message.header.kind = RouteType::Unicast;
    if route.destination.prefix_len() > 0 {
        message
            .attributes
            .push(RouteAttribute::Destination(RouteAddress::Inet(
                route.destination.addr(),
            )));
    }
    message
}

/// Translate a dumped message; non-IPv4, non-unicast and non-main routes are skipped.
fn parse_route(message: &RouteMessage) -> Option<KernelRoute> {
    let header = &message.header;
    if header.address_family != AddressFamily::Inet || header.kind != RouteType::Unicast {
        return None;
    }

    let mut table = u32::from(header.table);
    let mut destination = Ipv4Addr::UNSPECIFIED;
    let mut gateways = Vec::new();
    let mut interface = None;

    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Table(id) => table = *id,
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => destination = *addr,
            RouteAttribute::Gateway(RouteAddress::Inet(gateway)) => gateways.push(*gateway),
            RouteAttribute::Oif(index) => interface = Some(*index),
            RouteAttribute::MultiPath(hops) => {
                for hop in hops {
                    if interface.is_none() && hop.interface_index != 0 {
                        interface = Some(hop.interface_index);
                    }
                    gateways.extend(hop.attributes.iter().filter_map(|a| match a {
                        RouteAttribute::Gateway(RouteAddress::Inet(gateway)) => Some(*gateway),
                        _ => None,
                    }));
                }
            }
            _ => {}
        }
    }

    if table != u32::from(MAIN_TABLE) {
        return None;
    }

    let scope = match header.scope {
        RouteScope::Universe => Scope::Universe,
        RouteScope::Link => Scope::Link,
        other => Scope::Other(u8::from(other)),
    };

    Some(KernelRoute {
        destination: address::subnet(destination, header.destination_prefix_length)?,
        gateways,
        scope,
        protocol: u8::from(header.protocol),
        interface,
    })
}

fn parse_neighbour(message: &NeighbourMessage) -> Option<Neighbour> {
    let mut address = None;
    let mut link_address = None;
    for attribute in &message.attributes {
        match attribute {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)) => address = Some(*ip),
            NeighbourAttribute::LinkLocalAddress(bytes) if bytes.len() == 6 => {
                link_address = Some(EthernetAddress::from_bytes(bytes));
            }
            _ => {}
        }
    }
    Some(Neighbour {
        address: address?,
        link_address: link_address?,
    })
}
