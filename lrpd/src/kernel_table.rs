//! Kernel-synchronized routing table.
//!
//! `KernelRoutingTable` wraps the in-memory `RoutingTable` and, on every
//! mutation, reconciles:
//! - the kernel main table: one route per destination, next hops as
//!   parallel gateways, tagged with the route-owner protocol number
//! - the loop-avoidance chain: accept rules for predecessors (by MAC) and
//!   destinations (by subnet) ahead of the catch-all
//!
//! Kernel and firewall state is re-read before every read-modify-write, so
//! pre-existing routes and rules are tolerated and never duplicated.

use crate::address::{self, Address, Subnet, host_subnet, is_default_route};
use crate::config::Settings;
use crate::firewall::{Allow, CatchAll, Firewall, RuleMatch, RuleOp, predecessor_comment};
use crate::kernel::{Kernel, KernelError, KernelRoute};
use crate::node::{NodeIdentity, Role};
use crate::routing::{Metric, RouteTable, RoutingTable};
use crate::Result;
use smoltcp::wire::EthernetAddress;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Resolution of link-layer senders to network addresses.
pub trait LinkResolver {
    /// Network address of the neighbour owning `link`, if known.
    fn address_of_link(&mut self, link: EthernetAddress) -> Result<Option<Address>>;
}

/// Where and how routes and rules are projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelTableOptions {
    /// Interface index routes are bound to.
    pub interface: u32,
    /// Route-owner protocol number tagging our kernel routes.
    pub route_protocol: u8,
    pub catch_all: CatchAll,
}

impl KernelTableOptions {
    pub fn new(identity: &NodeIdentity, settings: &Settings) -> Self {
        let catch_all = match identity.role {
            Role::Router => CatchAll::Everything,
            Role::Sink => CatchAll::Towards(identity.prefix),
        };
        KernelTableOptions {
            interface: identity.index,
            route_protocol: settings.route_protocol,
            catch_all,
        }
    }
}

/// Routing table mirrored into the kernel and the firewall.
///
/// The projections are installed by `open` and torn down exactly once, by
/// `close` or on drop.
pub struct KernelRoutingTable<K: Kernel, F: Firewall> {
    table: RoutingTable,
    kernel: K,
    firewall: F,
    options: KernelTableOptions,
    released: bool,
}

impl<K: Kernel, F: Firewall> KernelRoutingTable<K, F> {
    /// Install the loop-avoidance chain and start with an empty table.
    pub fn open(kernel: K, mut firewall: F, options: KernelTableOptions) -> Result<Self> {
        firewall.install(options.catch_all)?;
        info!(
            interface = options.interface,
            protocol = options.route_protocol,
            catch_all = ?options.catch_all,
            "Kernel routing table opened"
        );
        Ok(KernelRoutingTable {
            table: RoutingTable::new(),
            kernel,
            firewall,
            options,
            released: false,
        })
    }

    /// Tear down kernel routes and the firewall chain now.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let purged = self.kernel.purge_routes(self.options.route_protocol);
        let uninstalled = self.firewall.uninstall();
        self.table.clear();

        let purged = purged?;
        uninstalled?;
        info!(routes = purged, "Kernel routing table released");
        Ok(())
    }

    /// The in-memory view.
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn firewall(&self) -> &F {
        &self.firewall
    }

    /// MAC address of `address` in the neighbour cache.
    pub fn link_address_of(&mut self, address: Address) -> Result<Option<EthernetAddress>> {
        Ok(self
            .kernel
            .neighbours()?
            .into_iter()
            .find(|neighbour| neighbour.address == address)
            .map(|neighbour| neighbour.link_address))
    }

    /// Add `next_hop` as a kernel gateway towards `destination`.
    fn install_gateway(&mut self, destination: Subnet, next_hop: Address) -> Result<()> {
        match self.kernel.route(destination)? {
            None => {
                let route = KernelRoute::via(
                    destination,
                    next_hop,
                    self.options.interface,
                    self.options.route_protocol,
                );
                self.kernel.add_route(&route)?;
                info!(%route, "Kernel route added");
                // Allowing 0.0.0.0/0 would accept everything the catch-all diverts
                if !is_default_route(&destination) {
                    self.allow_destination(destination)?;
                }
            }
            Some(route) if route.is_link_scope() => {
                debug!(%route, %next_hop, "Kept neighbor route, not adding gateway");
            }
            Some(route) if route.has_gateway(next_hop) => {}
            Some(route) => {
                self.kernel.add_gateway(&route, next_hop)?;
                info!(%route, %next_hop, "Kernel route gained a gateway");
            }
        }
        Ok(())
    }

    /// Remove `next_hop` from the kernel route towards `destination`.
    fn withdraw_gateway(&mut self, destination: Subnet, next_hop: Address) -> Result<()> {
        let Some(route) = self.kernel.route(destination)? else {
            return Ok(());
        };
        if route.is_link_scope() || !route.has_gateway(next_hop) {
            return Ok(());
        }

        match self.kernel.remove_gateway(&route, next_hop) {
            Ok(()) => {
                info!(%route, %next_hop, "Kernel route lost a gateway");
            }
            Err(KernelError::NotMultipath(_)) => {
                self.kernel.del_route(&route)?;
                info!(%route, "Kernel route deleted");
                self.disallow_destination(destination)?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Kernel and firewall teardown after `next_hop` left `destination`.
    fn forget_next_hop(&mut self, destination: Subnet, next_hop: Address) -> Result<()> {
        self.withdraw_gateway(destination, next_hop)?;
        if !self.table.is_predecessor(next_hop) {
            self.disallow_predecessor(next_hop)?;
        }
        Ok(())
    }

    fn allow_predecessor(&mut self, predecessor: Address) -> Result<()> {
        let Some(link) = self.link_address_of(predecessor)? else {
            warn!(%predecessor, "Unresolved link address, traffic from predecessor not allowed");
            return Ok(());
        };
        if self.firewall.rules()?.iter().any(|rule| rule.accepts_from(link)) {
            return Ok(());
        }
        self.firewall
            .commit(&[RuleOp::Insert(Allow::FromPredecessor { link, predecessor })])?;
        info!(%predecessor, %link, "Traffic from predecessor is allowed");
        Ok(())
    }

    fn disallow_predecessor(&mut self, predecessor: Address) -> Result<()> {
        let link = self.link_address_of(predecessor)?;
        let comment = predecessor_comment(predecessor);
        let stale: Vec<RuleOp> = self
            .firewall
            .rules()?
            .iter()
            .filter(|rule| match link {
                Some(link) => rule.accepts_from(link),
                // Entry left the neighbour cache: fall back to the rule comment
                None => matches!(rule.matcher, RuleMatch::FromLink(_)) && rule.has_comment(&comment),
            })
            .map(|rule| RuleOp::Delete(rule.handle))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        self.firewall.commit(&stale)?;
        info!(%predecessor, "Traffic from predecessor is no more allowed");
        Ok(())
    }

    fn allow_destination(&mut self, destination: Subnet) -> Result<()> {
        if self
            .firewall
            .rules()?
            .iter()
            .any(|rule| rule.accepts_towards(destination))
        {
            return Ok(());
        }
        self.firewall
            .commit(&[RuleOp::Insert(Allow::Towards(destination))])?;
        info!(destination = %address::display(&destination), "Traffic towards destination is allowed");
        Ok(())
    }

    fn disallow_destination(&mut self, destination: Subnet) -> Result<()> {
        let stale: Vec<RuleOp> = self
            .firewall
            .rules()?
            .iter()
            .filter(|rule| rule.accepts_towards(destination))
            .map(|rule| RuleOp::Delete(rule.handle))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        self.firewall.commit(&stale)?;
        info!(
            destination = %address::display(&destination),
            "Traffic towards destination is no more allowed"
        );
        Ok(())
    }
}

impl<K: Kernel, F: Firewall> LinkResolver for KernelRoutingTable<K, F> {
    fn address_of_link(&mut self, link: EthernetAddress) -> Result<Option<Address>> {
        Ok(self
            .kernel
            .neighbours()?
            .into_iter()
            .find(|neighbour| neighbour.link_address == link)
            .map(|neighbour| neighbour.address))
    }
}

impl<K: Kernel, F: Firewall> RouteTable for KernelRoutingTable<K, F> {
    fn add_route(&mut self, destination: Subnet, next_hop: Address, metric: Metric) -> Result<bool> {
        if !self.table.add_route(destination, next_hop, metric) {
            return Ok(false);
        }
        self.install_gateway(destination, next_hop)?;
        if !is_default_route(&destination) {
            self.allow_predecessor(next_hop)?;
        }
        Ok(true)
    }

    fn del_route(&mut self, destination: Subnet, next_hop: Address) -> Result<()> {
        self.table.del_route(destination, next_hop);
        self.forget_next_hop(destination, next_hop)
    }

    fn filter_out_nexthops(
        &mut self,
        destination: Subnet,
        max_metric: Option<Metric>,
    ) -> Result<Vec<(Address, Metric)>> {
        let removed = self.table.filter_out_nexthops(destination, max_metric);
        for (next_hop, _) in &removed {
            self.forget_next_hop(destination, *next_hop)?;
        }
        Ok(removed)
    }

    fn ensure_is_neighbor(&mut self, neighbor: Address) -> Result<()> {
        self.table.ensure_is_neighbor(neighbor);
        let host = host_subnet(neighbor);

        match self.kernel.route(host)? {
            Some(route) if route.is_link_scope() => {}
            existing => {
                if let Some(route) = existing {
                    self.kernel.del_route(&route)?;
                    debug!(%route, "Learned host route shadowed by neighbor route");
                }
                let route = KernelRoute::on_link(
                    host,
                    self.options.interface,
                    self.options.route_protocol,
                );
                self.kernel.add_route(&route)?;
                info!(%neighbor, "Neighbor route added");
            }
        }
        self.allow_destination(host)
    }

    fn no_more_neighbor(&mut self, neighbor: Address) -> Result<()> {
        let host = host_subnet(neighbor);

        if let Some(route) = self.kernel.route(host)?
            && route.is_link_scope()
        {
            let through_neighbor: Vec<Subnet> = self
                .table
                .destinations()
                .into_iter()
                .filter(|destination| {
                    self.table
                        .next_hops(destination)
                        .is_some_and(|hops| hops.contains_key(&neighbor))
                })
                .collect();
            for destination in through_neighbor {
                self.del_route(destination, neighbor)?;
            }
            self.kernel.del_route(&route)?;
            info!(%neighbor, "Neighbor route deleted");

            let shadowed: Vec<Address> = self
                .table
                .next_hops(&host)
                .map(|hops| hops.keys().copied().collect())
                .unwrap_or_default();
            if shadowed.is_empty() {
                self.disallow_destination(host)?;
            } else {
                for next_hop in shadowed {
                    self.install_gateway(host, next_hop)?;
                    self.allow_predecessor(next_hop)?;
                }
                info!(%neighbor, "Learned host route reinstated");
            }
        }

        self.table.forget_neighbor(neighbor);
        Ok(())
    }

    fn is_successor(&self, neighbor: Address) -> bool {
        self.table.is_successor(neighbor)
    }

    fn is_predecessor(&self, neighbor: Address) -> bool {
        self.table.is_predecessor(neighbor)
    }

    fn get_a_nexthop(&self, destination: Address) -> Option<Address> {
        self.table.get_a_nexthop(destination)
    }

    fn is_neighbor(&self, neighbor: Address) -> bool {
        self.table.is_neighbor(neighbor)
    }
}

impl<K: Kernel, F: Firewall> fmt::Display for KernelRoutingTable<K, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.table.fmt(f)
    }
}

impl<K: Kernel, F: Firewall> Drop for KernelRoutingTable<K, F> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(error = %e, "Failed to release kernel routing table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{default_route, parse_subnet};
    use crate::kernel::Scope;
    use crate::test_util::{FakeFirewall, FakeKernel};
    use std::net::Ipv4Addr;

    const IFINDEX: u32 = 3;
    const PROTO: u8 = 43;

    const N1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const N2: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const N3: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);
    const MAC1: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x01]);
    const MAC2: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 0x02]);

    fn options() -> KernelTableOptions {
        KernelTableOptions {
            interface: IFINDEX,
            route_protocol: PROTO,
            catch_all: CatchAll::Everything,
        }
    }

    fn open() -> (KernelRoutingTable<FakeKernel, FakeFirewall>, FakeKernel, FakeFirewall) {
        let kernel = FakeKernel::new()
            .with_neighbour(N1, MAC1)
            .with_neighbour(N2, MAC2);
        let firewall = FakeFirewall::new();
        let table = KernelRoutingTable::open(kernel.clone(), firewall.clone(), options()).unwrap();
        (table, kernel, firewall)
    }

    fn net(text: &str) -> Subnet {
        parse_subnet(text).unwrap()
    }

    #[test]
    fn test_open_installs_chain() {
        let (_table, _kernel, firewall) = open();
        assert_eq!(firewall.catch_all(), Some(CatchAll::Everything));
        assert_eq!(firewall.rules_snapshot().len(), 1);
        assert_eq!(firewall.rules_snapshot()[0].matcher, RuleMatch::Divert);
    }

    #[test]
    fn test_add_route_creates_kernel_route_and_rules() {
        let (mut table, kernel, firewall) = open();
        let dest = net("10.9.0.0/16");

        assert!(RouteTable::add_route(&mut table, dest, N1, 3).unwrap());

        let route = kernel.route_to(dest).unwrap();
        assert_eq!(route.gateways, vec![N1]);
        assert_eq!(route.protocol, PROTO);
        assert_eq!(route.interface, Some(IFINDEX));
        assert!(firewall.allows_destination(dest));
        assert!(firewall.allows_link(MAC1));
    }

    #[test]
    fn test_rejected_add_route_changes_nothing() {
        let (mut table, kernel, firewall) = open();
        let dest = net("10.9.0.0/16");
        RouteTable::add_route(&mut table, dest, N1, 3).unwrap();
        let commits = firewall.commits();

        assert!(!RouteTable::add_route(&mut table, dest, N1, 5).unwrap());
        assert_eq!(kernel.route_to(dest).unwrap().gateways, vec![N1]);
        assert_eq!(firewall.commits(), commits);
    }

    #[test]
    fn test_multipath_kernel_route() {
        let (mut table, kernel, firewall) = open();
        let dest = net("10.9.0.0/16");
        RouteTable::add_route(&mut table, dest, N1, 3).unwrap();
        RouteTable::add_route(&mut table, dest, N2, 4).unwrap();

        assert_eq!(kernel.route_to(dest).unwrap().gateways, vec![N1, N2]);
        assert_eq!(kernel.routes().len(), 1);

        // Metric refresh does not duplicate the gateway
        assert!(RouteTable::add_route(&mut table, dest, N2, 1).unwrap());
        assert_eq!(kernel.route_to(dest).unwrap().gateways, vec![N1, N2]);

        // One destination rule, two predecessor rules, the catch-all
        assert_eq!(firewall.rules_snapshot().len(), 4);
    }

    #[test]
    fn test_default_route_grants_no_allowance() {
        let (mut table, kernel, firewall) = open();
        RouteTable::add_route(&mut table, default_route(), N1, 10).unwrap();

        assert_eq!(kernel.route_to(default_route()).unwrap().gateways, vec![N1]);
        assert!(!firewall.allows_destination(default_route()));
        assert!(!firewall.allows_link(MAC1));
        assert!(table.is_successor(N1));

        assert!(!RouteTable::add_route(&mut table, default_route(), N1, 20).unwrap());
        assert_eq!(table.table().next_hops(&default_route()).unwrap()[&N1], 10);
    }

    #[test]
    fn test_del_route_falls_back_to_route_removal() {
        let (mut table, kernel, firewall) = open();
        let dest = net("10.9.0.0/16");
        RouteTable::add_route(&mut table, dest, N1, 3).unwrap();
        RouteTable::add_route(&mut table, dest, N2, 4).unwrap();

        RouteTable::del_route(&mut table, dest, N1).unwrap();
        assert_eq!(kernel.route_to(dest).unwrap().gateways, vec![N2]);
        assert!(!firewall.allows_link(MAC1));
        assert!(firewall.allows_destination(dest));

        // Single gateway: the kernel refuses, the whole route goes
        RouteTable::del_route(&mut table, dest, N2).unwrap();
        assert!(kernel.route_to(dest).is_none());
        assert!(!firewall.allows_destination(dest));
        assert!(!firewall.allows_link(MAC2));
        assert_eq!(firewall.rules_snapshot().len(), 1);
    }

    #[test]
    fn test_del_route_keeps_predecessor_used_elsewhere() {
        let (mut table, _kernel, firewall) = open();
        RouteTable::add_route(&mut table, net("10.9.0.0/16"), N1, 3).unwrap();
        RouteTable::add_route(&mut table, net("10.8.0.0/16"), N1, 3).unwrap();

        RouteTable::del_route(&mut table, net("10.9.0.0/16"), N1).unwrap();
        assert!(firewall.allows_link(MAC1));

        RouteTable::del_route(&mut table, net("10.8.0.0/16"), N1).unwrap();
        assert!(!firewall.allows_link(MAC1));
    }

    #[test]
    fn test_del_route_unknown_is_noop() {
        let (mut table, kernel, firewall) = open();
        let commits = firewall.commits();
        RouteTable::del_route(&mut table, net("10.9.0.0/16"), N1).unwrap();
        assert!(kernel.routes().is_empty());
        assert_eq!(firewall.commits(), commits);
    }

    #[test]
    fn test_filter_out_nexthops_tears_down() {
        let (mut table, kernel, firewall) = open();
        let dest = net("10.9.0.0/16");
        RouteTable::add_route(&mut table, dest, N1, 3).unwrap();
        RouteTable::add_route(&mut table, dest, N2, 9).unwrap();

        let removed = RouteTable::filter_out_nexthops(&mut table, dest, Some(5)).unwrap();
        assert_eq!(removed, vec![(N2, 9)]);
        assert_eq!(kernel.route_to(dest).unwrap().gateways, vec![N1]);
        assert!(!firewall.allows_link(MAC2));

        assert!(RouteTable::filter_out_nexthops(&mut table, dest, None).unwrap().is_empty());
        assert!(kernel.route_to(dest).is_some());
    }

    #[test]
    fn test_neighbor_route_wins() {
        let (mut table, kernel, firewall) = open();
        let host = host_subnet(N3);

        table.ensure_is_neighbor(N3).unwrap();
        let route = kernel.route_to(host).unwrap();
        assert_eq!(route.scope, Scope::Link);
        assert!(firewall.allows_destination(host));

        // A learned route to the neighbor does not touch the link-scope route
        RouteTable::add_route(&mut table, host, N1, 2).unwrap();
        assert_eq!(kernel.route_to(host).unwrap(), route);

        // Nor does removing it
        RouteTable::del_route(&mut table, host, N1).unwrap();
        assert_eq!(kernel.route_to(host).unwrap(), route);
    }

    #[test]
    fn test_ensure_is_neighbor_replaces_learned_host_route() {
        let (mut table, kernel, _firewall) = open();
        let host = host_subnet(N3);
        RouteTable::add_route(&mut table, host, N1, 2).unwrap();
        assert_eq!(kernel.route_to(host).unwrap().scope, Scope::Universe);

        table.ensure_is_neighbor(N3).unwrap();
        table.ensure_is_neighbor(N3).unwrap();
        let route = kernel.route_to(host).unwrap();
        assert_eq!(route.scope, Scope::Link);
        assert!(route.gateways.is_empty());
        assert_eq!(kernel.routes().len(), 1);
    }

    #[test]
    fn test_no_more_neighbor_reinstates_shadowed_route() {
        let (mut table, kernel, firewall) = open();
        let host = host_subnet(N3);
        RouteTable::add_route(&mut table, host, N1, 2).unwrap();
        table.ensure_is_neighbor(N3).unwrap();

        table.no_more_neighbor(N3).unwrap();
        let route = kernel.route_to(host).unwrap();
        assert_eq!(route.scope, Scope::Universe);
        assert_eq!(route.gateways, vec![N1]);
        assert!(firewall.allows_destination(host));
        assert!(firewall.allows_link(MAC1));
        assert!(!table.is_neighbor(N3));
    }

    #[test]
    fn test_neighbor_roundtrip_restores_state() {
        let (mut table, kernel, firewall) = open();
        RouteTable::add_route(&mut table, net("10.9.0.0/16"), N1, 3).unwrap();
        let routes = kernel.routes();
        let rules = firewall.rules_snapshot().len();
        let rendered = table.to_string();

        table.ensure_is_neighbor(N3).unwrap();
        table.no_more_neighbor(N3).unwrap();

        assert_eq!(kernel.routes(), routes);
        assert_eq!(firewall.rules_snapshot().len(), rules);
        assert_eq!(table.to_string(), rendered);
    }

    #[test]
    fn test_no_more_neighbor_cascades_routes_through_it() {
        let (mut table, kernel, firewall) = open();
        let dest = net("10.9.0.0/16");
        table.ensure_is_neighbor(N1).unwrap();
        RouteTable::add_route(&mut table, dest, N1, 3).unwrap();

        table.no_more_neighbor(N1).unwrap();
        assert!(table.table().next_hops(&dest).is_none());
        assert!(kernel.route_to(dest).is_none());
        assert!(kernel.route_to(host_subnet(N1)).is_none());
        assert!(!firewall.allows_link(MAC1));
        assert!(!firewall.allows_destination(host_subnet(N1)));
    }

    #[test]
    fn test_unresolved_predecessor() {
        let (mut table, _kernel, firewall) = open();
        let dest = net("10.9.0.0/16");
        let stranger = Ipv4Addr::new(10, 0, 0, 99);

        RouteTable::add_route(&mut table, dest, stranger, 3).unwrap();
        assert!(firewall.allows_destination(dest));
        // Only the destination rule and the catch-all
        assert_eq!(firewall.rules_snapshot().len(), 2);
    }

    #[test]
    fn test_disallow_falls_back_to_comment() {
        let (mut table, kernel, firewall) = open();
        let dest = net("10.9.0.0/16");
        RouteTable::add_route(&mut table, dest, N1, 3).unwrap();
        assert!(firewall.allows_link(MAC1));

        kernel.forget_neighbour(N1);
        RouteTable::del_route(&mut table, dest, N1).unwrap();
        assert!(!firewall.allows_link(MAC1));
    }

    #[test]
    fn test_link_resolution() {
        let (mut table, _kernel, _firewall) = open();
        assert_eq!(table.link_address_of(N1).unwrap(), Some(MAC1));
        assert_eq!(table.link_address_of(N3).unwrap(), None);
        assert_eq!(table.address_of_link(MAC2).unwrap(), Some(N2));
        assert_eq!(
            table.address_of_link(EthernetAddress([0x02, 0, 0, 0, 0, 0x63])).unwrap(),
            None
        );
    }

    #[test]
    fn test_close_removes_only_owned_routes() {
        let (mut table, kernel, firewall) = open();
        let foreign = KernelRoute::via(net("192.168.0.0/16"), N2, IFINDEX, 4);
        kernel.insert_route(foreign.clone());

        RouteTable::add_route(&mut table, net("10.9.0.0/16"), N1, 3).unwrap();
        table.ensure_is_neighbor(N3).unwrap();

        table.close().unwrap();
        assert_eq!(kernel.routes(), vec![foreign]);
        assert!(firewall.catch_all().is_none());
        assert!(firewall.rules_snapshot().is_empty());
        assert_eq!(firewall.uninstalls(), 1);
    }

    #[test]
    fn test_drop_releases_once() {
        let (mut table, kernel, firewall) = open();
        RouteTable::add_route(&mut table, net("10.9.0.0/16"), N1, 3).unwrap();
        drop(table);

        assert!(kernel.routes().is_empty());
        assert_eq!(firewall.uninstalls(), 1);
    }

    #[test]
    fn test_sink_options() {
        let identity = NodeIdentity {
            interface: "eth0".to_string(),
            index: IFINDEX,
            address: N1,
            prefix: net("10.0.0.0/8"),
            role: Role::Sink,
        };
        let options = KernelTableOptions::new(&identity, &Settings::default());
        assert_eq!(options.catch_all, CatchAll::Towards(net("10.0.0.0/8")));
        assert_eq!(options.route_protocol, 43);

        let identity = NodeIdentity {
            role: Role::Router,
            ..identity
        };
        let options = KernelTableOptions::new(&identity, &Settings::default());
        assert_eq!(options.catch_all, CatchAll::Everything);
    }
}
