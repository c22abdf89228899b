//! OS-independent routing table.
//!
//! This module provides:
//! - `RoutingTable`: destination -> {next hop: metric} with metric arbitration,
//!   LPM next-hop lookup and the neighbor set
//! - `RouteTable`: the contract the protocol collaborator programs against,
//!   implemented both by `RoutingTable` and by the kernel-synchronized table

use crate::Result;
use crate::address::{self, Address, Subnet};
use prefix_trie::PrefixMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

/// Cost of reaching a destination through a next hop. Lower is better.
pub type Metric = u32;

/// Next hops of one destination.
pub type NextHops = HashMap<Address, Metric>;

/// Routing operations exposed to the protocol collaborator.
///
/// Mutations are fallible because implementations may reconcile external
/// state (kernel routes, firewall rules) on every call.
pub trait RouteTable: fmt::Display {
    /// Add a route; returns whether the table changed.
    fn add_route(&mut self, destination: Subnet, next_hop: Address, metric: Metric)
    -> Result<bool>;

    fn del_route(&mut self, destination: Subnet, next_hop: Address) -> Result<()>;

    /// Drop the next hops of `destination` whose metric exceeds `max_metric`.
    fn filter_out_nexthops(
        &mut self,
        destination: Subnet,
        max_metric: Option<Metric>,
    ) -> Result<Vec<(Address, Metric)>>;

    fn ensure_is_neighbor(&mut self, neighbor: Address) -> Result<()>;

    fn no_more_neighbor(&mut self, neighbor: Address) -> Result<()>;

    fn is_successor(&self, neighbor: Address) -> bool;

    fn is_predecessor(&self, neighbor: Address) -> bool;

    fn get_a_nexthop(&self, destination: Address) -> Option<Address>;

    fn is_neighbor(&self, neighbor: Address) -> bool;
}

/// In-memory routing table.
///
/// Invariant: no destination maps to an empty set of next hops.
pub struct RoutingTable {
    routes: PrefixMap<Subnet, NextHops>,
    neighbors: HashSet<Address>,
}

impl RoutingTable {
    /// Create a new empty routing table.
    pub fn new() -> Self {
        RoutingTable {
            routes: PrefixMap::new(),
            neighbors: HashSet::new(),
        }
    }

    /// Add a route to `destination` through `next_hop` with cost `metric`.
    ///
    /// A new destination or a new next hop is always accepted. A known
    /// (destination, next hop) pair is only overwritten by a strictly smaller
    /// metric. Returns whether the table changed.
    pub fn add_route(&mut self, destination: Subnet, next_hop: Address, metric: Metric) -> bool {
        let Some(next_hops) = self.routes.get_mut(&destination) else {
            info!(
                destination = %address::display(&destination),
                %next_hop,
                metric,
                "New route"
            );
            self.routes
                .insert(destination, HashMap::from([(next_hop, metric)]));
            return true;
        };

        match next_hops.get(&next_hop) {
            None => {
                info!(
                    destination = %address::display(&destination),
                    %next_hop,
                    metric,
                    "Route also through a new next hop"
                );
            }
            Some(&known) if known <= metric => {
                debug!(
                    destination = %address::display(&destination),
                    %next_hop,
                    known,
                    metric,
                    "Refusing route: metric is not better"
                );
                return false;
            }
            Some(_) => {
                info!(
                    destination = %address::display(&destination),
                    %next_hop,
                    metric,
                    "Refresh route with a better metric"
                );
            }
        }
        next_hops.insert(next_hop, metric);
        true
    }

    /// Delete the route to `destination` through `next_hop`. Absent keys are ignored.
    pub fn del_route(&mut self, destination: Subnet, next_hop: Address) {
        let Some(next_hops) = self.routes.get_mut(&destination) else {
            return;
        };
        if next_hops.remove(&next_hop).is_some() && next_hops.is_empty() {
            self.routes.remove(&destination);
        }
    }

    /// Remove every next hop whose metric is strictly greater than `max_metric`.
    ///
    /// Returns the removed (next hop, metric) pairs. `None` removes nothing.
    pub fn filter_out_nexthops(
        &mut self,
        destination: Subnet,
        max_metric: Option<Metric>,
    ) -> Vec<(Address, Metric)> {
        let Some(max_metric) = max_metric else {
            return Vec::new();
        };
        let Some(next_hops) = self.routes.get_mut(&destination) else {
            return Vec::new();
        };

        let dropped: Vec<(Address, Metric)> = next_hops
            .iter()
            .filter(|&(_, &metric)| metric > max_metric)
            .map(|(&nh, &metric)| (nh, metric))
            .collect();
        for (nh, metric) in &dropped {
            debug!(
                destination = %address::display(&destination),
                next_hop = %nh,
                metric,
                max_metric,
                "Filter next hop out: metric too big"
            );
            next_hops.remove(nh);
        }

        if next_hops.is_empty() {
            self.routes.remove(&destination);
        }
        dropped
    }

    /// Whether `neighbor` is a next hop of the default route.
    pub fn is_successor(&self, neighbor: Address) -> bool {
        self.routes
            .get(&address::default_route())
            .is_some_and(|next_hops| next_hops.contains_key(&neighbor))
    }

    /// Whether `neighbor` is a next hop of any route.
    pub fn is_predecessor(&self, neighbor: Address) -> bool {
        self.routes
            .iter()
            .any(|(_, next_hops)| next_hops.contains_key(&neighbor))
    }

    /// Pick a next hop towards `destination` using the most specific route.
    ///
    /// Within that route the next hop with the highest metric is returned.
    pub fn get_a_nexthop(&self, destination: Address) -> Option<Address> {
        let (_, next_hops) = self.routes.get_lpm(&address::host_subnet(destination))?;
        next_hops
            .iter()
            .max_by_key(|&(_, &metric)| metric)
            .map(|(&nh, _)| nh)
    }

    pub fn ensure_is_neighbor(&mut self, neighbor: Address) {
        self.neighbors.insert(neighbor);
    }

    pub fn forget_neighbor(&mut self, neighbor: Address) {
        self.neighbors.remove(&neighbor);
    }

    pub fn is_neighbor(&self, neighbor: Address) -> bool {
        self.neighbors.contains(&neighbor)
    }

    /// Next hops towards exactly `destination`.
    pub fn next_hops(&self, destination: &Subnet) -> Option<&NextHops> {
        self.routes.get(destination)
    }

    /// Snapshot of all known destinations.
    pub fn destinations(&self) -> Vec<Subnet> {
        self.routes.iter().map(|(destination, _)| *destination).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.iter().next().is_none()
    }

    /// Drop every route and neighbor.
    pub fn clear(&mut self) {
        self.routes = PrefixMap::new();
        self.neighbors.clear();
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut neighbors: Vec<_> = self.neighbors.iter().collect();
        neighbors.sort();
        let neighbors: Vec<String> = neighbors.iter().map(|n| n.to_string()).collect();

        let routes: Vec<String> = self
            .routes
            .iter()
            .map(|(destination, next_hops)| {
                let mut hops: Vec<_> = next_hops.iter().collect();
                hops.sort();
                let hops: Vec<String> = hops
                    .iter()
                    .map(|(nh, metric)| format!("{nh}: {metric}"))
                    .collect();
                format!("{}: {{{}}}", address::display(destination), hops.join(", "))
            })
            .collect();

        write!(f, "[{} ; {}]", neighbors.join(", "), routes.join(", "))
    }
}

impl RouteTable for RoutingTable {
    fn add_route(
        &mut self,
        destination: Subnet,
        next_hop: Address,
        metric: Metric,
    ) -> Result<bool> {
        Ok(RoutingTable::add_route(self, destination, next_hop, metric))
    }

    fn del_route(&mut self, destination: Subnet, next_hop: Address) -> Result<()> {
        RoutingTable::del_route(self, destination, next_hop);
        Ok(())
    }

    fn filter_out_nexthops(
        &mut self,
        destination: Subnet,
        max_metric: Option<Metric>,
    ) -> Result<Vec<(Address, Metric)>> {
        Ok(RoutingTable::filter_out_nexthops(self, destination, max_metric))
    }

    fn ensure_is_neighbor(&mut self, neighbor: Address) -> Result<()> {
        RoutingTable::ensure_is_neighbor(self, neighbor);
        Ok(())
    }

    fn no_more_neighbor(&mut self, neighbor: Address) -> Result<()> {
        self.forget_neighbor(neighbor);
        Ok(())
    }

    fn is_successor(&self, neighbor: Address) -> bool {
        RoutingTable::is_successor(self, neighbor)
    }

    fn is_predecessor(&self, neighbor: Address) -> bool {
        RoutingTable::is_predecessor(self, neighbor)
    }

    fn get_a_nexthop(&self, destination: Address) -> Option<Address> {
        RoutingTable::get_a_nexthop(self, destination)
    }

    fn is_neighbor(&self, neighbor: Address) -> bool {
        RoutingTable::is_neighbor(self, neighbor)
    }
}
