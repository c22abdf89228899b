//! In-memory kernel: a main table and a neighbour cache.

use crate::address::{Address, Subnet};
use crate::kernel::{Kernel, KernelError, KernelRoute, Neighbour, Result};
use smoltcp::wire::EthernetAddress;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default)]
struct KernelState {
    routes: Vec<KernelRoute>,
    neighbours: Vec<Neighbour>,
}

/// Fake kernel. Clones share state, so a test keeps one handle to inspect
/// the routes while the table under test owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Rc<RefCell<KernelState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a neighbour cache entry.
    pub fn with_neighbour(self, address: Address, link_address: EthernetAddress) -> Self {
        self.state.borrow_mut().neighbours.push(Neighbour {
            address,
            link_address,
        });
        self
    }

    /// Evict `address` from the neighbour cache.
    pub fn forget_neighbour(&self, address: Address) {
        self.state
            .borrow_mut()
            .neighbours
            .retain(|neighbour| neighbour.address != address);
    }

    /// Install a route behind the table's back (e.g., another owner's).
    pub fn insert_route(&self, route: KernelRoute) {
        self.state.borrow_mut().routes.push(route);
    }

    pub fn route_to(&self, destination: Subnet) -> Option<KernelRoute> {
        self.state
            .borrow()
            .routes
            .iter()
            .find(|route| route.destination == destination)
            .cloned()
    }

    pub fn routes(&self) -> Vec<KernelRoute> {
        self.state.borrow().routes.clone()
    }
}

impl Kernel for FakeKernel {
    fn route(&mut self, destination: Subnet) -> Result<Option<KernelRoute>> {
        Ok(self.route_to(destination))
    }

    fn add_route(&mut self, route: &KernelRoute) -> Result<()> {
        if self.route_to(route.destination).is_some() {
            return Err(KernelError::Netlink("File exists".to_string()));
        }
        self.insert_route(route.clone());
        Ok(())
    }

    fn add_gateway(&mut self, route: &KernelRoute, gateway: Address) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let existing = state
            .routes
            .iter_mut()
            .find(|r| r.destination == route.destination)
            .ok_or(KernelError::NoRoute(route.destination))?;
        if !existing.gateways.contains(&gateway) {
            existing.gateways.push(gateway);
        }
        Ok(())
    }

    fn remove_gateway(&mut self, route: &KernelRoute, gateway: Address) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let existing = state
            .routes
            .iter_mut()
            .find(|r| r.destination == route.destination)
            .ok_or(KernelError::NoRoute(route.destination))?;
        if existing.gateways.len() <= 1 {
            return Err(KernelError::NotMultipath(route.destination));
        }
        existing.gateways.retain(|gw| *gw != gateway);
        Ok(())
    }

    fn del_route(&mut self, route: &KernelRoute) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let before = state.routes.len();
        state.routes.retain(|r| r.destination != route.destination);
        if state.routes.len() == before {
            return Err(KernelError::NoRoute(route.destination));
        }
        Ok(())
    }

    fn purge_routes(&mut self, protocol: u8) -> Result<usize> {
        let mut state = self.state.borrow_mut();
        let before = state.routes.len();
        state.routes.retain(|route| route.protocol != protocol);
        Ok(before - state.routes.len())
    }

    fn neighbours(&mut self) -> Result<Vec<Neighbour>> {
        Ok(self.state.borrow().neighbours.clone())
    }
}
