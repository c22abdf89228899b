//! Passive protocol: learns neighbours from received datagrams and reports.
//!
//! It never advertises routes. Running it exercises the whole node (sockets,
//! diversion queue, kernel table) without taking part in route computation.

use crate::Result;
use crate::address::{self, Address};
use crate::event_loop::{Node, Protocol, RawDatagram};
use std::time::Duration;
use tracing::info;

/// Timers of the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverTimer {
    /// Periodic routing table report.
    Report,
}

/// What the observer has seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverStats {
    pub datagrams: u64,
    pub multicast: u64,
    pub non_routable: u64,
    /// Non-routable packets headed outside the node's network.
    pub outside_network: u64,
    pub unknown_hosts: u64,
    pub reports: u64,
}

pub struct Observer {
    report_interval: Duration,
    stats: ObserverStats,
}

impl Observer {
    pub fn new(report_interval: Duration) -> Self {
        Observer {
            report_interval,
            stats: ObserverStats::default(),
        }
    }

    pub fn stats(&self) -> ObserverStats {
        self.stats
    }
}

impl Protocol for Observer {
    type Message = RawDatagram;
    type Timer = ObserverTimer;

    fn start(&mut self, node: &mut Node<'_, ObserverTimer>) -> Result<()> {
        info!(
            address = %node.identity().address,
            interval_secs = self.report_interval.as_secs(),
            "Observer started"
        );
        node.schedule(self.report_interval, ObserverTimer::Report);
        Ok(())
    }

    fn handle_msg(
        &mut self,
        msg: RawDatagram,
        sender: Address,
        is_multicast: bool,
        node: &mut Node<'_, ObserverTimer>,
    ) -> Result<()> {
        self.stats.datagrams += 1;
        if is_multicast {
            self.stats.multicast += 1;
        }
        if !node.routes().is_neighbor(sender) {
            info!(%sender, "New neighbor");
        }
        node.routes().ensure_is_neighbor(sender)?;
        info!(%sender, len = msg.0.len(), is_multicast, "Datagram");
        Ok(())
    }

    fn handle_non_routable_packet(
        &mut self,
        source: Address,
        destination: Address,
        sender: Option<Address>,
        node: &mut Node<'_, ObserverTimer>,
    ) -> Result<()> {
        self.stats.non_routable += 1;
        let in_network = address::contains(&node.identity().prefix, destination);
        if !in_network {
            self.stats.outside_network += 1;
        }
        info!(%source, %destination, ?sender, in_network, "Non-routable packet");
        Ok(())
    }

    fn handle_unknown_host(
        &mut self,
        destination: Address,
        _node: &mut Node<'_, ObserverTimer>,
    ) -> Result<()> {
        self.stats.unknown_hosts += 1;
        info!(%destination, "Unknown host");
        Ok(())
    }

    fn handle_timer(
        &mut self,
        timer: ObserverTimer,
        node: &mut Node<'_, ObserverTimer>,
    ) -> Result<()> {
        match timer {
            ObserverTimer::Report => {
                self.stats.reports += 1;
                let table = node.routes().to_string();
                info!(%table, stats = ?self.stats, "Routing table");
                node.schedule(self.report_interval, ObserverTimer::Report);
            }
        }
        Ok(())
    }
}
