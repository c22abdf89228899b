//! Single-threaded event loop.
//!
//! Each iteration runs the due timers, then waits on the endpoints for at
//! most the delay to the next timer, and dispatches whatever became ready
//! to the protocol:
//!
//! ```text
//! timers ------------------------------> Protocol::handle_timer
//! unicast / multicast socket --parse---> Protocol::handle_msg
//! diversion queue --+-- sink ----------> Protocol::handle_unknown_host
//!                   +-- router --------> Protocol::handle_non_routable_packet
//! SIGINT / SIGTERM --------------------> return
//! ```

use crate::address::Address;
use crate::endpoints::{Channel, DivertedPacket, Endpoints, Ready, Transmit};
use crate::kernel_table::LinkResolver;
use crate::node::{NodeIdentity, Role};
use crate::routing::RouteTable;
use crate::scheduler::{Scheduler, TimerId};
use crate::Result;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Codec of protocol datagrams.
pub trait WireMessage: Sized + fmt::Debug {
    type Error: std::error::Error + Send + Sync + 'static;

    fn parse(payload: &[u8]) -> std::result::Result<Self, Self::Error>;

    fn dump(&self) -> Vec<u8>;
}

/// Datagram kept as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDatagram(pub Vec<u8>);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("empty datagram")]
pub struct EmptyDatagram;

impl WireMessage for RawDatagram {
    type Error = EmptyDatagram;

    fn parse(payload: &[u8]) -> std::result::Result<Self, Self::Error> {
        if payload.is_empty() {
            return Err(EmptyDatagram);
        }
        Ok(RawDatagram(payload.to_vec()))
    }

    fn dump(&self) -> Vec<u8> {
        self.0.clone()
    }
}

/// What a protocol handler can act on.
pub struct Node<'a, T> {
    routes: &'a mut dyn RouteTable,
    timers: &'a mut Scheduler<T>,
    transmit: &'a mut dyn Transmit,
    identity: &'a NodeIdentity,
}

impl<'a, T> Node<'a, T> {
    pub fn new(
        routes: &'a mut dyn RouteTable,
        timers: &'a mut Scheduler<T>,
        transmit: &'a mut dyn Transmit,
        identity: &'a NodeIdentity,
    ) -> Self {
        Node {
            routes,
            timers,
            transmit,
            identity,
        }
    }

    pub fn routes(&mut self) -> &mut dyn RouteTable {
        &mut *self.routes
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.identity
    }

    /// Fire `timer` after `delay`.
    pub fn schedule(&mut self, delay: Duration, timer: T) -> TimerId {
        self.timers.schedule(delay, timer)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Send `msg` to `destination`, or multicast it when `None`.
    pub fn send_msg<M: WireMessage>(&mut self, msg: &M, destination: Option<Address>) -> Result<()> {
        match destination {
            None => info!(?msg, "Send (multicast)"),
            Some(destination) => info!(?msg, %destination, "Send"),
        }
        self.transmit.transmit(&msg.dump(), destination)?;
        Ok(())
    }
}

/// The routing protocol driven by the loop.
///
/// Any error returned by a handler ends the session.
pub trait Protocol {
    type Message: WireMessage;
    type Timer;

    /// Called once, before the first iteration.
    fn start(&mut self, node: &mut Node<'_, Self::Timer>) -> Result<()>;

    fn handle_msg(
        &mut self,
        msg: Self::Message,
        sender: Address,
        is_multicast: bool,
        node: &mut Node<'_, Self::Timer>,
    ) -> Result<()>;

    /// A router was handed a packet it has no legitimate route for.
    ///
    /// `sender` is the neighbour that forwarded it, when its link address
    /// resolves.
    fn handle_non_routable_packet(
        &mut self,
        source: Address,
        destination: Address,
        sender: Option<Address>,
        node: &mut Node<'_, Self::Timer>,
    ) -> Result<()>;

    /// The sink was handed a packet towards a host it does not know.
    fn handle_unknown_host(
        &mut self,
        destination: Address,
        node: &mut Node<'_, Self::Timer>,
    ) -> Result<()>;

    fn handle_timer(&mut self, timer: Self::Timer, node: &mut Node<'_, Self::Timer>) -> Result<()>;
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Dispatcher owning the protocol, the routing table and the endpoints.
pub struct EventLoop<P: Protocol, T, E> {
    protocol: P,
    table: T,
    endpoints: E,
    timers: Scheduler<P::Timer>,
    identity: NodeIdentity,
    started: bool,
}

impl<P, T, E> EventLoop<P, T, E>
where
    P: Protocol,
    T: RouteTable + LinkResolver,
    E: Endpoints,
{
    pub fn new(protocol: P, table: T, endpoints: E, identity: NodeIdentity) -> Self {
        EventLoop {
            protocol,
            table,
            endpoints,
            timers: Scheduler::new(),
            identity,
            started: false,
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn endpoints(&self) -> &E {
        &self.endpoints
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Give up the parts; the table and endpoints tear down when dropped.
    pub fn into_parts(self) -> (P, T, E) {
        (self.protocol, self.table, self.endpoints)
    }

    /// Run until a termination signal.
    pub fn run(&mut self) -> Result<()> {
        info!(
            address = %self.identity.address,
            role = %self.identity.role,
            "Event loop running"
        );
        while self.run_once()? == Flow::Continue {}
        info!("Event loop stopped");
        Ok(())
    }

    /// Start the protocol if needed, then run one iteration.
    pub fn run_once(&mut self) -> Result<Flow> {
        let EventLoop {
            protocol,
            table,
            endpoints,
            timers,
            identity,
            started,
        } = self;

        if !*started {
            *started = true;
            protocol.start(&mut Node::new(table, timers, endpoints, identity))?;
        }

        while let Some(timer) = timers.pop_due(Instant::now()) {
            protocol.handle_timer(timer, &mut Node::new(table, timers, endpoints, identity))?;
        }

        let timeout = timers.next_delay(Instant::now());
        let Some(ready) = endpoints.wait(timeout)? else {
            return Ok(Flow::Continue);
        };

        match ready {
            Ready::Shutdown => return Ok(Flow::Shutdown),
            Ready::Diversion => {
                let Some(packet) = endpoints.next_diverted()? else {
                    endpoints.release_diverted()?;
                    return Ok(Flow::Continue);
                };
                let dispatched = dispatch_diverted(protocol, table, timers, endpoints, identity, packet);
                // The kernel copy is dropped whatever the handler did
                let released = endpoints.release_diverted();
                dispatched?;
                released?;
            }
            Ready::Datagram(channel) => {
                let (payload, sender) = match endpoints.recv_datagram(channel) {
                    Ok(datagram) => datagram,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Continue),
                    Err(e) => return Err(e.into()),
                };
                if sender == identity.address {
                    debug!("Skip a message from ourselves");
                    return Ok(Flow::Continue);
                }
                let msg = match P::Message::parse(&payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(%sender, len = payload.len(), error = %e, "Dropping malformed datagram");
                        return Ok(Flow::Continue);
                    }
                };
                debug!(?msg, %sender, ?channel, "Received");
                protocol.handle_msg(
                    msg,
                    sender,
                    channel == Channel::Multicast,
                    &mut Node::new(table, timers, endpoints, identity),
                )?;
            }
        }
        Ok(Flow::Continue)
    }
}

fn dispatch_diverted<P, T, E>(
    protocol: &mut P,
    table: &mut T,
    timers: &mut Scheduler<P::Timer>,
    endpoints: &mut E,
    identity: &NodeIdentity,
    packet: DivertedPacket,
) -> Result<()>
where
    P: Protocol,
    T: RouteTable + LinkResolver,
    E: Endpoints,
{
    match identity.role {
        Role::Sink => {
            debug!(destination = %packet.destination, "Packet towards unknown host");
            protocol.handle_unknown_host(
                packet.destination,
                &mut Node::new(table, timers, endpoints, identity),
            )
        }
        Role::Router => {
            let sender = match packet.sender_link {
                Some(link) => table.address_of_link(link)?,
                None => None,
            };
            debug!(
                source = %packet.source,
                destination = %packet.destination,
                ?sender,
                "Non-routable packet"
            );
            protocol.handle_non_routable_packet(
                packet.source,
                packet.destination,
                sender,
                &mut Node::new(table, timers, endpoints, identity),
            )
        }
    }
}
