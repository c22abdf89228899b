//! Event sources of a node: protocol sockets, the diversion queue and
//! termination signals.

use crate::address::Address;
use crate::config::Settings;
use crate::node::NodeIdentity;
use crate::queue::{DiversionQueue, Verdict};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use smoltcp::wire::{EthernetAddress, Ipv4Packet};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::AsFd;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest protocol datagram accepted.
const DATAGRAM_BUFFER_SIZE: usize = 1500;

/// Socket a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Unicast,
    Multicast,
}

/// What `wait` found ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Datagram(Channel),
    Diversion,
    /// SIGINT or SIGTERM was received.
    Shutdown,
}

/// Poll results over the node's sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub signal: bool,
    pub diversion: bool,
    pub multicast: bool,
    pub unicast: bool,
}

impl Readiness {
    /// The source to serve first: termination, then diverted packets, then
    /// multicast, then unicast datagrams.
    pub fn ready(self) -> Option<Ready> {
        if self.signal {
            Some(Ready::Shutdown)
        } else if self.diversion {
            Some(Ready::Diversion)
        } else if self.multicast {
            Some(Ready::Datagram(Channel::Multicast))
        } else if self.unicast {
            Some(Ready::Datagram(Channel::Unicast))
        } else {
            None
        }
    }
}

/// A forwarded packet the loop-avoidance chain did not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivertedPacket {
    pub source: Address,
    pub destination: Address,
    /// Link-layer address of the neighbour that sent it to us.
    pub sender_link: Option<EthernetAddress>,
}

impl DivertedPacket {
    /// Parse the IPv4 header of a queued payload. `None` for anything else.
    pub fn parse(payload: &[u8], sender_link: Option<EthernetAddress>) -> Option<Self> {
        let packet = Ipv4Packet::new_checked(payload).ok()?;
        if packet.version() != 4 {
            return None;
        }
        Some(DivertedPacket {
            source: packet.src_addr(),
            destination: packet.dst_addr(),
            sender_link,
        })
    }
}

/// Outgoing protocol datagrams.
pub trait Transmit {
    /// Send `payload` to `destination`, or to the multicast group when `None`.
    fn transmit(&mut self, payload: &[u8], destination: Option<Address>) -> io::Result<()>;
}

/// Everything the event loop waits on.
pub trait Endpoints: Transmit {
    /// Block until a source is ready or `timeout` elapses (`Ok(None)`).
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Option<Ready>>;

    /// Receive one datagram from `channel`, with its sender.
    fn recv_datagram(&mut self, channel: Channel) -> io::Result<(Vec<u8>, Address)>;

    /// Take one packet from the diversion queue. The kernel keeps holding
    /// it until `release_diverted`.
    ///
    /// `None` when nothing is queued or the payload is not IPv4.
    fn next_diverted(&mut self) -> io::Result<Option<DivertedPacket>>;

    /// Drop the packet taken by the last `next_diverted`.
    fn release_diverted(&mut self) -> io::Result<()>;
}

/// Real endpoints: UDP sockets, an NFQUEUE and a signalfd.
pub struct NodeSockets {
    unicast: UdpSocket,
    multicast_in: UdpSocket,
    multicast_out: UdpSocket,
    service_port: u16,
    queue: DiversionQueue,
    /// Id of the packet taken by the last `next_diverted`.
    held: Option<u32>,
    signals: SignalFd,
}

impl NodeSockets {
    pub fn open(identity: &NodeIdentity, settings: &Settings) -> io::Result<Self> {
        let own = identity.address;
        let group = settings.multicast_group;
        let port = settings.service_port;

        let multicast_out = udp_socket()?;
        multicast_out.bind(&SocketAddrV4::new(own, 0).into())?;
        multicast_out.set_multicast_if_v4(&own)?;
        multicast_out.connect(&SocketAddrV4::new(group, port).into())?;

        let multicast_in = udp_socket()?;
        multicast_in.set_reuse_address(true)?;
        multicast_in.join_multicast_v4(&group, &own)?;
        multicast_in.bind(&SocketAddrV4::new(group, port).into())?;

        let unicast = udp_socket()?;
        unicast.bind(&SocketAddrV4::new(own, port).into())?;

        let queue = DiversionQueue::open(settings.queue_num)?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().map_err(io::Error::from)?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(io::Error::from)?;

        info!(
            %own,
            %group,
            port,
            queue = settings.queue_num,
            "Node endpoints opened"
        );

        Ok(NodeSockets {
            unicast: unicast.into(),
            multicast_in: multicast_in.into(),
            multicast_out: multicast_out.into(),
            service_port: port,
            queue,
            held: None,
            signals,
        })
    }

    fn socket(&self, channel: Channel) -> &UdpSocket {
        match channel {
            Channel::Unicast => &self.unicast,
            Channel::Multicast => &self.multicast_in,
        }
    }
}

fn udp_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_cloexec(true)?;
    Ok(socket)
}

impl Transmit for NodeSockets {
    fn transmit(&mut self, payload: &[u8], destination: Option<Address>) -> io::Result<()> {
        match destination {
            None => {
                self.multicast_out.send(payload)?;
            }
            Some(destination) => {
                self.unicast
                    .send_to(payload, SocketAddrV4::new(destination, self.service_port))?;
            }
        }
        Ok(())
    }
}

impl Endpoints for NodeSockets {
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Option<Ready>> {
        let mut fds = [
            PollFd::new(self.signals.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.queue.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.multicast_in.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.unicast.as_fd(), PollFlags::POLLIN),
        ];
        // Packets left over from a batched read are ready now
        let pending = self.queue.has_pending();
        let timeout = match timeout {
            _ if pending => PollTimeout::ZERO,
            None => PollTimeout::NONE,
            Some(delay) => {
                // Round up so a pending timer is due when poll returns
                let ms = delay.as_micros().div_ceil(1000);
                PollTimeout::try_from(ms.min(i32::MAX as u128) as i32)
                    .unwrap_or(PollTimeout::MAX)
            }
        };

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let [signal, diversion, multicast, unicast] = fds.map(|fd| {
            fd.revents()
                .is_some_and(|events| events.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
        });
        let ready = Readiness {
            signal,
            diversion: diversion || pending,
            multicast,
            unicast,
        }
        .ready();
        if ready == Some(Ready::Shutdown)
            && let Some(siginfo) = self.signals.read_signal().map_err(io::Error::from)?
        {
            info!(signal = siginfo.ssi_signo, "Termination signal received");
        }
        Ok(ready)
    }

    fn recv_datagram(&mut self, channel: Channel) -> io::Result<(Vec<u8>, Address)> {
        let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
        let (n, sender) = self.socket(channel).recv_from(&mut buf)?;
        buf.truncate(n);
        let sender = match sender {
            std::net::SocketAddr::V4(addr) => *addr.ip(),
            std::net::SocketAddr::V6(addr) => addr.ip().to_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        Ok((buf, sender))
    }

    fn next_diverted(&mut self) -> io::Result<Option<DivertedPacket>> {
        if self.held.is_some() {
            self.release_diverted()?;
        }
        let Some(queued) = self.queue.recv()? else {
            return Ok(None);
        };

        let packet = DivertedPacket::parse(&queued.payload, queued.hw_addr);
        if packet.is_none() {
            warn!(id = queued.id, "Diverted packet is not IPv4, dropped");
        }
        self.held = Some(queued.id);
        Ok(packet)
    }

    fn release_diverted(&mut self) -> io::Result<()> {
        let Some(id) = self.held.take() else {
            return Ok(());
        };
        self.queue.verdict(id, Verdict::Drop)
    }
}

impl Drop for NodeSockets {
    fn drop(&mut self) {
        if let Err(e) = self.release_diverted() {
            warn!(error = %e, "Failed to release diverted packet");
        }
        if let Err(e) = self.queue.unbind() {
            warn!(error = %e, "Failed to unbind queue");
        }
        debug!("Node endpoints closed");
    }
}
