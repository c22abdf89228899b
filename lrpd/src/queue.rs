//! NFQUEUE diversion queue over a NETLINK_NETFILTER socket.
//!
//! Covers what the node needs: bind one queue in packet-copy mode, take
//! queued packets one at a time, issue verdicts, unbind. A single netlink
//! datagram may carry several packets; the extra ones are kept in
//! `pending` and handed out before the socket is read again.

use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use smoltcp::wire::EthernetAddress;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use tracing::{debug, warn};

/// nlmsghdr
const NLMSG_HDR_LEN: usize = 16;
/// nfgenmsg
const NFGEN_HDR_LEN: usize = 4;
/// nlattr
const NLA_HDR_LEN: usize = 4;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLMSG_ERROR: u16 = 0x2;

const NFNL_SUBSYS_QUEUE: u16 = 3;
const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_HWADDR: u16 = 9;
const NFQA_PAYLOAD: u16 = 10;

/// Strips NLA_F_NESTED and NLA_F_NET_BYTEORDER.
const NLA_TYPE_MASK: u16 = 0x3fff;

const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_UNBIND: u8 = 2;
const NFQNL_COPY_PACKET: u8 = 2;

/// Largest packet copied to userspace.
const COPY_RANGE: u32 = 0xffff;

const RECV_BUFFER_SIZE: usize = 0x10000 + 0x1000;

/// Fate of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
}

/// A packet held by the kernel until its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub id: u32,
    /// Link-layer source, when the kernel reports one.
    pub hw_addr: Option<EthernetAddress>,
    /// Network header first.
    pub payload: Vec<u8>,
}

/// One netlink message read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Incoming {
    Packet(QueuedPacket),
    /// `NLMSG_ERROR`; `code` 0 is an acknowledgement.
    Status { seq: u32, code: i32 },
    Other,
}

/// A bound NFQUEUE.
pub struct DiversionQueue {
    fd: OwnedFd,
    queue_num: u16,
    seq: u32,
    pending: VecDeque<QueuedPacket>,
}

impl DiversionQueue {
    /// Bind queue `queue_num` in packet-copy mode.
    pub fn open(queue_num: u16) -> io::Result<Self> {
        let fd = socket::socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkNetFilter,
        )?;
        socket::bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;

        let mut queue = DiversionQueue {
            fd,
            queue_num,
            seq: 0,
            pending: VecDeque::new(),
        };
        queue.configure(NFQA_CFG_CMD, &config_command(NFQNL_CFG_CMD_BIND))?;
        queue.configure(NFQA_CFG_PARAMS, &copy_params(COPY_RANGE))?;
        debug!(queue = queue_num, "NFQUEUE bound");
        Ok(queue)
    }

    /// Whether packets from an earlier read are waiting.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Next queued packet, without blocking.
    pub fn recv(&mut self) -> io::Result<Option<QueuedPacket>> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(Some(packet));
        }
        match self.read(MsgFlags::MSG_DONTWAIT) {
            Ok(statuses) => {
                for (seq, code) in statuses {
                    warn!(seq, code, "Unexpected netlink status on the queue");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(Errno::ENOBUFS as i32) => {
                warn!(queue = self.queue_num, "Queue overrun, packets lost");
            }
            Err(e) => return Err(e),
        }
        Ok(self.pending.pop_front())
    }

    /// Give the kernel the verdict on packet `id`.
    pub fn verdict(&mut self, id: u32, verdict: Verdict) -> io::Result<()> {
        let seq = self.next_seq();
        self.send(&verdict_message(self.queue_num, seq, id, verdict))
    }

    /// Detach from the queue; the kernel drops what is still queued.
    pub fn unbind(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.configure(NFQA_CFG_CMD, &config_command(NFQNL_CFG_CMD_UNBIND))?;
        debug!(queue = self.queue_num, "NFQUEUE unbound");
        Ok(())
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, message: &[u8]) -> io::Result<()> {
        socket::sendto(
            self.fd.as_raw_fd(),
            message,
            &NetlinkAddr::new(0, 0),
            MsgFlags::empty(),
        )?;
        Ok(())
    }

    /// Send one config attribute and wait for its acknowledgement.
    fn configure(&mut self, kind: u16, value: &[u8]) -> io::Result<()> {
        let seq = self.next_seq();
        self.send(&config_message(self.queue_num, seq, kind, value))?;
        loop {
            for (status_seq, code) in self.read(MsgFlags::empty())? {
                if status_seq != seq {
                    continue;
                }
                if code == 0 {
                    return Ok(());
                }
                return Err(io::Error::from_raw_os_error(-code));
            }
        }
    }

    /// Read one datagram: packets go to `pending`, statuses are returned.
    fn read(&mut self, flags: MsgFlags) -> io::Result<Vec<(u32, i32)>> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let n = socket::recv(self.fd.as_raw_fd(), &mut buf, flags)?;
        let mut statuses = Vec::new();
        for incoming in parse_datagram(&buf[..n])? {
            match incoming {
                Incoming::Packet(packet) => self.pending.push_back(packet),
                Incoming::Status { seq, code } => statuses.push((seq, code)),
                Incoming::Other => {}
            }
        }
        Ok(statuses)
    }
}

impl AsFd for DiversionQueue {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Netlink message under construction.
struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(kind: u16, flags: u16, seq: u32, queue_num: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&((NFNL_SUBSYS_QUEUE << 8) | kind).to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        // nfgenmsg: AF_UNSPEC, NFNETLINK_V0, queue number
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&queue_num.to_be_bytes());
        MessageBuilder { buf }
    }

    fn attr(mut self, kind: u16, value: &[u8]) -> Self {
        let len = (NLA_HDR_LEN + value.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self.buf.resize(align(self.buf.len()), 0);
        self
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// `nfqnl_msg_config_cmd` for every protocol family.
fn config_command(command: u8) -> [u8; 4] {
    [command, 0, 0, 0]
}

/// `nfqnl_msg_config_params`: copy whole packets up to `range` bytes.
fn copy_params(range: u32) -> [u8; 5] {
    let r = range.to_be_bytes();
    [r[0], r[1], r[2], r[3], NFQNL_COPY_PACKET]
}

fn config_message(queue_num: u16, seq: u32, kind: u16, value: &[u8]) -> Vec<u8> {
    MessageBuilder::new(NFQNL_MSG_CONFIG, NLM_F_REQUEST | NLM_F_ACK, seq, queue_num)
        .attr(kind, value)
        .finish()
}

fn verdict_message(queue_num: u16, seq: u32, id: u32, verdict: Verdict) -> Vec<u8> {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&(verdict as u32).to_be_bytes());
    header[4..].copy_from_slice(&id.to_be_bytes());
    MessageBuilder::new(NFQNL_MSG_VERDICT, NLM_F_REQUEST, seq, queue_num)
        .attr(NFQA_VERDICT_HDR, &header)
        .finish()
}

fn malformed(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed netlink message: {what}"))
}

fn parse_datagram(buf: &[u8]) -> io::Result<Vec<Incoming>> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while buf.len() - offset >= NLMSG_HDR_LEN {
        let header = &buf[offset..];
        let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len < NLMSG_HDR_LEN || len > header.len() {
            return Err(malformed("length"));
        }
        let kind = u16::from_ne_bytes([header[4], header[5]]);
        let seq = u32::from_ne_bytes([header[8], header[9], header[10], header[11]]);
        let body = &header[NLMSG_HDR_LEN..len];

        messages.push(if kind == NLMSG_ERROR {
            let code = body.get(..4).ok_or_else(|| malformed("error code"))?;
            Incoming::Status {
                seq,
                code: i32::from_ne_bytes([code[0], code[1], code[2], code[3]]),
            }
        } else if kind == (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET {
            let attrs = body.get(NFGEN_HDR_LEN..).ok_or_else(|| malformed("nfgenmsg"))?;
            parse_packet(attrs)?.map_or(Incoming::Other, Incoming::Packet)
        } else {
            Incoming::Other
        });
        offset += align(len).min(header.len());
    }
    Ok(messages)
}

/// Packet attributes; `None` without a packet header.
fn parse_packet(mut attrs: &[u8]) -> io::Result<Option<QueuedPacket>> {
    let mut id = None;
    let mut hw_addr = None;
    let mut payload = Vec::new();

    while attrs.len() >= NLA_HDR_LEN {
        let len = u16::from_ne_bytes([attrs[0], attrs[1]]) as usize;
        let kind = u16::from_ne_bytes([attrs[2], attrs[3]]) & NLA_TYPE_MASK;
        if len < NLA_HDR_LEN || len > attrs.len() {
            return Err(malformed("attribute length"));
        }
        let value = &attrs[NLA_HDR_LEN..len];
        match kind {
            NFQA_PACKET_HDR if value.len() >= 4 => {
                id = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            NFQA_HWADDR if value.len() >= 10 => {
                let addr_len = u16::from_be_bytes([value[0], value[1]]);
                if addr_len >= 6 {
                    hw_addr = Some(EthernetAddress::from_bytes(&value[4..10]));
                }
            }
            NFQA_PAYLOAD => payload = value.to_vec(),
            _ => {}
        }
        attrs = &attrs[align(len).min(attrs.len())..];
    }

    Ok(id.map(|id| QueuedPacket {
        id,
        hw_addr,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_message(id: u32, hw_addr: Option<[u8; 6]>, payload: &[u8]) -> Vec<u8> {
        // nfqnl_msg_packet_hdr: id, hw_protocol (IPv4), hook (FORWARD)
        let mut header = id.to_be_bytes().to_vec();
        header.extend_from_slice(&[0x08, 0x00, 2]);
        let mut message = MessageBuilder::new(NFQNL_MSG_PACKET, 0, 0, 43)
            .attr(NFQA_PACKET_HDR, &header);
        if let Some(mac) = hw_addr {
            let mut value = vec![0, 6, 0, 0];
            value.extend_from_slice(&mac);
            value.extend_from_slice(&[0, 0]);
            message = message.attr(NFQA_HWADDR, &value);
        }
        message.attr(NFQA_PAYLOAD, payload).finish()
    }

    fn status_message(seq: u32, code: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&36u32.to_ne_bytes());
        buf.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&code.to_ne_bytes());
        // Echoed request header
        buf.extend_from_slice(&[0u8; 16]);
        buf
    }

    #[test]
    fn test_verdict_message() {
        let message = verdict_message(43, 7, 0x0102_0304, Verdict::Drop);
        assert_eq!(message.len(), NLMSG_HDR_LEN + NFGEN_HDR_LEN + NLA_HDR_LEN + 8);
        assert_eq!(u32::from_ne_bytes(message[..4].try_into().unwrap()), message.len() as u32);
        assert_eq!(u16::from_ne_bytes([message[4], message[5]]), 0x0301);
        assert_eq!(u16::from_ne_bytes([message[6], message[7]]), NLM_F_REQUEST);
        assert_eq!(u32::from_ne_bytes(message[8..12].try_into().unwrap()), 7);
        // Queue number in network order
        assert_eq!(&message[18..20], &[0, 43]);
        assert_eq!(u16::from_ne_bytes([message[22], message[23]]), NFQA_VERDICT_HDR);
        assert_eq!(&message[24..], &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_config_message_is_padded() {
        let message = config_message(43, 1, NFQA_CFG_PARAMS, &copy_params(COPY_RANGE));
        // 5-byte params padded to 8
        assert_eq!(message.len(), NLMSG_HDR_LEN + NFGEN_HDR_LEN + NLA_HDR_LEN + 8);
        assert_eq!(u16::from_ne_bytes([message[4], message[5]]), 0x0302);
        assert_eq!(
            u16::from_ne_bytes([message[6], message[7]]),
            NLM_F_REQUEST | NLM_F_ACK
        );
        assert_eq!(u16::from_ne_bytes([message[20], message[21]]), 9);
        assert_eq!(&message[24..29], &[0, 0, 0xff, 0xff, NFQNL_COPY_PACKET]);
    }

    #[test]
    fn test_parse_packet_message() {
        let mac = [0x02, 0, 0, 0, 0, 0x07];
        let parsed = parse_datagram(&packet_message(9, Some(mac), &[0x45, 0, 0, 20])).unwrap();
        assert_eq!(
            parsed,
            vec![Incoming::Packet(QueuedPacket {
                id: 9,
                hw_addr: Some(EthernetAddress(mac)),
                payload: vec![0x45, 0, 0, 20],
            })]
        );
    }

    #[test]
    fn test_parse_batched_datagram() {
        let mut datagram = packet_message(1, None, &[0x45, 1, 2]);
        datagram.extend(packet_message(2, None, &[0x45]));
        datagram.extend(status_message(5, 0));

        let parsed = parse_datagram(&datagram).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(matches!(&parsed[0], Incoming::Packet(p) if p.id == 1 && p.payload == [0x45, 1, 2]));
        assert!(matches!(&parsed[1], Incoming::Packet(p) if p.id == 2 && p.hw_addr.is_none()));
        assert_eq!(parsed[2], Incoming::Status { seq: 5, code: 0 });
    }

    #[test]
    fn test_parse_error_status() {
        let parsed = parse_datagram(&status_message(3, -(Errno::EPERM as i32))).unwrap();
        assert_eq!(
            parsed,
            vec![Incoming::Status {
                seq: 3,
                code: -(Errno::EPERM as i32)
            }]
        );
    }

    #[test]
    fn test_parse_rejects_bad_lengths() {
        let mut datagram = packet_message(1, None, &[0x45]);
        datagram[..4].copy_from_slice(&1000u32.to_ne_bytes());
        assert!(parse_datagram(&datagram).is_err());

        // Attribute overrunning its message
        let mut datagram = packet_message(1, None, &[0x45]);
        let first_attr = NLMSG_HDR_LEN + NFGEN_HDR_LEN;
        datagram[first_attr..first_attr + 2].copy_from_slice(&500u16.to_ne_bytes());
        assert!(parse_datagram(&datagram).is_err());
    }

    #[test]
    fn test_packet_without_header_is_ignored() {
        let message = MessageBuilder::new(NFQNL_MSG_PACKET, 0, 0, 43)
            .attr(NFQA_PAYLOAD, &[0x45])
            .finish();
        assert_eq!(parse_datagram(&message).unwrap(), vec![Incoming::Other]);
    }
}
