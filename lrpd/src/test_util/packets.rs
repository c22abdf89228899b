//! Packet builders for diverted-packet tests.

use smoltcp::wire::{IpProtocol, Ipv4Packet, UdpPacket};
use std::net::Ipv4Addr;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// Create an IPv4/UDP packet as the diversion queue hands it over
/// (network header first, no link-layer header).
pub fn create_udp_packet(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IP_HDR_SIZE + UDP_HDR_SIZE + payload.len();
    let mut buf = vec![0u8; total_len];

    let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.set_version(4);
    ip.set_header_len(IP_HDR_SIZE as u8);
    ip.set_total_len(total_len as u16);
    ip.set_hop_limit(64);
    ip.set_next_header(IpProtocol::Udp);
    ip.set_src_addr(source);
    ip.set_dst_addr(destination);
    ip.fill_checksum();

    let mut udp = UdpPacket::new_unchecked(&mut buf[IP_HDR_SIZE..]);
    udp.set_src_port(40000);
    udp.set_dst_port(dst_port);
    udp.set_len((UDP_HDR_SIZE + payload.len()) as u16);
    udp.payload_mut().copy_from_slice(payload);

    buf
}

/// Create an IPv6-looking payload the queue may hand over on a dual-stack host.
pub fn create_ipv6_stub() -> Vec<u8> {
    let mut buf = vec![0u8; 40];
    buf[0] = 0x60;
    buf
}
