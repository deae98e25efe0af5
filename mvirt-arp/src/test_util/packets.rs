//! Inbound frame builders for tests.

use smoltcp::wire::{ArpOperation, EthernetAddress, Ipv4Packet};
use std::net::Ipv4Addr;

use crate::wire::{ETHERNET_HEADER_SIZE, ZERO_MAC, build_arp_frame};

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// Broadcast ARP request from `sender` asking for `target_ip`.
pub fn create_arp_request(
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    build_arp_frame(
        EthernetAddress::BROADCAST,
        ArpOperation::Request,
        sender_mac,
        sender_ip,
        ZERO_MAC,
        target_ip,
    )
}

/// Unicast ARP reply announcing `sender_ip` is at `sender_mac`.
pub fn create_arp_reply(
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    build_arp_frame(
        target_mac,
        ArpOperation::Reply,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    )
}

/// Gratuitous request announcing `ip` is at `mac`.
pub fn create_gratuitous_arp(mac: EthernetAddress, ip: Ipv4Addr) -> Vec<u8> {
    build_arp_frame(
        EthernetAddress::BROADCAST,
        ArpOperation::Request,
        mac,
        ip,
        ZERO_MAC,
        ip,
    )
}

/// ARP frame with an arbitrary operation code.
pub fn create_arp_with_operation(
    code: u16,
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    build_arp_frame(
        EthernetAddress::BROADCAST,
        ArpOperation::from(code),
        sender_mac,
        sender_ip,
        ZERO_MAC,
        target_ip,
    )
}

/// Minimal IPv4 packet (header only) from `src` to `dst`, as trapped for
/// resolution of `dst`.
pub fn create_ipv4_packet(src_mac: EthernetAddress, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + IP_HDR_SIZE];
    frame[0..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(src_mac.as_bytes());
    frame[12..14].copy_from_slice(&[0x08, 0x00]);

    let ip = &mut frame[ETHERNET_HEADER_SIZE..];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(IP_HDR_SIZE as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    Ipv4Packet::new_unchecked(ip).fill_checksum();
    frame
}
