//! ARP and Ethernet II framing.
//!
//! Parsing is strict about the fixed ARP header fields (Ethernet hardware,
//! IPv4 protocol, 6/4 address lengths) so that everything past this module can
//! work with plain `Ipv4Addr` / `EthernetAddress` values. Building always
//! produces the fixed 28-byte Ethernet/IPv4 ARP body.

use smoltcp::wire::{
    ArpHardware, ArpOperation, ArpPacket, EthernetAddress, EthernetFrame, EthernetProtocol,
    Ipv4Packet,
};
use std::net::Ipv4Addr;

use crate::error::ParseError;

/// Ethernet header size
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// ARP packet size (for Ethernet + IPv4)
pub const ARP_PACKET_SIZE: usize = 28;

/// Size of a complete ARP frame on the wire.
pub const ARP_FRAME_SIZE: usize = ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE;

/// All-zero MAC used as the target hardware address of requests.
pub const ZERO_MAC: EthernetAddress = EthernetAddress([0; 6]);

const ETHERNET_ADDR_LEN: u8 = 6;
const IPV4_ADDR_LEN: u8 = 4;

/// Offset of the destination address in an IPv4 header.
const IPV4_DST_OFFSET: usize = 16;

/// A validated Ethernet/IPv4 ARP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpMessage {
    pub operation: ArpOperation,
    pub sender_mac: EthernetAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: EthernetAddress,
    pub target_ip: Ipv4Addr,
}

impl ArpMessage {
    /// Address whose binding this message is about.
    ///
    /// Requests ask for the target; replies (and anything else) announce the
    /// sender's own binding.
    pub fn resolution_target(&self) -> Ipv4Addr {
        match self.operation {
            ArpOperation::Request => self.target_ip,
            _ => self.sender_ip,
        }
    }

    /// Sender announces its own address (or has none yet).
    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip || self.sender_ip.is_unspecified()
    }
}

/// Classified inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame {
    /// A genuine ARP frame.
    Arp(ArpMessage),
    /// An IPv4 packet trapped because its destination needs resolution.
    Ipv4 { destination: Ipv4Addr },
}

impl InboundFrame {
    /// Address the handler will resolve for this frame.
    pub fn resolution_target(&self) -> Ipv4Addr {
        match self {
            InboundFrame::Arp(msg) => msg.resolution_target(),
            InboundFrame::Ipv4 { destination } => *destination,
        }
    }
}

/// Parse an Ethernet II frame and classify its payload.
pub fn parse_frame(data: &[u8]) -> Result<InboundFrame, ParseError> {
    let frame = EthernetFrame::new_checked(data).map_err(|_| ParseError::Truncated {
        needed: ETHERNET_HEADER_SIZE,
        got: data.len(),
    })?;

    match frame.ethertype() {
        EthernetProtocol::Arp => parse_arp(frame.payload()).map(InboundFrame::Arp),
        EthernetProtocol::Ipv4 => parse_ipv4_destination(frame.payload())
            .map(|destination| InboundFrame::Ipv4 { destination }),
        other => Err(ParseError::UnsupportedEtherType(u16::from(other))),
    }
}

/// Parse an ARP body (the Ethernet payload).
pub fn parse_arp(data: &[u8]) -> Result<ArpMessage, ParseError> {
    let packet = ArpPacket::new_checked(data).map_err(|_| ParseError::Truncated {
        needed: ARP_PACKET_SIZE,
        got: data.len(),
    })?;

    if packet.hardware_type() != ArpHardware::Ethernet {
        return Err(ParseError::UnsupportedHardware(u16::from(
            packet.hardware_type(),
        )));
    }
    if packet.protocol_type() != EthernetProtocol::Ipv4 {
        return Err(ParseError::UnsupportedProtocol(u16::from(
            packet.protocol_type(),
        )));
    }
    if packet.hardware_len() != ETHERNET_ADDR_LEN {
        return Err(ParseError::HardwareLength(packet.hardware_len()));
    }
    if packet.protocol_len() != IPV4_ADDR_LEN {
        return Err(ParseError::ProtocolLength(packet.protocol_len()));
    }

    Ok(ArpMessage {
        operation: packet.operation(),
        sender_mac: mac_from_slice(packet.source_hardware_addr())?,
        sender_ip: ipv4_from_slice(packet.source_protocol_addr())?,
        target_mac: mac_from_slice(packet.target_hardware_addr())?,
        target_ip: ipv4_from_slice(packet.target_protocol_addr())?,
    })
}

fn parse_ipv4_destination(data: &[u8]) -> Result<Ipv4Addr, ParseError> {
    let packet = Ipv4Packet::new_checked(data).map_err(|_| ParseError::MalformedIpv4)?;
    if packet.version() != 4 {
        return Err(ParseError::MalformedIpv4);
    }
    ipv4_from_slice(&data[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4])
}

fn mac_from_slice(bytes: &[u8]) -> Result<EthernetAddress, ParseError> {
    let octets: [u8; 6] = bytes
        .try_into()
        .map_err(|_| ParseError::HardwareLength(bytes.len() as u8))?;
    Ok(EthernetAddress(octets))
}

fn ipv4_from_slice(bytes: &[u8]) -> Result<Ipv4Addr, ParseError> {
    let octets: [u8; 4] = bytes
        .try_into()
        .map_err(|_| ParseError::ProtocolLength(bytes.len() as u8))?;
    Ok(Ipv4Addr::from(octets))
}

/// Build an ARP body.
pub fn build_arp(
    operation: ArpOperation,
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ARP_PACKET_SIZE];
    emit_arp(
        &mut buffer,
        operation,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    );
    buffer
}

/// Build a complete ARP Ethernet frame sourced from `sender_mac`.
pub fn build_arp_frame(
    dst_mac: EthernetAddress,
    operation: ArpOperation,
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ARP_FRAME_SIZE];

    let mut frame = EthernetFrame::new_unchecked(&mut buffer[..]);
    frame.set_dst_addr(dst_mac);
    frame.set_src_addr(sender_mac);
    frame.set_ethertype(EthernetProtocol::Arp);

    emit_arp(
        frame.payload_mut(),
        operation,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    );
    buffer
}

fn emit_arp(
    buffer: &mut [u8],
    operation: ArpOperation,
    sender_mac: EthernetAddress,
    sender_ip: Ipv4Addr,
    target_mac: EthernetAddress,
    target_ip: Ipv4Addr,
) {
    let mut packet = ArpPacket::new_unchecked(buffer);
    packet.set_hardware_type(ArpHardware::Ethernet);
    packet.set_protocol_type(EthernetProtocol::Ipv4);
    packet.set_hardware_len(ETHERNET_ADDR_LEN);
    packet.set_protocol_len(IPV4_ADDR_LEN);
    packet.set_operation(operation);
    packet.set_source_hardware_addr(sender_mac.as_bytes());
    packet.set_source_protocol_addr(&sender_ip.octets());
    packet.set_target_hardware_addr(target_mac.as_bytes());
    packet.set_target_protocol_addr(&target_ip.octets());
}
