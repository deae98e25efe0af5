//! Error types for the ARP control plane.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::entry::ResolutionKey;

/// Wire-format errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unsupported ARP hardware type {0:#06x}")]
    UnsupportedHardware(u16),

    #[error("unsupported ARP protocol type {0:#06x}")]
    UnsupportedProtocol(u16),

    #[error("invalid hardware address length {0}")]
    HardwareLength(u8),

    #[error("invalid protocol address length {0}")]
    ProtocolLength(u8),

    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),

    #[error("malformed IPv4 header")]
    MalformedIpv4,
}

/// Errors raised while classifying or applying ARP work.
///
/// None of these are fatal: the handler records them in the statistics and
/// reports the unit of work as handled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArpError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] ParseError),

    #[error("IP fabric interface not installed")]
    FabricNotInstalled,

    #[error("invalid or inactive interface {0}")]
    InvalidInterface(u32),

    #[error("invalid or inactive VRF {0}")]
    InvalidVrf(u32),

    #[error("interface {0} has no active VRF")]
    InterfaceWithoutVrf(u32),

    #[error("invalid address {0}")]
    InvalidAddress(Ipv4Addr),

    #[error("packet addressed to own router address {0}")]
    OwnAddress(Ipv4Addr),

    #[error("invalid ARP command {0}")]
    InvalidCommand(u16),

    #[error("entry already exists for {0}")]
    DuplicateKey(ResolutionKey),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors of the ARP worker service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("ARP service stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ArpError>;
