//! Internal work items for the ARP handler.
//!
//! Timers, the next-hop layer and the path-preference subsystem talk to the
//! handler exclusively through these events. Events only carry keys and
//! interface references; the handler re-resolves the live entry (if any)
//! when it processes them.

use ipnet::Ipv4Net;
use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;

use crate::entry::ResolutionKey;
use crate::oper::{InterfaceRef, VrfId};

/// Request to probe the addresses of an (allowed-address-pair) prefix on a
/// VM interface.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// VM interface to probe on.
    pub interface: InterfaceRef,
    /// VRF the probes are sent in.
    pub vrf: VrfId,
    /// Address block; a /32 probes a single address.
    pub prefix: Ipv4Net,
    /// MAC learned for the block, used as unicast destination.
    pub mac: Option<EthernetAddress>,
    /// Probe only this address instead of enumerating the block.
    pub target: Option<Ipv4Addr>,
}

/// An internal ARP event.
#[derive(Debug, Clone)]
pub enum ArpEvent {
    /// Resolve `key` on `interface` (next-hop installed).
    Resolve {
        key: ResolutionKey,
        interface: InterfaceRef,
    },
    /// Announce a locally owned address on `interface`.
    SendGratuitous {
        key: ResolutionKey,
        interface: InterfaceRef,
    },
    /// Backing next-hop removed.
    Delete { key: ResolutionKey },
    /// Retry timer of the entry for `key` fired.
    RetryExpired { key: ResolutionKey },
    /// Aging timer of the entry for `key` fired.
    AgingExpired { key: ResolutionKey },
    /// Gratuitous timer of the entry for `key` on `interface_id` fired.
    ///
    /// Carries the interface index only; a pending timer must not keep the
    /// interface alive.
    GratuitousExpired {
        key: ResolutionKey,
        interface_id: u32,
    },
    /// VRF torn down; all its entries go with it.
    VrfDeleted { vrf: VrfId },
    /// Probe an address block.
    Probe(ProbeRequest),
}

impl ArpEvent {
    /// Address used to pick the worker partition, so that every event for a
    /// given key is processed by the same worker.
    pub fn partition_addr(&self) -> Option<Ipv4Addr> {
        match self {
            ArpEvent::Resolve { key, .. }
            | ArpEvent::SendGratuitous { key, .. }
            | ArpEvent::Delete { key }
            | ArpEvent::RetryExpired { key }
            | ArpEvent::AgingExpired { key }
            | ArpEvent::GratuitousExpired { key, .. } => Some(key.ip),
            ArpEvent::Probe(probe) => Some(probe.target.unwrap_or(probe.prefix.addr())),
            ArpEvent::VrfDeleted { .. } => None,
        }
    }

    /// Short name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            ArpEvent::Resolve { .. } => "resolve",
            ArpEvent::SendGratuitous { .. } => "send-gratuitous",
            ArpEvent::Delete { .. } => "delete",
            ArpEvent::RetryExpired { .. } => "retry-expired",
            ArpEvent::AgingExpired { .. } => "aging-expired",
            ArpEvent::GratuitousExpired { .. } => "gratuitous-expired",
            ArpEvent::VrfDeleted { .. } => "vrf-deleted",
            ArpEvent::Probe(_) => "probe",
        }
    }
}
