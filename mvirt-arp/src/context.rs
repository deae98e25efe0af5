//! Dependencies of the ARP handler.
//!
//! Everything the handler and entries touch outside their own state is
//! reached through an [`ArpContext`] built once and shared by all workers.

use smoltcp::wire::{ArpOperation, EthernetAddress};
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

use crate::config::ArpConfig;
use crate::entry::ResolutionKey;
use crate::oper::{Interface, InterfaceTable, VrfId, VrfTable};
use crate::registry::ArpRegistry;
use crate::stats::ArpStats;
use crate::timer::TimerScheduler;
use crate::wire;

/// How the data plane should emit a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Broadcast,
    Unicast,
}

impl TxMode {
    pub fn for_destination(dst: EthernetAddress) -> Self {
        if dst.is_broadcast() {
            TxMode::Broadcast
        } else {
            TxMode::Unicast
        }
    }
}

/// Outbound frame path. Fire and forget.
pub trait PacketTransport: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>, interface_id: u32, vrf: VrfId, mode: TxMode);
}

/// Path-preference subsystem.
pub trait RoutePreference: Send + Sync {
    /// Traffic from `ip`/`mac` was seen on a VM interface.
    fn notify_traffic_seen(
        &self,
        ip: Ipv4Addr,
        prefix_len: u8,
        interface_id: u32,
        vrf: VrfId,
        mac: EthernetAddress,
    );
}

/// Next-hop layer: told when a binding becomes usable or goes away.
pub trait NextHopObserver: Send + Sync {
    fn arp_resolved(&self, key: ResolutionKey, mac: EthernetAddress, interface_id: u32);
    fn arp_unresolved(&self, key: ResolutionKey);
}

/// External services consumed by the handler.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn PacketTransport>,
    pub route_preference: Arc<dyn RoutePreference>,
    pub observer: Arc<dyn NextHopObserver>,
    pub timers: Arc<dyn TimerScheduler>,
}

/// Shared state of the ARP subsystem.
pub struct ArpContext {
    config: ArpConfig,
    interfaces: Arc<InterfaceTable>,
    vrfs: Arc<VrfTable>,
    registry: ArpRegistry,
    stats: ArpStats,
    collaborators: Collaborators,
    ip_fabric_interface: RwLock<Option<u32>>,
}

impl ArpContext {
    pub fn new(
        config: ArpConfig,
        interfaces: Arc<InterfaceTable>,
        vrfs: Arc<VrfTable>,
        collaborators: Collaborators,
    ) -> Self {
        let registry = ArpRegistry::new(
            config.registry_shards,
            Arc::clone(&collaborators.timers),
        );
        ArpContext {
            config,
            interfaces,
            vrfs,
            registry,
            stats: ArpStats::new(),
            collaborators,
            ip_fabric_interface: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ArpConfig {
        &self.config
    }

    pub fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    pub fn vrfs(&self) -> &VrfTable {
        &self.vrfs
    }

    pub fn registry(&self) -> &ArpRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &ArpStats {
        &self.stats
    }

    pub fn timers(&self) -> &dyn TimerScheduler {
        self.collaborators.timers.as_ref()
    }

    pub fn observer(&self) -> &dyn NextHopObserver {
        self.collaborators.observer.as_ref()
    }

    pub fn route_preference(&self) -> &dyn RoutePreference {
        self.collaborators.route_preference.as_ref()
    }

    /// Interface ARP is processed for. Nothing is processed until one is set.
    pub fn ip_fabric_interface(&self) -> Option<u32> {
        *self
            .ip_fabric_interface
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_ip_fabric_interface(&self, interface_id: Option<u32>) {
        *self
            .ip_fabric_interface
            .write()
            .unwrap_or_else(PoisonError::into_inner) = interface_id;
    }

    /// Build an ARP frame sourced from `interface` and hand it to the
    /// transport.
    #[allow(clippy::too_many_arguments)]
    pub fn send_arp(
        &self,
        interface: &Interface,
        vrf: VrfId,
        dst_mac: EthernetAddress,
        operation: ArpOperation,
        sender_ip: Ipv4Addr,
        target_mac: EthernetAddress,
        target_ip: Ipv4Addr,
    ) {
        let frame = wire::build_arp_frame(
            dst_mac,
            operation,
            interface.mac(),
            sender_ip,
            target_mac,
            target_ip,
        );
        trace!(
            interface = interface.name(),
            vrf = %vrf,
            sender = %sender_ip,
            target = %target_ip,
            "Sending ARP"
        );
        self.collaborators.transport.send_frame(
            frame,
            interface.id(),
            vrf,
            TxMode::for_destination(dst_mac),
        );
    }
}
