//! ARP protocol handler.
//!
//! One [`ArpHandler`] call processes one unit of work: an inbound frame
//! trapped to the agent or an internal [`ArpEvent`]. The handler holds no
//! state of its own; everything lives in the [`ArpContext`].
//!
//! Both entry points return `true` when the work was fully handled and
//! `false` when it resulted in a new entry that keeps resolving on its own.

use ipnet::Ipv4Net;
use smoltcp::wire::{ArpOperation, EthernetAddress};
use std::net::Ipv4Addr;
use tracing::{debug, trace, warn};

use crate::config::MAX_V4_PREFIX_LEN;
use crate::context::ArpContext;
use crate::entry::{ArpEntry, ResolutionKey};
use crate::error::{ArpError, Result};
use crate::event::{ArpEvent, ProbeRequest};
use crate::oper::{InterfaceRef, NextHop, VrfId, VrfRef};
use crate::registry::{EntryRef, lock};
use crate::wire::{self, InboundFrame, ZERO_MAC};

/// Prefix length reported with traffic-seen notifications. The
/// path-preference module does its own LPM to find the real one.
const TRAFFIC_SEEN_PREFIX_LEN: u8 = 32;

/// Classified operation of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpCommand {
    Request,
    Reply {
        sender_ip: Ipv4Addr,
        sender_mac: EthernetAddress,
    },
    Gratuitous {
        sender_ip: Ipv4Addr,
        sender_mac: EthernetAddress,
    },
    Unknown(u16),
}

impl ArpCommand {
    /// Classify a frame. Gratuitous announcements take precedence over the
    /// operation code.
    pub fn classify(frame: &InboundFrame) -> Self {
        match frame {
            InboundFrame::Ipv4 { .. } => ArpCommand::Request,
            InboundFrame::Arp(msg) if msg.is_gratuitous() => ArpCommand::Gratuitous {
                sender_ip: msg.sender_ip,
                sender_mac: msg.sender_mac,
            },
            InboundFrame::Arp(msg) => match msg.operation {
                ArpOperation::Request => ArpCommand::Request,
                ArpOperation::Reply => ArpCommand::Reply {
                    sender_ip: msg.sender_ip,
                    sender_mac: msg.sender_mac,
                },
                ArpOperation::Unknown(code) => ArpCommand::Unknown(code),
            },
        }
    }
}

/// Validated context of an inbound frame.
struct Resolution {
    key: ResolutionKey,
    /// Interface the resolution runs on, after next-hop redirection.
    interface: InterfaceRef,
    nh_vrf: VrfRef,
}

/// Stateless processor for packets and internal events.
pub struct ArpHandler<'a> {
    ctx: &'a ArpContext,
}

impl<'a> ArpHandler<'a> {
    pub fn new(ctx: &'a ArpContext) -> Self {
        ArpHandler { ctx }
    }

    /// Process a frame received on `ingress_interface` in `ingress_vrf`.
    pub fn handle_packet(&self, data: &[u8], ingress_interface: u32, ingress_vrf: VrfId) -> bool {
        match self.process_packet(data, ingress_interface, ingress_vrf) {
            Ok(handled) => handled,
            Err(error) => {
                self.record(&error, ingress_interface);
                true
            }
        }
    }

    /// Process an internal event.
    pub fn handle_internal_event(&self, event: ArpEvent) -> bool {
        if self.ctx.ip_fabric_interface().is_none() {
            self.ctx.stats().record_error(&ArpError::FabricNotInstalled);
            return true;
        }
        trace!(event = event.name(), "Handling ARP event");

        match event {
            ArpEvent::Resolve { key, interface } => self.resolve(key, interface),
            ArpEvent::SendGratuitous { key, interface } => self.send_gratuitous(key, interface),
            ArpEvent::Delete { key } => {
                self.ctx.registry().delete_key(&key);
                true
            }
            ArpEvent::RetryExpired { key } => {
                if let Some(entry) = self.ctx.registry().find(&key) {
                    let alive = lock(&entry).retry_expiry(self.ctx);
                    if !alive {
                        self.retire(&entry, key);
                    }
                }
                true
            }
            ArpEvent::AgingExpired { key } => {
                if let Some(entry) = self.ctx.registry().find(&key) {
                    let alive = lock(&entry).aging_expiry(self.ctx);
                    if !alive {
                        self.retire(&entry, key);
                    }
                }
                true
            }
            ArpEvent::GratuitousExpired { key, interface_id } => {
                self.gratuitous_expired(key, interface_id);
                true
            }
            ArpEvent::VrfDeleted { vrf } => {
                let removed = self.ctx.registry().purge_vrf(vrf);
                debug!(vrf = %vrf, removed, "Purged ARP entries of deleted VRF");
                true
            }
            ArpEvent::Probe(probe) => {
                self.send_arp_request_by_plen(&probe);
                true
            }
        }
    }

    /// Probe the addresses of `probe.prefix` on its VM interface.
    ///
    /// Returns the number of requests sent.
    pub fn send_arp_request_by_plen(&self, probe: &ProbeRequest) -> usize {
        let interface = &probe.interface;
        let config = self.ctx.config();
        let sender_ip = interface.service_ip().unwrap_or(config.router_id);
        let dst_mac = if interface.is_aap_prefix(&probe.prefix) {
            EthernetAddress::BROADCAST
        } else {
            probe
                .mac
                .filter(|mac| *mac != ZERO_MAC)
                .unwrap_or_else(|| interface.vm_mac())
        };

        let mut sent = 0;
        for target in probe_targets(
            probe.prefix,
            probe.target,
            config.max_arp_probe_addresses(),
        ) {
            self.ctx.send_arp(
                interface,
                probe.vrf,
                dst_mac,
                ArpOperation::Request,
                sender_ip,
                ZERO_MAC,
                target,
            );
            self.ctx.stats().inc_vm_arp_requests();
            sent += 1;
        }
        debug!(
            interface = interface.name(),
            prefix = %probe.prefix,
            count = sent,
            "Sent ARP probes"
        );
        sent
    }

    fn process_packet(
        &self,
        data: &[u8],
        ingress_interface: u32,
        ingress_vrf: VrfId,
    ) -> Result<bool> {
        if self.ctx.ip_fabric_interface().is_none() {
            return Err(ArpError::FabricNotInstalled);
        }

        let frame = wire::parse_frame(data)?;
        let target = frame.resolution_target();
        if target == self.ctx.config().router_id {
            return Err(ArpError::OwnAddress(target));
        }
        let command = ArpCommand::classify(&frame);

        let resolution = self.resolve_context(target, ingress_interface, ingress_vrf)?;
        self.dispatch(command, resolution)
    }

    /// Validate the ingress context and find where `target` resolves.
    fn resolve_context(
        &self,
        target: Ipv4Addr,
        ingress_interface: u32,
        ingress_vrf: VrfId,
    ) -> Result<Resolution> {
        let mut interface = self
            .ctx
            .interfaces()
            .find_by_index(ingress_interface)
            .filter(|itf| itf.is_active())
            .ok_or(ArpError::InvalidInterface(ingress_interface))?;
        let vrf = self
            .ctx
            .vrfs()
            .find_by_id(ingress_vrf)
            .filter(|vrf| vrf.is_active())
            .ok_or(ArpError::InvalidVrf(ingress_vrf.0))?;
        let mut nh_vrf = interface
            .vrf()
            .filter(|vrf| vrf.is_active())
            .ok_or(ArpError::InterfaceWithoutVrf(ingress_interface))?;

        if target.is_broadcast() || target.is_unspecified() {
            return Err(ArpError::InvalidAddress(target));
        }

        let routes = vrf.route_table();
        if let Some(route) = routes.longest_prefix_match(target) {
            if route.is_multicast() {
                return Err(ArpError::InvalidAddress(target));
            }
            if let NextHop::Resolve { interface_id } = *route.active_next_hop() {
                interface = self
                    .ctx
                    .interfaces()
                    .find_by_index(interface_id)
                    .ok_or(ArpError::InvalidInterface(interface_id))?;
                nh_vrf = interface
                    .vrf()
                    .filter(|vrf| vrf.is_active())
                    .ok_or(ArpError::InterfaceWithoutVrf(interface_id))?;
            }
        }

        if let Some(forwarding) = nh_vrf.forwarding_vrf() {
            nh_vrf = forwarding;
        }

        Ok(Resolution {
            key: ResolutionKey::new(target, vrf.id()),
            interface,
            nh_vrf,
        })
    }

    fn dispatch(&self, command: ArpCommand, resolution: Resolution) -> Result<bool> {
        let Resolution {
            key,
            interface,
            nh_vrf,
        } = resolution;
        let stats = self.ctx.stats();

        match command {
            ArpCommand::Request => {
                stats.inc_arp_requests();
                stats.record_request(interface.id());
                let (entry, created) = match self.find_or_add(key, nh_vrf, &interface) {
                    Some(found) => found,
                    None => return Ok(true),
                };
                self.request_transition(&entry, key);
                Ok(!created)
            }
            ArpCommand::Reply {
                sender_ip,
                sender_mac,
            } => {
                stats.inc_arp_replies();
                stats.record_reply(interface.id());
                self.traffic_seen(&interface, sender_ip, key.vrf, sender_mac);
                let (entry, created) = match self.find_or_add(key, nh_vrf, &interface) {
                    Some(found) => found,
                    None => return Ok(true),
                };
                lock(&entry).handle_arp_reply(sender_mac, self.ctx);
                Ok(!created)
            }
            ArpCommand::Gratuitous {
                sender_ip,
                sender_mac,
            } => {
                stats.inc_gratuitous();
                self.traffic_seen(&interface, sender_ip, key.vrf, sender_mac);
                if let Some(entry) = self.ctx.registry().find(&key) {
                    lock(&entry).handle_arp_reply(sender_mac, self.ctx);
                }
                Ok(true)
            }
            ArpCommand::Unknown(code) => Err(ArpError::InvalidCommand(code)),
        }
    }

    fn resolve(&self, key: ResolutionKey, interface: InterfaceRef) -> bool {
        let Some(vrf) = self.ctx.vrfs().find_by_id(key.vrf) else {
            self.record(&ArpError::InvalidVrf(key.vrf.0), interface.id());
            return true;
        };
        let stats = self.ctx.stats();
        stats.inc_arp_requests();
        stats.record_request(interface.id());

        let Some((entry, created)) = self.find_or_add(key, vrf, &interface) else {
            return true;
        };
        self.request_transition(&entry, key);
        !created
    }

    fn send_gratuitous(&self, key: ResolutionKey, interface: InterfaceRef) -> bool {
        if interface.is_deleted() {
            return true;
        }
        let Some(vrf) = self.ctx.vrfs().find_by_id(key.vrf) else {
            self.record(&ArpError::InvalidVrf(key.vrf.0), interface.id());
            return true;
        };

        let registry = self.ctx.registry();
        let (entry, created) = match registry.gratuitous_find_for_key(&key, interface.id()) {
            Some(entry) => (entry, false),
            None => match registry.add_gratuitous(ArpEntry::new_gratuitous(key, vrf, &interface)) {
                Ok(entry) => (entry, true),
                Err(error) => {
                    self.record(&error, interface.id());
                    return true;
                }
            },
        };
        lock(&entry).send_gratuitous_arp(self.ctx);
        !created
    }

    fn gratuitous_expired(&self, key: ResolutionKey, interface_id: u32) {
        // An interface removed meanwhile takes its announcements with it.
        if self
            .ctx
            .interfaces()
            .find_by_index(interface_id)
            .is_none_or(|itf| itf.is_deleted())
        {
            trace!(key = %key, interface_id, "Gratuitous expiry for removed interface");
            return;
        }
        let Some(entry) = self
            .ctx
            .registry()
            .gratuitous_find_for_key(&key, interface_id)
        else {
            return;
        };

        let retained = {
            let mut guard = lock(&entry);
            guard.gratuitous_expiry(self.ctx)
                || guard.nh_vrf().name() == self.ctx.config().fabric_vrf_name
        };
        if !retained {
            debug!(key = %key, interface_id, "Gratuitous ARP entry retired");
            self.ctx.registry().delete(&entry);
        }
    }

    /// Existing primary entry for `key`, or a newly added initing one.
    ///
    /// A lost creation race falls back to the winner. Returns `None` only if
    /// the winner vanished again in between.
    fn find_or_add(
        &self,
        key: ResolutionKey,
        nh_vrf: VrfRef,
        interface: &InterfaceRef,
    ) -> Option<(EntryRef, bool)> {
        let registry = self.ctx.registry();
        if let Some(entry) = registry.find(&key) {
            return Some((entry, false));
        }
        self.add_or_winner(ArpEntry::new(key, nh_vrf, interface))
    }

    /// Add `entry`, or fall back to the entry that won the creation race.
    fn add_or_winner(&self, entry: ArpEntry) -> Option<(EntryRef, bool)> {
        let key = entry.key();
        let registry = self.ctx.registry();
        match registry.add(entry) {
            Ok(entry) => Some((entry, true)),
            Err(error) => {
                self.ctx.stats().record_error(&error);
                trace!(key = %key, "Lost ARP entry creation race");
                registry.find(&key).map(|entry| (entry, false))
            }
        }
    }

    fn request_transition(&self, entry: &EntryRef, key: ResolutionKey) {
        let alive = lock(entry).handle_arp_request(self.ctx);
        if !alive {
            self.retire(entry, key);
        }
    }

    /// Delete an entry whose resolution ended and tell the next-hop layer.
    fn retire(&self, entry: &EntryRef, key: ResolutionKey) {
        if self.ctx.registry().delete(entry) {
            self.ctx.observer().arp_unresolved(key);
        }
    }

    fn traffic_seen(
        &self,
        interface: &InterfaceRef,
        sender_ip: Ipv4Addr,
        vrf: VrfId,
        sender_mac: EthernetAddress,
    ) {
        if interface.kind().is_end_host() {
            self.ctx.route_preference().notify_traffic_seen(
                sender_ip,
                TRAFFIC_SEEN_PREFIX_LEN,
                interface.id(),
                vrf,
                sender_mac,
            );
        }
    }

    fn record(&self, error: &ArpError, interface: u32) {
        self.ctx.stats().record_error(error);
        match error {
            ArpError::OwnAddress(_) => trace!(interface, "{}", error),
            ArpError::FabricNotInstalled => debug!(interface, "{}", error),
            _ => warn!(interface, "Dropping ARP work: {}", error),
        }
    }
}

/// Addresses to probe for `prefix`, in probe order.
///
/// A full-length prefix probes its own address and an explicit target
/// probes only that address. Otherwise the host addresses of the block are
/// enumerated from base + 1, capped at `max_probes`; a capped block keeps
/// two extra addresses since its base and broadcast lie outside the cap.
pub fn probe_targets(
    prefix: Ipv4Net,
    target: Option<Ipv4Addr>,
    max_probes: u64,
) -> impl Iterator<Item = Ipv4Addr> {
    let (base, offsets) = if prefix.prefix_len() == MAX_V4_PREFIX_LEN {
        (u32::from(prefix.addr()), 0..1)
    } else if let Some(target) = target.filter(|t| !t.is_unspecified()) {
        (u32::from(target), 0..1)
    } else {
        let mut count = 1u64 << (MAX_V4_PREFIX_LEN - prefix.prefix_len());
        if count > max_probes {
            count = max_probes + 2;
        }
        (u32::from(prefix.network()), 1..count)
    };
    offsets.map(move |offset| Ipv4Addr::from(base.wrapping_add(offset as u32)))
}
