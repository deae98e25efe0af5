//! ARP resolution entries and their state machine.
//!
//! An entry tracks the resolution of one `(ip, vrf)` key. It never owns the
//! interface it resolves on and never references itself from a timer: all
//! timers post key-carrying events that the handler routes back here.

use smoltcp::wire::{ArpOperation, EthernetAddress};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

use crate::context::ArpContext;
use crate::event::ArpEvent;
use crate::oper::{Interface, InterfaceKind, InterfaceRef, VrfId, VrfRef};
use crate::timer::{TimerScheduler, TimerSlot};
use crate::wire::ZERO_MAC;

/// Identity of a resolution: target address within a VRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResolutionKey {
    pub ip: Ipv4Addr,
    pub vrf: VrfId,
}

impl ResolutionKey {
    pub fn new(ip: Ipv4Addr, vrf: VrfId) -> Self {
        ResolutionKey { ip, vrf }
    }
}

impl fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@vrf{}", self.ip, self.vrf)
    }
}

/// Resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    /// Probing, no MAC known yet.
    Initing,
    /// MAC known and aging.
    Active,
}

/// A single ARP resolution.
#[derive(Debug)]
pub struct ArpEntry {
    key: ResolutionKey,
    /// VRF probes are sent in.
    nh_vrf: VrfRef,
    interface: Weak<Interface>,
    interface_id: u32,
    mac: Option<EthernetAddress>,
    state: ArpState,
    retry_count: u32,
    /// Retry timer while initing, aging timer once active.
    short_timer: TimerSlot,
    /// Gratuitous refresh timer.
    long_timer: TimerSlot,
    gratuitous: bool,
    deleted: bool,
}

impl ArpEntry {
    /// New entry awaiting resolution.
    pub fn new(key: ResolutionKey, nh_vrf: VrfRef, interface: &InterfaceRef) -> Self {
        ArpEntry {
            key,
            nh_vrf,
            interface: Arc::downgrade(interface),
            interface_id: interface.id(),
            mac: None,
            state: ArpState::Initing,
            retry_count: 0,
            short_timer: TimerSlot::default(),
            long_timer: TimerSlot::default(),
            gratuitous: false,
            deleted: false,
        }
    }

    /// Entry announcing a locally owned address on `interface`.
    ///
    /// The binding is known up front: it is the interface's own MAC.
    pub fn new_gratuitous(key: ResolutionKey, nh_vrf: VrfRef, interface: &InterfaceRef) -> Self {
        let mut entry = Self::new(key, nh_vrf, interface);
        entry.mac = Some(interface.mac());
        entry.state = ArpState::Active;
        entry.gratuitous = true;
        entry
    }

    pub fn key(&self) -> ResolutionKey {
        self.key
    }

    pub fn state(&self) -> ArpState {
        self.state
    }

    pub fn mac(&self) -> Option<EthernetAddress> {
        self.mac
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn nh_vrf(&self) -> &VrfRef {
        &self.nh_vrf
    }

    pub fn interface_id(&self) -> u32 {
        self.interface_id
    }

    /// The bound interface, unless it has been dropped.
    pub fn interface(&self) -> Option<InterfaceRef> {
        self.interface.upgrade()
    }

    pub(crate) fn interface_weak(&self) -> Weak<Interface> {
        Weak::clone(&self.interface)
    }

    pub fn is_gratuitous(&self) -> bool {
        self.gratuitous
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Retry or aging timer is armed.
    pub fn short_timer_armed(&self) -> bool {
        self.short_timer.is_armed()
    }

    /// Gratuitous timer is armed.
    pub fn long_timer_armed(&self) -> bool {
        self.long_timer.is_armed()
    }

    /// Cancel both timers.
    pub fn cancel_timers(&mut self, timers: &dyn TimerScheduler) {
        self.short_timer.cancel(timers);
        self.long_timer.cancel(timers);
    }

    /// Detach the entry: cancel its timers and make further transitions
    /// no-ops. Called by the registry on removal.
    pub(crate) fn mark_deleted(&mut self, timers: &dyn TimerScheduler) {
        self.cancel_timers(timers);
        self.deleted = true;
    }

    /// A resolution request for this key.
    ///
    /// Returns `false` when the retry budget is exhausted and the entry
    /// should be deleted.
    pub fn handle_arp_request(&mut self, ctx: &ArpContext) -> bool {
        if self.deleted {
            return true;
        }
        match self.state {
            ArpState::Active => {
                if let Some(mac) = self.mac {
                    ctx.observer().arp_resolved(self.key, mac, self.interface_id);
                }
                true
            }
            ArpState::Initing => {
                self.retry_count += 1;
                if self.retry_count > ctx.config().max_retries {
                    debug!(key = %self.key, retries = self.retry_count, "ARP retries exhausted");
                    return false;
                }
                self.probe(ctx);
                true
            }
        }
    }

    /// A reply (or gratuitous announcement) carrying `mac`.
    pub fn handle_arp_reply(&mut self, mac: EthernetAddress, ctx: &ArpContext) {
        if self.deleted {
            return;
        }
        match self.state {
            ArpState::Initing => {
                debug!(key = %self.key, mac = %mac, "ARP entry resolved");
                self.mac = Some(mac);
                self.state = ArpState::Active;
                self.retry_count = 0;
                ctx.observer().arp_resolved(self.key, mac, self.interface_id);
            }
            ArpState::Active if self.mac != Some(mac) => {
                debug!(key = %self.key, mac = %mac, "ARP entry MAC moved");
                self.mac = Some(mac);
                ctx.observer().arp_resolved(self.key, mac, self.interface_id);
            }
            ArpState::Active => {}
        }
        // Shares the slot with the retry timer, so arming cancels it.
        self.short_timer.arm(
            ctx.timers(),
            ctx.config().aging_timeout(),
            ArpEvent::AgingExpired { key: self.key },
        );
    }

    /// The retry timer fired.
    ///
    /// Returns `false` once the retry budget is spent.
    pub fn retry_expiry(&mut self, ctx: &ArpContext) -> bool {
        if self.deleted || self.state == ArpState::Active {
            return true;
        }
        if !self.short_timer.take_expired(Instant::now()) {
            trace!(key = %self.key, "Stale retry timer");
            return true;
        }
        if self.retry_count >= ctx.config().max_retries {
            debug!(key = %self.key, retries = self.retry_count, "ARP resolution failed");
            return false;
        }
        self.retry_count += 1;
        self.probe(ctx);
        true
    }

    /// The aging timer fired.
    ///
    /// Returns `false` when the binding was not refreshed and has expired.
    pub fn aging_expiry(&mut self, _ctx: &ArpContext) -> bool {
        if self.deleted || self.state != ArpState::Active {
            return true;
        }
        if !self.short_timer.take_expired(Instant::now()) {
            trace!(key = %self.key, "Stale aging timer");
            return true;
        }
        debug!(key = %self.key, "ARP entry aged out");
        false
    }

    /// The gratuitous timer fired.
    ///
    /// Resends while the gratuitous budget lasts; returns `false` once it is
    /// spent.
    pub fn gratuitous_expiry(&mut self, ctx: &ArpContext) -> bool {
        if self.deleted {
            return true;
        }
        if self.retry_count > ctx.config().grat_retries {
            return false;
        }
        if !self.long_timer.take_expired(Instant::now()) {
            trace!(key = %self.key, "Stale gratuitous timer");
            return true;
        }
        self.send_gratuitous_arp(ctx);
        true
    }

    /// Announce the address owned on the bound interface.
    pub fn send_gratuitous_arp(&mut self, ctx: &ArpContext) {
        if self.deleted {
            return;
        }
        let Some(interface) = self.interface.upgrade() else {
            trace!(key = %self.key, "Gratuitous ARP on dropped interface");
            return;
        };

        let config = ctx.config();
        if config.router_id_configured() {
            ctx.send_arp(
                &interface,
                self.nh_vrf.id(),
                EthernetAddress::BROADCAST,
                ArpOperation::Request,
                self.key.ip,
                ZERO_MAC,
                self.key.ip,
            );
        }

        // Re-armed after the final announcement too: that expiry finds the
        // budget spent and retires the entry.
        self.retry_count += 1;
        self.long_timer.arm(
            ctx.timers(),
            config.grat_retry_timeout(),
            ArpEvent::GratuitousExpired {
                key: self.key,
                interface_id: self.interface_id,
            },
        );
    }

    /// Send one resolution probe for the key.
    ///
    /// VM interfaces probe from their service address in the entry's VRF;
    /// everything else probes from the router address in the fabric VRF.
    pub fn send_arp_request(&self, ctx: &ArpContext) {
        let Some(interface) = self.interface.upgrade() else {
            trace!(key = %self.key, "ARP probe on dropped interface");
            return;
        };
        let config = ctx.config();

        let (sender_ip, vrf) = if interface.kind() == InterfaceKind::VmInterface {
            (
                interface.service_ip().unwrap_or(config.router_id),
                self.nh_vrf.id(),
            )
        } else {
            let Some(fabric) = ctx.vrfs().find_by_name(&config.fabric_vrf_name) else {
                debug!(key = %self.key, "Fabric VRF missing, ARP probe dropped");
                return;
            };
            (config.router_id, fabric.id())
        };

        ctx.send_arp(
            &interface,
            vrf,
            EthernetAddress::BROADCAST,
            ArpOperation::Request,
            sender_ip,
            ZERO_MAC,
            self.key.ip,
        );
    }

    fn probe(&mut self, ctx: &ArpContext) {
        self.send_arp_request(ctx);
        self.short_timer.arm(
            ctx.timers(),
            ctx.config().retry_timeout(),
            ArpEvent::RetryExpired { key: self.key },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::Fixture;

    const PEER_MAC: EthernetAddress = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const MOVED_MAC: EthernetAddress = EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);

    fn initing_entry(fx: &Fixture) -> ArpEntry {
        ArpEntry::new(
            ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 5), fx.vrf.id()),
            fx.vrf.clone(),
            &fx.fabric_if,
        )
    }

    #[test]
    fn test_key_ordering_and_display() {
        let a = ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 1), VrfId(2));
        let b = ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 1), VrfId(3));
        let c = ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 2), VrfId(1));
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "10.0.0.1@vrf2");
    }

    #[test]
    fn test_first_request_probes_once() {
        let fx = Fixture::new();
        let mut entry = initing_entry(&fx);

        assert!(entry.handle_arp_request(&fx.ctx));
        assert_eq!(entry.state(), ArpState::Initing);
        assert_eq!(entry.retry_count(), 1);
        assert!(entry.short_timer_armed());

        let frames = fx.transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message.target_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(frames[0].message.sender_ip, fx.ctx.config().router_id);
        assert_eq!(frames[0].vrf, fx.fabric_vrf.id());
    }

    #[test]
    fn test_request_exhausts_retries() {
        let fx = Fixture::new();
        let mut entry = initing_entry(&fx);
        let max = fx.ctx.config().max_retries;

        for _ in 0..max {
            assert!(entry.handle_arp_request(&fx.ctx));
        }
        assert!(!entry.handle_arp_request(&fx.ctx));
        assert_eq!(fx.transport.frames().len(), max as usize);
    }

    #[test]
    fn test_reply_activates_and_notifies() {
        let fx = Fixture::new();
        let mut entry = initing_entry(&fx);
        entry.handle_arp_request(&fx.ctx);

        entry.handle_arp_reply(PEER_MAC, &fx.ctx);
        assert_eq!(entry.state(), ArpState::Active);
        assert_eq!(entry.mac(), Some(PEER_MAC));
        assert_eq!(entry.retry_count(), 0);
        assert_eq!(fx.observer.resolved().len(), 1);

        // Same MAC refreshes without re-notifying, a new one re-notifies.
        entry.handle_arp_reply(PEER_MAC, &fx.ctx);
        assert_eq!(fx.observer.resolved().len(), 1);
        entry.handle_arp_reply(MOVED_MAC, &fx.ctx);
        assert_eq!(entry.mac(), Some(MOVED_MAC));
        assert_eq!(fx.observer.resolved().len(), 2);
    }

    #[test]
    fn test_request_on_active_renotifies_without_probe() {
        let fx = Fixture::new();
        let mut entry = initing_entry(&fx);
        entry.handle_arp_reply(PEER_MAC, &fx.ctx);

        assert!(entry.handle_arp_request(&fx.ctx));
        assert!(fx.transport.frames().is_empty());
        assert_eq!(fx.observer.resolved().len(), 2);
    }

    #[test]
    fn test_retry_expiry_is_noop_when_active() {
        let fx = Fixture::new().with_config(|c| c.retry_timeout_ms = 0);
        let mut entry = initing_entry(&fx);
        entry.handle_arp_request(&fx.ctx);
        entry.handle_arp_reply(PEER_MAC, &fx.ctx);

        assert!(entry.retry_expiry(&fx.ctx));
        assert_eq!(fx.transport.frames().len(), 1);
    }

    #[test]
    fn test_retry_expiry_not_due_is_noop() {
        let fx = Fixture::new();
        let mut entry = initing_entry(&fx);
        entry.handle_arp_request(&fx.ctx);

        assert!(entry.retry_expiry(&fx.ctx));
        assert_eq!(entry.retry_count(), 1);
        assert_eq!(fx.transport.frames().len(), 1);
    }

    #[test]
    fn test_retry_expiry_until_exhausted() {
        let fx = Fixture::new().with_config(|c| {
            c.retry_timeout_ms = 0;
            c.max_retries = 3;
        });
        let mut entry = initing_entry(&fx);
        entry.handle_arp_request(&fx.ctx);

        assert!(entry.retry_expiry(&fx.ctx));
        assert!(entry.retry_expiry(&fx.ctx));
        assert_eq!(entry.retry_count(), 3);
        assert!(!entry.retry_expiry(&fx.ctx));
        assert_eq!(fx.transport.frames().len(), 3);
    }

    #[test]
    fn test_aging_expiry() {
        let fx = Fixture::new().with_config(|c| c.aging_timeout_ms = 0);
        let mut entry = initing_entry(&fx);

        // Not active yet.
        assert!(entry.aging_expiry(&fx.ctx));

        entry.handle_arp_reply(PEER_MAC, &fx.ctx);
        assert!(!entry.aging_expiry(&fx.ctx));
    }

    #[test]
    fn test_aging_not_due_after_refresh() {
        let fx = Fixture::new();
        let mut entry = initing_entry(&fx);
        entry.handle_arp_reply(PEER_MAC, &fx.ctx);

        assert!(entry.aging_expiry(&fx.ctx));
        assert_eq!(entry.state(), ArpState::Active);
    }

    #[test]
    fn test_gratuitous_send_budget() {
        let fx = Fixture::new();
        let key = ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 1), fx.vrf.id());
        let mut entry = ArpEntry::new_gratuitous(key, fx.vrf.clone(), &fx.vm_if);
        assert_eq!(entry.state(), ArpState::Active);
        assert_eq!(entry.mac(), Some(fx.vm_if.mac()));

        let grat_retries = fx.ctx.config().grat_retries;
        for sent in 1..=grat_retries {
            entry.send_gratuitous_arp(&fx.ctx);
            assert_eq!(entry.retry_count(), sent);
            assert!(entry.long_timer_armed());
        }

        // The last announcement still arms the expiry that retires it.
        entry.send_gratuitous_arp(&fx.ctx);
        assert_eq!(entry.retry_count(), grat_retries + 1);
        assert!(entry.long_timer_armed());
        assert!(!entry.gratuitous_expiry(&fx.ctx));

        let frames = fx.transport.frames();
        assert_eq!(frames.len(), grat_retries as usize + 1);
        assert!(frames.iter().all(|f| f.message.is_gratuitous()));
    }

    #[test]
    fn test_gratuitous_without_router_id_is_silent() {
        let fx = Fixture::new().with_config(|c| c.router_id = Ipv4Addr::UNSPECIFIED);
        let key = ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 1), fx.vrf.id());
        let mut entry = ArpEntry::new_gratuitous(key, fx.vrf.clone(), &fx.vm_if);

        entry.send_gratuitous_arp(&fx.ctx);
        assert!(fx.transport.frames().is_empty());
        assert_eq!(entry.retry_count(), 1);
    }

    #[test]
    fn test_vm_probe_uses_service_ip() {
        let fx = Fixture::new();
        let key = ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 9), fx.vrf.id());
        let mut entry = ArpEntry::new(key, fx.vrf.clone(), &fx.vm_if);

        entry.handle_arp_request(&fx.ctx);
        let frames = fx.transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(Some(frames[0].message.sender_ip), fx.vm_if.service_ip());
        assert_eq!(frames[0].vrf, fx.vrf.id());
        assert_eq!(frames[0].interface_id, fx.vm_if.id());
    }

    #[test]
    fn test_deleted_entry_ignores_transitions() {
        let fx = Fixture::new();
        let mut entry = initing_entry(&fx);
        entry.handle_arp_request(&fx.ctx);
        entry.mark_deleted(fx.ctx.timers());

        assert!(!entry.short_timer_armed());
        assert!(entry.handle_arp_request(&fx.ctx));
        entry.handle_arp_reply(PEER_MAC, &fx.ctx);
        assert_eq!(entry.state(), ArpState::Initing);
        assert_eq!(fx.transport.frames().len(), 1);
    }
}
