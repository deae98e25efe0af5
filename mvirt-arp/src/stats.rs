//! ARP statistics.
//!
//! Global counters are keyed by event or error kind; requests and replies
//! are additionally tallied per interface.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::error::ArpError;

/// Per-interface request/reply tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub arp_requests: u64,
    pub arp_replies: u64,
}

/// Live counters, updated from any worker.
#[derive(Debug, Default)]
pub struct ArpStats {
    arp_requests: AtomicU64,
    arp_replies: AtomicU64,
    gratuitous: AtomicU64,
    vm_arp_requests: AtomicU64,
    invalid_packets: AtomicU64,
    invalid_interface: AtomicU64,
    invalid_vrf: AtomicU64,
    invalid_address: AtomicU64,
    invalid_command: AtomicU64,
    ip_fabric_not_installed: AtomicU64,
    duplicate_key: AtomicU64,
    interfaces: RwLock<HashMap<u32, InterfaceCounters>>,
}

/// Point-in-time copy of [`ArpStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub arp_requests: u64,
    pub arp_replies: u64,
    pub gratuitous: u64,
    pub vm_arp_requests: u64,
    pub invalid_packets: u64,
    pub invalid_interface: u64,
    pub invalid_vrf: u64,
    pub invalid_address: u64,
    pub invalid_command: u64,
    pub ip_fabric_not_installed: u64,
    pub duplicate_key: u64,
    pub interfaces: BTreeMap<u32, InterfaceCounters>,
}

impl ArpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_arp_requests(&self) {
        self.arp_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_arp_replies(&self) {
        self.arp_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gratuitous(&self) {
        self.gratuitous.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vm_arp_requests(&self) {
        self.vm_arp_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a request sent or received on `interface_id`.
    pub fn record_request(&self, interface_id: u32) {
        self.update_interface(interface_id, |c| c.arp_requests += 1);
    }

    /// Count a reply received on `interface_id`.
    pub fn record_reply(&self, interface_id: u32) {
        self.update_interface(interface_id, |c| c.arp_replies += 1);
    }

    /// Count a dropped unit of work under its error kind.
    pub fn record_error(&self, error: &ArpError) {
        let counter = match error {
            ArpError::MalformedFrame(_) => &self.invalid_packets,
            ArpError::FabricNotInstalled => &self.ip_fabric_not_installed,
            ArpError::InvalidInterface(_) => &self.invalid_interface,
            ArpError::InvalidVrf(_) | ArpError::InterfaceWithoutVrf(_) => &self.invalid_vrf,
            ArpError::InvalidAddress(_) => &self.invalid_address,
            ArpError::OwnAddress(_) => &self.gratuitous,
            ArpError::InvalidCommand(_) => &self.invalid_command,
            ArpError::DuplicateKey(_) => &self.duplicate_key,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn interface(&self, interface_id: u32) -> InterfaceCounters {
        self.interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&interface_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            arp_requests: load(&self.arp_requests),
            arp_replies: load(&self.arp_replies),
            gratuitous: load(&self.gratuitous),
            vm_arp_requests: load(&self.vm_arp_requests),
            invalid_packets: load(&self.invalid_packets),
            invalid_interface: load(&self.invalid_interface),
            invalid_vrf: load(&self.invalid_vrf),
            invalid_address: load(&self.invalid_address),
            invalid_command: load(&self.invalid_command),
            ip_fabric_not_installed: load(&self.ip_fabric_not_installed),
            duplicate_key: load(&self.duplicate_key),
            interfaces: self
                .interfaces
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(id, counters)| (*id, *counters))
                .collect(),
        }
    }

    fn update_interface(&self, interface_id: u32, update: impl FnOnce(&mut InterfaceCounters)) {
        let mut interfaces = self
            .interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        update(interfaces.entry(interface_id).or_default());
    }
}
