//! Interface table.
//!
//! Provides thread-safe lookup of interfaces by index or name. ARP entries
//! hold interfaces weakly and re-resolve them here, so an interface that is
//! removed while a resolution is in flight simply stops matching.

use ipnet::Ipv4Net;
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::vrf::VrfRef;

/// Type of interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// Physical ethernet port (or LAG).
    Physical,
    /// Physical port on a remote device.
    RemotePhysical,
    /// Logical sub-interface.
    Logical,
    /// Interface of a virtual machine (end host).
    VmInterface,
    /// Host OS interface such as vhost0.
    Inet,
    /// Packet interface between the data plane and the agent.
    Packet,
}

impl InterfaceKind {
    /// Interface faces an end host rather than the fabric.
    pub fn is_end_host(&self) -> bool {
        matches!(self, InterfaceKind::VmInterface)
    }
}

pub type InterfaceRef = Arc<Interface>;

/// A network interface known to the agent.
pub struct Interface {
    id: u32,
    name: String,
    kind: InterfaceKind,
    mac: EthernetAddress,
    vrf: RwLock<Option<VrfRef>>,
    active: AtomicBool,
    deleted: AtomicBool,
    /// Address the agent sources probes from on this interface.
    service_ip: Option<Ipv4Addr>,
    /// MAC of the attached VM, used as unicast probe destination.
    vm_mac: Option<EthernetAddress>,
    /// Allowed-address-pair blocks configured on the interface.
    aap_prefixes: Vec<Ipv4Net>,
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mac", &self.mac)
            .field("active", &self.is_active())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl Interface {
    /// Create an active interface without a VRF.
    pub fn new(id: u32, name: impl Into<String>, kind: InterfaceKind, mac: EthernetAddress) -> Self {
        Interface {
            id,
            name: name.into(),
            kind,
            mac,
            vrf: RwLock::new(None),
            active: AtomicBool::new(true),
            deleted: AtomicBool::new(false),
            service_ip: None,
            vm_mac: None,
            aap_prefixes: Vec::new(),
        }
    }

    pub fn with_vrf(self, vrf: VrfRef) -> Self {
        self.set_vrf(Some(vrf));
        self
    }

    pub fn with_service_ip(mut self, ip: Ipv4Addr) -> Self {
        self.service_ip = Some(ip);
        self
    }

    pub fn with_vm_mac(mut self, mac: EthernetAddress) -> Self {
        self.vm_mac = Some(mac);
        self
    }

    pub fn with_aap_prefix(mut self, prefix: Ipv4Net) -> Self {
        self.aap_prefixes.push(prefix.trunc());
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn vrf(&self) -> Option<VrfRef> {
        self.vrf.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_vrf(&self, vrf: Option<VrfRef>) {
        *self.vrf.write().unwrap_or_else(PoisonError::into_inner) = vrf;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.is_deleted()
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Interface removal has started.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn service_ip(&self) -> Option<Ipv4Addr> {
        self.service_ip
    }

    /// MAC of the attached VM, falling back to the interface MAC.
    pub fn vm_mac(&self) -> EthernetAddress {
        self.vm_mac.unwrap_or(self.mac)
    }

    /// `prefix` is exactly one of the allowed-address-pair blocks.
    pub fn is_aap_prefix(&self, prefix: &Ipv4Net) -> bool {
        let prefix = prefix.trunc();
        self.aap_prefixes.contains(&prefix)
    }
}

/// Central table of interfaces.
pub struct InterfaceTable {
    /// Interfaces indexed by their index.
    interfaces: RwLock<HashMap<u32, InterfaceRef>>,
    /// Index from interface name to index.
    name_index: RwLock<HashMap<String, u32>>,
}

impl InterfaceTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        InterfaceTable {
            interfaces: RwLock::new(HashMap::new()),
            name_index: RwLock::new(HashMap::new()),
        }
    }

    /// Register an interface.
    ///
    /// Returns the shared reference and the interface previously registered
    /// under the same index, if any.
    pub fn register(&self, interface: Interface) -> (InterfaceRef, Option<InterfaceRef>) {
        let interface = Arc::new(interface);
        self.name_index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(interface.name.clone(), interface.id);
        let previous = self
            .interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(interface.id, Arc::clone(&interface));
        (interface, previous)
    }

    /// Unregister an interface by index.
    ///
    /// The interface is marked deleted first so concurrent lookups through
    /// stale references stop matching it.
    pub fn unregister(&self, id: u32) -> Option<InterfaceRef> {
        let interface = self
            .interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        interface.mark_deleted();

        let mut names = self
            .name_index
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if names.get(&interface.name) == Some(&id) {
            names.remove(&interface.name);
        }
        Some(interface)
    }

    pub fn find_by_index(&self, id: u32) -> Option<InterfaceRef> {
        self.interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<InterfaceRef> {
        let id = *self
            .name_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)?;
        self.find_by_index(id)
    }

    /// Get the number of registered interfaces.
    pub fn len(&self) -> usize {
        self.interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get all registered interface indexes.
    pub fn ids(&self) -> Vec<u32> {
        self.interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

impl Default for InterfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oper::vrf::Vrf;

    const MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

    #[test]
    fn test_register_unregister() {
        let table = InterfaceTable::new();
        assert!(table.is_empty());

        let (tap, previous) =
            table.register(Interface::new(42, "tap0", InterfaceKind::VmInterface, MAC));
        assert!(previous.is_none());
        assert_eq!(table.len(), 1);

        assert_eq!(table.find_by_index(42).map(|i| i.id()), Some(42));
        assert_eq!(table.find_by_name("tap0").map(|i| i.id()), Some(42));
        assert!(table.find_by_index(99).is_none());

        let removed = table.unregister(42).unwrap();
        assert!(removed.is_deleted());
        assert!(!tap.is_active());
        assert!(table.is_empty());
        assert!(table.find_by_name("tap0").is_none());
        assert!(table.unregister(42).is_none());
    }

    #[test]
    fn test_multiple_interfaces() {
        let table = InterfaceTable::new();
        table.register(Interface::new(1, "eth0", InterfaceKind::Physical, MAC));
        table.register(Interface::new(2, "tap1", InterfaceKind::VmInterface, MAC));

        let mut ids = table.ids();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_interface_attributes() {
        let vrf = Arc::new(Vrf::new(5, "vrf-red"));
        let vm_mac = EthernetAddress([0x02, 0, 0, 0, 0, 9]);
        let itf = Interface::new(3, "tap3", InterfaceKind::VmInterface, MAC)
            .with_vrf(Arc::clone(&vrf))
            .with_service_ip(Ipv4Addr::new(10, 0, 0, 2))
            .with_vm_mac(vm_mac)
            .with_aap_prefix("10.0.0.4/30".parse().unwrap());

        assert!(itf.kind().is_end_host());
        assert_eq!(itf.vrf().map(|v| v.name().to_string()), Some("vrf-red".to_string()));
        assert_eq!(itf.service_ip(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(itf.vm_mac(), vm_mac);
        assert!(itf.is_aap_prefix(&"10.0.0.4/30".parse().unwrap()));
        assert!(!itf.is_aap_prefix(&"10.0.0.0/24".parse().unwrap()));

        itf.set_active(false);
        assert!(!itf.is_active());
    }

    #[test]
    fn test_vm_mac_fallback() {
        let itf = Interface::new(1, "eth0", InterfaceKind::Physical, MAC);
        assert!(!itf.kind().is_end_host());
        assert_eq!(itf.vm_mac(), MAC);
    }
}
