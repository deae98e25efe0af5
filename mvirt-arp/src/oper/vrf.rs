//! VRF table.
//!
//! VRFs are shared as `Arc<Vrf>`; the route table of each VRF is published
//! through an `ArcSwap` so packet handling always reads a consistent
//! snapshot while the control plane swaps in updated tables.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::route::{Route, RouteTable};
use ipnet::Ipv4Net;

/// Index of a VRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VrfId(pub u32);

impl fmt::Display for VrfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type VrfRef = Arc<Vrf>;

/// A forwarding domain.
pub struct Vrf {
    id: VrfId,
    name: String,
    active: AtomicBool,
    forwarding_vrf: RwLock<Option<VrfRef>>,
    routes: ArcSwap<RouteTable>,
}

impl fmt::Debug for Vrf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vrf")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Vrf {
    /// Create an active VRF with an empty route table.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Vrf {
            id: VrfId(id),
            name: name.into(),
            active: AtomicBool::new(true),
            forwarding_vrf: RwLock::new(None),
            routes: ArcSwap::from_pointee(RouteTable::new()),
        }
    }

    pub fn id(&self) -> VrfId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// VRF that actually forwards traffic for this one, if aliased.
    pub fn forwarding_vrf(&self) -> Option<VrfRef> {
        self.forwarding_vrf
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_forwarding_vrf(&self, vrf: Option<VrfRef>) {
        *self
            .forwarding_vrf
            .write()
            .unwrap_or_else(PoisonError::into_inner) = vrf;
    }

    /// Current route table snapshot.
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.routes.load_full()
    }

    /// Publish a modified copy of the route table.
    pub fn update_routes(&self, mut update: impl FnMut(&mut RouteTable)) {
        self.routes.rcu(|current| {
            let mut table = RouteTable::clone(current);
            update(&mut table);
            table
        });
    }

    pub fn add_route(&self, route: Route) {
        self.update_routes(|table| {
            table.insert(route.clone());
        });
    }

    pub fn remove_route(&self, prefix: Ipv4Net) {
        self.update_routes(|table| {
            table.remove(&prefix);
        });
    }
}

/// VRFs indexed by id and by name.
pub struct VrfTable {
    vrfs: RwLock<HashMap<VrfId, VrfRef>>,
    /// Index from VRF name to id.
    name_index: RwLock<HashMap<String, VrfId>>,
}

impl VrfTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        VrfTable {
            vrfs: RwLock::new(HashMap::new()),
            name_index: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a VRF, returning the one it replaced.
    pub fn insert(&self, vrf: Vrf) -> (VrfRef, Option<VrfRef>) {
        let vrf = Arc::new(vrf);
        self.name_index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vrf.name.clone(), vrf.id);
        let previous = self
            .vrfs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vrf.id, Arc::clone(&vrf));
        (vrf, previous)
    }

    /// Remove a VRF. The removed VRF is marked inactive so holders of a
    /// stale reference observe the teardown.
    pub fn remove(&self, id: VrfId) -> Option<VrfRef> {
        let vrf = self
            .vrfs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        vrf.set_active(false);

        let mut names = self
            .name_index
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if names.get(&vrf.name) == Some(&id) {
            names.remove(&vrf.name);
        }
        Some(vrf)
    }

    pub fn find_by_id(&self, id: VrfId) -> Option<VrfRef> {
        self.vrfs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<VrfRef> {
        let id = *self
            .name_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)?;
        self.find_by_id(id)
    }

    pub fn len(&self) -> usize {
        self.vrfs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VrfTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oper::route::NextHop;
    use std::net::Ipv4Addr;

    #[test]
    fn test_vrf_table_lookup() {
        let table = VrfTable::new();
        assert!(table.is_empty());

        let (red, previous) = table.insert(Vrf::new(3, "vrf-red"));
        assert!(previous.is_none());
        assert_eq!(table.len(), 1);

        assert_eq!(table.find_by_id(VrfId(3)).map(|v| v.id()), Some(red.id()));
        assert_eq!(
            table.find_by_name("vrf-red").map(|v| v.id()),
            Some(VrfId(3))
        );
        assert!(table.find_by_name("vrf-blue").is_none());
    }

    #[test]
    fn test_remove_marks_inactive() {
        let table = VrfTable::new();
        let (red, _) = table.insert(Vrf::new(3, "vrf-red"));
        assert!(red.is_active());

        let removed = table.remove(VrfId(3)).unwrap();
        assert!(!removed.is_active());
        assert!(!red.is_active());
        assert!(table.find_by_id(VrfId(3)).is_none());
        assert!(table.find_by_name("vrf-red").is_none());
        assert!(table.remove(VrfId(3)).is_none());
    }

    #[test]
    fn test_route_snapshot_isolated_from_update() {
        let vrf = Vrf::new(1, "vrf");
        let before = vrf.route_table();

        vrf.add_route(Route::unicast(
            "10.0.0.0/24".parse().unwrap(),
            NextHop::Resolve { interface_id: 4 },
        ));

        assert!(
            before
                .longest_prefix_match(Ipv4Addr::new(10, 0, 0, 1))
                .is_none()
        );
        assert!(
            vrf.route_table()
                .longest_prefix_match(Ipv4Addr::new(10, 0, 0, 1))
                .is_some()
        );

        vrf.remove_route("10.0.0.0/24".parse().unwrap());
        assert!(
            vrf.route_table()
                .longest_prefix_match(Ipv4Addr::new(10, 0, 0, 1))
                .is_none()
        );
    }

    #[test]
    fn test_forwarding_vrf() {
        let table = VrfTable::new();
        let (fwd, _) = table.insert(Vrf::new(1, "fwd"));
        let (alias, _) = table.insert(Vrf::new(2, "alias"));

        assert!(alias.forwarding_vrf().is_none());
        alias.set_forwarding_vrf(Some(Arc::clone(&fwd)));
        assert_eq!(alias.forwarding_vrf().map(|v| v.id()), Some(VrfId(1)));
    }
}
