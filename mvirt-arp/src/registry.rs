//! ARP entry registry.
//!
//! Single source of truth for entry existence. The primary map is sharded by
//! key hash so unrelated keys never contend; gratuitous entries live in a
//! separate index keyed by address and told apart by interface. Locks are
//! only held for map operations, never while an entry transition runs.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use crate::entry::{ArpEntry, ResolutionKey};
use crate::error::{ArpError, Result};
use crate::oper::{Interface, VrfId};
use crate::timer::TimerScheduler;

/// Shared handle to a registered entry.
pub type EntryRef = Arc<Mutex<ArpEntry>>;

/// Lock an entry, recovering from poisoning.
pub fn lock(entry: &EntryRef) -> MutexGuard<'_, ArpEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

type Shard = Mutex<BTreeMap<ResolutionKey, EntryRef>>;

/// One gratuitous entry together with the fields its index is matched on,
/// so lookups do not need to lock the entry itself.
struct GratuitousSlot {
    key: ResolutionKey,
    interface_id: u32,
    interface: Weak<Interface>,
    entry: EntryRef,
}

impl GratuitousSlot {
    /// Interface still exists and is not being torn down.
    fn is_live(&self) -> bool {
        self.interface
            .upgrade()
            .is_some_and(|interface| !interface.is_deleted())
    }
}

/// Owner of every ARP entry.
pub struct ArpRegistry {
    shards: Vec<Shard>,
    gratuitous: Mutex<HashMap<Ipv4Addr, Vec<GratuitousSlot>>>,
    timers: Arc<dyn TimerScheduler>,
}

impl ArpRegistry {
    /// Create a registry with `shards` primary shards, rounded up to a power
    /// of two.
    pub fn new(shards: usize, timers: Arc<dyn TimerScheduler>) -> Self {
        let count = shards.max(1).next_power_of_two();
        ArpRegistry {
            shards: (0..count).map(|_| Mutex::new(BTreeMap::new())).collect(),
            gratuitous: Mutex::new(HashMap::new()),
            timers,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &ResolutionKey) -> MutexGuard<'_, BTreeMap<ResolutionKey, EntryRef>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) & (self.shards.len() - 1);
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn gratuitous_index(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, Vec<GratuitousSlot>>> {
        self.gratuitous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the primary entry for `key`.
    pub fn find(&self, key: &ResolutionKey) -> Option<EntryRef> {
        self.shard(key).get(key).cloned()
    }

    /// Install `entry` as the owner of its key.
    ///
    /// Fails with [`ArpError::DuplicateKey`] when the key is already owned;
    /// the rejected entry is dropped.
    pub fn add(&self, entry: ArpEntry) -> Result<EntryRef> {
        let key = entry.key();
        let mut shard = self.shard(&key);
        if shard.contains_key(&key) {
            return Err(ArpError::DuplicateKey(key));
        }
        let entry = Arc::new(Mutex::new(entry));
        shard.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Remove `entry` from whichever index holds it.
    ///
    /// Returns `false` when the entry was not registered (already deleted).
    pub fn delete(&self, entry: &EntryRef) -> bool {
        let (key, gratuitous) = {
            let guard = lock(entry);
            (guard.key(), guard.is_gratuitous())
        };

        let removed = if gratuitous {
            let mut index = self.gratuitous_index();
            let removed = match index.get_mut(&key.ip) {
                Some(slots) => {
                    let before = slots.len();
                    slots.retain(|slot| !Arc::ptr_eq(&slot.entry, entry));
                    slots.len() != before
                }
                None => false,
            };
            if index.get(&key.ip).is_some_and(Vec::is_empty) {
                index.remove(&key.ip);
            }
            removed
        } else {
            let mut shard = self.shard(&key);
            match shard.get(&key) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    shard.remove(&key);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.retire(entry);
        }
        removed
    }

    /// Remove the primary entry for `key` and every gratuitous entry sharing
    /// it. Returns the number of entries removed.
    pub fn delete_key(&self, key: &ResolutionKey) -> usize {
        let mut removed = Vec::new();
        if let Some(entry) = self.shard(key).remove(key) {
            removed.push(entry);
        }
        {
            let mut index = self.gratuitous_index();
            if let Some(slots) = index.get_mut(&key.ip) {
                let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(slots)
                    .into_iter()
                    .partition(|slot| slot.key == *key);
                *slots = rest;
                removed.extend(matching.into_iter().map(|slot| slot.entry));
                if slots.is_empty() {
                    index.remove(&key.ip);
                }
            }
        }

        for entry in &removed {
            self.retire(entry);
        }
        if !removed.is_empty() {
            debug!(key = %key, count = removed.len(), "Deleted ARP entries");
        }
        removed.len()
    }

    /// Gratuitous entry for `ip` on `interface_id`, in any VRF.
    pub fn gratuitous_find(&self, ip: Ipv4Addr, interface_id: u32) -> Option<EntryRef> {
        self.gratuitous_index()
            .get(&ip)?
            .iter()
            .find(|slot| slot.interface_id == interface_id && slot.is_live())
            .map(|slot| Arc::clone(&slot.entry))
    }

    /// Gratuitous entry for exactly `key` on `interface_id`.
    pub fn gratuitous_find_for_key(
        &self,
        key: &ResolutionKey,
        interface_id: u32,
    ) -> Option<EntryRef> {
        self.gratuitous_index()
            .get(&key.ip)?
            .iter()
            .find(|slot| slot.key == *key && slot.interface_id == interface_id && slot.is_live())
            .map(|slot| Arc::clone(&slot.entry))
    }

    /// Every gratuitous entry for `ip` whose interface is still live.
    pub fn gratuitous_iterate_by_ip(&self, ip: Ipv4Addr) -> Vec<EntryRef> {
        self.gratuitous_index()
            .get(&ip)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|slot| slot.is_live())
                    .map(|slot| Arc::clone(&slot.entry))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Install a gratuitous entry. At most one exists per key and interface.
    ///
    /// Entries left behind by interfaces that are gone are pruned first.
    pub fn add_gratuitous(&self, entry: ArpEntry) -> Result<EntryRef> {
        let key = entry.key();
        let interface_id = entry.interface_id();
        let interface = entry.interface_weak();

        let mut pruned = Vec::new();
        let entry = {
            let mut index = self.gratuitous_index();
            let slots = index.entry(key.ip).or_default();

            let (live, dead): (Vec<_>, Vec<_>) =
                std::mem::take(slots).into_iter().partition(GratuitousSlot::is_live);
            *slots = live;
            pruned.extend(dead.into_iter().map(|slot| slot.entry));

            if slots
                .iter()
                .any(|slot| slot.key == key && slot.interface_id == interface_id)
            {
                Err(ArpError::DuplicateKey(key))
            } else {
                let entry = Arc::new(Mutex::new(entry));
                slots.push(GratuitousSlot {
                    key,
                    interface_id,
                    interface,
                    entry: Arc::clone(&entry),
                });
                Ok(entry)
            }
        };

        for stale in &pruned {
            self.retire(stale);
        }
        entry
    }

    /// Remove every entry of `vrf`. Returns the number removed.
    pub fn purge_vrf(&self, vrf: VrfId) -> usize {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<ResolutionKey> =
                map.keys().filter(|key| key.vrf == vrf).copied().collect();
            for key in keys {
                if let Some(entry) = map.remove(&key) {
                    removed.push(entry);
                }
            }
        }
        {
            let mut index = self.gratuitous_index();
            for slots in index.values_mut() {
                let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(slots)
                    .into_iter()
                    .partition(|slot| slot.key.vrf == vrf);
                *slots = rest;
                removed.extend(matching.into_iter().map(|slot| slot.entry));
            }
            index.retain(|_, slots| !slots.is_empty());
        }

        for entry in &removed {
            self.retire(entry);
        }
        removed.len()
    }

    /// Number of primary entries.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of gratuitous entries.
    pub fn gratuitous_len(&self) -> usize {
        self.gratuitous_index().values().map(Vec::len).sum()
    }

    /// Keys of all primary entries, sorted.
    pub fn keys(&self) -> Vec<ResolutionKey> {
        let mut keys: Vec<ResolutionKey> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    fn retire(&self, entry: &EntryRef) {
        lock(entry).mark_deleted(self.timers.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ArpState;
    use crate::test_util::Fixture;
    use std::thread;

    fn key(fx: &Fixture, last: u8) -> ResolutionKey {
        ResolutionKey::new(Ipv4Addr::new(10, 0, 0, last), fx.vrf.id())
    }

    #[test]
    fn test_shards_round_up() {
        let fx = Fixture::new();
        assert_eq!(ArpRegistry::new(0, fx.timers.clone()).shard_count(), 1);
        assert_eq!(ArpRegistry::new(5, fx.timers.clone()).shard_count(), 8);
        assert_eq!(ArpRegistry::new(16, fx.timers.clone()).shard_count(), 16);
    }

    #[test]
    fn test_add_find_delete() {
        let fx = Fixture::new();
        let registry = fx.ctx.registry();
        let k = key(&fx, 5);

        let entry = registry
            .add(ArpEntry::new(k, fx.vrf.clone(), &fx.fabric_if))
            .unwrap();
        assert!(Arc::ptr_eq(&registry.find(&k).unwrap(), &entry));
        assert_eq!(registry.len(), 1);

        let duplicate = registry.add(ArpEntry::new(k, fx.vrf.clone(), &fx.fabric_if));
        assert_eq!(duplicate.unwrap_err(), ArpError::DuplicateKey(k));

        assert!(registry.delete(&entry));
        assert!(lock(&entry).is_deleted());
        assert!(registry.find(&k).is_none());
        assert!(!registry.delete(&entry));
    }

    #[test]
    fn test_delete_cancels_timers() {
        let fx = Fixture::new();
        let registry = fx.ctx.registry();
        let entry = registry
            .add(ArpEntry::new(key(&fx, 5), fx.vrf.clone(), &fx.fabric_if))
            .unwrap();
        lock(&entry).handle_arp_request(&fx.ctx);
        assert_eq!(fx.timers.armed().len(), 1);

        registry.delete(&entry);
        assert!(fx.timers.armed().is_empty());
    }

    #[test]
    fn test_delete_key_removes_both_indexes() {
        let fx = Fixture::new();
        let registry = fx.ctx.registry();
        let k = key(&fx, 1);

        registry
            .add(ArpEntry::new(k, fx.vrf.clone(), &fx.fabric_if))
            .unwrap();
        registry
            .add_gratuitous(ArpEntry::new_gratuitous(k, fx.vrf.clone(), &fx.vm_if))
            .unwrap();
        assert_eq!(registry.gratuitous_len(), 1);

        assert_eq!(registry.delete_key(&k), 2);
        assert!(registry.find(&k).is_none());
        assert!(registry.gratuitous_find(k.ip, fx.vm_if.id()).is_none());
        assert_eq!(registry.gratuitous_len(), 0);

        assert_eq!(registry.delete_key(&k), 0);
    }

    #[test]
    fn test_gratuitous_one_per_interface() {
        let fx = Fixture::new();
        let registry = fx.ctx.registry();
        let k = key(&fx, 1);

        let first = registry
            .add_gratuitous(ArpEntry::new_gratuitous(k, fx.vrf.clone(), &fx.vm_if))
            .unwrap();
        assert!(registry
            .add_gratuitous(ArpEntry::new_gratuitous(k, fx.vrf.clone(), &fx.vm_if))
            .is_err());
        registry
            .add_gratuitous(ArpEntry::new_gratuitous(k, fx.vrf.clone(), &fx.fabric_if))
            .unwrap();

        assert_eq!(registry.gratuitous_iterate_by_ip(k.ip).len(), 2);
        let found = registry.gratuitous_find_for_key(&k, fx.vm_if.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert_eq!(lock(&found).state(), ArpState::Active);
        // Gratuitous entries never show up in the primary map.
        assert!(registry.find(&k).is_none());
    }

    #[test]
    fn test_gratuitous_excludes_deleted_interface() {
        let fx = Fixture::new();
        let registry = fx.ctx.registry();
        let k = key(&fx, 1);
        registry
            .add_gratuitous(ArpEntry::new_gratuitous(k, fx.vrf.clone(), &fx.vm_if))
            .unwrap();

        fx.interfaces.unregister(fx.vm_if.id());
        assert!(registry.gratuitous_find(k.ip, fx.vm_if.id()).is_none());
        assert!(registry.gratuitous_iterate_by_ip(k.ip).is_empty());
    }

    #[test]
    fn test_purge_vrf() {
        let fx = Fixture::new();
        let registry = fx.ctx.registry();
        let other = ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 2), fx.fabric_vrf.id());

        registry
            .add(ArpEntry::new(key(&fx, 1), fx.vrf.clone(), &fx.fabric_if))
            .unwrap();
        registry
            .add(ArpEntry::new(other, fx.fabric_vrf.clone(), &fx.fabric_if))
            .unwrap();
        registry
            .add_gratuitous(ArpEntry::new_gratuitous(key(&fx, 3), fx.vrf.clone(), &fx.vm_if))
            .unwrap();

        assert_eq!(registry.purge_vrf(fx.vrf.id()), 2);
        assert_eq!(registry.keys(), vec![other]);
        assert_eq!(registry.gratuitous_len(), 0);
    }

    #[test]
    fn test_concurrent_add_single_winner() {
        let fx = Fixture::new();
        let k = key(&fx, 7);

        let winners: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        fx.ctx
                            .registry()
                            .add(ArpEntry::new(k, fx.vrf.clone(), &fx.fabric_if))
                            .is_ok() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(fx.ctx.registry().len(), 1);
    }
}
