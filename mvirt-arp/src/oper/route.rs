//! Per-VRF IPv4 unicast route table with longest-prefix-match lookup.
//!
//! The ARP handler only reads these tables: it needs to know whether a
//! target falls under a multicast route and whether the matching route's
//! active next-hop is a resolve next-hop that redirects resolution to
//! another interface.

use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;
use std::net::Ipv4Addr;

/// Kind of a next-hop, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHopKind {
    Resolve,
    Interface,
    Receive,
    Discard,
}

/// Forwarding action of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// Resolution still pending; resolve on the given interface.
    Resolve {
        /// Index of the interface the subnet lives behind.
        interface_id: u32,
    },
    /// Forward out of an interface.
    Interface {
        /// Outgoing interface index.
        interface_id: u32,
    },
    /// Terminate locally.
    Receive,
    /// Drop the packet.
    Discard,
}

impl NextHop {
    pub fn kind(&self) -> NextHopKind {
        match self {
            NextHop::Resolve { .. } => NextHopKind::Resolve,
            NextHop::Interface { .. } => NextHopKind::Interface,
            NextHop::Receive => NextHopKind::Receive,
            NextHop::Discard => NextHopKind::Discard,
        }
    }
}

/// A route entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    prefix: Ipv4Net,
    multicast: bool,
    next_hop: NextHop,
}

impl Route {
    pub fn unicast(prefix: Ipv4Net, next_hop: NextHop) -> Self {
        Route {
            prefix,
            multicast: false,
            next_hop,
        }
    }

    pub fn multicast(prefix: Ipv4Net) -> Self {
        Route {
            prefix,
            multicast: true,
            next_hop: NextHop::Receive,
        }
    }

    pub fn prefix(&self) -> Ipv4Net {
        self.prefix
    }

    pub fn is_multicast(&self) -> bool {
        self.multicast
    }

    pub fn active_next_hop(&self) -> &NextHop {
        &self.next_hop
    }
}

/// IPv4 LPM table.
#[derive(Clone)]
pub struct RouteTable {
    routes: PrefixMap<Ipv4Net, Route>,
}

impl RouteTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        RouteTable {
            routes: PrefixMap::new(),
        }
    }

    /// Longest matching route for a host address.
    pub fn longest_prefix_match(&self, addr: Ipv4Addr) -> Option<&Route> {
        let host = Ipv4Net::new(addr, 32).ok()?;
        self.routes.get_lpm(&host).map(|(_, route)| route)
    }

    /// Insert a route, replacing one with the same prefix.
    pub fn insert(&mut self, route: Route) -> Option<Route> {
        self.routes.insert(route.prefix.trunc(), route)
    }

    /// Remove the route for an exact prefix.
    pub fn remove(&mut self, prefix: &Ipv4Net) -> Option<Route> {
        self.routes.remove(&prefix.trunc())
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lpm_lookup() {
        let mut table = RouteTable::new();

        table.insert(Route::unicast(
            "10.0.0.0/8".parse().unwrap(),
            NextHop::Interface { interface_id: 1 },
        ));
        table.insert(Route::unicast(
            "10.1.0.0/16".parse().unwrap(),
            NextHop::Resolve { interface_id: 7 },
        ));

        // 10.1.2.3 -> 10.1.0.0/16 (more specific)
        let route = table
            .longest_prefix_match(Ipv4Addr::new(10, 1, 2, 3))
            .unwrap();
        assert_eq!(route.active_next_hop().kind(), NextHopKind::Resolve);
        assert_eq!(route.prefix(), "10.1.0.0/16".parse::<Ipv4Net>().unwrap());

        // 10.2.3.4 -> 10.0.0.0/8
        let route = table
            .longest_prefix_match(Ipv4Addr::new(10, 2, 3, 4))
            .unwrap();
        assert_eq!(
            route.active_next_hop(),
            &NextHop::Interface { interface_id: 1 }
        );

        assert!(
            table
                .longest_prefix_match(Ipv4Addr::new(192, 168, 1, 1))
                .is_none()
        );
    }

    #[test]
    fn test_multicast_route() {
        let mut table = RouteTable::new();
        table.insert(Route::multicast("224.0.0.0/4".parse().unwrap()));

        let route = table
            .longest_prefix_match(Ipv4Addr::new(224, 0, 0, 251))
            .unwrap();
        assert!(route.is_multicast());
    }

    #[test]
    fn test_remove_route() {
        let mut table = RouteTable::new();
        let prefix: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        table.insert(Route::unicast(prefix, NextHop::Discard));

        assert!(table.remove(&prefix).is_some());
        assert!(table.remove(&prefix).is_none());
        assert!(
            table
                .longest_prefix_match(Ipv4Addr::new(10, 0, 0, 1))
                .is_none()
        );
    }
}
