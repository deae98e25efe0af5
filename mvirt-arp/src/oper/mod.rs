//! Operational state consumed by the ARP handler: interfaces, VRFs and
//! their route tables.

pub mod interface;
pub mod route;
pub mod vrf;

pub use interface::{Interface, InterfaceKind, InterfaceRef, InterfaceTable};
pub use route::{NextHop, NextHopKind, Route, RouteTable};
pub use vrf::{Vrf, VrfId, VrfRef, VrfTable};
