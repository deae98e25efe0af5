//! ARP resolution for the virtual-router agent.
//!
//! Resolves IPv4 next-hops to MAC addresses per VRF, keeps the bindings
//! alive with retry and aging timers and announces locally owned addresses
//! with gratuitous ARP.

pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod event;
pub mod handler;
pub mod oper;
pub mod registry;
pub mod service;
pub mod stats;
pub mod test_util;
pub mod timer;
pub mod wire;

pub use config::ArpConfig;
pub use context::{ArpContext, Collaborators, NextHopObserver, PacketTransport, RoutePreference, TxMode};
pub use entry::{ArpEntry, ArpState, ResolutionKey};
pub use error::{ArpError, ConfigError, ParseError, ServiceError};
pub use event::{ArpEvent, ProbeRequest};
pub use handler::ArpHandler;
pub use registry::{ArpRegistry, EntryRef};
pub use service::ArpService;
pub use stats::{ArpStats, StatsSnapshot};
