//! Test utilities for the ARP handler
//!
//! Recording fakes for every collaborator, a manual timer scheduler, a
//! pre-wired [`Fixture`] and builders for inbound frames.

pub mod fakes;
pub mod fixture;
pub mod packets;

pub use fakes::{
    ManualTimers, RecordingObserver, RecordingRoutePreference, RecordingTransport, SentFrame,
    TrafficSeen,
};
pub use fixture::*;
pub use packets::*;
