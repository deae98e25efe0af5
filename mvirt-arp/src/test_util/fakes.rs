//! Recording implementations of the handler's collaborators.

use smoltcp::wire::{EthernetAddress, EthernetFrame};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::context::{NextHopObserver, PacketTransport, RoutePreference, TxMode};
use crate::entry::ResolutionKey;
use crate::event::ArpEvent;
use crate::oper::VrfId;
use crate::timer::{TimerHandle, TimerScheduler};
use crate::wire::{self, ArpMessage};

/// A frame handed to the transport.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub interface_id: u32,
    pub vrf: VrfId,
    pub mode: TxMode,
    pub dst_mac: EthernetAddress,
    pub message: ArpMessage,
    pub bytes: Vec<u8>,
}

/// Transport that keeps every sent ARP frame.
#[derive(Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<SentFrame>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<SentFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

impl PacketTransport for RecordingTransport {
    fn send_frame(&self, frame: Vec<u8>, interface_id: u32, vrf: VrfId, mode: TxMode) {
        let dst_mac = EthernetFrame::new_checked(&frame[..])
            .expect("sent frame has an ethernet header")
            .dst_addr();
        let message = match wire::parse_frame(&frame).expect("sent frame parses") {
            wire::InboundFrame::Arp(message) => message,
            other => panic!("transport only carries ARP, got {other:?}"),
        };
        self.frames.lock().unwrap().push(SentFrame {
            interface_id,
            vrf,
            mode,
            dst_mac,
            message,
            bytes: frame,
        });
    }
}

/// One traffic-seen notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSeen {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub interface_id: u32,
    pub vrf: VrfId,
    pub mac: EthernetAddress,
}

#[derive(Default)]
pub struct RecordingRoutePreference {
    calls: Mutex<Vec<TrafficSeen>>,
}

impl RecordingRoutePreference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TrafficSeen> {
        self.calls.lock().unwrap().clone()
    }
}

impl RoutePreference for RecordingRoutePreference {
    fn notify_traffic_seen(
        &self,
        ip: Ipv4Addr,
        prefix_len: u8,
        interface_id: u32,
        vrf: VrfId,
        mac: EthernetAddress,
    ) {
        self.calls.lock().unwrap().push(TrafficSeen {
            ip,
            prefix_len,
            interface_id,
            vrf,
            mac,
        });
    }
}

/// Records next-hop notifications.
#[derive(Default)]
pub struct RecordingObserver {
    resolved: Mutex<Vec<(ResolutionKey, EthernetAddress, u32)>>,
    unresolved: Mutex<Vec<ResolutionKey>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(&self) -> Vec<(ResolutionKey, EthernetAddress, u32)> {
        self.resolved.lock().unwrap().clone()
    }

    pub fn unresolved(&self) -> Vec<ResolutionKey> {
        self.unresolved.lock().unwrap().clone()
    }
}

impl NextHopObserver for RecordingObserver {
    fn arp_resolved(&self, key: ResolutionKey, mac: EthernetAddress, interface_id: u32) {
        self.resolved.lock().unwrap().push((key, mac, interface_id));
    }

    fn arp_unresolved(&self, key: ResolutionKey) {
        self.unresolved.lock().unwrap().push(key);
    }
}

/// Timer scheduler that never fires on its own.
///
/// Tests inspect what is armed and feed the events to the handler
/// themselves.
#[derive(Default)]
pub struct ManualTimers {
    next_id: AtomicU64,
    armed: Mutex<BTreeMap<u64, (Duration, ArpEvent)>>,
    cancelled: Mutex<HashSet<u64>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently armed timers in scheduling order.
    pub fn armed(&self) -> Vec<(TimerHandle, Duration, ArpEvent)> {
        self.armed
            .lock()
            .unwrap()
            .iter()
            .map(|(id, (delay, event))| (TimerHandle(*id), *delay, event.clone()))
            .collect()
    }

    pub fn is_cancelled(&self, handle: TimerHandle) -> bool {
        self.cancelled.lock().unwrap().contains(&handle.0)
    }

    /// Disarm every timer and return the events they would have posted.
    pub fn fire_all(&self) -> Vec<ArpEvent> {
        std::mem::take(&mut *self.armed.lock().unwrap())
            .into_values()
            .map(|(_, event)| event)
            .collect()
    }
}

impl TimerScheduler for ManualTimers {
    fn schedule(&self, delay: Duration, event: ArpEvent) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.armed.lock().unwrap().insert(id, (delay, event));
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if self.armed.lock().unwrap().remove(&handle.0).is_some() {
            self.cancelled.lock().unwrap().insert(handle.0);
        }
    }
}
