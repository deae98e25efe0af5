//! Ready-made ARP context for tests.
//!
//! Topology:
//! - fabric VRF (id 1) with the physical fabric interface `eth0` (id 1)
//! - `vrf-red` (id 2) with the VM interface `tap3` (id 3), service address
//!   10.0.0.2 and allowed-address-pair block 10.0.0.4/30

use ipnet::Ipv4Net;
use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::{ArpConfig, DEFAULT_FABRIC_VRF};
use crate::context::{ArpContext, Collaborators};
use crate::handler::ArpHandler;
use crate::oper::{
    Interface, InterfaceKind, InterfaceRef, InterfaceTable, NextHop, Route, Vrf, VrfRef, VrfTable,
};

use super::fakes::{ManualTimers, RecordingObserver, RecordingRoutePreference, RecordingTransport};

pub const ROUTER_ID: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);
pub const FABRIC_VRF_ID: u32 = 1;
pub const RED_VRF_ID: u32 = 2;
pub const FABRIC_IF_ID: u32 = 1;
pub const VM_IF_ID: u32 = 3;
pub const FABRIC_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const TAP_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x03]);
pub const VM_MAC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x03]);
pub const SERVICE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// ARP context wired to recording fakes.
pub struct Fixture {
    pub ctx: ArpContext,
    pub interfaces: Arc<InterfaceTable>,
    pub vrfs: Arc<VrfTable>,
    pub transport: Arc<RecordingTransport>,
    pub route_preference: Arc<RecordingRoutePreference>,
    pub observer: Arc<RecordingObserver>,
    pub timers: Arc<ManualTimers>,
    pub fabric_vrf: VrfRef,
    pub vrf: VrfRef,
    pub fabric_if: InterfaceRef,
    pub vm_if: InterfaceRef,
}

impl Fixture {
    pub fn new() -> Self {
        let config = ArpConfig {
            router_id: ROUTER_ID,
            ..ArpConfig::default()
        };

        let vrfs = Arc::new(VrfTable::new());
        let (fabric_vrf, _) = vrfs.insert(Vrf::new(FABRIC_VRF_ID, DEFAULT_FABRIC_VRF));
        let (vrf, _) = vrfs.insert(Vrf::new(RED_VRF_ID, "vrf-red"));

        let interfaces = Arc::new(InterfaceTable::new());
        let (fabric_if, _) = interfaces.register(
            Interface::new(FABRIC_IF_ID, "eth0", InterfaceKind::Physical, FABRIC_MAC)
                .with_vrf(Arc::clone(&fabric_vrf)),
        );
        let (vm_if, _) = interfaces.register(
            Interface::new(VM_IF_ID, "tap3", InterfaceKind::VmInterface, TAP_MAC)
                .with_vrf(Arc::clone(&vrf))
                .with_service_ip(SERVICE_IP)
                .with_vm_mac(VM_MAC)
                .with_aap_prefix(Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 4), 30).unwrap()),
        );

        let transport = Arc::new(RecordingTransport::new());
        let route_preference = Arc::new(RecordingRoutePreference::new());
        let observer = Arc::new(RecordingObserver::new());
        let timers = Arc::new(ManualTimers::new());

        let ctx = build_context(
            config,
            &interfaces,
            &vrfs,
            &transport,
            &route_preference,
            &observer,
            &timers,
        );

        Fixture {
            ctx,
            interfaces,
            vrfs,
            transport,
            route_preference,
            observer,
            timers,
            fabric_vrf,
            vrf,
            fabric_if,
            vm_if,
        }
    }

    /// Rebuild the context with a modified configuration.
    pub fn with_config(mut self, update: impl FnOnce(&mut ArpConfig)) -> Self {
        let mut config = self.ctx.config().clone();
        update(&mut config);
        let fabric = self.ctx.ip_fabric_interface();
        self.ctx = build_context(
            config,
            &self.interfaces,
            &self.vrfs,
            &self.transport,
            &self.route_preference,
            &self.observer,
            &self.timers,
        );
        self.ctx.set_ip_fabric_interface(fabric);
        self
    }

    pub fn handler(&self) -> ArpHandler<'_> {
        ArpHandler::new(&self.ctx)
    }

    /// Route `prefix` in `vrf-red` through a resolve next-hop on
    /// `interface_id`.
    pub fn add_resolve_route(&self, prefix: &str, interface_id: u32) {
        self.vrf.add_route(Route::unicast(
            prefix.parse().unwrap(),
            NextHop::Resolve { interface_id },
        ));
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

fn build_context(
    config: ArpConfig,
    interfaces: &Arc<InterfaceTable>,
    vrfs: &Arc<VrfTable>,
    transport: &Arc<RecordingTransport>,
    route_preference: &Arc<RecordingRoutePreference>,
    observer: &Arc<RecordingObserver>,
    timers: &Arc<ManualTimers>,
) -> ArpContext {
    let ctx = ArpContext::new(
        config,
        Arc::clone(interfaces),
        Arc::clone(vrfs),
        Collaborators {
            transport: transport.clone(),
            route_preference: route_preference.clone(),
            observer: observer.clone(),
            timers: timers.clone(),
        },
    );
    ctx.set_ip_fabric_interface(Some(FABRIC_IF_ID));
    ctx
}
