//! Partitioned ARP workers.
//!
//! Work is routed by the address being resolved, so all packets, timer
//! expiries and control events for one key land on the same worker and are
//! processed in arrival order. Different partitions run in parallel.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ArpConfig;
use crate::context::{ArpContext, Collaborators, NextHopObserver, PacketTransport, RoutePreference};
use crate::error::ServiceError;
use crate::event::ArpEvent;
use crate::handler::ArpHandler;
use crate::oper::{InterfaceTable, VrfId, VrfTable};
use crate::stats::StatsSnapshot;
use crate::timer::{EventSink, TokioTimers};
use crate::wire;

/// Unit of work queued to a worker.
#[derive(Debug)]
pub enum WorkItem {
    Packet {
        data: Vec<u8>,
        interface: u32,
        vrf: VrfId,
    },
    Event(ArpEvent),
    Shutdown,
}

/// Routes work items to partition queues.
#[derive(Clone)]
pub struct Dispatcher {
    partitions: Vec<mpsc::UnboundedSender<WorkItem>>,
}

impl Dispatcher {
    /// Create `partitions` queues (at least one).
    pub fn new(partitions: usize) -> (Self, Vec<mpsc::UnboundedReceiver<WorkItem>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions.max(1))
            .map(|_| mpsc::unbounded_channel::<WorkItem>())
            .unzip();
        (
            Dispatcher {
                partitions: senders,
            },
            receivers,
        )
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Partition owning `addr`. Work without an address goes to the first.
    pub fn partition_for(&self, addr: Option<Ipv4Addr>) -> usize {
        addr.map_or(0, |addr| u32::from(addr) as usize % self.partitions.len())
    }

    /// Queue an inbound frame on the partition of the address it resolves.
    ///
    /// Frames that do not parse are still queued so the handler counts them.
    pub fn submit_packet(
        &self,
        data: Vec<u8>,
        interface: u32,
        vrf: VrfId,
    ) -> Result<(), ServiceError> {
        let target = wire::parse_frame(&data)
            .ok()
            .map(|frame| frame.resolution_target());
        self.send(
            self.partition_for(target),
            WorkItem::Packet {
                data,
                interface,
                vrf,
            },
        )
    }

    pub fn submit_event(&self, event: ArpEvent) -> Result<(), ServiceError> {
        self.send(
            self.partition_for(event.partition_addr()),
            WorkItem::Event(event),
        )
    }

    fn send(&self, partition: usize, item: WorkItem) -> Result<(), ServiceError> {
        self.partitions[partition]
            .send(item)
            .map_err(|_| ServiceError::Stopped)
    }

    fn shutdown(&self) {
        for partition in &self.partitions {
            let _ = partition.send(WorkItem::Shutdown);
        }
    }
}

impl EventSink for Dispatcher {
    fn post(&self, event: ArpEvent) {
        if let Err(error) = self.submit_event(event) {
            debug!("Dropping timer event: {}", error);
        }
    }
}

/// Running ARP subsystem.
pub struct ArpService {
    ctx: Arc<ArpContext>,
    dispatcher: Dispatcher,
    timers: Arc<TokioTimers>,
    workers: Vec<JoinHandle<()>>,
}

impl ArpService {
    /// Validate `config` and spawn the workers on the current runtime.
    pub fn start(
        config: ArpConfig,
        interfaces: Arc<InterfaceTable>,
        vrfs: Arc<VrfTable>,
        transport: Arc<dyn PacketTransport>,
        route_preference: Arc<dyn RoutePreference>,
        observer: Arc<dyn NextHopObserver>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let (dispatcher, receivers) = Dispatcher::new(config.partitions);
        let timers = Arc::new(TokioTimers::new(Arc::new(dispatcher.clone())));
        let ctx = Arc::new(ArpContext::new(
            config,
            interfaces,
            vrfs,
            Collaborators {
                transport,
                route_preference,
                observer,
                timers: timers.clone(),
            },
        ));

        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, rx)| tokio::spawn(run_worker(partition, Arc::clone(&ctx), rx)))
            .collect();

        info!(
            partitions = dispatcher.partitions(),
            shards = ctx.registry().shard_count(),
            "ARP service started"
        );

        Ok(ArpService {
            ctx,
            dispatcher,
            timers,
            workers,
        })
    }

    pub fn context(&self) -> &Arc<ArpContext> {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Enable processing once the IP fabric interface is known.
    pub fn set_ip_fabric_interface(&self, interface_id: Option<u32>) {
        self.ctx.set_ip_fabric_interface(interface_id);
    }

    pub fn submit_packet(
        &self,
        data: Vec<u8>,
        interface: u32,
        vrf: VrfId,
    ) -> Result<(), ServiceError> {
        self.dispatcher.submit_packet(data, interface, vrf)
    }

    pub fn submit_event(&self, event: ArpEvent) -> Result<(), ServiceError> {
        self.dispatcher.submit_event(event)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats().snapshot()
    }

    /// Stop all timers and workers. Queued work ahead of the stop request is
    /// still processed.
    pub async fn shutdown(self) {
        self.timers.cancel_all();
        self.dispatcher.shutdown();
        for worker in self.workers {
            if let Err(error) = worker.await {
                warn!("ARP worker failed: {}", error);
            }
        }
        self.timers.cancel_all();
        info!("ARP service stopped");
    }
}

async fn run_worker(
    partition: usize,
    ctx: Arc<ArpContext>,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
) {
    debug!(partition, "ARP worker started");
    let handler = ArpHandler::new(&ctx);
    while let Some(item) = rx.recv().await {
        match item {
            WorkItem::Packet {
                data,
                interface,
                vrf,
            } => {
                handler.handle_packet(&data, interface, vrf);
            }
            WorkItem::Event(event) => {
                handler.handle_internal_event(event);
            }
            WorkItem::Shutdown => break,
        }
    }
    debug!(partition, "ARP worker stopped");
}
