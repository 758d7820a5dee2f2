//! Orchestrator: owns the pollers and the packet-processing loop.
//!
//! Start order: process index, socket index, connection sync timer, packet
//! source, packet processing timer. Stop order is the reverse: timers first,
//! then the packet source, then the indices. Both are idempotent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::attribution::{Attribution, ProcConManager};
use crate::capture::PacketSource;
use crate::capture::decode::PacketMetadata;
use crate::config::EngineConfig;
use crate::geo::GeoService;
use crate::net::LocalAddrs;
use crate::procs::ProcessIndex;
use crate::registry::RegistryManager;
use crate::sockets::SocketIndex;

/// Downstream consumer of attributed packets. Must not block.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: &PacketMetadata);
}

/// Sink that drops everything; useful when only snapshots are consumed.
pub struct NullSink;

impl PacketSink for NullSink {
    fn deliver(&self, _packet: &PacketMetadata) {}
}

pub struct NetworkAnalyzer {
    config: EngineConfig,
    procs: Arc<ProcessIndex>,
    sockets: Arc<SocketIndex>,
    registry: Arc<RegistryManager>,
    geo: Arc<GeoService>,
    local: Arc<LocalAddrs>,
    sink: Arc<dyn PacketSink>,
    source: Option<PacketSource>,
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkAnalyzer {
    /// Build the full component stack. Must run inside the async runtime
    /// (the geo worker is spawned here).
    pub fn new(config: EngineConfig, sink: Arc<dyn PacketSink>) -> eyre::Result<Self> {
        let local = Arc::new(LocalAddrs::discover()?);
        tracing::debug!(addresses = local.len(), "Discovered local addresses");

        let procs = Arc::new(ProcessIndex::new());
        let sockets = Arc::new(SocketIndex::new(&config));
        let geo = GeoService::new(&config);
        let registry = RegistryManager::new(
            Arc::clone(&procs),
            Arc::clone(&local),
            Some(Arc::clone(&geo)),
        );

        Ok(Self {
            config,
            procs,
            sockets,
            registry,
            geo,
            local,
            sink,
            source: None,
            shutdown: None,
            tasks: Vec::new(),
        })
    }

    pub fn registry(&self) -> Arc<RegistryManager> {
        Arc::clone(&self.registry)
    }

    /// Start capture and all pollers. A second call is a no-op.
    pub async fn start(&mut self, interfaces: &[String]) -> eyre::Result<()> {
        if self.shutdown.is_some() {
            return Ok(());
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        // Process index first so attribution has names from the start.
        let procs = Arc::clone(&self.procs);
        if let Err(e) = tokio::task::spawn_blocking(move || procs.refresh()).await? {
            tracing::warn!("Initial process enumeration failed: {e}");
        }
        self.tasks.push(spawn_process_poll(
            Arc::clone(&self.procs),
            self.config.process_poll_ms,
            shutdown_tx.subscribe(),
        ));

        // Socket index second.
        if let Err(e) = self.sockets.refresh().await {
            tracing::warn!("Initial socket refresh failed: {e}");
        }
        self.tasks.push(spawn_socket_poll(
            Arc::clone(&self.sockets),
            self.config.connection_poll_ms,
            shutdown_tx.subscribe(),
        ));

        // Connection sync timer third. The sync view shares the same indices
        // as the matcher driven by the packet loop.
        let manager = ProcConManager::new(
            Arc::clone(&self.sockets),
            Arc::clone(&self.procs),
            Arc::clone(&self.local),
        );
        let sync_view = ProcConManager::new(
            Arc::clone(&self.sockets),
            Arc::clone(&self.procs),
            Arc::clone(&self.local),
        );
        self.tasks.push(spawn_connection_sync(
            sync_view,
            self.config.connection_sync_ms,
            shutdown_tx.subscribe(),
        ));

        // Packet source fourth.
        let mut source = PacketSource::new();
        source.start(interfaces, &self.config)?;

        // Packet processing timer last.
        let flush_queue = {
            let queue = source.queue_handle();
            move || PacketSource::drain_handle(&queue)
        };
        self.source = Some(source);
        self.tasks.push(spawn_packet_processing(
            manager,
            flush_queue,
            Arc::clone(&self.registry),
            Arc::clone(&self.sink),
            self.config.retry_max,
            self.config.packet_process_ms,
            shutdown_tx.subscribe(),
        ));

        self.shutdown = Some(shutdown_tx);
        tracing::info!("Network analyzer started");
        Ok(())
    }

    /// Stop everything in reverse start order. A second call is a no-op.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };

        // Timers stop first.
        let _ = shutdown.send(());
        for task in self.tasks.drain(..) {
            if task.await.is_err() {
                tracing::warn!("A poller task panicked during shutdown");
            }
        }

        // Then the packet source.
        if let Some(mut source) = self.source.take() {
            source.stop();
        }

        // The indices have no background state of their own; the geo worker
        // drains its queue last.
        self.geo.close().await;
        tracing::info!("Network analyzer stopped");
    }
}

fn spawn_process_poll(
    procs: Arc<ProcessIndex>,
    period_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let procs = Arc::clone(&procs);
                    match tokio::task::spawn_blocking(move || procs.refresh()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!("Process refresh failed, retaining previous snapshot: {e}");
                        }
                        Err(e) => {
                            tracing::warn!("Process refresh task failed: {e}");
                        }
                    }
                }
            }
        }
    })
}

fn spawn_socket_poll(
    sockets: Arc<SocketIndex>,
    period_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Delay on missed ticks keeps refreshes self-serializing: a slow
        // netstat never overlaps the next invocation.
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sockets.refresh().await {
                        tracing::warn!("Socket refresh failed, retaining previous index: {e}");
                    }
                }
            }
        }
    })
}

fn spawn_connection_sync(
    manager: ProcConManager,
    period_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    manager.update_proc_con_info();
                }
            }
        }
    })
}

fn spawn_packet_processing<F>(
    mut manager: ProcConManager,
    flush_queue: F,
    registry: Arc<RegistryManager>,
    sink: Arc<dyn PacketSink>,
    retry_max: u8,
    period_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    F: Fn() -> Vec<PacketMetadata> + Send + 'static,
{
    tokio::spawn(async move {
        let mut retry_queue: VecDeque<PacketMetadata> = VecDeque::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    // Retries first, then the freshly captured packets, so
                    // ordering within a tick follows capture order.
                    let mut batch: Vec<PacketMetadata> = retry_queue.drain(..).collect();
                    batch.extend(flush_queue());

                    for packet in batch {
                        manager.process_packet(packet);
                    }

                    for (packet, attribution) in manager.drain_output() {
                        dispatch(packet, &attribution, &mut retry_queue, retry_max, &registry, sink.as_ref());
                    }
                }
            }
        }
    })
}

/// Route one attributed packet: matched and system packets go straight to the
/// registries and the sink; unknown packets retry up to `retry_max` cycles
/// and are then surfaced with their failure sentinel.
///
/// Frames with no IP family (ARP and other non-IP ethertypes) are delivered
/// but never folded: the registries' family counters partition
/// `total_packets`, and a frame with neither header would break that.
fn dispatch(
    mut packet: PacketMetadata,
    attribution: &Attribution,
    retry_queue: &mut VecDeque<PacketMetadata>,
    retry_max: u8,
    registry: &Arc<RegistryManager>,
    sink: &dyn PacketSink,
) {
    let has_ip_family = packet.ipv4.is_some() || packet.ipv6.is_some();

    match attribution {
        Attribution::Matched { .. } | Attribution::System => {
            if has_ip_family {
                registry.ingest(&mut packet, attribution);
            }
            sink.deliver(&packet);
        }
        Attribution::Unknown(reason) => {
            if packet.retry_count < retry_max {
                packet.retry_count += 1;
                retry_queue.push_back(packet);
            } else {
                packet.proc_name = Some(reason.sentinel().to_string());
                if has_ip_family {
                    registry.ingest(&mut packet, attribution);
                }
                sink.deliver(&packet);
            }
        }
    }
}
