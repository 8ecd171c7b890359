// # Reconciliation Driver
//
// The main loop. Owns the message channels, batches updates, fans
// them to the managers, gates applies on the in-sync sentinel and
// the token-bucket throttle, sequences the apply phases, drives the
// writers in parallel, and reports health and endpoint status
// upstream. There is no cancellation; the loop runs until the
// process exits (or the update channel closes).

pub mod throttle;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::common::AgentConfig;
use crate::error::{DpError, Result};
use crate::ifacemon::{InterfaceEvent, InterfaceMonitor};
use crate::ipsets::IpSetsWriter;
use crate::managers::program_attach::FastPathParams;
use crate::managers::{
    EndpointManager, FailsafeManager, FloatingIpManager, HostIpManager, IpSetsManager,
    ManagerKind, NatManager, OverlayManager, PolicyManager, ProgramAttachManager,
    ServiceLoopManager, SharedIpSetsWriter, SharedRouteWriter, SharedTableWriter,
    WireguardManager,
};
use crate::maps::MapRegistry;
use crate::marks::MarkAllocation;
use crate::proto::{DesiredStateUpdate, StatusUpdate};
use crate::routes::{NetlinkBackend, RouteBackend, RouteTableWriter};
use crate::tables::{standard_writers, ExecBackend, TableBackend, TableWriterOptions};

use throttle::Throttle;

const UPDATE_CHANNEL_DEPTH: usize = 1024;
const STATUS_CHANNEL_DEPTH: usize = 256;
const IFACE_CHANNEL_DEPTH: usize = 256;
const IFACE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The public face of the driver: message in, status out.
pub struct DriverHandle {
    tx: mpsc::Sender<DesiredStateUpdate>,
    status_rx: mpsc::Receiver<StatusUpdate>,
}

impl DriverHandle {
    /// Enqueue a desired-state message into the bounded FIFO.
    pub async fn send(&self, msg: DesiredStateUpdate) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| DpError::ChannelClosed("driver update channel".into()))
    }

    /// Dequeue the next status message; waits until one arrives.
    pub async fn recv(&mut self) -> Option<StatusUpdate> {
        self.status_rx.recv().await
    }
}

pub struct DataplaneDriver {
    config: AgentConfig,
    maps: Arc<MapRegistry>,
    managers: Vec<ManagerKind>,

    table_writers: Vec<SharedTableWriter>,
    ipsets_writer: SharedIpSetsWriter,
    /// Route tables collected from the managers that own them.
    route_syncers: Vec<SharedRouteWriter>,

    rx: mpsc::Receiver<DesiredStateUpdate>,
    iface_rx: mpsc::Receiver<InterfaceEvent>,
    status_tx: mpsc::Sender<StatusUpdate>,

    throttle: Throttle,
    dirty: bool,
    gate_open: bool,
    ready: bool,
    started: Instant,

    ipset_refresh_due: bool,
    route_refresh_due: bool,
    iface_channel_closed: bool,
    next_reschedule: Option<Instant>,
}

impl DataplaneDriver {
    /// Production constructor: real table and netlink backends plus
    /// the polling interface monitor.
    pub fn new(config: AgentConfig) -> Result<(Self, DriverHandle)> {
        let table_backend: Arc<dyn TableBackend> = Arc::new(ExecBackend::new());
        let route_backend: Arc<dyn RouteBackend> = Arc::new(NetlinkBackend::new()?);

        let (iface_tx, iface_rx) = mpsc::channel(IFACE_CHANNEL_DEPTH);
        let monitor = InterfaceMonitor::new(IFACE_POLL_INTERVAL)?;
        tokio::spawn(monitor.run(iface_tx));

        Self::with_backends(config, table_backend, route_backend, iface_rx)
    }

    /// Construction over explicit backends; the seam the tests use.
    pub fn with_backends(
        config: AgentConfig,
        table_backend: Arc<dyn TableBackend>,
        route_backend: Arc<dyn RouteBackend>,
        iface_rx: mpsc::Receiver<InterfaceEvent>,
    ) -> Result<(Self, DriverHandle)> {
        let marks = MarkAllocation::allocate(config.allowed_mark_mask, config.wireguard_enabled)?;
        let maps = Arc::new(MapRegistry::new());

        let writer_options = TableWriterOptions {
            insert_mode: config.rule_insert_mode,
            refresh_interval: config.table_refresh_interval,
            refresh_jitter: config.table_refresh_jitter,
            lock_timeout: config.table_lock_timeout,
            lock_probe_interval: config.table_lock_probe_interval,
        };
        let table_writers: Vec<SharedTableWriter> = standard_writers(table_backend, writer_options)
            .into_iter()
            .map(|w| Arc::new(tokio::sync::Mutex::new(w)))
            .collect();
        let filter = Arc::clone(&table_writers[0]);
        let nat = Arc::clone(&table_writers[1]);
        let mangle = Arc::clone(&table_writers[2]);
        let raw = Arc::clone(&table_writers[3]);

        let ipsets_writer: SharedIpSetsWriter = Arc::new(tokio::sync::Mutex::new(
            IpSetsWriter::new(maps.ip_sets.clone_owned(), config.max_ipset_size),
        ));
        let route_writer: SharedRouteWriter = Arc::new(tokio::sync::Mutex::new(
            RouteTableWriter::new(config.route_table_index, route_backend),
        ));

        let policy_manager = PolicyManager::new(Arc::clone(&filter), marks.accept);
        let policy_repo = policy_manager.repo();

        let managers = vec![
            ManagerKind::Endpoint(EndpointManager::new(
                Arc::clone(&filter),
                Arc::clone(&mangle),
                Arc::clone(&raw),
                Arc::clone(&route_writer),
                Arc::clone(&maps),
                config.workload_iface_prefix.clone(),
                marks.accept,
                marks.endpoint_block,
            )),
            ManagerKind::Policy(policy_manager),
            ManagerKind::IpSets(IpSetsManager::new(Arc::clone(&ipsets_writer))),
            ManagerKind::Nat(NatManager::new(Arc::clone(&nat), Arc::clone(&maps))),
            ManagerKind::FloatingIp(FloatingIpManager::new(Arc::clone(&nat))),
            ManagerKind::Overlay(OverlayManager::new(
                Arc::clone(&route_writer),
                Arc::clone(&maps),
                config.node_name.clone(),
                config.tunnel_iface_name.clone(),
                0,
                config.vxlan_mtu,
            )),
            ManagerKind::HostIps(HostIpManager::new(Arc::clone(&maps))),
            ManagerKind::ServiceLoop(ServiceLoopManager::new(
                Arc::clone(&filter),
                config.service_loop_prevention_cidrs.clone(),
            )),
            ManagerKind::Wireguard(WireguardManager::new(
                Arc::clone(&mangle),
                config.wireguard_enabled,
                marks.crypto,
                &config.node_name,
            )),
            ManagerKind::ProgramAttach(ProgramAttachManager::new(
                config.fastpath_enabled,
                Arc::clone(&maps),
                policy_repo,
                marks,
                FastPathParams {
                    node_name: config.node_name.clone(),
                    workload_iface_prefix: config.workload_iface_prefix.clone(),
                    vxlan_port: config.vxlan_port,
                    vxlan_vni: config.vxlan_vni,
                    tunnel_mtu: config.vxlan_mtu,
                    log_level: config.fastpath_log_level,
                    dsr: config.fastpath_dsr_enabled,
                    connect_time_lb: config.fastpath_connect_time_lb,
                },
            )),
            ManagerKind::Failsafe(FailsafeManager::new(
                Arc::clone(&maps),
                config.failsafe_inbound_ports.clone(),
                config.failsafe_outbound_ports.clone(),
            )),
        ];

        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_DEPTH);
        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_DEPTH);

        let throttle = Throttle::new(config.apply_throttle_capacity);

        let mut route_syncers: Vec<SharedRouteWriter> = Vec::new();
        for manager in &managers {
            for syncer in manager.route_table_syncers() {
                if !route_syncers.iter().any(|s| Arc::ptr_eq(s, &syncer)) {
                    route_syncers.push(syncer);
                }
            }
        }
        drop(route_writer);

        Ok((
            Self {
                config,
                maps,
                managers,
                table_writers,
                ipsets_writer,
                route_syncers,
                rx,
                iface_rx,
                status_tx,
                throttle,
                dirty: false,
                gate_open: false,
                ready: false,
                started: Instant::now(),
                ipset_refresh_due: false,
                route_refresh_due: false,
                iface_channel_closed: false,
                next_reschedule: None,
            },
            DriverHandle { tx, status_rx },
        ))
    }

    pub fn maps(&self) -> Arc<MapRegistry> {
        Arc::clone(&self.maps)
    }

    fn now_ns(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    /// The main loop. Never returns in normal operation; a closed
    /// update channel or a fatal error ends it.
    pub async fn run(mut self) -> Result<()> {
        info!(node = %self.config.node_name, "dataplane driver starting");

        if self.config.debug_simulate_dataplane_hang {
            warn!("debug: simulating dataplane hang for one hour");
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut throttle_ticker = tokio::time::interval(self.config.apply_throttle_refill_interval);
        let mut retry_ticker = tokio::time::interval(self.config.apply_retry_interval);
        let mut ipset_ticker = tokio::time::interval(self.config.ipset_refresh_interval);
        let mut route_ticker = tokio::time::interval(self.config.route_refresh_interval);
        let mut program_ticker = tokio::time::interval(self.config.fastpath_refresh_interval);
        let mut health_ticker = tokio::time::interval(self.config.health_report_interval);
        let mut status_ticker = tokio::time::interval(self.config.status_report_interval);
        // The immediate first tick of every interval would force a
        // full refresh before the first snapshot lands; swallow them.
        throttle_ticker.tick().await;
        retry_ticker.tick().await;
        ipset_ticker.tick().await;
        route_ticker.tick().await;
        program_ticker.tick().await;
        health_ticker.tick().await;
        status_ticker.tick().await;

        loop {
            let reschedule_at = self.next_reschedule;
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(msg) => self.absorb_update_batch(msg),
                    None => {
                        info!("update channel closed, driver exiting");
                        return Ok(());
                    }
                },
                maybe = self.iface_rx.recv(), if !self.iface_channel_closed => {
                    match maybe {
                        Some(event) => self.absorb_iface_batch(event),
                        None => self.iface_channel_closed = true,
                    }
                }
                _ = throttle_ticker.tick() => self.throttle.refill(),
                _ = retry_ticker.tick() => {
                    if self.dirty {
                        debug!("retry tick with dirty dataplane");
                    }
                }
                _ = ipset_ticker.tick() => self.ipset_refresh_due = true,
                _ = route_ticker.tick() => {
                    self.route_refresh_due = true;
                    let swept = self.maps.conntrack.sweep(self.now_ns());
                    if swept > 0 {
                        debug!(swept, "conntrack entries aged out");
                    }
                }
                _ = program_ticker.tick() => {
                    for manager in &mut self.managers {
                        if let ManagerKind::ProgramAttach(attach) = manager {
                            attach.queue_resync();
                        }
                    }
                    self.dirty = true;
                }
                _ = health_ticker.tick() => self.report_health(),
                _ = status_ticker.tick() => self.report_process_status(),
                _ = async {
                    match reschedule_at {
                        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                        None => futures::future::pending().await,
                    }
                } => {
                    self.next_reschedule = None;
                    self.dirty = true;
                }
            }

            if let Err(e) = self.maybe_apply().await {
                if e.is_fatal() {
                    error!("fatal dataplane error: {}", e);
                    let _ = self.status_tx.try_send(StatusUpdate::Health {
                        live: true,
                        ready: false,
                    });
                    return Err(e);
                }
            }
        }
    }

    /// Dispatch one message plus a greedy batch from the same FIFO.
    pub fn absorb_update_batch(&mut self, first: DesiredStateUpdate) {
        let mut count = 1;
        self.dispatch(first);
        while count < self.config.max_batch_size {
            match self.rx.try_recv() {
                Ok(msg) => {
                    self.dispatch(msg);
                    count += 1;
                }
                Err(_) => break,
            }
        }
        debug!(count, "absorbed update batch");
    }

    fn absorb_iface_batch(&mut self, first: InterfaceEvent) {
        let mut count = 1;
        self.dispatch(Self::iface_to_update(first));
        while count < self.config.max_batch_size {
            match self.iface_rx.try_recv() {
                Ok(event) => {
                    self.dispatch(Self::iface_to_update(event));
                    count += 1;
                }
                Err(_) => break,
            }
        }
    }

    fn iface_to_update(event: InterfaceEvent) -> DesiredStateUpdate {
        match event {
            InterfaceEvent::State { name, index, state } => {
                DesiredStateUpdate::InterfaceStateUpdate { name, index, state }
            }
            InterfaceEvent::Addrs { name, addrs } => {
                DesiredStateUpdate::InterfaceAddrsUpdate { name, addrs }
            }
        }
    }

    /// Fan one message to every manager. The in-sync sentinel opens
    /// the apply gate.
    pub fn dispatch(&mut self, msg: DesiredStateUpdate) {
        if matches!(msg, DesiredStateUpdate::InSync) {
            if !self.gate_open {
                info!("in-sync received, dataplane applies enabled");
            }
            self.gate_open = true;
        }
        for manager in &mut self.managers {
            manager.on_update(&msg);
        }
        self.dirty = true;
    }

    /// Apply when gated open, dirty and the throttle admits.
    pub async fn maybe_apply(&mut self) -> Result<()> {
        if !(self.gate_open && self.dirty) {
            return Ok(());
        }
        if !self.throttle.try_acquire() {
            return Ok(());
        }
        let started = Instant::now();
        match self.apply().await {
            Ok(()) => {
                if !self.ready {
                    info!("first dataplane apply succeeded, reporting ready");
                    self.ready = true;
                }
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "apply complete");
                Ok(())
            }
            Err(e) => {
                // Leave dirty set; the retry ticker re-enters apply.
                warn!("dataplane apply failed, will retry: {}", e);
                self.dirty = true;
                Err(e)
            }
        }
    }

    /// The apply phases, in contract order.
    pub async fn apply(&mut self) -> Result<()> {
        // Phase 1: batch resolution, with published messages fanned
        // back through every manager.
        let mut published = Vec::new();
        for manager in &mut self.managers {
            published.extend(manager.resolve_update_batch());
        }
        for msg in &published {
            for manager in &mut self.managers {
                manager.on_update(msg);
            }
        }

        // Phase 2: queue writer operations.
        let mut first_error: Option<DpError> = None;
        for manager in &mut self.managers {
            if let Err(e) = manager.complete_deferred_work().await {
                if e.is_fatal() {
                    return Err(e);
                }
                // One manager's rejection must not block the others.
                error!(manager = manager.name(), "deferred work failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        // Phase 3: propagate refresh flags to the writers.
        if self.ipset_refresh_due {
            self.ipsets_writer.lock().await.queue_resync();
            self.ipset_refresh_due = false;
        }
        if self.route_refresh_due {
            for syncer in &self.route_syncers {
                syncer.lock().await.queue_resync();
            }
            self.route_refresh_due = false;
        }

        // Phase 4: IP-set additions and routes, in parallel.
        let route_applies = self.route_syncers.iter().map(|syncer| {
            let syncer = Arc::clone(syncer);
            async move { syncer.lock().await.apply().await }
        });
        let (ipset_result, route_results) = tokio::join!(
            async { self.ipsets_writer.lock().await.apply_updates() },
            futures::future::join_all(route_applies),
        );
        if let Err(e) = ipset_result {
            first_error.get_or_insert(e);
        }
        for result in route_results {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        // Phase 5: table writers in parallel; combine requested
        // reschedule delays into the earliest.
        let applies = self.table_writers.iter().map(|writer| {
            let writer = Arc::clone(writer);
            async move { writer.lock().await.apply().await }
        });
        let mut earliest: Option<Duration> = None;
        for result in futures::future::join_all(applies).await {
            match result {
                Ok(Some(delay)) => {
                    earliest = Some(match earliest {
                        Some(current) => current.min(delay),
                        None => delay,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        // Phase 6: deferred IP-set deletions, now that no table rule
        // can still reference a removed set.
        if let Err(e) = self.ipsets_writer.lock().await.apply_deletions() {
            first_error.get_or_insert(e);
        }

        // Phase 7: flush pending endpoint status.
        for manager in &mut self.managers {
            for status in manager.take_status_updates() {
                let _ = self.status_tx.try_send(status);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        match earliest {
            Some(delay) => {
                self.next_reschedule = Some(Instant::now() + delay);
                self.dirty = true;
            }
            None => {
                self.dirty = false;
            }
        }
        Ok(())
    }

    fn report_health(&mut self) {
        // Live is unconditional: the loop is visibly turning.
        let _ = self.status_tx.try_send(StatusUpdate::Health {
            live: true,
            ready: self.ready,
        });
    }

    fn report_process_status(&mut self) {
        let _ = self.status_tx.try_send(StatusUpdate::ProcessStatus {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_secs: self.started.elapsed().as_secs(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{
        AdminState, EndpointId, IfaceState, IpSetId, IpSetKind, IpSetMember, Policy, PolicyId,
        Rule, RuleAction, RuleMatch, TierInfo, WorkloadEndpoint,
    };
    use crate::render::TableKind;
    use crate::routes::MemoryRouteBackend;
    use crate::tables::MemoryBackend;
    use std::net::Ipv4Addr;

    struct Fixture {
        driver: DataplaneDriver,
        _handle: DriverHandle,
        tables: Arc<MemoryBackend>,
        routes: Arc<MemoryRouteBackend>,
    }

    fn fixture() -> Fixture {
        let tables = MemoryBackend::new();
        let routes = MemoryRouteBackend::new();
        let (_iface_tx, iface_rx) = mpsc::channel(8);
        let (driver, handle) = DataplaneDriver::with_backends(
            AgentConfig::default(),
            Arc::clone(&tables) as Arc<dyn TableBackend>,
            Arc::clone(&routes) as Arc<dyn RouteBackend>,
            iface_rx,
        )
        .unwrap();
        Fixture {
            driver,
            _handle: handle,
            tables,
            routes,
        }
    }

    fn endpoint() -> WorkloadEndpoint {
        WorkloadEndpoint {
            id: EndpointId("wl1".into()),
            iface_name: "rpl123".into(),
            addresses: vec![Ipv4Addr::new(10, 65, 0, 5)],
            tiers: vec![TierInfo {
                name: "default".into(),
                ingress_policies: vec![PolicyId("p1".into())],
                egress_policies: vec![PolicyId("p1".into())],
            }],
            profiles: vec![],
            admin_state: AdminState::Up,
            expects_encap: false,
            floating_ips: vec![],
        }
    }

    fn policy_with_set(set: &str) -> Policy {
        Policy {
            id: PolicyId("p1".into()),
            inbound_rules: vec![Rule {
                criteria: RuleMatch {
                    src_sets: vec![IpSetId(set.into())],
                    ..Default::default()
                },
                action: RuleAction::Allow,
            }],
            outbound_rules: vec![],
            order: 0,
        }
    }

    #[tokio::test]
    async fn test_gate_blocks_apply_until_in_sync() {
        let mut fx = fixture();
        fx.driver.dispatch(DesiredStateUpdate::WorkloadEndpointUpdate(endpoint()));
        fx.driver.maybe_apply().await.unwrap();
        assert!(fx.tables.chains(TableKind::Filter).is_empty());
        assert!(!fx.driver.ready);

        fx.driver.dispatch(DesiredStateUpdate::InSync);
        fx.driver.maybe_apply().await.unwrap();
        assert!(!fx.tables.chains(TableKind::Filter).is_empty());
        assert!(fx.driver.ready);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_over_kernel_state() {
        let mut fx = fixture();
        fx.driver.dispatch(DesiredStateUpdate::InterfaceStateUpdate {
            name: "rpl123".into(),
            index: 7,
            state: IfaceState::Up,
        });
        fx.driver.dispatch(DesiredStateUpdate::WorkloadEndpointUpdate(endpoint()));
        fx.driver.dispatch(DesiredStateUpdate::InSync);
        fx.driver.apply().await.unwrap();

        let filter_before = fx.tables.chains(TableKind::Filter);
        let routes_before = fx.routes.routes(254);

        // Second apply over unchanged desired state changes nothing.
        fx.driver.apply().await.unwrap();
        assert_eq!(fx.tables.chains(TableKind::Filter), filter_before);
        assert_eq!(fx.routes.routes(254), routes_before);
    }

    #[tokio::test]
    async fn test_set_exists_while_rules_reference_it() {
        let mut fx = fixture();
        fx.driver.dispatch(DesiredStateUpdate::IpSetUpdate {
            id: IpSetId("rpl-s-clients".into()),
            kind: IpSetKind::Addrs,
            members: vec![IpSetMember::Addr(Ipv4Addr::new(1, 1, 1, 1))],
        });
        fx.driver.dispatch(DesiredStateUpdate::PolicyUpdate(policy_with_set(
            "rpl-s-clients",
        )));
        fx.driver.dispatch(DesiredStateUpdate::WorkloadEndpointUpdate(endpoint()));
        fx.driver.dispatch(DesiredStateUpdate::InSync);
        fx.driver.apply().await.unwrap();

        // The rendered rules reference the set and the set exists.
        let chains = fx.tables.chains(TableKind::Filter);
        let referencing: Vec<&String> = chains
            .values()
            .flatten()
            .filter(|r| r.contains("rpl-s-clients"))
            .collect();
        assert!(!referencing.is_empty());
        assert!(fx
            .driver
            .maps()
            .ip_sets
            .get(&IpSetId("rpl-s-clients".into()))
            .is_some());

        // Removing the set and the policy together: after apply, the
        // set is gone and so is every reference.
        fx.driver.dispatch(DesiredStateUpdate::PolicyRemove(PolicyId("p1".into())));
        fx.driver.dispatch(DesiredStateUpdate::IpSetRemove(IpSetId(
            "rpl-s-clients".into(),
        )));
        fx.driver.apply().await.unwrap();

        let chains = fx.tables.chains(TableKind::Filter);
        assert!(!chains.values().flatten().any(|r| r.contains("rpl-s-clients")));
        assert!(fx
            .driver
            .maps()
            .ip_sets
            .get(&IpSetId("rpl-s-clients".into()))
            .is_none());
    }

    #[tokio::test]
    async fn test_throttle_limits_apply_rate() {
        let mut fx = fixture();
        fx.driver.dispatch(DesiredStateUpdate::InSync);

        // Drain the bucket.
        for _ in 0..fx.driver.config.apply_throttle_capacity {
            fx.driver.dirty = true;
            fx.driver.maybe_apply().await.unwrap();
        }
        fx.driver.dirty = true;
        fx.driver.maybe_apply().await.unwrap();
        // Still dirty: the throttle refused the last apply.
        assert!(fx.driver.dirty);

        fx.driver.throttle.refill();
        fx.driver.maybe_apply().await.unwrap();
        assert!(!fx.driver.dirty);
    }

    #[tokio::test]
    async fn test_mark_messages_reach_attach_manager() {
        let mut fx = fixture();
        fx.driver.dispatch(DesiredStateUpdate::InterfaceStateUpdate {
            name: "rpl123".into(),
            index: 7,
            state: IfaceState::Up,
        });
        fx.driver.dispatch(DesiredStateUpdate::HostMetadataUpdate(
            crate::proto::HostMetadata {
                hostname: "node1".into(),
                addresses: vec![Ipv4Addr::new(172, 16, 0, 1)],
                tunnel_addr: None,
                tunnel_mac: None,
                pod_cidrs: vec![],
            },
        ));
        fx.driver.dispatch(DesiredStateUpdate::WorkloadEndpointUpdate(endpoint()));
        fx.driver.dispatch(DesiredStateUpdate::InSync);
        fx.driver.apply().await.unwrap();

        let attached = fx
            .driver
            .managers
            .iter()
            .find_map(|m| match m {
                ManagerKind::ProgramAttach(attach) => Some(attach.attachment_count()),
                _ => None,
            })
            .unwrap();
        assert_eq!(attached, 1);
    }
}
