// # Endpoint Manager
//
// Owns the per-endpoint filter and mangle chains, the endpoint-mark
// lifecycle, the per-endpoint routes (kernel table and route map)
// and endpoint status reporting. Mark assignment happens in the
// batch-resolution phase and is announced to the attachment manager
// by publishing messages back through the driver.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::managers::{Manager, SharedRouteWriter, SharedTableWriter};
use crate::maps::{MapRegistry, RouteValue};
use crate::marks::EndpointMarkAllocator;
use crate::proto::{
    AdminState, DesiredStateUpdate, EndpointId, EndpointState, HostEndpoint, IfaceState, IpNet,
    StatusUpdate, WorkloadEndpoint,
};
use crate::render::{self, Chain, MatchCriterion, RenderedRule, RuleVerb};
use crate::routes::RouteTarget;

pub const FROM_ENDPOINT_DISPATCH: &str = "rpl-from-endpoint";
pub const TO_ENDPOINT_DISPATCH: &str = "rpl-to-endpoint";
pub const SET_ENDPOINT_MARK: &str = "rpl-set-endpoint-mark";
pub const RPF_CHAIN: &str = "rpl-raw-rpf";

pub struct EndpointManager {
    filter: SharedTableWriter,
    mangle: SharedTableWriter,
    raw: SharedTableWriter,
    route_writer: SharedRouteWriter,
    maps: Arc<MapRegistry>,

    workload_iface_prefix: String,
    accept_mark: u32,
    endpoint_mark_mask: u32,
    mark_alloc: EndpointMarkAllocator,
    marks: HashMap<EndpointId, u32>,

    workloads: HashMap<EndpointId, WorkloadEndpoint>,
    host_eps: HashMap<EndpointId, HostEndpoint>,
    iface_index: HashMap<String, u32>,
    iface_state: HashMap<String, IfaceState>,

    dirty: BTreeSet<EndpointId>,
    removed: HashMap<EndpointId, WorkloadEndpoint>,
    removed_host: BTreeSet<EndpointId>,
    dispatch_dirty: bool,
    status_queue: Vec<StatusUpdate>,
}

impl EndpointManager {
    pub fn new(
        filter: SharedTableWriter,
        mangle: SharedTableWriter,
        raw: SharedTableWriter,
        route_writer: SharedRouteWriter,
        maps: Arc<MapRegistry>,
        workload_iface_prefix: String,
        accept_mark: u32,
        endpoint_mark_block: u32,
    ) -> Self {
        Self {
            filter,
            mangle,
            raw,
            route_writer,
            maps,
            workload_iface_prefix,
            accept_mark,
            endpoint_mark_mask: endpoint_mark_block,
            mark_alloc: EndpointMarkAllocator::new(endpoint_mark_block),
            marks: HashMap::new(),
            workloads: HashMap::new(),
            host_eps: HashMap::new(),
            iface_index: HashMap::new(),
            iface_state: HashMap::new(),
            dirty: BTreeSet::new(),
            removed: HashMap::new(),
            removed_host: BTreeSet::new(),
            dispatch_dirty: false,
            status_queue: Vec::new(),
        }
    }

    pub fn chain_names(id: &EndpointId) -> (String, String) {
        (
            render::chain_name("fw", &id.0),
            render::chain_name("tw", &id.0),
        )
    }

    fn host_chain_names(id: &EndpointId) -> (String, String) {
        (
            render::chain_name("fh", &id.0),
            render::chain_name("th", &id.0),
        )
    }

    fn endpoint_state(&self, endpoint: &WorkloadEndpoint) -> EndpointState {
        if endpoint.admin_state == AdminState::Down {
            return EndpointState::Down;
        }
        match self.iface_state.get(&endpoint.iface_name) {
            Some(IfaceState::Down) => EndpointState::Down,
            _ => EndpointState::Up,
        }
    }

    /// The policy walk for one direction of one endpoint: jump to
    /// each tier's chains, honor the accept mark, default deny.
    fn render_workload_chain(&self, endpoint: &WorkloadEndpoint, ingress: bool) -> Chain {
        let (from_name, to_name) = Self::chain_names(&endpoint.id);
        let name = if ingress { to_name } else { from_name };
        let mut chain = Chain::new(name);

        if endpoint.admin_state == AdminState::Down {
            chain.rules.push(
                RenderedRule::new(vec![], RuleVerb::Drop).with_comment("endpoint admin down"),
            );
            return chain;
        }

        chain.rules.push(RenderedRule::new(
            vec![MatchCriterion::CtStateEstablished],
            RuleVerb::Accept,
        ));

        for tier in &endpoint.tiers {
            let ids = if ingress {
                &tier.ingress_policies
            } else {
                &tier.egress_policies
            };
            for policy_id in ids {
                let (pi, po) = crate::managers::policy::PolicyManager::chain_names(policy_id);
                chain.rules.push(RenderedRule::new(
                    vec![],
                    RuleVerb::Jump(if ingress { pi } else { po }),
                ));
            }
            chain.rules.push(RenderedRule::new(
                vec![MatchCriterion::Mark {
                    mark: self.accept_mark,
                    mask: self.accept_mark,
                }],
                RuleVerb::Accept,
            ));
        }

        for profile_id in &endpoint.profiles {
            let (pi, po) = crate::managers::policy::PolicyManager::chain_names(profile_id);
            chain.rules.push(RenderedRule::new(
                vec![],
                RuleVerb::Jump(if ingress { pi } else { po }),
            ));
        }
        chain.rules.push(RenderedRule::new(
            vec![MatchCriterion::Mark {
                mark: self.accept_mark,
                mask: self.accept_mark,
            }],
            RuleVerb::Accept,
        ));

        chain
            .rules
            .push(RenderedRule::new(vec![], RuleVerb::Drop).with_comment("default deny"));
        chain
    }

    fn render_host_chain(&self, endpoint: &HostEndpoint, ingress: bool) -> Chain {
        let (from_name, to_name) = Self::host_chain_names(&endpoint.id);
        let name = if ingress { to_name } else { from_name };
        let mut chain = Chain::new(name);

        chain.rules.push(RenderedRule::new(
            vec![MatchCriterion::CtStateEstablished],
            RuleVerb::Accept,
        ));
        for tier in &endpoint.tiers {
            let ids = if ingress {
                &tier.ingress_policies
            } else {
                &tier.egress_policies
            };
            for policy_id in ids {
                let (pi, po) = crate::managers::policy::PolicyManager::chain_names(policy_id);
                chain.rules.push(RenderedRule::new(
                    vec![],
                    RuleVerb::Jump(if ingress { pi } else { po }),
                ));
            }
            chain.rules.push(RenderedRule::new(
                vec![MatchCriterion::Mark {
                    mark: self.accept_mark,
                    mask: self.accept_mark,
                }],
                RuleVerb::Accept,
            ));
        }
        // Host endpoints end open: no-match means allow.
        chain
            .rules
            .push(RenderedRule::new(vec![], RuleVerb::Accept).with_comment("host default allow"));
        chain
    }

    fn render_dispatch_chains(&self) -> Vec<Chain> {
        let mut from_dispatch = Chain::new(FROM_ENDPOINT_DISPATCH);
        let mut to_dispatch = Chain::new(TO_ENDPOINT_DISPATCH);
        let mut mark_chain = Chain::new(SET_ENDPOINT_MARK);

        let mut workloads: Vec<&WorkloadEndpoint> = self.workloads.values().collect();
        workloads.sort_by(|a, b| a.id.cmp(&b.id));

        for endpoint in workloads {
            let (fw, tw) = Self::chain_names(&endpoint.id);
            from_dispatch.rules.push(RenderedRule::new(
                vec![MatchCriterion::InIface(endpoint.iface_name.clone())],
                RuleVerb::Goto(fw),
            ));
            to_dispatch.rules.push(RenderedRule::new(
                vec![MatchCriterion::OutIface(endpoint.iface_name.clone())],
                RuleVerb::Goto(tw),
            ));
            if let Some(mark) = self.marks.get(&endpoint.id) {
                mark_chain.rules.push(RenderedRule::new(
                    vec![MatchCriterion::InIface(endpoint.iface_name.clone())],
                    RuleVerb::SetMark {
                        mark: *mark,
                        mask: self.endpoint_mark_mask,
                    },
                ));
            }
        }

        from_dispatch.rules.push(
            RenderedRule::new(vec![], RuleVerb::Drop).with_comment("unknown endpoint interface"),
        );
        to_dispatch.rules.push(
            RenderedRule::new(vec![], RuleVerb::Drop).with_comment("unknown endpoint interface"),
        );

        vec![from_dispatch, to_dispatch, mark_chain]
    }

    /// Early source validation for workload interfaces: a packet may
    /// only carry one of its endpoint's own addresses.
    fn render_rpf_chain(&self) -> Chain {
        let mut chain = Chain::new(RPF_CHAIN);
        let mut workloads: Vec<&WorkloadEndpoint> = self.workloads.values().collect();
        workloads.sort_by(|a, b| a.id.cmp(&b.id));

        for endpoint in &workloads {
            for addr in &endpoint.addresses {
                chain.rules.push(RenderedRule::new(
                    vec![
                        MatchCriterion::InIface(endpoint.iface_name.clone()),
                        MatchCriterion::SrcNet(IpNet::host(*addr)),
                    ],
                    RuleVerb::Return,
                ));
            }
        }
        for endpoint in &workloads {
            chain.rules.push(
                RenderedRule::new(
                    vec![MatchCriterion::InIface(endpoint.iface_name.clone())],
                    RuleVerb::Drop,
                )
                .with_comment("rpf"),
            );
        }
        chain
    }
}

#[async_trait]
impl Manager for EndpointManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        match msg {
            DesiredStateUpdate::WorkloadEndpointUpdate(endpoint) => {
                self.removed.remove(&endpoint.id);
                self.workloads.insert(endpoint.id.clone(), endpoint.clone());
                self.dirty.insert(endpoint.id.clone());
                self.dispatch_dirty = true;
            }
            DesiredStateUpdate::WorkloadEndpointRemove(id) => {
                if let Some(endpoint) = self.workloads.remove(id) {
                    self.dirty.remove(id);
                    self.removed.insert(id.clone(), endpoint);
                    self.dispatch_dirty = true;
                }
            }
            DesiredStateUpdate::HostEndpointUpdate(endpoint) => {
                self.removed_host.remove(&endpoint.id);
                self.host_eps.insert(endpoint.id.clone(), endpoint.clone());
                self.dirty.insert(endpoint.id.clone());
            }
            DesiredStateUpdate::HostEndpointRemove(id) => {
                if self.host_eps.remove(id).is_some() {
                    self.dirty.remove(id);
                    self.removed_host.insert(id.clone());
                }
            }
            DesiredStateUpdate::PolicyUpdate(policy) | DesiredStateUpdate::ProfileUpdate(policy) => {
                // Endpoints referencing this policy re-render so new
                // chain references appear atomically with the policy.
                let id = &policy.id;
                for (ep_id, endpoint) in &self.workloads {
                    let referenced = endpoint
                        .tiers
                        .iter()
                        .any(|t| t.ingress_policies.contains(id) || t.egress_policies.contains(id))
                        || endpoint.profiles.contains(id);
                    if referenced {
                        self.dirty.insert(ep_id.clone());
                    }
                }
            }
            DesiredStateUpdate::InterfaceStateUpdate { name, index, state } => {
                self.iface_index.insert(name.clone(), *index);
                let previous = self.iface_state.insert(name.clone(), *state);
                if previous != Some(*state) {
                    for (id, endpoint) in &self.workloads {
                        if &endpoint.iface_name == name {
                            self.dirty.insert(id.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn resolve_update_batch(&mut self) -> Vec<DesiredStateUpdate> {
        let mut published = Vec::new();

        // Release marks for departed endpoints first so a same-batch
        // create can reuse them.
        let removed_ids: Vec<EndpointId> = self.removed.keys().cloned().collect();
        for id in removed_ids {
            if let Some(mark) = self.marks.remove(&id) {
                self.mark_alloc.release(mark);
                let iface = self.removed.get(&id).map(|e| e.iface_name.clone()).unwrap_or_default();
                published.push(DesiredStateUpdate::EndpointMarkReleased {
                    id,
                    iface_name: iface,
                });
            }
        }

        let mut ids: Vec<EndpointId> = self
            .workloads
            .keys()
            .filter(|id| !self.marks.contains_key(*id))
            .cloned()
            .collect();
        ids.sort();
        for id in ids {
            match self.mark_alloc.assign() {
                Ok(mark) => {
                    self.marks.insert(id.clone(), mark);
                    self.dispatch_dirty = true;
                    let iface = self.workloads[&id].iface_name.clone();
                    published.push(DesiredStateUpdate::EndpointMarkAssigned {
                        id,
                        iface_name: iface,
                        mark,
                    });
                }
                Err(e) => {
                    warn!(endpoint = %id, "cannot assign endpoint mark: {}", e);
                    self.status_queue.push(StatusUpdate::EndpointStatus {
                        id,
                        state: EndpointState::Error,
                    });
                }
            }
        }

        published
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        let removed = std::mem::take(&mut self.removed);
        let removed_host = std::mem::take(&mut self.removed_host);
        let dirty = std::mem::take(&mut self.dirty);

        {
            let mut filter = self.filter.lock().await;
            let mut route_writer = self.route_writer.lock().await;

            for (id, endpoint) in &removed {
                debug!(endpoint = %id, "tearing down endpoint");
                let (fw, tw) = Self::chain_names(id);
                filter.remove_chain_by_name(&fw);
                filter.remove_chain_by_name(&tw);
                for addr in &endpoint.addresses {
                    route_writer.delete_route(IpNet::host(*addr));
                    self.maps.routes.remove(IpNet::host(*addr));
                }
                // Dataplane programming outlives the rules; conntrack
                // state for the endpoint does not.
                self.maps.conntrack.flush_for_addrs(&endpoint.addresses);
                self.status_queue.push(StatusUpdate::EndpointStatus {
                    id: id.clone(),
                    state: EndpointState::Down,
                });
            }
            for id in &removed_host {
                let (fh, th) = Self::host_chain_names(id);
                filter.remove_chain_by_name(&fh);
                filter.remove_chain_by_name(&th);
            }

            for id in &dirty {
                if let Some(endpoint) = self.workloads.get(id) {
                    filter.update_chains(vec![
                        self.render_workload_chain(endpoint, false),
                        self.render_workload_chain(endpoint, true),
                    ]);
                    let ifindex = self.iface_index.get(&endpoint.iface_name).copied();
                    for addr in &endpoint.addresses {
                        if let Some(ifindex) = ifindex {
                            route_writer
                                .upsert_route(IpNet::host(*addr), RouteTarget::device(ifindex));
                            self.maps
                                .routes
                                .insert(IpNet::host(*addr), RouteValue::local_workload(ifindex));
                        }
                    }
                    self.status_queue.push(StatusUpdate::EndpointStatus {
                        id: id.clone(),
                        state: self.endpoint_state(endpoint),
                    });
                } else if let Some(endpoint) = self.host_eps.get(id) {
                    filter.update_chains(vec![
                        self.render_host_chain(endpoint, false),
                        self.render_host_chain(endpoint, true),
                    ]);
                }
            }

            if self.dispatch_dirty {
                let mut chains = self.render_dispatch_chains();
                let mark_chain = chains.pop().expect("three dispatch chains");
                filter.update_chains(chains);
                filter.insert_or_append_rules(
                    "FORWARD",
                    vec![
                        RenderedRule::new(
                            vec![MatchCriterion::InIface(format!(
                                "{}+",
                                self.workload_iface_prefix
                            ))],
                            RuleVerb::Jump(FROM_ENDPOINT_DISPATCH.to_string()),
                        ),
                        RenderedRule::new(
                            vec![MatchCriterion::OutIface(format!(
                                "{}+",
                                self.workload_iface_prefix
                            ))],
                            RuleVerb::Jump(TO_ENDPOINT_DISPATCH.to_string()),
                        ),
                    ],
                );

                let mut mangle = self.mangle.lock().await;
                mangle.update_chain(mark_chain);
                mangle.insert_or_append_rules(
                    "PREROUTING",
                    vec![RenderedRule::new(
                        vec![MatchCriterion::InIface(format!(
                            "{}+",
                            self.workload_iface_prefix
                        ))],
                        RuleVerb::Jump(SET_ENDPOINT_MARK.to_string()),
                    )],
                );
                drop(mangle);

                let mut raw = self.raw.lock().await;
                raw.update_chain(self.render_rpf_chain());
                raw.insert_or_append_rules(
                    "PREROUTING",
                    vec![RenderedRule::new(
                        vec![MatchCriterion::InIface(format!(
                            "{}+",
                            self.workload_iface_prefix
                        ))],
                        RuleVerb::Jump(RPF_CHAIN.to_string()),
                    )],
                );
                self.dispatch_dirty = false;
            }
        }

        Ok(())
    }

    fn route_table_syncers(&self) -> Vec<SharedRouteWriter> {
        vec![Arc::clone(&self.route_writer)]
    }

    fn take_status_updates(&mut self) -> Vec<StatusUpdate> {
        std::mem::take(&mut self.status_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::TierInfo;
    use crate::render::TableKind;
    use crate::routes::{MemoryRouteBackend, RouteBackend, RouteTableWriter};
    use crate::tables::{MemoryBackend, TableBackend, TableWriter, TableWriterOptions};
    use std::net::Ipv4Addr;

    struct Fixture {
        mgr: EndpointManager,
        filter_backend: Arc<MemoryBackend>,
        route_backend: Arc<MemoryRouteBackend>,
    }

    fn fixture() -> Fixture {
        let filter_backend = MemoryBackend::new();
        let other_backend = MemoryBackend::new();
        let route_backend = MemoryRouteBackend::new();
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let filter = Arc::new(tokio::sync::Mutex::new(TableWriter::new(
            TableKind::Filter,
            Arc::clone(&filter_backend) as Arc<dyn TableBackend>,
            Arc::clone(&lock),
            TableWriterOptions::default(),
        )));
        let mangle = Arc::new(tokio::sync::Mutex::new(TableWriter::new(
            TableKind::Mangle,
            Arc::clone(&other_backend) as Arc<dyn TableBackend>,
            Arc::clone(&lock),
            TableWriterOptions::default(),
        )));
        let raw = Arc::new(tokio::sync::Mutex::new(TableWriter::new(
            TableKind::Raw,
            other_backend as Arc<dyn TableBackend>,
            lock,
            TableWriterOptions::default(),
        )));
        let route_writer = Arc::new(tokio::sync::Mutex::new(RouteTableWriter::new(
            254,
            Arc::clone(&route_backend) as Arc<dyn RouteBackend>,
        )));
        let mgr = EndpointManager::new(
            filter,
            mangle,
            raw,
            route_writer,
            Arc::new(MapRegistry::new()),
            "rpl".to_string(),
            0x10,
            0x0000_ff00,
        );
        Fixture {
            mgr,
            filter_backend,
            route_backend,
        }
    }

    fn endpoint(name: &str, iface: &str, addr: Ipv4Addr) -> WorkloadEndpoint {
        WorkloadEndpoint {
            id: EndpointId(name.to_string()),
            iface_name: iface.to_string(),
            addresses: vec![addr],
            tiers: vec![TierInfo {
                name: "default".into(),
                ingress_policies: vec![crate::proto::PolicyId("p1".into())],
                egress_policies: vec![],
            }],
            profiles: vec![],
            admin_state: AdminState::Up,
            expects_encap: false,
            floating_ips: vec![],
        }
    }

    async fn apply_all(fx: &mut Fixture) {
        fx.mgr.complete_deferred_work().await.unwrap();
        fx.mgr.filter.lock().await.apply().await.unwrap();
        fx.mgr.route_writer.lock().await.apply().await.unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_lifecycle_programs_and_tears_down() {
        let mut fx = fixture();
        let ep = endpoint("wl1", "rpl123", Ipv4Addr::new(10, 65, 0, 5));
        fx.mgr.on_update(&DesiredStateUpdate::InterfaceStateUpdate {
            name: "rpl123".into(),
            index: 7,
            state: IfaceState::Up,
        });
        fx.mgr
            .on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(ep.clone()));
        let published = fx.mgr.resolve_update_batch();
        assert!(matches!(
            published[0],
            DesiredStateUpdate::EndpointMarkAssigned { .. }
        ));
        apply_all(&mut fx).await;

        let (fw, tw) = EndpointManager::chain_names(&ep.id);
        let chains = fx.filter_backend.chains(TableKind::Filter);
        assert!(chains.contains_key(&fw));
        assert!(chains.contains_key(&tw));
        assert!(chains.contains_key(FROM_ENDPOINT_DISPATCH));
        assert_eq!(fx.route_backend.routes(254).len(), 1);
        assert!(fx
            .mgr
            .maps
            .routes
            .lookup(Ipv4Addr::new(10, 65, 0, 5))
            .is_some());

        fx.mgr
            .on_update(&DesiredStateUpdate::WorkloadEndpointRemove(ep.id.clone()));
        let published = fx.mgr.resolve_update_batch();
        assert!(matches!(
            published[0],
            DesiredStateUpdate::EndpointMarkReleased { .. }
        ));
        apply_all(&mut fx).await;

        let chains = fx.filter_backend.chains(TableKind::Filter);
        assert!(!chains.contains_key(&fw));
        assert!(fx.route_backend.routes(254).is_empty());
        assert!(fx
            .mgr
            .maps
            .routes
            .lookup(Ipv4Addr::new(10, 65, 0, 5))
            .is_none());
    }

    #[tokio::test]
    async fn test_status_reflects_admin_and_iface_state() {
        let mut fx = fixture();
        let mut ep = endpoint("wl1", "rpl123", Ipv4Addr::new(10, 65, 0, 5));
        fx.mgr
            .on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(ep.clone()));
        fx.mgr.resolve_update_batch();
        fx.mgr.complete_deferred_work().await.unwrap();
        let statuses = fx.mgr.take_status_updates();
        assert!(statuses.contains(&StatusUpdate::EndpointStatus {
            id: ep.id.clone(),
            state: EndpointState::Up,
        }));

        ep.admin_state = AdminState::Down;
        fx.mgr
            .on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(ep.clone()));
        fx.mgr.complete_deferred_work().await.unwrap();
        let statuses = fx.mgr.take_status_updates();
        assert!(statuses.contains(&StatusUpdate::EndpointStatus {
            id: ep.id,
            state: EndpointState::Down,
        }));
    }

    #[tokio::test]
    async fn test_marks_are_unique_and_recycled() {
        let mut fx = fixture();
        for i in 0..3 {
            fx.mgr.on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(endpoint(
                &format!("wl{}", i),
                &format!("rpl{}", i),
                Ipv4Addr::new(10, 65, 0, i as u8 + 1),
            )));
        }
        fx.mgr.resolve_update_batch();
        let all: Vec<u32> = fx.mgr.marks.values().copied().collect();
        let mut deduped = all.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(all.len(), 3);
        assert_eq!(deduped.len(), 3);

        let first_mark = fx.mgr.marks[&EndpointId("wl0".into())];
        fx.mgr
            .on_update(&DesiredStateUpdate::WorkloadEndpointRemove(EndpointId("wl0".into())));
        fx.mgr.resolve_update_batch();
        fx.mgr.complete_deferred_work().await.unwrap();

        fx.mgr.on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(endpoint(
            "wl9",
            "rpl9",
            Ipv4Addr::new(10, 65, 0, 9),
        )));
        fx.mgr.resolve_update_batch();
        assert_eq!(fx.mgr.marks[&EndpointId("wl9".into())], first_mark);
    }
}
