// # Program-Attachment Manager
//
// In fast-path mode, ensures every matched workload interface has
// the kernel packet programs attached at ingress and egress with the
// correct build-time parameterization, and keeps their policy
// sub-programs current with the compiled policy repository. The
// endpoint manager announces marks through the driver; an interface
// is not attached until its endpoint holds a mark.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;
use crate::fastpath::{
    EndpointSide, FastPathConfig, FastPathProgram, JumpTable, ProgramDirection, ProgramSpec,
};
use crate::managers::policy::{compile_policy_program, PolicyRepo};
use crate::managers::Manager;
use crate::maps::MapRegistry;
use crate::marks::MarkAllocation;
use crate::proto::{DesiredStateUpdate, EndpointId, WorkloadEndpoint};

/// Static parameterization shared by every attachment.
#[derive(Debug, Clone)]
pub struct FastPathParams {
    pub node_name: String,
    pub workload_iface_prefix: String,
    pub vxlan_port: u16,
    pub vxlan_vni: u32,
    pub tunnel_mtu: u16,
    pub log_level: u8,
    pub dsr: bool,
    pub connect_time_lb: bool,
}

/// One direction of an attached interface.
pub struct AttachedProgram {
    pub program: Arc<FastPathProgram>,
    pub jump: Arc<JumpTable>,
}

/// Both directions of one attached interface.
pub struct Attachment {
    pub endpoint: EndpointId,
    pub ifindex: u32,
    pub ingress: AttachedProgram,
    pub egress: AttachedProgram,
    policy_generation: u64,
}

pub struct ProgramAttachManager {
    enabled: bool,
    maps: Arc<MapRegistry>,
    repo: PolicyRepo,
    marks: MarkAllocation,
    params: FastPathParams,

    host_ip: Option<Ipv4Addr>,
    workloads: HashMap<EndpointId, WorkloadEndpoint>,
    endpoint_marks: HashMap<EndpointId, u32>,
    iface_index: HashMap<String, u32>,
    attachments: HashMap<String, Attachment>,
    resync_queued: bool,
}

impl ProgramAttachManager {
    pub fn new(
        enabled: bool,
        maps: Arc<MapRegistry>,
        repo: PolicyRepo,
        marks: MarkAllocation,
        params: FastPathParams,
    ) -> Self {
        Self {
            enabled,
            maps,
            repo,
            marks,
            params,
            host_ip: None,
            workloads: HashMap::new(),
            endpoint_marks: HashMap::new(),
            iface_index: HashMap::new(),
            attachments: HashMap::new(),
            resync_queued: false,
        }
    }

    /// Re-verify every attachment on the next apply.
    pub fn queue_resync(&mut self) {
        self.resync_queued = true;
    }

    pub fn attachment(&self, iface: &str) -> Option<&Attachment> {
        self.attachments.get(iface)
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    fn host_mac(host_ip: Ipv4Addr) -> [u8; 6] {
        let o = host_ip.octets();
        [0x02, 0x42, o[0], o[1], o[2], o[3]]
    }

    fn build_attachment(&self, endpoint: &WorkloadEndpoint, ifindex: u32, host_ip: Ipv4Addr) -> Attachment {
        let base_spec = |direction| ProgramSpec {
            direction,
            side: EndpointSide::Workload,
            tunnel_enabled: true,
            dsr: self.params.dsr,
            log_level: self.params.log_level,
            connect_time_lb: self.params.connect_time_lb,
        };
        let config = |direction| FastPathConfig {
            spec: base_spec(direction),
            host_ip,
            host_mac: Self::host_mac(host_ip),
            ifindex,
            vxlan_port: self.params.vxlan_port,
            vxlan_vni: self.params.vxlan_vni,
            tunnel_mtu: self.params.tunnel_mtu,
        };

        let generation = self.repo.read().generation;
        // From-workload evaluates the endpoint's egress rules;
        // to-workload its ingress rules.
        let ingress_jump = JumpTable::new(compile_policy_program(
            &endpoint.tiers,
            &endpoint.profiles,
            &self.repo,
            false,
        ));
        let egress_jump = JumpTable::new(compile_policy_program(
            &endpoint.tiers,
            &endpoint.profiles,
            &self.repo,
            true,
        ));

        Attachment {
            endpoint: endpoint.id.clone(),
            ifindex,
            ingress: AttachedProgram {
                program: Arc::new(FastPathProgram::new(
                    config(ProgramDirection::ToHost),
                    Arc::clone(&self.maps),
                    Arc::clone(&ingress_jump),
                    self.marks,
                )),
                jump: ingress_jump,
            },
            egress: AttachedProgram {
                program: Arc::new(FastPathProgram::new(
                    config(ProgramDirection::FromHost),
                    Arc::clone(&self.maps),
                    Arc::clone(&egress_jump),
                    self.marks,
                )),
                jump: egress_jump,
            },
            policy_generation: generation,
        }
    }
}

#[async_trait]
impl Manager for ProgramAttachManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        match msg {
            DesiredStateUpdate::WorkloadEndpointUpdate(endpoint) => {
                self.workloads.insert(endpoint.id.clone(), endpoint.clone());
            }
            DesiredStateUpdate::WorkloadEndpointRemove(id) => {
                self.workloads.remove(id);
                self.endpoint_marks.remove(id);
            }
            DesiredStateUpdate::EndpointMarkAssigned { id, mark, .. } => {
                self.endpoint_marks.insert(id.clone(), *mark);
            }
            DesiredStateUpdate::EndpointMarkReleased { id, .. } => {
                self.endpoint_marks.remove(id);
            }
            DesiredStateUpdate::InterfaceStateUpdate { name, index, .. } => {
                self.iface_index.insert(name.clone(), *index);
            }
            DesiredStateUpdate::HostMetadataUpdate(meta) => {
                if meta.hostname == self.params.node_name {
                    self.host_ip = meta.addresses.first().copied();
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(host_ip) = self.host_ip else {
            // Nothing to attach until we know our own address.
            return Ok(());
        };

        // Detach interfaces whose endpoint is gone.
        let live: HashMap<String, EndpointId> = self
            .workloads
            .values()
            .map(|w| (w.iface_name.clone(), w.id.clone()))
            .collect();
        self.attachments.retain(|iface, attachment| {
            let keep = live.get(iface) == Some(&attachment.endpoint);
            if !keep {
                info!(iface = %iface, "detaching fast-path programs");
            }
            keep
        });

        let resync = std::mem::take(&mut self.resync_queued);
        let generation = self.repo.read().generation;

        for endpoint in self.workloads.values() {
            if !endpoint.iface_name.starts_with(&self.params.workload_iface_prefix) {
                continue;
            }
            let Some(&ifindex) = self.iface_index.get(&endpoint.iface_name) else {
                continue;
            };
            // Mark assignment gates attachment so the legacy path and
            // the programs agree on the endpoint's bit.
            if !self.endpoint_marks.contains_key(&endpoint.id) {
                continue;
            }

            let needs_build = match self.attachments.get(&endpoint.iface_name) {
                None => true,
                Some(existing) => resync || existing.ifindex != ifindex,
            };
            if needs_build {
                info!(
                    iface = %endpoint.iface_name,
                    ifindex,
                    "attaching fast-path programs"
                );
                let attachment = self.build_attachment(endpoint, ifindex, host_ip);
                self.attachments.insert(endpoint.iface_name.clone(), attachment);
            } else if let Some(attachment) = self.attachments.get_mut(&endpoint.iface_name) {
                if attachment.policy_generation != generation {
                    debug!(iface = %endpoint.iface_name, generation, "reinstalling policy programs");
                    attachment.ingress.jump.install_policy(compile_policy_program(
                        &endpoint.tiers,
                        &endpoint.profiles,
                        &self.repo,
                        false,
                    ));
                    attachment.egress.jump.install_policy(compile_policy_program(
                        &endpoint.tiers,
                        &endpoint.profiles,
                        &self.repo,
                        true,
                    ));
                    attachment.policy_generation = generation;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::policy::CompiledPolicies;
    use crate::proto::{AdminState, HostMetadata};
    use parking_lot::RwLock;

    fn params() -> FastPathParams {
        FastPathParams {
            node_name: "node-a".into(),
            workload_iface_prefix: "rpl".into(),
            vxlan_port: 4789,
            vxlan_vni: 4096,
            tunnel_mtu: 1450,
            log_level: 0,
            dsr: false,
            connect_time_lb: false,
        }
    }

    fn manager(repo: PolicyRepo) -> ProgramAttachManager {
        ProgramAttachManager::new(
            true,
            Arc::new(MapRegistry::new()),
            repo,
            MarkAllocation::allocate(0x000f_fff0, false).unwrap(),
            params(),
        )
    }

    fn endpoint(name: &str, iface: &str) -> WorkloadEndpoint {
        WorkloadEndpoint {
            id: EndpointId(name.into()),
            iface_name: iface.into(),
            addresses: vec![Ipv4Addr::new(10, 65, 0, 5)],
            tiers: vec![],
            profiles: vec![],
            admin_state: AdminState::Up,
            expects_encap: false,
            floating_ips: vec![],
        }
    }

    fn feed_prereqs(mgr: &mut ProgramAttachManager, iface: &str) {
        mgr.on_update(&DesiredStateUpdate::HostMetadataUpdate(HostMetadata {
            hostname: "node-a".into(),
            addresses: vec![Ipv4Addr::new(172, 16, 0, 1)],
            tunnel_addr: None,
            tunnel_mac: None,
            pod_cidrs: vec![],
        }));
        mgr.on_update(&DesiredStateUpdate::InterfaceStateUpdate {
            name: iface.into(),
            index: 7,
            state: crate::proto::IfaceState::Up,
        });
        mgr.on_update(&DesiredStateUpdate::EndpointMarkAssigned {
            id: EndpointId("wl1".into()),
            iface_name: iface.into(),
            mark: 0x100,
        });
    }

    #[tokio::test]
    async fn test_attachment_waits_for_mark_and_index() {
        let repo: PolicyRepo = Arc::new(RwLock::new(CompiledPolicies::default()));
        let mut mgr = manager(repo);
        mgr.on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(endpoint("wl1", "rpl123")));

        // No host IP / index / mark yet: nothing attaches.
        mgr.complete_deferred_work().await.unwrap();
        assert_eq!(mgr.attachment_count(), 0);

        feed_prereqs(&mut mgr, "rpl123");
        mgr.complete_deferred_work().await.unwrap();
        assert_eq!(mgr.attachment_count(), 1);
        assert!(mgr.attachment("rpl123").is_some());
    }

    #[tokio::test]
    async fn test_policy_generation_triggers_reinstall() {
        let repo: PolicyRepo = Arc::new(RwLock::new(CompiledPolicies::default()));
        let mut mgr = manager(Arc::clone(&repo));
        mgr.on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(endpoint("wl1", "rpl123")));
        feed_prereqs(&mut mgr, "rpl123");
        mgr.complete_deferred_work().await.unwrap();

        let before = mgr
            .attachment("rpl123")
            .unwrap()
            .ingress
            .jump
            .policy()
            .generation;

        repo.write().generation += 1;
        mgr.complete_deferred_work().await.unwrap();
        let after = mgr
            .attachment("rpl123")
            .unwrap()
            .ingress
            .jump
            .policy()
            .generation;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_removed_endpoint_detaches() {
        let repo: PolicyRepo = Arc::new(RwLock::new(CompiledPolicies::default()));
        let mut mgr = manager(repo);
        mgr.on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(endpoint("wl1", "rpl123")));
        feed_prereqs(&mut mgr, "rpl123");
        mgr.complete_deferred_work().await.unwrap();
        assert_eq!(mgr.attachment_count(), 1);

        mgr.on_update(&DesiredStateUpdate::WorkloadEndpointRemove(EndpointId("wl1".into())));
        mgr.complete_deferred_work().await.unwrap();
        assert_eq!(mgr.attachment_count(), 0);
    }

    #[tokio::test]
    async fn test_non_matching_prefix_ignored() {
        let repo: PolicyRepo = Arc::new(RwLock::new(CompiledPolicies::default()));
        let mut mgr = manager(repo);
        mgr.on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(endpoint("wl1", "eth0")));
        feed_prereqs(&mut mgr, "eth0");
        mgr.complete_deferred_work().await.unwrap();
        assert_eq!(mgr.attachment_count(), 0);
    }
}
