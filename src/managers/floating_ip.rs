// # Floating-IP Manager
//
// 1:1 NAT between external floating addresses and workload
// addresses: DNAT on the way in, SNAT on the way out.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::managers::{Manager, SharedTableWriter};
use crate::proto::{DesiredStateUpdate, EndpointId, FloatingIp};
use crate::render::{Chain, MatchCriterion, RenderedRule, RuleVerb};

pub const FIP_DNAT_CHAIN: &str = "rpl-fip-dnat";
pub const FIP_SNAT_CHAIN: &str = "rpl-fip-snat";

pub struct FloatingIpManager {
    nat: SharedTableWriter,
    mappings: BTreeMap<EndpointId, Vec<FloatingIp>>,
    dirty: bool,
}

impl FloatingIpManager {
    pub fn new(nat: SharedTableWriter) -> Self {
        Self {
            nat,
            mappings: BTreeMap::new(),
            dirty: true,
        }
    }

    fn render_chains(&self) -> Vec<Chain> {
        let mut dnat = Chain::new(FIP_DNAT_CHAIN);
        let mut snat = Chain::new(FIP_SNAT_CHAIN);
        for fips in self.mappings.values() {
            for fip in fips {
                dnat.rules.push(RenderedRule::new(
                    vec![MatchCriterion::DstNet(crate::proto::IpNet::host(fip.external))],
                    RuleVerb::DnatAddr(fip.internal),
                ));
                snat.rules.push(RenderedRule::new(
                    vec![MatchCriterion::SrcNet(crate::proto::IpNet::host(fip.internal))],
                    RuleVerb::SnatAddr(fip.external),
                ));
            }
        }
        vec![dnat, snat]
    }
}

#[async_trait]
impl Manager for FloatingIpManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        match msg {
            DesiredStateUpdate::WorkloadEndpointUpdate(endpoint) => {
                let previous = self
                    .mappings
                    .insert(endpoint.id.clone(), endpoint.floating_ips.clone());
                if previous.as_deref() != Some(endpoint.floating_ips.as_slice()) {
                    self.dirty = true;
                }
            }
            DesiredStateUpdate::WorkloadEndpointRemove(id) => {
                if self.mappings.remove(id).is_some() {
                    self.dirty = true;
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut nat = self.nat.lock().await;
        nat.update_chains(self.render_chains());
        nat.insert_or_append_rules(
            "PREROUTING",
            vec![RenderedRule::new(
                vec![],
                RuleVerb::Jump(FIP_DNAT_CHAIN.to_string()),
            )],
        );
        nat.append_rules(
            "POSTROUTING",
            vec![RenderedRule::new(
                vec![],
                RuleVerb::Jump(FIP_SNAT_CHAIN.to_string()),
            )],
        );
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{AdminState, WorkloadEndpoint};
    use crate::render::TableKind;
    use crate::tables::{MemoryBackend, TableBackend, TableWriter, TableWriterOptions};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_floating_ip_rules_follow_endpoint() {
        let backend = MemoryBackend::new();
        let writer = Arc::new(tokio::sync::Mutex::new(TableWriter::new(
            TableKind::Nat,
            Arc::clone(&backend) as Arc<dyn TableBackend>,
            Arc::new(tokio::sync::Mutex::new(())),
            TableWriterOptions::default(),
        )));
        let mut mgr = FloatingIpManager::new(Arc::clone(&writer));

        let endpoint = WorkloadEndpoint {
            id: EndpointId("wl1".into()),
            iface_name: "rpl123".into(),
            addresses: vec![Ipv4Addr::new(10, 65, 0, 5)],
            tiers: vec![],
            profiles: vec![],
            admin_state: AdminState::Up,
            expects_encap: false,
            floating_ips: vec![FloatingIp {
                external: Ipv4Addr::new(192, 0, 2, 10),
                internal: Ipv4Addr::new(10, 65, 0, 5),
            }],
        };
        mgr.on_update(&DesiredStateUpdate::WorkloadEndpointUpdate(endpoint.clone()));
        mgr.complete_deferred_work().await.unwrap();
        writer.lock().await.apply().await.unwrap();

        let chains = backend.chains(TableKind::Nat);
        assert!(chains[FIP_DNAT_CHAIN][0].contains("192.0.2.10"));
        assert!(chains[FIP_SNAT_CHAIN][0].contains("--to-source 192.0.2.10"));

        mgr.on_update(&DesiredStateUpdate::WorkloadEndpointRemove(endpoint.id));
        mgr.complete_deferred_work().await.unwrap();
        writer.lock().await.apply().await.unwrap();
        assert!(backend.chains(TableKind::Nat)[FIP_DNAT_CHAIN].is_empty());
    }
}
