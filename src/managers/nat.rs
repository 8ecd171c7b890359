// # NAT / Masquerade Manager
//
// Two halves of the same slice: the source-NAT postrouting chain for
// NAT-outgoing traffic, and the service NAT frontend/backend/affinity
// maps consumed by the fast path for load balancing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::managers::{Manager, SharedTableWriter};
use crate::maps::nat::NatFrontendKey;
use crate::maps::MapRegistry;
use crate::marks::fixed;
use crate::proto::{DesiredStateUpdate, ServiceKey, ServiceSpec};
use crate::render::{Chain, MatchCriterion, RenderedRule, RuleVerb};

pub const NAT_OUTGOING_CHAIN: &str = "rpl-nat-outgoing";
pub const MASQ_POOLS_SET: &str = "rpl-s-masq";

pub struct NatManager {
    nat: SharedTableWriter,
    maps: Arc<MapRegistry>,
    services: BTreeMap<ServiceKey, ServiceSpec>,
    dirty: BTreeSet<ServiceKey>,
    removed: BTreeSet<ServiceKey>,
    chain_programmed: bool,
}

impl NatManager {
    pub fn new(nat: SharedTableWriter, maps: Arc<MapRegistry>) -> Self {
        Self {
            nat,
            maps,
            services: BTreeMap::new(),
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
            chain_programmed: false,
        }
    }

    /// Masquerade anything the fast path or legacy rules flagged as
    /// NAT-outgoing, unless it stays inside the pools.
    fn render_masquerade_chain() -> Chain {
        Chain::new(NAT_OUTGOING_CHAIN).rule(
            RenderedRule::new(
                vec![
                    MatchCriterion::Mark {
                        mark: fixed::BIT_NAT_OUT,
                        mask: fixed::BIT_NAT_OUT,
                    },
                    MatchCriterion::NotDstSet(MASQ_POOLS_SET.to_string()),
                ],
                RuleVerb::Masquerade,
            )
            .with_comment("nat outgoing"),
        )
    }
}

#[async_trait]
impl Manager for NatManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        match msg {
            DesiredStateUpdate::ServiceUpdate(spec) => {
                self.removed.remove(&spec.key);
                self.services.insert(spec.key, spec.clone());
                self.dirty.insert(spec.key);
            }
            DesiredStateUpdate::ServiceRemove(key) => {
                if self.services.remove(key).is_some() {
                    self.dirty.remove(key);
                    self.removed.insert(*key);
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        for key in std::mem::take(&mut self.removed) {
            debug!(service = %key, "removing service NAT entries");
            self.maps.nat.remove_service(&NatFrontendKey {
                addr: key.vip,
                port: key.port,
                protocol: key.protocol,
            });
        }
        for key in std::mem::take(&mut self.dirty) {
            if let Some(spec) = self.services.get(&key) {
                debug!(service = %key, backends = spec.backends.len(), "programming service NAT");
                self.maps.nat.program_service(spec);
            }
        }

        if !self.chain_programmed {
            let mut nat = self.nat.lock().await;
            nat.update_chain(Self::render_masquerade_chain());
            nat.insert_or_append_rules(
                "POSTROUTING",
                vec![RenderedRule::new(
                    vec![],
                    RuleVerb::Jump(NAT_OUTGOING_CHAIN.to_string()),
                )],
            );
            self.chain_programmed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Protocol, ServiceBackend, ServiceFlags};
    use crate::render::TableKind;
    use crate::tables::{MemoryBackend, TableBackend, TableWriter, TableWriterOptions};
    use std::net::Ipv4Addr;

    fn manager() -> (NatManager, Arc<MemoryBackend>, Arc<MapRegistry>) {
        let backend = MemoryBackend::new();
        let maps = Arc::new(MapRegistry::new());
        let writer = TableWriter::new(
            TableKind::Nat,
            Arc::clone(&backend) as Arc<dyn TableBackend>,
            Arc::new(tokio::sync::Mutex::new(())),
            TableWriterOptions::default(),
        );
        (
            NatManager::new(Arc::new(tokio::sync::Mutex::new(writer)), Arc::clone(&maps)),
            backend,
            maps,
        )
    }

    fn service(port: u16, backends: usize) -> ServiceSpec {
        ServiceSpec {
            key: ServiceKey {
                vip: Ipv4Addr::new(10, 0, 0, 1),
                port,
                protocol: Protocol::Tcp,
            },
            backends: (0..backends)
                .map(|i| ServiceBackend {
                    addr: Ipv4Addr::new(8, 8, 8, 8 + i as u8),
                    port: 666,
                    is_local: false,
                })
                .collect(),
            flags: ServiceFlags::empty(),
            affinity_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_service_upsert_programs_maps() {
        let (mut mgr, _, maps) = manager();
        mgr.on_update(&DesiredStateUpdate::ServiceUpdate(service(80, 2)));
        mgr.complete_deferred_work().await.unwrap();

        let fe = maps
            .nat
            .lookup_frontend(&NatFrontendKey {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                port: 80,
                protocol: Protocol::Tcp,
            })
            .unwrap();
        assert_eq!(fe.backend_count, 2);

        mgr.on_update(&DesiredStateUpdate::ServiceRemove(service(80, 2).key));
        mgr.complete_deferred_work().await.unwrap();
        assert_eq!(maps.nat.frontend_len(), 0);
        assert_eq!(maps.nat.backend_len(), 0);
    }

    #[tokio::test]
    async fn test_masquerade_chain_rendered_once() {
        let (mut mgr, backend, _) = manager();
        mgr.complete_deferred_work().await.unwrap();
        mgr.nat.lock().await.apply().await.unwrap();

        let chains = backend.chains(TableKind::Nat);
        let rules = &chains[NAT_OUTGOING_CHAIN];
        assert_eq!(rules.len(), 1);
        assert!(rules[0].contains("MASQUERADE"));
        assert!(rules[0].contains(MASQ_POOLS_SET));
    }
}
