// # Service-Loop Prevention Manager
//
// Installs drop rules for the configured service CIDRs so traffic
// for a virtual address that survived NAT (no backend, stale state)
// cannot be re-admitted to the dataplane and loop.

use async_trait::async_trait;

use crate::error::Result;
use crate::managers::{Manager, SharedTableWriter};
use crate::proto::{DesiredStateUpdate, IpNet};
use crate::render::{Chain, MatchCriterion, RenderedRule, RuleVerb};

pub const SERVICE_LOOP_CHAIN: &str = "rpl-svc-loop";

pub struct ServiceLoopManager {
    filter: SharedTableWriter,
    cidrs: Vec<IpNet>,
    programmed: bool,
}

impl ServiceLoopManager {
    pub fn new(filter: SharedTableWriter, cidrs: Vec<IpNet>) -> Self {
        Self {
            filter,
            cidrs,
            programmed: false,
        }
    }
}

#[async_trait]
impl Manager for ServiceLoopManager {
    fn on_update(&mut self, _msg: &DesiredStateUpdate) {}

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if self.programmed {
            return Ok(());
        }
        let mut chain = Chain::new(SERVICE_LOOP_CHAIN);
        for cidr in &self.cidrs {
            chain.rules.push(
                RenderedRule::new(vec![MatchCriterion::DstNet(*cidr)], RuleVerb::Drop)
                    .with_comment("service loop prevention"),
            );
        }
        let mut filter = self.filter.lock().await;
        filter.update_chain(chain);
        if !self.cidrs.is_empty() {
            filter.insert_or_append_rules(
                "FORWARD",
                vec![RenderedRule::new(
                    vec![],
                    RuleVerb::Jump(SERVICE_LOOP_CHAIN.to_string()),
                )],
            );
        }
        self.programmed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::TableKind;
    use crate::tables::{MemoryBackend, TableBackend, TableWriter, TableWriterOptions};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drop_rules_cover_configured_cidrs() {
        let backend = MemoryBackend::new();
        let writer = Arc::new(tokio::sync::Mutex::new(TableWriter::new(
            TableKind::Filter,
            Arc::clone(&backend) as Arc<dyn TableBackend>,
            Arc::new(tokio::sync::Mutex::new(())),
            TableWriterOptions::default(),
        )));
        let mut mgr = ServiceLoopManager::new(
            Arc::clone(&writer),
            vec![IpNet::new(Ipv4Addr::new(10, 96, 0, 0), 12)],
        );
        mgr.complete_deferred_work().await.unwrap();
        writer.lock().await.apply().await.unwrap();

        let chains = backend.chains(TableKind::Filter);
        assert_eq!(chains[SERVICE_LOOP_CHAIN].len(), 1);
        assert!(chains[SERVICE_LOOP_CHAIN][0].contains("10.96.0.0/12"));
        assert!(chains[SERVICE_LOOP_CHAIN][0].contains("DROP"));
    }
}
