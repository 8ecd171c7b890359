// # IP-Sets Manager
//
// Translates desired membership messages into writer operations. The
// create-before-reference / delete-after-dereference ordering is the
// driver's apply phasing: updates land before the table writers run,
// deletions after they finish.

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::managers::{Manager, SharedIpSetsWriter};
use crate::proto::DesiredStateUpdate;

pub struct IpSetsManager {
    writer: SharedIpSetsWriter,
    queue: Vec<DesiredStateUpdate>,
}

impl IpSetsManager {
    pub fn new(writer: SharedIpSetsWriter) -> Self {
        Self {
            writer,
            queue: Vec::new(),
        }
    }
}

#[async_trait]
impl Manager for IpSetsManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        match msg {
            DesiredStateUpdate::IpSetUpdate { .. }
            | DesiredStateUpdate::IpSetDeltaUpdate { .. }
            | DesiredStateUpdate::IpSetRemove(_) => self.queue.push(msg.clone()),
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        let mut first_error = None;
        for msg in queue {
            let result = match msg {
                DesiredStateUpdate::IpSetUpdate { id, kind, members } => {
                    writer.add_or_replace_members(id, kind, members)
                }
                DesiredStateUpdate::IpSetDeltaUpdate { id, added, removed } => {
                    writer.apply_delta(&id, added, removed)
                }
                DesiredStateUpdate::IpSetRemove(id) => {
                    writer.remove_set(&id);
                    Ok(())
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                // One bad set must not block the rest of the batch.
                warn!("ip set update rejected: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsets::IpSetsWriter;
    use crate::maps::IpSetsMap;
    use crate::proto::{IpSetId, IpSetKind, IpSetMember};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_messages_flow_to_writer() {
        let writer = Arc::new(tokio::sync::Mutex::new(IpSetsWriter::new(
            IpSetsMap::new(),
            1024,
        )));
        let mut mgr = IpSetsManager::new(Arc::clone(&writer));

        mgr.on_update(&DesiredStateUpdate::IpSetUpdate {
            id: IpSetId("rpl-s-a".into()),
            kind: IpSetKind::Addrs,
            members: vec![IpSetMember::Addr(Ipv4Addr::new(1, 1, 1, 1))],
        });
        mgr.complete_deferred_work().await.unwrap();

        let mut guard = writer.lock().await;
        guard.apply_updates().unwrap();
        assert!(guard.kernel().get(&IpSetId("rpl-s-a".into())).is_some());
    }

    #[tokio::test]
    async fn test_bad_update_reported_but_batch_continues() {
        let writer = Arc::new(tokio::sync::Mutex::new(IpSetsWriter::new(
            IpSetsMap::new(),
            1024,
        )));
        let mut mgr = IpSetsManager::new(Arc::clone(&writer));

        // Delta against a set that does not exist fails...
        mgr.on_update(&DesiredStateUpdate::IpSetDeltaUpdate {
            id: IpSetId("missing".into()),
            added: vec![],
            removed: vec![],
        });
        // ...but the following good update still lands.
        mgr.on_update(&DesiredStateUpdate::IpSetUpdate {
            id: IpSetId("rpl-s-b".into()),
            kind: IpSetKind::Addrs,
            members: vec![],
        });
        assert!(mgr.complete_deferred_work().await.is_err());

        let mut guard = writer.lock().await;
        guard.apply_updates().unwrap();
        assert!(guard.kernel().get(&IpSetId("rpl-s-b".into())).is_some());
    }
}
