// # Failsafe-Ports Manager
//
// Writes the configured failsafe ports into the shared map consumed
// by the fast path, so control-plane protocols stay reachable while
// policy churns.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::managers::Manager;
use crate::maps::{FailsafeDirection, FailsafeKey, MapRegistry};
use crate::proto::{DesiredStateUpdate, Protocol};

pub struct FailsafeManager {
    maps: Arc<MapRegistry>,
    inbound: Vec<(Protocol, u16)>,
    outbound: Vec<(Protocol, u16)>,
    programmed: bool,
}

impl FailsafeManager {
    pub fn new(
        maps: Arc<MapRegistry>,
        inbound: Vec<(Protocol, u16)>,
        outbound: Vec<(Protocol, u16)>,
    ) -> Self {
        Self {
            maps,
            inbound,
            outbound,
            programmed: false,
        }
    }
}

#[async_trait]
impl Manager for FailsafeManager {
    fn on_update(&mut self, _msg: &DesiredStateUpdate) {}

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if self.programmed {
            return Ok(());
        }
        for (protocol, port) in &self.inbound {
            self.maps.failsafe.insert(
                FailsafeKey {
                    port: *port,
                    protocol: *protocol,
                    direction: FailsafeDirection::Inbound,
                },
                (),
            );
        }
        for (protocol, port) in &self.outbound {
            self.maps.failsafe.insert(
                FailsafeKey {
                    port: *port,
                    protocol: *protocol,
                    direction: FailsafeDirection::Outbound,
                },
                (),
            );
        }
        info!(
            inbound = self.inbound.len(),
            outbound = self.outbound.len(),
            "failsafe ports programmed"
        );
        self.programmed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ports_written_to_shared_map() {
        let maps = Arc::new(MapRegistry::new());
        let mut mgr = FailsafeManager::new(
            Arc::clone(&maps),
            vec![(Protocol::Tcp, 22)],
            vec![(Protocol::Udp, 53)],
        );
        mgr.complete_deferred_work().await.unwrap();

        assert!(maps
            .failsafe
            .get(&FailsafeKey {
                port: 22,
                protocol: Protocol::Tcp,
                direction: FailsafeDirection::Inbound,
            })
            .is_some());
        assert!(maps
            .failsafe
            .get(&FailsafeKey {
                port: 53,
                protocol: Protocol::Udp,
                direction: FailsafeDirection::Outbound,
            })
            .is_some());
        assert!(maps
            .failsafe
            .get(&FailsafeKey {
                port: 22,
                protocol: Protocol::Tcp,
                direction: FailsafeDirection::Outbound,
            })
            .is_none());
    }
}
