// # Host-IP Manager
//
// Tracks this host's own addresses from interface events so policy
// can match them symbolically, publishing the host-ips set and
// keeping the local-host route map entries current.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::managers::Manager;
use crate::maps::{MapRegistry, RouteFlags, RouteValue};
use crate::proto::{DesiredStateUpdate, IpNet, IpSetId, IpSetKind, IpSetMember};

pub const HOST_IPS_SET: &str = "rpl-s-host-ips";

pub struct HostIpManager {
    maps: Arc<MapRegistry>,
    by_iface: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    programmed: BTreeSet<Ipv4Addr>,
    dirty: bool,
}

impl HostIpManager {
    pub fn new(maps: Arc<MapRegistry>) -> Self {
        Self {
            maps,
            by_iface: BTreeMap::new(),
            programmed: BTreeSet::new(),
            dirty: false,
        }
    }

    fn all_addrs(&self) -> BTreeSet<Ipv4Addr> {
        self.by_iface.values().flatten().copied().collect()
    }
}

#[async_trait]
impl Manager for HostIpManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        if let DesiredStateUpdate::InterfaceAddrsUpdate { name, addrs } = msg {
            let set: BTreeSet<Ipv4Addr> = addrs.iter().copied().collect();
            if set.is_empty() {
                if self.by_iface.remove(name).is_some() {
                    self.dirty = true;
                }
            } else if self.by_iface.insert(name.clone(), set.clone()) != Some(set) {
                self.dirty = true;
            }
        }
    }

    fn resolve_update_batch(&mut self) -> Vec<DesiredStateUpdate> {
        if !self.dirty {
            return Vec::new();
        }
        vec![DesiredStateUpdate::IpSetUpdate {
            id: IpSetId(HOST_IPS_SET.to_string()),
            kind: IpSetKind::Addrs,
            members: self.all_addrs().into_iter().map(IpSetMember::Addr).collect(),
        }]
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;

        let current = self.all_addrs();
        for addr in self.programmed.difference(&current) {
            self.maps.routes.remove(IpNet::host(*addr));
        }
        for addr in &current {
            self.maps.routes.insert(
                IpNet::host(*addr),
                RouteValue {
                    flags: RouteFlags::LOCAL_HOST,
                    ifindex: 0,
                    next_hop: None,
                },
            );
        }
        self.programmed = current;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_addrs_tracked_and_withdrawn() {
        let maps = Arc::new(MapRegistry::new());
        let mut mgr = HostIpManager::new(Arc::clone(&maps));

        mgr.on_update(&DesiredStateUpdate::InterfaceAddrsUpdate {
            name: "eth0".into(),
            addrs: vec![Ipv4Addr::new(172, 16, 0, 1)],
        });
        let published = mgr.resolve_update_batch();
        assert_eq!(published.len(), 1);
        mgr.complete_deferred_work().await.unwrap();

        let route = maps.routes.lookup(Ipv4Addr::new(172, 16, 0, 1)).unwrap();
        assert!(route.flags.contains(RouteFlags::LOCAL_HOST));

        mgr.on_update(&DesiredStateUpdate::InterfaceAddrsUpdate {
            name: "eth0".into(),
            addrs: vec![],
        });
        mgr.complete_deferred_work().await.unwrap();
        assert!(maps.routes.lookup(Ipv4Addr::new(172, 16, 0, 1)).is_none());
    }

    #[tokio::test]
    async fn test_unchanged_addrs_publish_nothing() {
        let maps = Arc::new(MapRegistry::new());
        let mut mgr = HostIpManager::new(maps);
        mgr.on_update(&DesiredStateUpdate::InterfaceAddrsUpdate {
            name: "eth0".into(),
            addrs: vec![Ipv4Addr::new(172, 16, 0, 1)],
        });
        mgr.resolve_update_batch();
        mgr.complete_deferred_work().await.unwrap();

        mgr.on_update(&DesiredStateUpdate::InterfaceAddrsUpdate {
            name: "eth0".into(),
            addrs: vec![Ipv4Addr::new(172, 16, 0, 1)],
        });
        assert!(mgr.resolve_update_batch().is_empty());
    }
}
