// # Route-Table Writer
//
// Maintains routes in one named kernel routing table. Incremental
// upserts and deletes flow through `apply`; a queued resync lists the
// kernel table and reconciles both directions, deleting stale
// entries and re-adding missing ones.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DpError, Result};
use crate::proto::IpNet;

/// Where a route points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget {
    pub via: Option<Ipv4Addr>,
    pub ifindex: Option<u32>,
}

impl RouteTarget {
    pub fn via(gateway: Ipv4Addr) -> Self {
        Self {
            via: Some(gateway),
            ifindex: None,
        }
    }

    pub fn device(ifindex: u32) -> Self {
        Self {
            via: None,
            ifindex: Some(ifindex),
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

#[async_trait]
pub trait RouteBackend: Send + Sync {
    async fn add_route(&self, table: u32, net: IpNet, target: RouteTarget) -> Result<()>;
    async fn del_route(&self, table: u32, net: IpNet) -> Result<()>;
    async fn list_routes(&self, table: u32) -> Result<Vec<(IpNet, RouteTarget)>>;
}

/// The real backend, speaking rtnetlink.
pub struct NetlinkBackend {
    handle: rtnetlink::Handle,
}

impl NetlinkBackend {
    /// Spawn the netlink connection task and return the backend.
    pub fn new() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| DpError::Netlink(format!("open rtnetlink: {}", e)))?;
        tokio::spawn(conn);
        Ok(Self { handle })
    }
}

#[async_trait]
impl RouteBackend for NetlinkBackend {
    async fn add_route(&self, table: u32, net: IpNet, target: RouteTarget) -> Result<()> {
        let mut request = self
            .handle
            .route()
            .add()
            .v4()
            .replace()
            .table_id(table)
            .destination_prefix(net.addr, net.prefix_len);
        if let Some(gateway) = target.via {
            request = request.gateway(gateway);
        }
        if let Some(ifindex) = target.ifindex {
            request = request.output_interface(ifindex);
        }
        request.execute().await?;
        Ok(())
    }

    async fn del_route(&self, table: u32, net: IpNet) -> Result<()> {
        let mut stream = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(message) = stream.try_next().await? {
            if route_table_id(&message) != table {
                continue;
            }
            if message.header.destination_prefix_length != net.prefix_len {
                continue;
            }
            if route_destination(&message) != Some(net.addr) {
                continue;
            }
            self.handle.route().del(message).execute().await?;
            return Ok(());
        }
        // Already gone; deletion is idempotent.
        Ok(())
    }

    async fn list_routes(&self, table: u32) -> Result<Vec<(IpNet, RouteTarget)>> {
        let mut routes = Vec::new();
        let mut stream = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(message) = stream.try_next().await? {
            if route_table_id(&message) != table {
                continue;
            }
            let Some(dst) = route_destination(&message) else {
                continue;
            };
            let mut target = RouteTarget {
                via: None,
                ifindex: None,
            };
            for attr in &message.attributes {
                match attr {
                    RouteAttribute::Gateway(RouteAddress::Inet(gw)) => target.via = Some(*gw),
                    RouteAttribute::Oif(ifindex) => target.ifindex = Some(*ifindex),
                    _ => {}
                }
            }
            routes.push((
                IpNet::new(dst, message.header.destination_prefix_length),
                target,
            ));
        }
        Ok(routes)
    }
}

fn route_table_id(message: &netlink_packet_route::route::RouteMessage) -> u32 {
    for attr in &message.attributes {
        if let RouteAttribute::Table(id) = attr {
            return *id;
        }
    }
    message.header.table as u32
}

fn route_destination(message: &netlink_packet_route::route::RouteMessage) -> Option<Ipv4Addr> {
    for attr in &message.attributes {
        if let RouteAttribute::Destination(RouteAddress::Inet(addr)) = attr {
            return Some(*addr);
        }
    }
    None
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryRouteBackend {
    tables: Mutex<BTreeMap<u32, BTreeMap<IpNet, RouteTarget>>>,
}

impl MemoryRouteBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate a route added behind the writer's back.
    pub fn inject(&self, table: u32, net: IpNet, target: RouteTarget) {
        self.tables.lock().entry(table).or_default().insert(net, target);
    }

    pub fn routes(&self, table: u32) -> BTreeMap<IpNet, RouteTarget> {
        self.tables.lock().get(&table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RouteBackend for MemoryRouteBackend {
    async fn add_route(&self, table: u32, net: IpNet, target: RouteTarget) -> Result<()> {
        self.tables.lock().entry(table).or_default().insert(net, target);
        Ok(())
    }

    async fn del_route(&self, table: u32, net: IpNet) -> Result<()> {
        self.tables.lock().entry(table).or_default().remove(&net);
        Ok(())
    }

    async fn list_routes(&self, table: u32) -> Result<Vec<(IpNet, RouteTarget)>> {
        Ok(self
            .tables
            .lock()
            .get(&table)
            .map(|t| t.iter().map(|(net, target)| (*net, *target)).collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// Writer
// ============================================================================

pub struct RouteTableWriter {
    table_index: u32,
    backend: Arc<dyn RouteBackend>,
    desired: BTreeMap<IpNet, RouteTarget>,
    dirty: BTreeSet<IpNet>,
    deleted: BTreeSet<IpNet>,
    resync_queued: bool,
}

impl RouteTableWriter {
    pub fn new(table_index: u32, backend: Arc<dyn RouteBackend>) -> Self {
        Self {
            table_index,
            backend,
            desired: BTreeMap::new(),
            dirty: BTreeSet::new(),
            deleted: BTreeSet::new(),
            resync_queued: true,
        }
    }

    pub fn table_index(&self) -> u32 {
        self.table_index
    }

    pub fn upsert_route(&mut self, net: IpNet, target: RouteTarget) {
        self.deleted.remove(&net);
        if self.desired.get(&net) != Some(&target) {
            self.desired.insert(net, target);
            self.dirty.insert(net);
        }
    }

    pub fn delete_route(&mut self, net: IpNet) {
        if self.desired.remove(&net).is_some() {
            self.dirty.remove(&net);
            self.deleted.insert(net);
        }
    }

    pub fn queue_resync(&mut self) {
        self.resync_queued = true;
    }

    /// Flush pending route changes; on resync, reconcile the kernel
    /// table in both directions.
    pub async fn apply(&mut self) -> Result<()> {
        if self.resync_queued {
            let kernel = self.backend.list_routes(self.table_index).await?;
            let kernel_map: BTreeMap<IpNet, RouteTarget> = kernel.into_iter().collect();

            for (net, target) in &kernel_map {
                match self.desired.get(net) {
                    Some(want) if want == target => {}
                    _ => {
                        warn!(table = self.table_index, route = %net, "deleting stale route");
                        self.backend.del_route(self.table_index, *net).await?;
                    }
                }
            }
            for (net, target) in &self.desired {
                if kernel_map.get(net) != Some(target) {
                    debug!(table = self.table_index, route = %net, "restoring route");
                    self.backend.add_route(self.table_index, *net, *target).await?;
                }
            }
            self.dirty.clear();
            self.deleted.clear();
            self.resync_queued = false;
            info!(
                table = self.table_index,
                routes = self.desired.len(),
                "route table resynced"
            );
            return Ok(());
        }

        for net in std::mem::take(&mut self.deleted) {
            self.backend.del_route(self.table_index, net).await?;
        }
        for net in std::mem::take(&mut self.dirty) {
            if let Some(target) = self.desired.get(&net) {
                self.backend.add_route(self.table_index, net, *target).await?;
            }
        }
        Ok(())
    }

    pub fn desired_len(&self) -> usize {
        self.desired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(last: u8, len: u8) -> IpNet {
        IpNet::new(Ipv4Addr::new(10, 65, 0, last), len)
    }

    #[tokio::test]
    async fn test_incremental_add_and_delete() {
        let backend = MemoryRouteBackend::new();
        let mut writer = RouteTableWriter::new(254, Arc::clone(&backend) as Arc<dyn RouteBackend>);

        writer.upsert_route(net(5, 32), RouteTarget::device(3));
        writer.apply().await.unwrap();
        assert_eq!(backend.routes(254).len(), 1);

        writer.delete_route(net(5, 32));
        writer.apply().await.unwrap();
        assert!(backend.routes(254).is_empty());
    }

    #[tokio::test]
    async fn test_resync_removes_stale_and_restores_missing() {
        let backend = MemoryRouteBackend::new();
        let mut writer = RouteTableWriter::new(254, Arc::clone(&backend) as Arc<dyn RouteBackend>);

        writer.upsert_route(net(5, 32), RouteTarget::device(3));
        writer.apply().await.unwrap();

        // Someone deleted our route and added a stray one.
        backend.del_route(254, net(5, 32)).await.unwrap();
        backend.inject(254, net(9, 32), RouteTarget::via(Ipv4Addr::new(1, 2, 3, 4)));

        writer.queue_resync();
        writer.apply().await.unwrap();

        let routes = backend.routes(254);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[&net(5, 32)], RouteTarget::device(3));
    }

    #[tokio::test]
    async fn test_upsert_same_target_is_not_dirty() {
        let backend = MemoryRouteBackend::new();
        let mut writer = RouteTableWriter::new(254, Arc::clone(&backend) as Arc<dyn RouteBackend>);
        writer.upsert_route(net(5, 32), RouteTarget::device(3));
        writer.apply().await.unwrap();

        writer.upsert_route(net(5, 32), RouteTarget::device(3));
        assert!(writer.dirty.is_empty());

        writer.upsert_route(net(5, 32), RouteTarget::device(4));
        assert_eq!(writer.dirty.len(), 1);
    }
}
