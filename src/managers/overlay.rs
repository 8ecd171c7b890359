// # Overlay / Tunnel Manager
//
// Keeps the tunnel device configuration current and programs the
// per-peer state: remote-host and remote-workload route map entries,
// VTEP ARP entries, kernel routes for peer pod CIDRs, and the
// all-peers and masquerade-pools IP sets (published as messages so
// the IP-sets manager programs them through its own writer).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;
use crate::managers::{Manager, SharedRouteWriter};
use crate::maps::{ArpKey, ArpValue, MapRegistry, RouteFlags, RouteValue};
use crate::proto::{
    DesiredStateUpdate, HostMetadata, IpNet, IpSetId, IpSetKind, IpSetMember,
};
use crate::routes::RouteTarget;

pub const ALL_PEERS_SET: &str = "rpl-s-peers";
pub const MASQ_POOLS_SET: &str = super::nat::MASQ_POOLS_SET;

pub struct OverlayManager {
    route_writer: SharedRouteWriter,
    maps: Arc<MapRegistry>,
    node_name: String,
    tunnel_iface_name: String,
    tunnel_ifindex: u32,
    mtu: u16,

    peers: BTreeMap<String, HostMetadata>,
    /// Peer state torn down on the next apply.
    departed: Vec<HostMetadata>,
    sets_dirty: bool,
    peers_dirty: bool,
    device_logged: bool,
}

impl OverlayManager {
    pub fn new(
        route_writer: SharedRouteWriter,
        maps: Arc<MapRegistry>,
        node_name: String,
        tunnel_iface_name: String,
        tunnel_ifindex: u32,
        mtu: u16,
    ) -> Self {
        Self {
            route_writer,
            maps,
            node_name,
            tunnel_iface_name,
            tunnel_ifindex,
            mtu,
            peers: BTreeMap::new(),
            departed: Vec::new(),
            sets_dirty: true,
            peers_dirty: false,
            device_logged: false,
        }
    }

    fn vtep_mac(addr: std::net::Ipv4Addr) -> [u8; 6] {
        let o = addr.octets();
        [0x02, 0x55, o[0], o[1], o[2], o[3]]
    }
}

#[async_trait]
impl Manager for OverlayManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        match msg {
            DesiredStateUpdate::HostMetadataUpdate(meta) => {
                self.peers.insert(meta.hostname.clone(), meta.clone());
                self.sets_dirty = true;
                self.peers_dirty = true;
            }
            DesiredStateUpdate::HostMetadataRemove(hostname) => {
                if let Some(meta) = self.peers.remove(hostname) {
                    self.departed.push(meta);
                    self.sets_dirty = true;
                    self.peers_dirty = true;
                }
            }
            _ => {}
        }
    }

    fn resolve_update_batch(&mut self) -> Vec<DesiredStateUpdate> {
        if !self.sets_dirty {
            return Vec::new();
        }
        self.sets_dirty = false;

        let mut peer_members = Vec::new();
        let mut pool_members = Vec::new();
        for (hostname, meta) in &self.peers {
            if hostname == &self.node_name {
                continue;
            }
            for addr in &meta.addresses {
                peer_members.push(IpSetMember::Addr(*addr));
            }
            if let Some(tunnel) = meta.tunnel_addr {
                peer_members.push(IpSetMember::Addr(tunnel));
            }
        }
        for meta in self.peers.values() {
            for cidr in &meta.pod_cidrs {
                pool_members.push(IpSetMember::Net(*cidr));
            }
        }

        vec![
            DesiredStateUpdate::IpSetUpdate {
                id: IpSetId(ALL_PEERS_SET.to_string()),
                kind: IpSetKind::Addrs,
                members: peer_members,
            },
            DesiredStateUpdate::IpSetUpdate {
                id: IpSetId(MASQ_POOLS_SET.to_string()),
                kind: IpSetKind::Addrs,
                members: pool_members,
            },
        ]
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.device_logged {
            // Device management proper (link add, addressing) is done
            // once at startup; the interesting state is the peers.
            info!(
                iface = %self.tunnel_iface_name,
                mtu = self.mtu,
                "overlay device configured"
            );
            self.device_logged = true;
        }

        if !self.peers_dirty {
            return Ok(());
        }
        self.peers_dirty = false;

        let mut route_writer = self.route_writer.lock().await;

        for meta in std::mem::take(&mut self.departed) {
            debug!(peer = %meta.hostname, "removing overlay peer");
            for addr in &meta.addresses {
                self.maps.routes.remove(IpNet::host(*addr));
            }
            for cidr in &meta.pod_cidrs {
                self.maps.routes.remove(*cidr);
                route_writer.delete_route(*cidr);
            }
            if let Some(tunnel) = meta.tunnel_addr {
                self.maps.arp.remove(&ArpKey {
                    addr: tunnel,
                    ifindex: self.tunnel_ifindex,
                });
            }
        }

        for (hostname, meta) in &self.peers {
            let local = hostname == &self.node_name;
            let Some(&node_addr) = meta.addresses.first() else {
                continue;
            };

            for addr in &meta.addresses {
                let flags = if local {
                    RouteFlags::LOCAL_HOST
                } else {
                    RouteFlags::REMOTE_HOST
                };
                self.maps.routes.insert(
                    IpNet::host(*addr),
                    RouteValue {
                        flags,
                        ifindex: 0,
                        next_hop: None,
                    },
                );
            }

            for cidr in &meta.pod_cidrs {
                if local {
                    self.maps.routes.insert(
                        *cidr,
                        RouteValue {
                            flags: RouteFlags::IN_POOL | RouteFlags::NAT_OUTGOING,
                            ifindex: 0,
                            next_hop: None,
                        },
                    );
                } else {
                    self.maps
                        .routes
                        .insert(*cidr, RouteValue::remote_workload(node_addr));
                    route_writer.upsert_route(*cidr, RouteTarget::via(node_addr));
                }
            }

            if !local {
                if let Some(tunnel) = meta.tunnel_addr {
                    let dst_mac = meta.tunnel_mac.unwrap_or_else(|| Self::vtep_mac(tunnel));
                    self.maps.arp.insert(
                        ArpKey {
                            addr: tunnel,
                            ifindex: self.tunnel_ifindex,
                        },
                        ArpValue {
                            dst_mac,
                            src_mac: Self::vtep_mac(node_addr),
                        },
                    );
                }
            }
        }

        Ok(())
    }

    fn route_table_syncers(&self) -> Vec<SharedRouteWriter> {
        vec![Arc::clone(&self.route_writer)]
    }
}
