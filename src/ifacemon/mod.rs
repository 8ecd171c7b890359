// # Interface Monitor
//
// Publishes two event streams from the kernel: (name, index,
// admin+oper state) and (name, address set). Events for a single
// interface are emitted in order; deduplication is left to the
// consumer. The monitor polls the link and address tables and diffs
// against its previous snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures::stream::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkFlag, State as OperState};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DpError, Result};
use crate::proto::IfaceState;

/// One event from the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    State {
        name: String,
        index: u32,
        state: IfaceState,
    },
    Addrs {
        name: String,
        addrs: Vec<Ipv4Addr>,
    },
}

/// The monitor's view of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceSnapshot {
    pub name: String,
    pub index: u32,
    pub state: IfaceState,
    pub addrs: BTreeSet<Ipv4Addr>,
}

/// Diff two snapshots of the whole interface table into ordered
/// events. Pure, so the event contract is testable without netlink.
pub fn diff_snapshots(
    old: &BTreeMap<u32, IfaceSnapshot>,
    new: &BTreeMap<u32, IfaceSnapshot>,
) -> Vec<InterfaceEvent> {
    let mut events = Vec::new();

    for (index, iface) in new {
        match old.get(index) {
            None => {
                events.push(InterfaceEvent::State {
                    name: iface.name.clone(),
                    index: iface.index,
                    state: iface.state,
                });
                if !iface.addrs.is_empty() {
                    events.push(InterfaceEvent::Addrs {
                        name: iface.name.clone(),
                        addrs: iface.addrs.iter().copied().collect(),
                    });
                }
            }
            Some(previous) => {
                if previous.state != iface.state || previous.name != iface.name {
                    events.push(InterfaceEvent::State {
                        name: iface.name.clone(),
                        index: iface.index,
                        state: iface.state,
                    });
                }
                if previous.addrs != iface.addrs {
                    events.push(InterfaceEvent::Addrs {
                        name: iface.name.clone(),
                        addrs: iface.addrs.iter().copied().collect(),
                    });
                }
            }
        }
    }

    // Vanished interfaces report down with no addresses.
    for (index, iface) in old {
        if !new.contains_key(index) {
            events.push(InterfaceEvent::State {
                name: iface.name.clone(),
                index: iface.index,
                state: IfaceState::Down,
            });
            events.push(InterfaceEvent::Addrs {
                name: iface.name.clone(),
                addrs: Vec::new(),
            });
        }
    }

    events
}

/// Polling monitor over rtnetlink.
pub struct InterfaceMonitor {
    handle: rtnetlink::Handle,
    poll_interval: Duration,
    last: BTreeMap<u32, IfaceSnapshot>,
}

impl InterfaceMonitor {
    pub fn new(poll_interval: Duration) -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| DpError::Netlink(format!("open rtnetlink: {}", e)))?;
        tokio::spawn(conn);
        Ok(Self {
            handle,
            poll_interval,
            last: BTreeMap::new(),
        })
    }

    /// Run forever, pushing events into `tx`. Exits when the consumer
    /// goes away.
    pub async fn run(mut self, tx: mpsc::Sender<InterfaceEvent>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            match self.snapshot().await {
                Ok(current) => {
                    for event in diff_snapshots(&self.last, &current) {
                        debug!(?event, "interface event");
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    self.last = current;
                }
                Err(e) => warn!("interface snapshot failed: {}", e),
            }
        }
    }

    async fn snapshot(&self) -> Result<BTreeMap<u32, IfaceSnapshot>> {
        let mut snapshot = BTreeMap::new();

        let mut links = self.handle.link().get().execute();
        while let Some(link) = links.try_next().await? {
            let index = link.header.index;
            let admin_up = link.header.flags.contains(&LinkFlag::Up);
            let mut name = String::new();
            let mut oper_up = admin_up;
            for attr in &link.attributes {
                match attr {
                    LinkAttribute::IfName(n) => name = n.clone(),
                    LinkAttribute::OperState(state) => oper_up = *state == OperState::Up,
                    _ => {}
                }
            }
            let state = if admin_up && oper_up {
                IfaceState::Up
            } else {
                IfaceState::Down
            };
            snapshot.insert(
                index,
                IfaceSnapshot {
                    name,
                    index,
                    state,
                    addrs: BTreeSet::new(),
                },
            );
        }

        let mut addrs = self.handle.address().get().execute();
        while let Some(addr) = addrs.try_next().await? {
            let index = addr.header.index;
            for attr in &addr.attributes {
                if let AddressAttribute::Address(IpAddr::V4(v4)) = attr {
                    if let Some(entry) = snapshot.get_mut(&index) {
                        entry.addrs.insert(*v4);
                    }
                }
            }
        }

        Ok(snapshot)
    }
}
