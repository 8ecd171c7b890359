// # IP-Set Writers
//
// Maintains kernel IP-set membership from desired membership sets.
// The driver calls `apply_updates` before the table writers run and
// `apply_deletions` after them, so a table rule never references a
// set that does not yet exist and a set is never deleted while a
// rule still mentions it.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::{DpError, Result};
use crate::maps::IpSetsMap;
use crate::proto::{IpSetId, IpSetKind, IpSetMember};

/// Desired state of one set.
#[derive(Debug, Clone)]
struct DesiredSet {
    kind: IpSetKind,
    members: HashSet<IpSetMember>,
}

pub struct IpSetsWriter {
    /// The kernel-side store, shared read-only with the fast path.
    kernel: IpSetsMap,
    desired: HashMap<IpSetId, DesiredSet>,
    pending_updates: BTreeSet<IpSetId>,
    pending_deletions: BTreeSet<IpSetId>,
    max_size: usize,
    resync_queued: bool,
}

impl IpSetsWriter {
    pub fn new(kernel: IpSetsMap, max_size: usize) -> Self {
        Self {
            kernel,
            desired: HashMap::new(),
            pending_updates: BTreeSet::new(),
            pending_deletions: BTreeSet::new(),
            max_size,
            resync_queued: true,
        }
    }

    pub fn kernel(&self) -> &IpSetsMap {
        &self.kernel
    }

    /// Replace the full membership of a set.
    pub fn add_or_replace_members(
        &mut self,
        id: IpSetId,
        kind: IpSetKind,
        members: Vec<IpSetMember>,
    ) -> Result<()> {
        for member in &members {
            if member.kind() != kind {
                return Err(DpError::IpSet(format!(
                    "member {} has wrong kind for set {}",
                    member, id
                )));
            }
        }
        self.pending_deletions.remove(&id);
        self.pending_updates.insert(id.clone());
        self.desired.insert(
            id,
            DesiredSet {
                kind,
                members: members.into_iter().collect(),
            },
        );
        Ok(())
    }

    /// Additive membership delta.
    pub fn apply_delta(
        &mut self,
        id: &IpSetId,
        added: Vec<IpSetMember>,
        removed: Vec<IpSetMember>,
    ) -> Result<()> {
        let set = self
            .desired
            .get_mut(id)
            .ok_or_else(|| DpError::NotFound(format!("ip set {}", id)))?;
        for member in &added {
            if member.kind() != set.kind {
                return Err(DpError::IpSet(format!(
                    "member {} has wrong kind for set {}",
                    member, id
                )));
            }
        }
        for member in removed {
            set.members.remove(&member);
        }
        set.members.extend(added);
        self.pending_updates.insert(id.clone());
        Ok(())
    }

    /// Queue a set for removal; the driver applies it after the table
    /// writers have dropped every reference.
    pub fn remove_set(&mut self, id: &IpSetId) {
        if self.desired.remove(id).is_some() {
            self.pending_updates.remove(id);
            self.pending_deletions.insert(id.clone());
        }
    }

    /// Force a full reconcile of kernel state on the next apply.
    pub fn queue_resync(&mut self) {
        self.resync_queued = true;
    }

    /// Create and update sets. Runs before the table writers.
    pub fn apply_updates(&mut self) -> Result<()> {
        if self.resync_queued {
            // Reconcile sets the kernel has but we no longer want,
            // except those queued for post-table deletion.
            for (id, _) in self.kernel.iter_snapshot() {
                if !self.desired.contains_key(&id) && !self.pending_deletions.contains(&id) {
                    warn!(set = %id, "removing unexpected kernel ip set");
                    self.kernel.remove(&id);
                }
            }
            let ids: Vec<IpSetId> = self.desired.keys().cloned().collect();
            self.pending_updates.extend(ids);
            self.resync_queued = false;
        }

        for id in std::mem::take(&mut self.pending_updates) {
            let Some(desired) = self.desired.get(&id) else {
                continue;
            };
            if desired.members.len() > self.max_size {
                return Err(DpError::IpSet(format!(
                    "set {} exceeds the configured max size ({} > {})",
                    id,
                    desired.members.len(),
                    self.max_size
                )));
            }
            debug!(set = %id, members = desired.members.len(), "programming ip set");
            self.kernel.insert(id.clone(), desired.members.clone());
        }
        Ok(())
    }

    /// Delete sets whose last rule reference is gone. Runs after the
    /// table writers.
    pub fn apply_deletions(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.pending_deletions) {
            info!(set = %id, "deleting ip set");
            self.kernel.remove(&id);
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
    use std::net::Ipv4Addr;

    fn writer() -> IpSetsWriter {
        IpSetsWriter::new(IpSetsMap::new(), 4)
    }

    fn addr(last: u8) -> IpSetMember {
        IpSetMember::Addr(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_updates_program_kernel_store() {
        let mut writer = writer();
        let id = IpSetId("rpl-s-hosts".into());
        writer
            .add_or_replace_members(id.clone(), IpSetKind::Addrs, vec![addr(1), addr(2)])
            .unwrap();
        writer.apply_updates().unwrap();

        let programmed = writer.kernel().get(&id).unwrap();
        assert_eq!(programmed.len(), 2);
        assert!(programmed.contains(&addr(1)));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut writer = writer();
        let err = writer.add_or_replace_members(
            IpSetId("rpl-s-x".into()),
            IpSetKind::Addrs,
            vec![IpSetMember::AddrProto(
                Ipv4Addr::new(1, 1, 1, 1),
                crate::proto::Protocol::Tcp,
            )],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_max_size_enforced() {
        let mut writer = writer();
        writer
            .add_or_replace_members(
                IpSetId("rpl-s-big".into()),
                IpSetKind::Addrs,
                (1..=5).map(addr).collect(),
            )
            .unwrap();
        assert!(writer.apply_updates().is_err());
    }

    #[test]
    fn test_deletion_deferred_until_applied() {
        let mut writer = writer();
        let id = IpSetId("rpl-s-gone".into());
        writer
            .add_or_replace_members(id.clone(), IpSetKind::Addrs, vec![addr(1)])
            .unwrap();
        writer.apply_updates().unwrap();

        writer.remove_set(&id);
        // Still present: table writers have not dropped references yet.
        assert!(writer.kernel().get(&id).is_some());

        writer.apply_deletions().unwrap();
        assert!(writer.kernel().get(&id).is_none());
    }

    #[test]
    fn test_delta_updates_membership() {
        let mut writer = writer();
        let id = IpSetId("rpl-s-delta".into());
        writer
            .add_or_replace_members(id.clone(), IpSetKind::Addrs, vec![addr(1), addr(2)])
            .unwrap();
        writer.apply_updates().unwrap();

        writer
            .apply_delta(&id, vec![addr(3)], vec![addr(1)])
            .unwrap();
        writer.apply_updates().unwrap();

        let programmed = writer.kernel().get(&id).unwrap();
        assert!(!programmed.contains(&addr(1)));
        assert!(programmed.contains(&addr(2)));
        assert!(programmed.contains(&addr(3)));
    }

    #[test]
    fn test_resync_removes_stray_sets() {
        let mut writer = writer();
        writer.apply_updates().unwrap();

        // Something else left a set behind.
        writer
            .kernel
            .insert(IpSetId("stray".into()), HashSet::new());
        writer.queue_resync();
        writer.apply_updates().unwrap();
        assert!(writer.kernel().get(&IpSetId("stray".into())).is_none());
    }
}
