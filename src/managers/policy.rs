// # Policy Manager
//
// Renders tier/policy chains into the filter table and keeps the
// compiled policy repository that the attachment manager installs
// into the fast-path jump tables. Chain names carry a content hash
// so an unrelated policy change never rewrites another policy's
// chains.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::fastpath::{CompiledTier, PolicyProgram};
use crate::managers::{Manager, SharedTableWriter};
use crate::proto::{DesiredStateUpdate, Policy, PolicyId, TierInfo};
use crate::render::{self, Chain};

/// The compiled view of all policies and profiles, shared read-only
/// with the attachment manager. The generation bumps on every change
/// so stale jump-table installs are detectable.
#[derive(Debug, Default)]
pub struct CompiledPolicies {
    pub generation: u64,
    pub policies: HashMap<PolicyId, Policy>,
    pub profiles: HashMap<PolicyId, Policy>,
}

pub type PolicyRepo = Arc<RwLock<CompiledPolicies>>;

/// Flatten the tiers that apply to one endpoint direction into a
/// policy sub-program. Policies missing from the repo contribute no
/// rules (they will arrive; the dispatch defaults to deny for
/// workloads meanwhile).
pub fn compile_policy_program(
    tiers: &[TierInfo],
    profiles: &[PolicyId],
    repo: &PolicyRepo,
    ingress: bool,
) -> PolicyProgram {
    let repo = repo.read();
    let mut compiled = Vec::new();

    for tier in tiers {
        let ids = if ingress {
            &tier.ingress_policies
        } else {
            &tier.egress_policies
        };
        let mut members: Vec<&Policy> =
            ids.iter().filter_map(|id| repo.policies.get(id)).collect();
        members.sort_by_key(|p| (p.order, p.id.clone()));

        let mut rules = Vec::new();
        for policy in members {
            let source = if ingress {
                &policy.inbound_rules
            } else {
                &policy.outbound_rules
            };
            rules.extend(source.iter().cloned());
        }
        compiled.push(CompiledTier {
            name: tier.name.clone(),
            rules,
        });
    }

    // Profiles evaluate after every tier.
    let mut profile_rules = Vec::new();
    for id in profiles {
        if let Some(profile) = repo.profiles.get(id) {
            let source = if ingress {
                &profile.inbound_rules
            } else {
                &profile.outbound_rules
            };
            profile_rules.extend(source.iter().cloned());
        }
    }
    if !profile_rules.is_empty() {
        compiled.push(CompiledTier {
            name: "profiles".to_string(),
            rules: profile_rules,
        });
    }

    PolicyProgram {
        tiers: compiled,
        generation: repo.generation,
    }
}

pub struct PolicyManager {
    filter: SharedTableWriter,
    repo: PolicyRepo,
    accept_mark: u32,
    dirty: BTreeSet<PolicyId>,
    removed: BTreeSet<PolicyId>,
    repo_dirty: bool,
}

impl PolicyManager {
    pub fn new(filter: SharedTableWriter, accept_mark: u32) -> Self {
        Self {
            filter,
            repo: Arc::new(RwLock::new(CompiledPolicies::default())),
            accept_mark,
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
            repo_dirty: false,
        }
    }

    pub fn repo(&self) -> PolicyRepo {
        Arc::clone(&self.repo)
    }

    /// Chain names for one policy: inbound and outbound.
    pub fn chain_names(id: &PolicyId) -> (String, String) {
        (
            render::chain_name("pi", &id.0),
            render::chain_name("po", &id.0),
        )
    }

    fn render_chains(&self, policy: &Policy) -> Vec<Chain> {
        let (in_name, out_name) = Self::chain_names(&policy.id);
        let mut inbound = Chain::new(in_name);
        for rule in &policy.inbound_rules {
            inbound.rules.extend(render::render_policy_rule(rule, self.accept_mark));
        }
        let mut outbound = Chain::new(out_name);
        for rule in &policy.outbound_rules {
            outbound.rules.extend(render::render_policy_rule(rule, self.accept_mark));
        }
        vec![inbound, outbound]
    }
}

#[async_trait]
impl Manager for PolicyManager {
    fn on_update(&mut self, msg: &DesiredStateUpdate) {
        match msg {
            DesiredStateUpdate::PolicyUpdate(policy) => {
                self.repo.write().policies.insert(policy.id.clone(), policy.clone());
                self.removed.remove(&policy.id);
                self.dirty.insert(policy.id.clone());
                self.repo_dirty = true;
            }
            DesiredStateUpdate::PolicyRemove(id) => {
                if self.repo.write().policies.remove(id).is_some() {
                    self.dirty.remove(id);
                    self.removed.insert(id.clone());
                    self.repo_dirty = true;
                }
            }
            DesiredStateUpdate::ProfileUpdate(profile) => {
                self.repo.write().profiles.insert(profile.id.clone(), profile.clone());
                self.removed.remove(&profile.id);
                self.dirty.insert(profile.id.clone());
                self.repo_dirty = true;
            }
            DesiredStateUpdate::ProfileRemove(id) => {
                if self.repo.write().profiles.remove(id).is_some() {
                    self.dirty.remove(id);
                    self.removed.insert(id.clone());
                    self.repo_dirty = true;
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if self.repo_dirty {
            self.repo.write().generation += 1;
            self.repo_dirty = false;
        }

        let dirty = std::mem::take(&mut self.dirty);
        let removed = std::mem::take(&mut self.removed);
        if dirty.is_empty() && removed.is_empty() {
            return Ok(());
        }

        let mut filter = self.filter.lock().await;
        for id in dirty {
            let repo = self.repo.read();
            let policy = repo.policies.get(&id).or_else(|| repo.profiles.get(&id));
            if let Some(policy) = policy {
                debug!(policy = %id, "rendering policy chains");
                let chains = self.render_chains(policy);
                drop(repo);
                filter.update_chains(chains);
            }
        }
        for id in removed {
            let (in_name, out_name) = Self::chain_names(&id);
            filter.remove_chain_by_name(&in_name);
            filter.remove_chain_by_name(&out_name);
        }
        Ok(())
    }
}
