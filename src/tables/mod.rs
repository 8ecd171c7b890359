// # Table Writers
//
// One writer per kernel table (filter, nat, mangle, raw). A writer
// owns the agent's chains in its table and applies changes as a
// single transactional save/restore batch; partial failures abort
// the whole batch. A shared lock serializes writers when the
// backend's own locking is unavailable, and a jittered post-write
// self-check detects external mutation and asks the driver for a
// reconvergence pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::common::RuleInsertMode;
use crate::error::{DpError, Result};
use crate::render::{Chain, RenderedRule, TableKind};

// ============================================================================
// Backend
// ============================================================================

/// The kernel-facing half of a writer: applies a restore-format
/// payload and reads back the programmed state.
#[async_trait]
pub trait TableBackend: Send + Sync {
    async fn apply(&self, table: TableKind, payload: &str) -> Result<()>;
    /// Chain name to rendered rule fragments, for the self-check.
    async fn read_chains(&self, table: TableKind) -> Result<BTreeMap<String, Vec<String>>>;
}

/// Shells out to the restore binary, one transaction per apply.
pub struct ExecBackend {
    restore_bin: String,
}

impl ExecBackend {
    pub fn new() -> Self {
        Self {
            restore_bin: "iptables-restore".to_string(),
        }
    }
}

impl Default for ExecBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableBackend for ExecBackend {
    async fn apply(&self, table: TableKind, payload: &str) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.restore_bin)
            .arg("--noflush")
            .arg("-w")
            .arg("10")
            .stdin(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| DpError::Table(format!("spawn {}: {}", self.restore_bin, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| DpError::Table(format!("write restore payload: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DpError::Table(format!("wait for restore: {}", e)))?;
        if !output.status.success() {
            return Err(DpError::Table(format!(
                "{} failed for table {}: {}",
                self.restore_bin,
                table.name(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn read_chains(&self, table: TableKind) -> Result<BTreeMap<String, Vec<String>>> {
        let output = tokio::process::Command::new("iptables-save")
            .arg("-t")
            .arg(table.name())
            .output()
            .await
            .map_err(|e| DpError::Table(format!("spawn iptables-save: {}", e)))?;
        if !output.status.success() {
            return Err(DpError::Table(format!(
                "iptables-save failed for table {}",
                table.name()
            )));
        }
        Ok(parse_save_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// The kernel's own chains always exist and are never flushed by us.
fn is_builtin_chain(name: &str) -> bool {
    matches!(
        name,
        "INPUT" | "OUTPUT" | "FORWARD" | "PREROUTING" | "POSTROUTING"
    )
}

fn parse_save_output(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut chains: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(':') {
            if let Some(name) = rest.split_whitespace().next() {
                chains.entry(name.to_string()).or_default();
            }
        } else if let Some(rest) = line.strip_prefix("-A ") {
            if let Some((chain, fragment)) = rest.split_once(' ') {
                chains
                    .entry(chain.to_string())
                    .or_default()
                    .push(fragment.to_string());
            }
        }
    }
    chains
}

/// In-memory backend: a faithful little model of the kernel table,
/// used by tests and exercised by the same payloads the exec backend
/// ships.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<BTreeMap<TableKind, BTreeMap<String, Vec<String>>>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate another tool mutating the table behind our back.
    pub fn mutate_externally(&self, table: TableKind, chain: &str, fragment: &str) {
        self.tables
            .lock()
            .entry(table)
            .or_default()
            .entry(chain.to_string())
            .or_default()
            .push(fragment.to_string());
    }

    pub fn chains(&self, table: TableKind) -> BTreeMap<String, Vec<String>> {
        self.tables.lock().get(&table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TableBackend for MemoryBackend {
    async fn apply(&self, table: TableKind, payload: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        let chains = tables.entry(table).or_default();
        let mut staged = chains.clone();

        for line in payload.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('*') || line == "COMMIT" {
                continue;
            }
            if let Some(rest) = line.strip_prefix(':') {
                let name = rest
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| DpError::Table("malformed chain declaration".into()))?;
                staged.entry(name.to_string()).or_default();
            } else if let Some(chain) = line.strip_prefix("-F ") {
                staged
                    .get_mut(chain)
                    .map(|rules| rules.clear())
                    .ok_or_else(|| DpError::Table(format!("flush of unknown chain {}", chain)))?;
            } else if let Some(chain) = line.strip_prefix("-X ") {
                staged
                    .remove(chain)
                    .ok_or_else(|| DpError::Table(format!("delete of unknown chain {}", chain)))?;
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let (chain, fragment) = rest
                    .split_once(' ')
                    .ok_or_else(|| DpError::Table("malformed append".into()))?;
                if is_builtin_chain(chain) {
                    let rules = staged.entry(chain.to_string()).or_default();
                    // Built-in chain rules are ensured, not stacked.
                    if !rules.iter().any(|r| r == fragment) {
                        rules.push(fragment.to_string());
                    }
                } else {
                    staged
                        .get_mut(chain)
                        .ok_or_else(|| {
                            DpError::Table(format!("append to unknown chain {}", chain))
                        })?
                        .push(fragment.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("-I ") {
                let (chain, fragment) = rest
                    .split_once(' ')
                    .ok_or_else(|| DpError::Table("malformed insert".into()))?;
                let rules = if is_builtin_chain(chain) {
                    staged.entry(chain.to_string()).or_default()
                } else {
                    staged.get_mut(chain).ok_or_else(|| {
                        DpError::Table(format!("insert to unknown chain {}", chain))
                    })?
                };
                if !rules.iter().any(|r| r == fragment) {
                    rules.insert(0, fragment.to_string());
                }
            } else {
                return Err(DpError::Table(format!("unrecognized payload line: {}", line)));
            }
        }

        // Transactional: nothing lands unless every line applied.
        *chains = staged;
        Ok(())
    }

    async fn read_chains(&self, table: TableKind) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self.chains(table))
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Timing knobs for a writer, split from the full agent config so
/// tests can construct writers directly.
#[derive(Debug, Clone)]
pub struct TableWriterOptions {
    pub insert_mode: RuleInsertMode,
    pub refresh_interval: Duration,
    pub refresh_jitter: f64,
    pub lock_timeout: Duration,
    pub lock_probe_interval: Duration,
}

impl Default for TableWriterOptions {
    fn default() -> Self {
        Self {
            insert_mode: RuleInsertMode::Insert,
            refresh_interval: Duration::from_secs(90),
            refresh_jitter: 0.1,
            lock_timeout: Duration::from_secs(10),
            lock_probe_interval: Duration::from_millis(50),
        }
    }
}

pub struct TableWriter {
    table: TableKind,
    backend: Arc<dyn TableBackend>,
    /// Held across apply when the backend lacks its own locking.
    shared_lock: Arc<AsyncMutex<()>>,
    options: TableWriterOptions,

    desired_chains: BTreeMap<String, Chain>,
    /// Rules we ensure exist in the kernel's built-in chains, at the
    /// configured position and appended respectively. Several
    /// managers contribute to the same built-in chain; ensure means
    /// merge, never replace.
    base_rules: BTreeMap<String, Vec<RenderedRule>>,
    base_appends: BTreeMap<String, Vec<RenderedRule>>,
    dirty_chains: BTreeSet<String>,
    dirty_base: BTreeSet<String>,
    pending_deletions: BTreeSet<String>,
    /// Chains we believe are programmed, for the self-check diff.
    programmed: BTreeMap<String, Vec<String>>,
    full_resync: bool,
    next_check: Instant,
}

impl TableWriter {
    pub fn new(
        table: TableKind,
        backend: Arc<dyn TableBackend>,
        shared_lock: Arc<AsyncMutex<()>>,
        options: TableWriterOptions,
    ) -> Self {
        let next_check = Instant::now() + jittered(options.refresh_interval, options.refresh_jitter);
        Self {
            table,
            backend,
            shared_lock,
            options,
            desired_chains: BTreeMap::new(),
            base_rules: BTreeMap::new(),
            base_appends: BTreeMap::new(),
            dirty_chains: BTreeSet::new(),
            dirty_base: BTreeSet::new(),
            pending_deletions: BTreeSet::new(),
            programmed: BTreeMap::new(),
            full_resync: true,
            next_check,
        }
    }

    pub fn table(&self) -> TableKind {
        self.table
    }

    pub fn update_chain(&mut self, chain: Chain) {
        self.pending_deletions.remove(&chain.name);
        let changed = self
            .desired_chains
            .get(&chain.name)
            .map(|existing| existing != &chain)
            .unwrap_or(true);
        if changed {
            self.dirty_chains.insert(chain.name.clone());
            self.desired_chains.insert(chain.name.clone(), chain);
        }
    }

    pub fn update_chains(&mut self, chains: Vec<Chain>) {
        for chain in chains {
            self.update_chain(chain);
        }
    }

    pub fn remove_chain_by_name(&mut self, name: &str) {
        if self.desired_chains.remove(name).is_some() {
            self.dirty_chains.remove(name);
            self.pending_deletions.insert(name.to_string());
        }
    }

    pub fn remove_chains(&mut self, names: &[String]) {
        for name in names {
            self.remove_chain_by_name(name);
        }
    }

    /// Ensure `rules` exist in a built-in chain, at the configured
    /// position.
    pub fn insert_or_append_rules(&mut self, base_chain: &str, rules: Vec<RenderedRule>) {
        let pool = self.base_rules.entry(base_chain.to_string()).or_default();
        let mut changed = false;
        for rule in rules {
            if !pool.contains(&rule) {
                pool.push(rule);
                changed = true;
            }
        }
        if changed {
            self.dirty_base.insert(base_chain.to_string());
        }
    }

    /// Idempotently append, regardless of the configured insert mode.
    pub fn append_rules(&mut self, base_chain: &str, rules: Vec<RenderedRule>) {
        let pool = self.base_appends.entry(base_chain.to_string()).or_default();
        let mut changed = false;
        for rule in rules {
            if !pool.contains(&rule) {
                pool.push(rule);
                changed = true;
            }
        }
        if changed {
            self.dirty_base.insert(base_chain.to_string());
        }
    }

    pub fn queue_resync(&mut self) {
        self.full_resync = true;
    }

    pub fn has_pending_work(&self) -> bool {
        self.full_resync
            || !self.dirty_chains.is_empty()
            || !self.dirty_base.is_empty()
            || !self.pending_deletions.is_empty()
    }

    /// Flush pending changes as one transaction. Returns a requested
    /// reschedule delay when the post-write check found external
    /// mutation.
    pub async fn apply(&mut self) -> Result<Option<Duration>> {
        if self.has_pending_work() {
            let payload = self.render_payload();
            let _guard = self.acquire_shared_lock().await?;
            self.backend.apply(self.table, &payload).await?;
            debug!(table = self.table.name(), "table batch applied");

            self.programmed = self
                .desired_chains
                .iter()
                .map(|(name, chain)| {
                    (
                        name.clone(),
                        chain.rules.iter().map(|r| r.fragment()).collect(),
                    )
                })
                .collect();
            self.dirty_chains.clear();
            self.dirty_base.clear();
            self.pending_deletions.clear();
            self.full_resync = false;
        }

        // Jittered self-check against external mutation.
        if Instant::now() >= self.next_check {
            self.next_check =
                Instant::now() + jittered(self.options.refresh_interval, self.options.refresh_jitter);
            let kernel = self.backend.read_chains(self.table).await?;
            for (name, expected) in &self.programmed {
                if kernel.get(name) != Some(expected) {
                    warn!(
                        table = self.table.name(),
                        chain = %name,
                        "external mutation detected, scheduling reconvergence"
                    );
                    self.full_resync = true;
                    for chain in self.desired_chains.keys() {
                        self.dirty_chains.insert(chain.clone());
                    }
                    return Ok(Some(Duration::from_millis(100)));
                }
            }
        }

        Ok(None)
    }

    async fn acquire_shared_lock(&self) -> Result<OwnedMutexGuard<()>> {
        let deadline = Instant::now() + self.options.lock_timeout;
        loop {
            if let Ok(guard) = Arc::clone(&self.shared_lock).try_lock_owned() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                return Err(DpError::LockTimeout);
            }
            tokio::time::sleep(self.options.lock_probe_interval).await;
        }
    }

    fn render_payload(&self) -> String {
        let mut out = String::new();
        out.push('*');
        out.push_str(self.table.name());
        out.push('\n');

        let chains: Box<dyn Iterator<Item = &String>> = if self.full_resync {
            Box::new(self.desired_chains.keys())
        } else {
            Box::new(self.dirty_chains.iter())
        };

        let mut body = String::new();
        for name in chains {
            let Some(chain) = self.desired_chains.get(name) else {
                continue;
            };
            out.push_str(&format!(":{} - [0:0]\n", chain.name));
            body.push_str(&format!("-F {}\n", chain.name));
            for rule in &chain.rules {
                body.push_str(&format!("-A {} {}\n", chain.name, rule.fragment()));
            }
        }

        let base: Box<dyn Iterator<Item = &String>> = if self.full_resync {
            Box::new(self.base_rules.keys().chain(self.base_appends.keys()))
        } else {
            Box::new(self.dirty_base.iter())
        };
        let mut seen_base = BTreeSet::new();
        for name in base {
            if !seen_base.insert(name.clone()) {
                continue;
            }
            if let Some(rules) = self.base_rules.get(name) {
                // Inserted rules are emitted in reverse so the first
                // registered rule ends up on top.
                for rule in rules.iter().rev() {
                    match self.options.insert_mode {
                        RuleInsertMode::Insert => {
                            body.push_str(&format!("-I {} {}\n", name, rule.fragment()))
                        }
                        RuleInsertMode::Append => {
                            body.push_str(&format!("-A {} {}\n", name, rule.fragment()))
                        }
                    }
                }
            }
            if let Some(rules) = self.base_appends.get(name) {
                for rule in rules {
                    body.push_str(&format!("-A {} {}\n", name, rule.fragment()));
                }
            }
        }

        for name in &self.pending_deletions {
            // A chain created and dropped between applies never
            // reached the kernel; nothing to delete.
            if !self.programmed.contains_key(name) {
                continue;
            }
            body.push_str(&format!("-F {}\n", name));
            body.push_str(&format!("-X {}\n", name));
        }

        out.push_str(&body);
        out.push_str("COMMIT\n");
        out
    }
}

/// Build the standard set of four writers sharing one lock.
pub fn standard_writers(
    backend: Arc<dyn TableBackend>,
    options: TableWriterOptions,
) -> Vec<TableWriter> {
    let lock = Arc::new(AsyncMutex::new(()));
    info!("creating table writers: filter, nat, mangle, raw");
    [TableKind::Filter, TableKind::Nat, TableKind::Mangle, TableKind::Raw]
        .into_iter()
        .map(|table| TableWriter::new(table, Arc::clone(&backend), Arc::clone(&lock), options.clone()))
        .collect()
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    let factor = 1.0 + rand::rng().random_range(0.0..jitter.max(f64::EPSILON));
    base.mul_f64(factor)
}
