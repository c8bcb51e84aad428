//! Scope tree and the data sink interface
//!
//! Profiler backends report metrics against scopes: named, possibly nested
//! spans owned by the host profiling framework. Backends only see the
//! [`DataSink`] trait; [`ScopeTree`] is the in-memory implementation used for
//! offline analysis and tests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use super::metric::{PcSamplingMetric, PcSamplingValues};

/// Identifier of a scope in the host data model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub u64);

impl ScopeId {
    /// Implicit root every top-level scope hangs off
    pub const ROOT: ScopeId = ScopeId(0);
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiver of attributed samples
///
/// Implementations must tolerate calls from whichever host thread drives the
/// profiler backend.
pub trait DataSink: Send + Sync {
    /// Open a child scope named `name` under `parent`, or return the existing one
    fn add_scope(&self, parent: ScopeId, name: &str) -> ScopeId;

    /// Attach a metric record to `scope`
    fn add_metric(&self, scope: ScopeId, metric: PcSamplingMetric);
}

/// A single node of the scope tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: ScopeId,
    pub name: String,
}

#[derive(Debug, Default)]
struct ScopeTreeInner {
    next_id: u64,
    scopes: HashMap<ScopeId, Scope>,
    children: HashMap<(ScopeId, String), ScopeId>,
    records: Vec<(ScopeId, PcSamplingMetric)>,
    values: HashMap<ScopeId, PcSamplingValues>,
}

/// Thread-safe in-memory data sink
#[derive(Debug, Default)]
pub struct ScopeTree {
    inner: Mutex<ScopeTreeInner>,
}

impl ScopeTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeTreeInner> {
        // A poisoned tree still holds consistent records; keep serving it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a scope by id
    pub fn scope(&self, id: ScopeId) -> Option<Scope> {
        self.lock().scopes.get(&id).cloned()
    }

    /// Find the child of `parent` named `name`
    pub fn child(&self, parent: ScopeId, name: &str) -> Option<ScopeId> {
        self.lock().children.get(&(parent, name.to_string())).copied()
    }

    /// Children of `parent`, in creation order
    pub fn children(&self, parent: ScopeId) -> Vec<Scope> {
        let inner = self.lock();
        let mut children: Vec<Scope> = inner
            .scopes
            .values()
            .filter(|s| s.parent == parent)
            .cloned()
            .collect();
        children.sort_by_key(|s| s.id);
        children
    }

    /// Number of scopes created so far
    pub fn scope_count(&self) -> usize {
        self.lock().scopes.len()
    }

    /// Every metric record received, in arrival order
    pub fn records(&self) -> Vec<(ScopeId, PcSamplingMetric)> {
        self.lock().records.clone()
    }

    /// Metric records attached directly to `scope`
    pub fn records_for(&self, scope: ScopeId) -> Vec<PcSamplingMetric> {
        self.lock()
            .records
            .iter()
            .filter(|(id, _)| *id == scope)
            .map(|(_, m)| *m)
            .collect()
    }

    /// Accumulated values attached directly to `scope`
    pub fn values(&self, scope: ScopeId) -> PcSamplingValues {
        self.lock().values.get(&scope).cloned().unwrap_or_default()
    }

    /// Build a JSON representation of the tree
    pub fn to_json_value(&self) -> serde_json::Value {
        let inner = self.lock();
        let mut ids: Vec<&ScopeId> = inner.scopes.keys().collect();
        ids.sort();

        let scopes: Vec<serde_json::Value> = ids
            .into_iter()
            .map(|id| {
                let scope = &inner.scopes[id];
                let metrics: serde_json::Map<String, serde_json::Value> = inner
                    .values
                    .get(id)
                    .map(|v| {
                        v.non_zero()
                            .into_iter()
                            .map(|(name, value)| (name.to_string(), serde_json::Value::from(value)))
                            .collect()
                    })
                    .unwrap_or_default();
                serde_json::json!({
                    "id": scope.id,
                    "parent": scope.parent,
                    "name": scope.name,
                    "metrics": metrics,
                })
            })
            .collect();

        serde_json::json!({
            "total_records": inner.records.len(),
            "scopes": scopes,
        })
    }

    /// Write the tree as pretty-printed JSON
    pub fn write_json(&self, output_path: &Path) -> Result<()> {
        info!("Writing scope tree JSON: {}", output_path.display());

        let file = File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;

        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, &self.to_json_value())
            .context("Failed to serialize scope tree to JSON")?;

        Ok(())
    }
}

impl DataSink for ScopeTree {
    fn add_scope(&self, parent: ScopeId, name: &str) -> ScopeId {
        let mut inner = self.lock();
        if let Some(id) = inner.children.get(&(parent, name.to_string())) {
            return *id;
        }

        // Parents created by the host become nodes of their own, and ids
        // are always allocated above every id seen so far.
        if parent != ScopeId::ROOT && !inner.scopes.contains_key(&parent) {
            inner.scopes.insert(
                parent,
                Scope {
                    id: parent,
                    parent: ScopeId::ROOT,
                    name: parent.to_string(),
                },
            );
        }
        inner.next_id = inner.next_id.max(parent.0) + 1;
        let id = ScopeId(inner.next_id);
        inner.scopes.insert(
            id,
            Scope {
                id,
                parent,
                name: name.to_string(),
            },
        );
        inner.children.insert((parent, name.to_string()), id);
        id
    }

    fn add_metric(&self, scope: ScopeId, metric: PcSamplingMetric) {
        let mut inner = self.lock();
        inner.values.entry(scope).or_default().accumulate(&metric);
        inner.records.push((scope, metric));
    }
}
