//! The certification registry (§4.3): a per-node, monotonic, thread-safe store of Byzantine pairs
//! and completed core invocations, readable and writable across every protocol layer.

use dashmap::{DashMap, DashSet};

use crate::network_info::NodeId;

/// Unordered pair `{min, max}` of suspected-Byzantine node ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlaggedPair(NodeId, NodeId);

impl FlaggedPair {
    fn new(i: NodeId, j: NodeId) -> Self {
        if i <= j {
            FlaggedPair(i, j)
        } else {
            FlaggedPair(j, i)
        }
    }
}

/// Thread-safe because `DashSet`/`DashMap` shard their locks internally; exposed through `&self`
/// methods only so the registry can be shared as a plain `Arc<CertificationRegistry>` without an
/// outer lock, satisfying §4.3's "must be safe for concurrent read/write" requirement even though
/// a single node's engines all run on one cooperative task (§5).
#[derive(Default)]
pub struct CertificationRegistry {
    flagged: DashSet<FlaggedPair>,
    invocations: DashMap<String, ()>,
}

impl CertificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently flags `{i,j}` as containing at least one Byzantine party. Never un-flags:
    /// the set only grows (§8 property 12, monotonicity of certification).
    pub fn flag(&self, i: NodeId, j: NodeId) {
        self.flagged.insert(FlaggedPair::new(i, j));
    }

    pub fn is_flagged(&self, i: NodeId, j: NodeId) -> bool {
        self.flagged.contains(&FlaggedPair::new(i, j))
    }

    pub fn record_invocation(&self, instance: impl Into<String>) {
        self.invocations.insert(instance.into(), ());
    }

    pub fn has_invocation(&self, instance: &str) -> bool {
        self.invocations.contains_key(instance)
    }

    pub fn list_invocations(&self) -> Vec<String> {
        self.invocations.iter().map(|e| e.key().clone()).collect()
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.len()
    }
}
