//! Per-action memoization of reconciliation results.
//!
//! Each `(action, mount)` pair caches the state that flowed in, the
//! state that came out, and the action revision the result was computed
//! at. A snapshot is reusable only while the incoming state is the very
//! same allocation (`Arc` pointer equality -- the identity-compare
//! contract) and the action has not changed since. Archived prefixes
//! fold their output into a per-mount baseline so replay never has to
//! reach past the retained root.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::action::ActionId;

/// Identity of one mounted domain, unique within a repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MountId(pub u64);

/// A memoized `(input, output)` pair for one action/mount step.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    /// The upstream state the result was computed against.
    pub last: Arc<Value>,
    /// The state produced by this step.
    pub next: Arc<Value>,
    /// The action revision at computation time.
    pub revision: u64,
}

impl Snapshot {
    /// Whether the snapshot can stand in for recomputation.
    pub fn is_valid(&self, incoming: &Arc<Value>, revision: u64) -> bool {
        Arc::ptr_eq(&self.last, incoming) && self.revision == revision
    }
}

/// The two-level snapshot cache: action → mount → snapshot.
#[derive(Default)]
pub(crate) struct Warehouse {
    snapshots: HashMap<ActionId, HashMap<MountId, Snapshot>>,
    /// Folded output of archived prefixes, per mount.
    baseline: HashMap<MountId, Arc<Value>>,
}

impl Warehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, action: ActionId, mount: MountId) -> Option<&Snapshot> {
        self.snapshots.get(&action)?.get(&mount)
    }

    pub fn set(&mut self, action: ActionId, mount: MountId, snapshot: Snapshot) {
        self.snapshots.entry(action).or_default().insert(mount, snapshot);
    }

    /// Drop every consumer snapshot for an action.
    pub fn delete(&mut self, action: ActionId) {
        self.snapshots.remove(&action);
    }

    /// Absorb an archived action's output into the baseline, then drop
    /// its snapshots.
    ///
    /// Mounts with no snapshot for the action keep their current
    /// baseline: the action contributed nothing to them.
    pub fn fold_into_baseline(&mut self, action: ActionId) {
        if let Some(per_mount) = self.snapshots.remove(&action) {
            for (mount, snapshot) in per_mount {
                self.baseline.insert(mount, snapshot.next);
            }
        }
    }

    /// The folded prefix state for a mount, if any action was archived.
    pub fn baseline(&self, mount: MountId) -> Option<&Arc<Value>> {
        self.baseline.get(&mount)
    }

    /// Number of actions with at least one cached snapshot.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }
}
