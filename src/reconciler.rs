//! Incremental recomputation of derived state.
//!
//! Reconciliation walks the active branch from the lowest mutated point
//! (the shared root) to the head, folding each mounted domain's handlers
//! over the actions in tree order. Results are memoized per
//! `(action, mount)` in the [`Warehouse`]; a step whose input identity
//! and action revision are unchanged is reused without invoking the
//! handler. Because the walk always restarts at the earliest changed
//! node, completions applied out of wall-clock order still produce the
//! state their tree positions dictate.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::action::ActionId;
use crate::command::{LifecycleStage, PATCH_TAG, RESET_TAG};
use crate::domain::{ActionMeta, Domain, HandlerTable};
use crate::history::{ActionNode, History};
use crate::repo::ForkId;
use crate::warehouse::{MountId, Snapshot, Warehouse};

/// One mounted domain: its identity, owner fork, state key, dispatch
/// table, and initial state.
pub(crate) struct Mount {
    pub id: MountId,
    pub fork: ForkId,
    pub key: String,
    pub initial: Arc<Value>,
    pub table: HandlerTable,
    pub domain: Box<dyn Domain>,
}

impl Mount {
    pub fn new(
        id: MountId,
        fork: ForkId,
        key: impl Into<String>,
        domain: Box<dyn Domain>,
    ) -> Self {
        let mut table = HandlerTable::new();
        domain.register(&mut table);
        let initial = Arc::new(domain.initial_state());
        Self {
            id,
            fork,
            key: key.into(),
            initial,
            table,
            domain,
        }
    }
}

/// Replay the active branch from `start`, returning each mount's state
/// at the head.
///
/// Handler exceptions are deliberately not caught: a panicking handler
/// is a configuration defect and must surface, not corrupt state
/// silently.
pub(crate) fn reconcile(
    history: &History,
    warehouse: &mut Warehouse,
    mounts: &[Mount],
    start: ActionId,
) -> HashMap<MountId, Arc<Value>> {
    let path = history.branch_from(Some(start));
    tracing::debug!(start = %start, steps = path.len(), "reconciling");

    // Seed each mount's flowing state from the node before the start:
    // its cached output, else the archived baseline, else the initial
    // state.
    let predecessor = history.node(start).and_then(|n| n.parent);
    let mut current: HashMap<MountId, Arc<Value>> = HashMap::with_capacity(mounts.len());
    for mount in mounts {
        let input = predecessor
            .and_then(|p| warehouse.get(p, mount.id))
            .map(|snapshot| Arc::clone(&snapshot.next))
            .or_else(|| warehouse.baseline(mount.id).cloned())
            .unwrap_or_else(|| Arc::clone(&mount.initial));
        current.insert(mount.id, input);
    }

    for id in path {
        let Some(node) = history.node(id) else {
            continue;
        };
        let revision = node.state.revision;
        for mount in mounts {
            let incoming = Arc::clone(&current[&mount.id]);
            if let Some(snapshot) = warehouse.get(id, mount.id)
                && snapshot.is_valid(&incoming, revision)
            {
                current.insert(mount.id, Arc::clone(&snapshot.next));
                continue;
            }
            let next = step(mount, node, &incoming);
            warehouse.set(
                id,
                mount.id,
                Snapshot {
                    last: incoming,
                    next: Arc::clone(&next),
                    revision,
                },
            );
            current.insert(mount.id, next);
        }
    }
    current
}

/// Compute one mount's next state for one action node.
fn step(mount: &Mount, node: &ActionNode, incoming: &Arc<Value>) -> Arc<Value> {
    let state = &node.state;
    // A disabled action contributes nothing while keeping its position;
    // `unset`/`unsubscribed` actions have no dispatchable stage.
    if state.disabled {
        return Arc::clone(incoming);
    }
    let Some(stage) = state.status.stage() else {
        return Arc::clone(incoming);
    };

    // State injection built-ins run before the dispatch table: they are
    // repo-level commands no domain registers for.
    if stage == LifecycleStage::Done {
        match node.tag.as_str() {
            RESET_TAG => {
                return match state.payload.get(&mount.key) {
                    Some(raw) => Arc::new(mount.domain.deserialize(raw.clone())),
                    None => Arc::clone(&mount.initial),
                };
            }
            PATCH_TAG => {
                return match state.payload.get(&mount.key) {
                    Some(raw) => Arc::new(raw.clone()),
                    None => Arc::clone(incoming),
                };
            }
            _ => {}
        }
    }

    match mount.table.get(&node.tag, stage) {
        Some(handler) => {
            let meta = ActionMeta {
                id: node.id,
                tag: &node.tag,
                status: state.status,
            };
            Arc::new(handler(incoming, &state.payload, &meta))
        }
        None => Arc::clone(incoming),
    }
}
