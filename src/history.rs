//! The branchable, prunable tree of actions.
//!
//! Nodes live in an arena keyed by [`ActionId`]; parent/child links are
//! ids, so there are no reference cycles to manage. Exactly one child per
//! node is marked active, making the root→head path deterministic.
//! Insertion-order iteration falls out of the id-keyed `BTreeMap` because
//! ids are monotonic.
//!
//! This module is deliberately synchronous and event-free: mutations
//! return what happened and the repo actor turns that into emissions.

use serde_json::{Value, json};

use std::collections::BTreeMap;

use crate::action::{ActionId, ActionState, Transition};
use crate::command::CommandTag;
use crate::error::HistoryError;

/// Notifications the history produces for downstream consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    /// A node was appended at the head.
    Append(ActionId),
    /// A node left the retained tree (archive, remove, or prune).
    Remove(ActionId),
    /// The active branch switched to pass through this node.
    Checkout(ActionId),
    /// Reconciliation ran, starting at this node.
    Reconcile(ActionId),
    /// Derived state settled after a batch of mutations.
    Release,
}

/// One retained action record.
#[derive(Debug)]
pub struct ActionNode {
    pub id: ActionId,
    pub tag: CommandTag,
    pub state: ActionState,
    pub parent: Option<ActionId>,
    pub children: Vec<ActionId>,
    /// The one child on the active branch, if any.
    pub active_child: Option<ActionId>,
}

/// What `archive` removed.
///
/// `folded` lists the nodes whose derived snapshots must be absorbed into
/// the reconciler baseline, oldest first -- exactly the sequence of old
/// roots, in eviction order. `dropped` lists every removed node
/// (including the folded ones and any discarded inactive subtrees).
#[derive(Debug, Default)]
pub struct ArchiveOutcome {
    pub folded: Vec<ActionId>,
    pub dropped: Vec<ActionId>,
}

/// The ordered, branchable action history.
pub struct History {
    nodes: BTreeMap<ActionId, ActionNode>,
    root: Option<ActionId>,
    head: Option<ActionId>,
    limit: Option<usize>,
}

impl History {
    /// An empty history.
    ///
    /// `limit` is the maximum retained node count; `None` retains
    /// everything (no eviction).
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            root: None,
            head: None,
            limit,
        }
    }

    /// Oldest retained node.
    pub fn root(&self) -> Option<ActionId> {
        self.root
    }

    /// Tip of the active branch.
    pub fn head(&self) -> Option<ActionId> {
        self.head
    }

    /// Number of retained nodes.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Retention limit, if finite.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Whether the id refers to a retained node.
    pub fn contains(&self, id: ActionId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Borrow a retained node.
    pub fn node(&self, id: ActionId) -> Option<&ActionNode> {
        self.nodes.get(&id)
    }

    /// Append a fresh action as the active child of the current head.
    ///
    /// The first append seeds both `root` and `head`.
    pub fn append(&mut self, id: ActionId, tag: CommandTag) {
        let parent = self.head;
        if let Some(parent_id) = parent
            && let Some(parent_node) = self.nodes.get_mut(&parent_id)
        {
            parent_node.children.push(id);
            parent_node.active_child = Some(id);
        }
        self.nodes.insert(
            id,
            ActionNode {
                id,
                tag,
                state: ActionState::default(),
                parent,
                children: Vec::new(),
                active_child: None,
            },
        );
        if self.root.is_none() {
            self.root = Some(id);
        }
        self.head = Some(id);
    }

    /// Apply a lifecycle transition to a retained node.
    ///
    /// Returns whether the node actually changed (ignored transitions on
    /// terminal actions return `false`).
    ///
    /// # Errors
    ///
    /// [`HistoryError::UnknownAction`] if the id is not retained.
    pub fn apply(&mut self, id: ActionId, transition: Transition) -> Result<bool, HistoryError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(HistoryError::UnknownAction(id.0))?;
        Ok(node.state.apply(transition))
    }

    /// Flip a node's disabled flag in place.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UnknownAction`] if the id is not retained.
    pub fn toggle(&mut self, id: ActionId) -> Result<(), HistoryError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(HistoryError::UnknownAction(id.0))?;
        node.state.toggle();
        Ok(())
    }

    /// Whether the node lies on the root→head path.
    pub fn is_active(&self, id: ActionId) -> bool {
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == id {
                return true;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }
        false
    }

    /// The reconciliation starting point for a change at `id`: the node
    /// itself when it is on the active branch, otherwise its nearest
    /// ancestor that is -- everything at or below that ancestor on the
    /// active branch is the only state that can differ.
    pub fn shared_root(&self, id: ActionId) -> Option<ActionId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.is_active(current) {
                return Some(current);
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }
        None
    }

    /// Switch the active branch to pass through `id`.
    ///
    /// Flips active-child pointers along the path from `id` back to the
    /// root, so exactly one root→head path is active afterwards. Returns
    /// the shared root with the previous head -- the point reconciliation
    /// must restart from.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UnknownAction`] if the id is not retained.
    pub fn checkout(&mut self, id: ActionId) -> Result<ActionId, HistoryError> {
        if !self.contains(id) {
            return Err(HistoryError::UnknownAction(id.0));
        }
        // Compute before flipping: afterwards `id` is trivially active.
        let start = self.shared_root(id).unwrap_or(id);

        self.head = Some(id);
        let mut child = id;
        while let Some(parent_id) = self.nodes.get(&child).and_then(|n| n.parent) {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                parent.active_child = Some(child);
            }
            child = parent_id;
        }
        Ok(start)
    }

    /// Splice a node out of the tree, re-parenting its children.
    ///
    /// The children take the removed node's place in its parent's child
    /// list; if the head is removed, it retreats to the parent. Removing
    /// the root promotes its active child and discards any inactive
    /// sibling subtrees. Returns every id that left the tree, the spliced
    /// node first.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UnknownAction`] if the id is not retained.
    pub fn remove(&mut self, id: ActionId) -> Result<Vec<ActionId>, HistoryError> {
        let node = self.nodes.get(&id).ok_or(HistoryError::UnknownAction(id.0))?;
        let parent = node.parent;
        let children = node.children.clone();
        let active_child = node.active_child;

        match parent {
            Some(parent_id) => {
                self.nodes.remove(&id);
                for child in &children {
                    if let Some(child_node) = self.nodes.get_mut(child) {
                        child_node.parent = Some(parent_id);
                    }
                }
                if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                    let at = parent_node
                        .children
                        .iter()
                        .position(|c| *c == id)
                        .unwrap_or(parent_node.children.len());
                    parent_node.children.splice(at..at, children);
                    parent_node.children.retain(|c| *c != id);
                    if parent_node.active_child == Some(id) {
                        parent_node.active_child = active_child;
                    }
                }
                if self.head == Some(id) {
                    self.head = Some(parent_id);
                }
                Ok(vec![id])
            }
            None => {
                // Root removal: promote the active child, discard the rest.
                self.nodes.remove(&id);
                let mut removed = vec![id];
                let promoted = active_child.or_else(|| children.first().copied());
                for child in children {
                    if Some(child) == promoted {
                        continue;
                    }
                    removed.extend(self.drop_subtree(child));
                }
                match promoted {
                    Some(new_root) => {
                        if let Some(n) = self.nodes.get_mut(&new_root) {
                            n.parent = None;
                        }
                        self.root = Some(new_root);
                        if self.head == Some(id) {
                            self.head = Some(new_root);
                        }
                    }
                    None => {
                        self.root = None;
                        self.head = None;
                    }
                }
                Ok(removed)
            }
        }
    }

    /// Drop a disconnected subtree entirely.
    ///
    /// # Errors
    ///
    /// [`HistoryError::UnknownAction`] if the id is not retained;
    /// [`HistoryError::ActiveSubtree`] if the node is on the active
    /// branch (disconnect it first by checking out a sibling).
    pub fn prune(&mut self, id: ActionId) -> Result<Vec<ActionId>, HistoryError> {
        if !self.contains(id) {
            return Err(HistoryError::UnknownAction(id.0));
        }
        if self.is_active(id) {
            return Err(HistoryError::ActiveSubtree(id.0));
        }
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        if let Some(parent_id) = parent
            && let Some(parent_node) = self.nodes.get_mut(&parent_id)
        {
            parent_node.children.retain(|c| *c != id);
            if parent_node.active_child == Some(id) {
                parent_node.active_child = None;
            }
        }
        Ok(self.drop_subtree(id))
    }

    /// Evict settled nodes from the front while over the retention limit.
    ///
    /// The root is evicted only when it is terminal, promoting its active
    /// child would orphan no unresolved node (every discarded inactive
    /// sibling subtree must be fully settled), and at least one node
    /// remains retained.
    pub fn archive(&mut self) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome::default();
        let Some(limit) = self.limit else {
            return outcome;
        };
        let floor = limit.max(1);

        while self.nodes.len() > floor {
            let Some(root_id) = self.root else { break };
            let Some(root) = self.nodes.get(&root_id) else {
                break;
            };
            if !root.state.status.is_terminal() {
                break;
            }
            let Some(next_root) = root.active_child else {
                // A childless root is the last retained node.
                break;
            };
            let discard: Vec<ActionId> = root
                .children
                .iter()
                .copied()
                .filter(|c| *c != next_root)
                .collect();
            if discard.iter().any(|c| !self.subtree_settled(*c)) {
                break;
            }

            for subtree in discard {
                outcome.dropped.extend(self.drop_subtree(subtree));
            }
            self.nodes.remove(&root_id);
            outcome.folded.push(root_id);
            outcome.dropped.push(root_id);
            if let Some(n) = self.nodes.get_mut(&next_root) {
                n.parent = None;
            }
            self.root = Some(next_root);
        }
        outcome
    }

    /// All retained nodes in insertion (id) order -- the full tree, not
    /// just the active branch.
    pub fn iter(&self) -> impl Iterator<Item = &ActionNode> {
        self.nodes.values()
    }

    /// The ids on the root→head path, in order.
    pub fn active_branch(&self) -> Vec<ActionId> {
        self.branch_from(self.root)
    }

    /// The ids from `start` to head along active-child pointers.
    ///
    /// Empty when `start` is not an active ancestor of the head.
    pub fn branch_from(&self, start: Option<ActionId>) -> Vec<ActionId> {
        let mut path = Vec::new();
        let Some(head) = self.head else { return path };
        let mut cursor = start;
        while let Some(id) = cursor {
            path.push(id);
            if id == head {
                return path;
            }
            cursor = self.nodes.get(&id).and_then(|n| n.active_child);
        }
        // The chain ran out without reaching the head: `start` was not on
        // the active branch.
        Vec::new()
    }

    /// Ids of retained actions that have not yet settled.
    pub fn pending(&self) -> Vec<ActionId> {
        self.nodes
            .values()
            .filter(|n| !n.state.status.is_terminal())
            .map(|n| n.id)
            .collect()
    }

    /// Devtools dump: `{size, limit, root, head, tree}`.
    ///
    /// Purely a debugging wire shape, not a persistence format.
    pub fn to_json(&self) -> Value {
        json!({
            "size": self.size(),
            "limit": self.limit,
            "root": self.root.map(|id| id.0),
            "head": self.head.map(|id| id.0),
            "tree": self.root.map(|id| self.node_json(id)).unwrap_or(Value::Null),
        })
    }

    fn node_json(&self, id: ActionId) -> Value {
        let Some(node) = self.nodes.get(&id) else {
            return Value::Null;
        };
        json!({
            "id": node.id.0,
            "command": node.tag.as_str(),
            "status": node.state.status,
            "payload": node.state.payload,
            "disabled": node.state.disabled,
            "children": node
                .children
                .iter()
                .map(|child| self.node_json(*child))
                .collect::<Vec<_>>(),
        })
    }

    fn subtree_settled(&self, id: ActionId) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return true;
        };
        node.state.status.is_terminal()
            && node.children.iter().all(|c| self.subtree_settled(*c))
    }

    fn drop_subtree(&mut self, id: ActionId) -> Vec<ActionId> {
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
                removed.push(current);
            }
        }
        removed
    }
}
