//! The per-action finite state machine and its cloneable handle.
//!
//! The pure transition rule lives in [`ActionState::apply`] so ordering
//! and at-most-once guarantees are testable without a runtime. The
//! [`ActionHandle`] is the caller-facing side: transitions are
//! fire-and-forget messages into the repo actor, observation goes through
//! a `watch` channel (cheap status reads, future-interop) or a full
//! [`Subscription`] stream (ordered events with replay).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::command::{CommandTag, LifecycleStage};
use crate::error::RepoError;
use crate::repo::RepoMessage;
use crate::subject::Subscription;

/// Monotonic identity of an action, unique within its repo and stable
/// for the action's lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ActionId(pub u64);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created but not yet started.
    Unset,
    /// Work began.
    Open,
    /// A progress payload was emitted; may repeat.
    Update,
    /// Resolved successfully. Terminal.
    Done,
    /// Rejected with an error payload. Terminal.
    Error,
    /// Cancelled by the caller. Terminal.
    Cancel,
    /// Torn down without settling. Terminal.
    Unsubscribed,
}

impl Status {
    /// Whether this status ends the action's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Error | Status::Cancel | Status::Unsubscribed
        )
    }

    /// The dispatch stage handlers see for this status.
    ///
    /// `Unset` and `Unsubscribed` dispatch nothing.
    pub fn stage(self) -> Option<LifecycleStage> {
        match self {
            Status::Unset | Status::Unsubscribed => None,
            Status::Open => Some(LifecycleStage::Open),
            Status::Update => Some(LifecycleStage::Update),
            Status::Done => Some(LifecycleStage::Done),
            Status::Error => Some(LifecycleStage::Error),
            Status::Cancel => Some(LifecycleStage::Cancel),
        }
    }
}

/// A requested state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `unset → open` with an initial payload.
    Open(Value),
    /// `open/update → update` with a progress payload.
    Update(Value),
    /// Any non-terminal → `done`.
    Resolve(Value),
    /// Any non-terminal → `error`.
    Reject(Value),
    /// Any non-terminal → `cancel`.
    Cancel(Value),
    /// Any non-terminal → `unsubscribed`; payload unchanged.
    Unsubscribe,
}

/// The mutable lifecycle state of one action.
///
/// `revision` bumps on every observable change (status, payload, or the
/// disabled flag) and is what snapshot validity checks compare against.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionState {
    pub status: Status,
    pub payload: Value,
    pub disabled: bool,
    pub revision: u64,
}

impl Default for ActionState {
    fn default() -> Self {
        Self {
            status: Status::Unset,
            payload: Value::Null,
            disabled: false,
            revision: 0,
        }
    }
}

impl ActionState {
    /// Apply a transition, returning `true` if anything changed.
    ///
    /// The first terminal transition wins: once the action is terminal
    /// every later transition is a no-op, which is what gives
    /// at-most-once completion semantics.
    pub fn apply(&mut self, transition: Transition) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match transition {
            Transition::Open(payload) => {
                // Opening is only meaningful from the initial state; an
                // already-running action keeps its progress.
                if self.status != Status::Unset {
                    return false;
                }
                self.status = Status::Open;
                self.payload = payload;
            }
            Transition::Update(payload) => {
                self.status = Status::Update;
                self.payload = payload;
            }
            Transition::Resolve(payload) => {
                self.status = Status::Done;
                self.payload = payload;
            }
            Transition::Reject(payload) => {
                self.status = Status::Error;
                self.payload = payload;
            }
            Transition::Cancel(payload) => {
                self.status = Status::Cancel;
                self.payload = payload;
            }
            Transition::Unsubscribe => {
                self.status = Status::Unsubscribed;
            }
        }
        self.revision += 1;
        true
    }

    /// Flip the disabled flag in place.
    pub fn toggle(&mut self) {
        self.disabled = !self.disabled;
        self.revision += 1;
    }
}

/// One emission on an action's event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEvent {
    pub id: ActionId,
    pub status: Status,
    pub payload: Value,
}

/// How an action ultimately settled.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Done(Value),
    Error(Value),
    Cancelled(Value),
    Unsubscribed,
}

/// Failure half of [`ActionHandle::result`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ActionError {
    /// The action rejected; carries the error payload.
    #[error("action failed: {0}")]
    Failed(Value),
    /// The action was cancelled before settling.
    #[error("action cancelled")]
    Cancelled(Value),
    /// The action was torn down without settling.
    #[error("action unsubscribed")]
    Unsubscribed,
    /// The repo actor exited before the action settled.
    #[error("repo is no longer running")]
    RepoGone,
}

/// Snapshot of an action's lifecycle state published on its watch channel.
#[derive(Debug, Clone)]
pub struct ActionView {
    pub status: Status,
    pub payload: Value,
    pub disabled: bool,
}

impl ActionView {
    pub(crate) fn unset() -> Self {
        Self {
            status: Status::Unset,
            payload: Value::Null,
            disabled: false,
        }
    }
}

/// Cloneable handle to one pushed action.
///
/// Transitions are fire-and-forget: they enqueue a message for the repo
/// actor and never fail -- a handle whose repo has exited simply drops
/// them, matching the contract that no transition can itself error.
#[derive(Debug)]
pub struct ActionHandle {
    id: ActionId,
    tag: CommandTag,
    tx: tokio::sync::mpsc::UnboundedSender<RepoMessage>,
    view: watch::Receiver<ActionView>,
}

// Manual `Clone` keeps the derive bounds honest: every field is cheaply
// cloneable by construction.
impl Clone for ActionHandle {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tag: self.tag.clone(),
            tx: self.tx.clone(),
            view: self.view.clone(),
        }
    }
}

impl ActionHandle {
    pub(crate) fn new(
        id: ActionId,
        tag: CommandTag,
        tx: tokio::sync::mpsc::UnboundedSender<RepoMessage>,
        view: watch::Receiver<ActionView>,
    ) -> Self {
        Self { id, tag, tx, view }
    }

    /// The action's stable identity.
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Identity of the command that produced this action.
    pub fn tag(&self) -> &CommandTag {
        &self.tag
    }

    /// Current lifecycle status.
    pub fn status(&self) -> Status {
        self.view.borrow().status
    }

    /// Last emitted payload.
    pub fn payload(&self) -> Value {
        self.view.borrow().payload.clone()
    }

    /// Whether the action is excluded from reconciliation.
    pub fn is_disabled(&self) -> bool {
        self.view.borrow().disabled
    }

    /// Whether the action has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Begin the action: `unset → open`.
    pub fn open(&self, payload: Value) {
        self.transition(Transition::Open(payload));
    }

    /// Emit a progress payload: `open/update → update`.
    pub fn update(&self, payload: Value) {
        self.transition(Transition::Update(payload));
    }

    /// Resolve successfully. The first terminal transition wins.
    pub fn resolve(&self, payload: Value) {
        self.transition(Transition::Resolve(payload));
    }

    /// Reject with an error payload. The first terminal transition wins.
    pub fn reject(&self, payload: Value) {
        self.transition(Transition::Reject(payload));
    }

    /// Cancel without a payload.
    pub fn cancel(&self) {
        self.cancel_with(Value::Null);
    }

    /// Cancel, carrying a payload for cancel-stage handlers.
    pub fn cancel_with(&self, payload: Value) {
        self.transition(Transition::Cancel(payload));
    }

    /// Tear the action down without settling it.
    pub fn unsubscribe(&self) {
        self.transition(Transition::Unsubscribe);
    }

    /// Flip the disabled flag, triggering reconciliation unless `silent`.
    pub fn toggle(&self, silent: bool) {
        let _ = self.tx.send(RepoMessage::Toggle {
            id: self.id,
            silent,
        });
    }

    /// Register a hook invoked exactly once if the action is cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce(Value) + Send + 'static) {
        let _ = self.tx.send(RepoMessage::OnCancel {
            id: self.id,
            hook: Box::new(hook),
        });
    }

    /// Subscribe to the action's ordered event stream.
    ///
    /// A terminal action replays only its terminal event; a running one
    /// replays its latest state first.
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the repo actor has exited.
    pub async fn subscribe(&self) -> Result<Subscription<ActionEvent>, RepoError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RepoMessage::SubscribeAction {
                id: self.id,
                reply,
            })
            .map_err(|_| RepoError::Gone)?;
        rx.await.map_err(|_| RepoError::Gone)?
    }

    /// Wait until the action settles and report how.
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the repo actor exits before settlement.
    pub async fn settled(&self) -> Result<ActionOutcome, RepoError> {
        let mut view = self.view.clone();
        let settled = view
            .wait_for(|v| v.status.is_terminal())
            .await
            .map_err(|_| RepoError::Gone)?;
        Ok(match settled.status {
            Status::Done => ActionOutcome::Done(settled.payload.clone()),
            Status::Error => ActionOutcome::Error(settled.payload.clone()),
            Status::Cancel => ActionOutcome::Cancelled(settled.payload.clone()),
            // `wait_for` only yields terminal statuses.
            _ => ActionOutcome::Unsubscribed,
        })
    }

    /// Future-interop: resolve with the `done` payload or the failure.
    ///
    /// # Errors
    ///
    /// [`ActionError::Failed`]/[`ActionError::Cancelled`]/
    /// [`ActionError::Unsubscribed`] mirror the terminal status;
    /// [`ActionError::RepoGone`] if the actor exits first.
    pub async fn result(&self) -> Result<Value, ActionError> {
        match self.settled().await {
            Ok(ActionOutcome::Done(payload)) => Ok(payload),
            Ok(ActionOutcome::Error(payload)) => Err(ActionError::Failed(payload)),
            Ok(ActionOutcome::Cancelled(payload)) => Err(ActionError::Cancelled(payload)),
            Ok(ActionOutcome::Unsubscribed) => Err(ActionError::Unsubscribed),
            Err(_) => Err(ActionError::RepoGone),
        }
    }

    fn transition(&self, transition: Transition) {
        // Transitions never fail: a dead repo silently drops them.
        let _ = self.tx.send(RepoMessage::Transition {
            id: self.id,
            transition,
        });
    }
}
