//! The owning store: an actor that holds the history, the snapshot
//! cache, and every mounted domain and effect.
//!
//! The actor runs on a dedicated thread with its own minimal
//! current-thread runtime, processing [`RepoMessage`]s in FIFO order.
//! Cloneable [`Repo`] handles send messages; command-body futures spawn
//! onto the actor's runtime and feed transitions back through the same
//! channel, which is what makes cross-action ordering deterministic:
//! every mutation is one message, and reconciliation always sees the
//! tree as of the message being processed. A push issued from inside an
//! effect handler or thunk is just a later message, so nested pushes
//! never reconcile against stale state.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::action::{
    ActionEvent, ActionHandle, ActionId, ActionView, Status, Transition,
};
use crate::command::{Body, Command, CommandTag, INIT_TAG, LifecycleStage, PATCH_TAG, RESET_TAG};
use crate::domain::Domain;
use crate::effect::{Effect, EffectTable};
use crate::error::{HistoryError, RepoError};
use crate::history::{History, HistoryEvent};
use crate::reconciler::{Mount, reconcile};
use crate::subject::{Subject, Subscription};
use crate::warehouse::{MountId, Warehouse};

/// Identity of one fork (view) of the store.
pub(crate) type ForkId = Uuid;

/// A cancellation hook registered via [`ActionHandle::on_cancel`].
pub(crate) type CancelHook = Box<dyn FnOnce(Value) + Send>;

/// Context handed to a thunk body: the action it drives and a repo
/// handle for sub-pushes (adopted as children of the running action).
pub struct TaskContext {
    pub action: ActionHandle,
    pub repo: Repo,
}

/// Messages processed by the repo actor.
pub(crate) enum RepoMessage {
    Push {
        id: ActionId,
        fork: ForkId,
        tag: CommandTag,
        body: Body,
        view_tx: watch::Sender<ActionView>,
    },
    Transition {
        id: ActionId,
        transition: Transition,
    },
    Toggle {
        id: ActionId,
        silent: bool,
    },
    OnCancel {
        id: ActionId,
        hook: CancelHook,
    },
    SubscribeAction {
        id: ActionId,
        reply: oneshot::Sender<Result<Subscription<ActionEvent>, RepoError>>,
    },
    Checkout {
        id: ActionId,
        reply: oneshot::Sender<Result<(), RepoError>>,
    },
    Remove {
        id: ActionId,
        reply: oneshot::Sender<Result<(), RepoError>>,
    },
    Prune {
        id: ActionId,
        reply: oneshot::Sender<Result<(), RepoError>>,
    },
    Wait {
        reply: oneshot::Sender<Result<(), Value>>,
    },
    SubscribeEvents {
        reply: oneshot::Sender<Subscription<HistoryEvent>>,
    },
    AddDomain {
        fork: ForkId,
        key: String,
        domain: Box<dyn Domain>,
        reply: oneshot::Sender<()>,
    },
    AddEffect {
        fork: ForkId,
        effect: Box<dyn Effect>,
        reply: oneshot::Sender<()>,
    },
    Fork {
        parent: ForkId,
        id: ForkId,
        reply: oneshot::Sender<watch::Receiver<Value>>,
    },
    ToJson {
        reply: oneshot::Sender<Value>,
    },
    Serialize {
        fork: ForkId,
        reply: oneshot::Sender<Value>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for a [`Repo`], mirroring the store-construction pattern of
/// the rest of the crate's handles: configure, then `finish()`.
pub struct RepoBuilder {
    limit: Option<usize>,
    domains: Vec<(String, Box<dyn Domain>)>,
    effects: Vec<Box<dyn Effect>>,
}

impl RepoBuilder {
    /// Retain at most `n` history nodes; settled prefixes beyond the
    /// limit are archived. Without a limit everything is retained.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Mount a domain at a state key.
    pub fn domain(mut self, key: &str, domain: impl Domain) -> Self {
        self.domains.push((key.to_owned(), Box::new(domain)));
        self
    }

    /// Register an effect.
    pub fn effect(mut self, effect: impl Effect) -> Self {
        self.effects.push(Box::new(effect));
        self
    }

    /// Spawn the actor and return the root handle.
    pub fn finish(self) -> Repo {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = Arc::new(AtomicU64::new(0));
        let root_fork = ForkId::new_v4();

        // The genesis id is allocated before any handle exists, so it is
        // always the lowest id and iteration order starts at the root.
        let genesis = ActionId(ids.fetch_add(1, Ordering::Relaxed));

        let mut initial = serde_json::Map::new();
        for (key, domain) in &self.domains {
            initial.insert(key.clone(), domain.initial_state());
        }
        let (state_tx, state_rx) = watch::channel(Value::Object(initial));

        let mut mounts = Vec::new();
        for (index, (key, domain)) in self.domains.into_iter().enumerate() {
            mounts.push(Mount::new(MountId(index as u64), root_fork, key, domain));
        }
        let next_mount = mounts.len() as u64;

        let mut effects = Vec::new();
        for effect in self.effects {
            let mut table = EffectTable::new();
            effect.register(&mut table);
            effects.push(EffectMount {
                fork: root_fork,
                table,
                effect,
            });
        }

        let actor = RepoActor {
            rx,
            tx: tx.clone(),
            ids: Arc::clone(&ids),
            genesis,
            history: History::new(self.limit),
            warehouse: Warehouse::new(),
            mounts,
            effects,
            forks: vec![ForkInfo {
                id: root_fork,
                parent: None,
                state_tx,
            }],
            actions: HashMap::new(),
            events: Subject::new(),
            published: HashMap::new(),
            waiters: Vec::new(),
            next_mount,
            release_dirty: false,
            shutdown_reply: None,
        };
        std::thread::spawn(move || run_repo(actor));

        Repo {
            tx,
            ids,
            fork: root_fork,
            state_rx,
        }
    }
}

/// Cloneable handle to a running store.
///
/// `push` is synchronous in its return of the [`ActionHandle`]; every
/// other operation that needs an answer round-trips through the actor.
/// A fork shares the same actor and history but publishes its own
/// merged state.
#[derive(Debug)]
pub struct Repo {
    tx: mpsc::UnboundedSender<RepoMessage>,
    ids: Arc<AtomicU64>,
    fork: ForkId,
    state_rx: watch::Receiver<Value>,
}

// Manual `Clone`: `RepoMessage` is not `Clone`, so the derive would
// over-constrain; every field here clones cheaply.
impl Clone for Repo {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            ids: Arc::clone(&self.ids),
            fork: self.fork,
            state_rx: self.state_rx.clone(),
        }
    }
}

impl std::fmt::Debug for RepoMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RepoMessage::Push { .. } => "Push",
            RepoMessage::Transition { .. } => "Transition",
            RepoMessage::Toggle { .. } => "Toggle",
            RepoMessage::OnCancel { .. } => "OnCancel",
            RepoMessage::SubscribeAction { .. } => "SubscribeAction",
            RepoMessage::Checkout { .. } => "Checkout",
            RepoMessage::Remove { .. } => "Remove",
            RepoMessage::Prune { .. } => "Prune",
            RepoMessage::Wait { .. } => "Wait",
            RepoMessage::SubscribeEvents { .. } => "SubscribeEvents",
            RepoMessage::AddDomain { .. } => "AddDomain",
            RepoMessage::AddEffect { .. } => "AddEffect",
            RepoMessage::Fork { .. } => "Fork",
            RepoMessage::ToJson { .. } => "ToJson",
            RepoMessage::Serialize { .. } => "Serialize",
            RepoMessage::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Repo {
    /// Start building a store.
    pub fn build() -> RepoBuilder {
        RepoBuilder {
            limit: None,
            domains: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Push a command, appending a new action at the head.
    ///
    /// Returns the handle synchronously; the body is dispatched by the
    /// actor (immediate value, spawned future, or inline thunk).
    pub fn push(&self, command: &Command, args: Vec<Value>) -> ActionHandle {
        self.push_body(command.tag().clone(), command.invoke(args))
    }

    /// Replace every mounted domain's state.
    ///
    /// `data` is an object keyed by mount key; domains present in it
    /// receive `deserialize(value)`, the rest fall back to their initial
    /// state. An ordinary history action: replayable and toggle-able.
    pub fn reset(&self, data: Value) -> ActionHandle {
        self.push_body(CommandTag::literal(RESET_TAG), Body::Value(data))
    }

    /// Override only the domain states present in `data`, leaving the
    /// rest untouched.
    pub fn patch(&self, data: Value) -> ActionHandle {
        self.push_body(CommandTag::literal(PATCH_TAG), Body::Value(data))
    }

    /// The latest published state for this fork (parent slices merged
    /// with its own).
    pub fn state(&self) -> Value {
        self.state_rx.borrow().clone()
    }

    /// Whether the actor is still running.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Switch the active branch to pass through the given action.
    ///
    /// # Errors
    ///
    /// [`RepoError::History`] if the action is not retained,
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn checkout(&self, action: &ActionHandle) -> Result<(), RepoError> {
        self.checkout_id(action.id()).await
    }

    /// [`checkout`](Repo::checkout) by raw id.
    ///
    /// # Errors
    ///
    /// See [`checkout`](Repo::checkout).
    pub async fn checkout_id(&self, id: ActionId) -> Result<(), RepoError> {
        self.request(|reply| RepoMessage::Checkout { id, reply })
            .await?
    }

    /// Splice an action out of the tree, re-parenting its children.
    ///
    /// # Errors
    ///
    /// [`RepoError::History`] if the action is not retained,
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn remove(&self, action: &ActionHandle) -> Result<(), RepoError> {
        self.request(|reply| RepoMessage::Remove {
            id: action.id(),
            reply,
        })
        .await?
    }

    /// Drop a disconnected subtree entirely.
    ///
    /// # Errors
    ///
    /// [`RepoError::History`] if the action is not retained or still on
    /// the active branch, [`RepoError::Gone`] if the actor has exited.
    pub async fn prune(&self, action: &ActionHandle) -> Result<(), RepoError> {
        self.request(|reply| RepoMessage::Prune {
            id: action.id(),
            reply,
        })
        .await?
    }

    /// Wait for every currently retained, unsettled action to settle.
    ///
    /// # Errors
    ///
    /// The chronologically first error payload among the awaited
    /// actions, surfaced only after all of them have settled.
    pub async fn wait(&self) -> Result<(), Value> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RepoMessage::Wait { reply }).is_err() {
            // A stopped actor has nothing pending.
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Subscribe to the history event stream (`Append`, `Remove`,
    /// `Checkout`, `Reconcile`, `Release`).
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn events(&self) -> Result<Subscription<HistoryEvent>, RepoError> {
        self.request(|reply| RepoMessage::SubscribeEvents { reply })
            .await
    }

    /// Mount a domain at runtime; derived state is recomputed over the
    /// whole active branch so the new domain catches up.
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn add_domain(&self, key: &str, domain: impl Domain) -> Result<(), RepoError> {
        let key = key.to_owned();
        self.request(|reply| RepoMessage::AddDomain {
            fork: self.fork,
            key,
            domain: Box::new(domain),
            reply,
        })
        .await
    }

    /// Register an effect at runtime.
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn add_effect(&self, effect: impl Effect) -> Result<(), RepoError> {
        self.request(|reply| RepoMessage::AddEffect {
            fork: self.fork,
            effect: Box::new(effect),
            reply,
        })
        .await
    }

    /// Create a child view sharing this store's history and actor.
    ///
    /// The child inherits this fork's state slices; domains it mounts
    /// are layered on top (same key shadows the parent's slice).
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn fork(&self) -> Result<Repo, RepoError> {
        let id = ForkId::new_v4();
        let state_rx = self
            .request(|reply| RepoMessage::Fork {
                parent: self.fork,
                id,
                reply,
            })
            .await?;
        Ok(Repo {
            tx: self.tx.clone(),
            ids: Arc::clone(&self.ids),
            fork: id,
            state_rx,
        })
    }

    /// Devtools dump of the retained tree:
    /// `{size, limit, root, head, tree}`.
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn to_json(&self) -> Result<Value, RepoError> {
        self.request(|reply| RepoMessage::ToJson { reply }).await
    }

    /// Export this fork's state through each domain's `serialize` hook.
    ///
    /// # Errors
    ///
    /// [`RepoError::Gone`] if the actor has exited.
    pub async fn serialize(&self) -> Result<Value, RepoError> {
        self.request(|reply| RepoMessage::Serialize {
            fork: self.fork,
            reply,
        })
        .await
    }

    /// Stop the actor after running every domain and effect teardown.
    ///
    /// Idempotent: shutting down a stopped repo succeeds.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the signature stable.
    pub async fn shutdown(&self) -> Result<(), RepoError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RepoMessage::Shutdown { reply }).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    fn push_body(&self, tag: CommandTag, body: Body) -> ActionHandle {
        let id = ActionId(self.ids.fetch_add(1, Ordering::Relaxed));
        let (view_tx, view_rx) = watch::channel(ActionView::unset());
        let handle = ActionHandle::new(id, tag.clone(), self.tx.clone(), view_rx);
        // A failed send means the actor is gone; the handle still works
        // as an inert record (transitions drop, `settled` reports Gone).
        let _ = self.tx.send(RepoMessage::Push {
            id,
            fork: self.fork,
            tag,
            body,
            view_tx,
        });
        handle
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RepoMessage,
    ) -> Result<T, RepoError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| RepoError::Gone)?;
        rx.await.map_err(|_| RepoError::Gone)
    }
}

/// One registered effect and its dispatch table.
struct EffectMount {
    fork: ForkId,
    table: EffectTable,
    effect: Box<dyn Effect>,
}

/// One fork's published-state channel.
struct ForkInfo {
    id: ForkId,
    parent: Option<ForkId>,
    state_tx: watch::Sender<Value>,
}

/// Per-action runtime companions: event subject, view channel, hooks.
struct ActionRuntime {
    subject: Subject<ActionEvent>,
    view: watch::Sender<ActionView>,
    cancel_hooks: Vec<CancelHook>,
}

/// One outstanding `wait()` call.
struct Waiter {
    pending: HashSet<ActionId>,
    first_error: Option<Value>,
    reply: oneshot::Sender<Result<(), Value>>,
}

struct RepoActor {
    rx: mpsc::UnboundedReceiver<RepoMessage>,
    tx: mpsc::UnboundedSender<RepoMessage>,
    ids: Arc<AtomicU64>,
    genesis: ActionId,
    history: History,
    warehouse: Warehouse,
    mounts: Vec<Mount>,
    effects: Vec<EffectMount>,
    forks: Vec<ForkInfo>,
    actions: HashMap<ActionId, ActionRuntime>,
    events: Subject<HistoryEvent>,
    published: HashMap<MountId, Arc<Value>>,
    waiters: Vec<Waiter>,
    next_mount: u64,
    release_dirty: bool,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

/// Runs the repo actor loop on its dedicated thread.
///
/// Builds a lightweight current-thread runtime so that command-body
/// futures spawned by `Push` make progress while the loop awaits the
/// next message. After each received message the loop drains whatever
/// is immediately available before flushing a single `Release`
/// notification -- the store-owned batching scheduler.
fn run_repo(mut actor: RepoActor) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to create repo runtime");

    rt.block_on(async move {
        actor.seed();
        'outer: loop {
            let Some(msg) = actor.rx.recv().await else {
                break;
            };
            if actor.handle(msg).is_break() {
                break 'outer;
            }
            while let Ok(msg) = actor.rx.try_recv() {
                if actor.handle(msg).is_break() {
                    break 'outer;
                }
            }
            actor.flush_release();
        }
        actor.teardown();
    });
}

impl RepoActor {
    /// Plant the genesis node so the tree always has a retained root,
    /// and publish each domain's initial state.
    fn seed(&mut self) {
        self.history
            .append(self.genesis, CommandTag::literal(INIT_TAG));
        let _ = self
            .history
            .apply(self.genesis, Transition::Resolve(Value::Null));
        self.reconcile_from(self.genesis);
        // Seeding is construction, not a mutation worth notifying.
        self.release_dirty = false;
    }

    fn handle(&mut self, msg: RepoMessage) -> ControlFlow<()> {
        match msg {
            RepoMessage::Push {
                id,
                fork,
                tag,
                body,
                view_tx,
            } => self.handle_push(id, fork, tag, body, view_tx),
            RepoMessage::Transition { id, transition } => {
                self.handle_transition(id, transition);
            }
            RepoMessage::Toggle { id, silent } => self.handle_toggle(id, silent),
            RepoMessage::OnCancel { id, hook } => self.handle_on_cancel(id, hook),
            RepoMessage::SubscribeAction { id, reply } => {
                let result = self
                    .actions
                    .get(&id)
                    .map(|runtime| runtime.subject.subscribe())
                    .ok_or(RepoError::History(HistoryError::UnknownAction(id.0)));
                let _ = reply.send(result);
            }
            RepoMessage::Checkout { id, reply } => {
                let result = match self.history.checkout(id) {
                    Ok(start) => {
                        self.events.next(HistoryEvent::Checkout(id));
                        self.reconcile_from(start);
                        Ok(())
                    }
                    Err(e) => Err(RepoError::from(e)),
                };
                let _ = reply.send(result);
            }
            RepoMessage::Remove { id, reply } => {
                let _ = reply.send(self.handle_remove(id));
            }
            RepoMessage::Prune { id, reply } => {
                let result = match self.history.prune(id) {
                    Ok(removed) => {
                        self.discard(&removed);
                        Ok(())
                    }
                    Err(e) => Err(RepoError::from(e)),
                };
                let _ = reply.send(result);
            }
            RepoMessage::Wait { reply } => self.handle_wait(reply),
            RepoMessage::SubscribeEvents { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            RepoMessage::AddDomain {
                fork,
                key,
                domain,
                reply,
            } => {
                let mount = Mount::new(MountId(self.next_mount), fork, key, domain);
                self.next_mount += 1;
                self.mounts.push(mount);
                if let Some(root) = self.history.root() {
                    self.reconcile_from(root);
                }
                let _ = reply.send(());
            }
            RepoMessage::AddEffect {
                fork,
                effect,
                reply,
            } => {
                let mut table = EffectTable::new();
                effect.register(&mut table);
                self.effects.push(EffectMount {
                    fork,
                    table,
                    effect,
                });
                let _ = reply.send(());
            }
            RepoMessage::Fork { parent, id, reply } => {
                let (state_tx, state_rx) = watch::channel(Value::Null);
                self.forks.push(ForkInfo {
                    id,
                    parent: Some(parent),
                    state_tx,
                });
                let value = self.fork_state(id);
                if let Some(fork) = self.forks.iter().find(|f| f.id == id) {
                    fork.state_tx.send_replace(value);
                }
                let _ = reply.send(state_rx);
            }
            RepoMessage::ToJson { reply } => {
                let _ = reply.send(self.history.to_json());
            }
            RepoMessage::Serialize { fork, reply } => {
                let _ = reply.send(self.serialize_fork(fork));
            }
            RepoMessage::Shutdown { reply } => {
                // Close the channel first so handles observe the stop as
                // soon as the shutdown reply arrives.
                self.rx.close();
                self.shutdown_reply = Some(reply);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_push(
        &mut self,
        id: ActionId,
        fork: ForkId,
        tag: CommandTag,
        body: Body,
        view_tx: watch::Sender<ActionView>,
    ) {
        tracing::debug!(action = %id, command = %tag, "push");
        self.history.append(id, tag);
        self.actions.insert(
            id,
            ActionRuntime {
                subject: Subject::new(),
                view: view_tx,
                cancel_hooks: Vec::new(),
            },
        );
        self.events.next(HistoryEvent::Append(id));
        self.release_dirty = true;

        match body {
            Body::Value(payload) => {
                self.handle_transition(id, Transition::Resolve(payload));
            }
            Body::Future { open, future } => {
                self.handle_transition(id, Transition::Open(open));
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let transition = match future.await {
                        Ok(payload) => Transition::Resolve(payload),
                        Err(payload) => Transition::Reject(payload),
                    };
                    let _ = tx.send(RepoMessage::Transition { id, transition });
                });
            }
            Body::Thunk(thunk) => {
                let ctx = TaskContext {
                    action: self.mint_action_handle(id),
                    repo: self.mint_repo(fork),
                };
                thunk(ctx);
            }
        }
    }

    fn handle_transition(&mut self, id: ActionId, transition: Transition) {
        // Transitions for archived actions are dropped: the work settled
        // after its record left the retained window.
        let Ok(changed) = self.history.apply(id, transition) else {
            return;
        };
        if !changed {
            return;
        }
        let Some(node) = self.history.node(id) else {
            return;
        };
        let status = node.state.status;
        let payload = node.state.payload.clone();
        let disabled = node.state.disabled;
        let tag = node.tag.clone();
        tracing::debug!(action = %id, status = ?status, "transition");

        // Reconcile first so every observer woken below reads the
        // already-published state. Inactive-branch changes refresh their
        // snapshots lazily on the next checkout instead.
        if self.history.is_active(id) {
            self.reconcile_from(id);
        }

        if let Some(runtime) = self.actions.get_mut(&id) {
            let unobserved = runtime.subject.subscriber_count() == 0;
            runtime.view.send_replace(ActionView {
                status,
                payload: payload.clone(),
                disabled,
            });
            let event = ActionEvent {
                id,
                status,
                payload: payload.clone(),
            };
            match status {
                Status::Open | Status::Update => runtime.subject.next(event),
                Status::Done | Status::Cancel => runtime.subject.complete(Some(event)),
                Status::Error => runtime.subject.error(event),
                Status::Unsubscribed => runtime.subject.unsubscribe(),
                Status::Unset => {}
            }
            if status == Status::Cancel {
                for hook in runtime.cancel_hooks.drain(..) {
                    hook(payload.clone());
                }
            }
            if status == Status::Error && unobserved && self.waiters.is_empty() {
                tracing::warn!(
                    action = %id,
                    payload = %payload,
                    "action failed with no observers"
                );
            }
        }

        if status.is_terminal() {
            self.settle_waiters(id, status, &payload);
        }

        if let Some(stage) = status.stage() {
            self.dispatch_effects(&tag, stage, &payload);
        }

        if status.is_terminal() {
            self.archive();
        }
        self.release_dirty = true;
    }

    fn handle_toggle(&mut self, id: ActionId, silent: bool) {
        if self.history.toggle(id).is_err() {
            return;
        }
        if let Some(node) = self.history.node(id)
            && let Some(runtime) = self.actions.get(&id)
        {
            runtime.view.send_replace(ActionView {
                status: node.state.status,
                payload: node.state.payload.clone(),
                disabled: node.state.disabled,
            });
        }
        if !silent && self.history.is_active(id) {
            self.reconcile_from(id);
        }
        self.release_dirty = true;
    }

    fn handle_on_cancel(&mut self, id: ActionId, hook: CancelHook) {
        let status = self
            .history
            .node(id)
            .map(|n| (n.state.status, n.state.payload.clone()));
        match status {
            // Already cancelled: honor the exactly-once contract now.
            Some((Status::Cancel, payload)) => hook(payload),
            // Otherwise-terminal actions can no longer be cancelled.
            Some((s, _)) if s.is_terminal() => {}
            Some(_) => {
                if let Some(runtime) = self.actions.get_mut(&id) {
                    runtime.cancel_hooks.push(hook);
                }
            }
            None => {}
        }
    }

    fn handle_remove(&mut self, id: ActionId) -> Result<(), RepoError> {
        let was_active = self.history.is_active(id);
        let parent = self.history.node(id).and_then(|n| n.parent);
        let removed = self.history.remove(id)?;
        self.discard(&removed);
        if was_active {
            let start = parent
                .filter(|p| self.history.contains(*p))
                .or_else(|| self.history.root());
            if let Some(start) = start {
                self.reconcile_from(start);
            }
        }
        Ok(())
    }

    fn handle_wait(&mut self, reply: oneshot::Sender<Result<(), Value>>) {
        let pending: HashSet<ActionId> = self.history.pending().into_iter().collect();
        // A retained action that already failed still rejects the wait;
        // ties among pre-settled errors break by tree order.
        let first_error = self
            .history
            .iter()
            .filter(|n| n.state.status == Status::Error)
            .min_by_key(|n| n.id)
            .map(|n| n.state.payload.clone());

        if pending.is_empty() {
            let result = match first_error {
                Some(payload) => Err(payload),
                None => Ok(()),
            };
            let _ = reply.send(result);
        } else {
            self.waiters.push(Waiter {
                pending,
                first_error,
                reply,
            });
        }
    }

    fn settle_waiters(&mut self, id: ActionId, status: Status, payload: &Value) {
        let waiters = std::mem::take(&mut self.waiters);
        for mut waiter in waiters {
            let was_member = waiter.pending.remove(&id);
            if was_member && status == Status::Error && waiter.first_error.is_none() {
                waiter.first_error = Some(payload.clone());
            }
            if waiter.pending.is_empty() {
                let result = match waiter.first_error {
                    Some(error) => Err(error),
                    None => Ok(()),
                };
                let _ = waiter.reply.send(result);
            } else {
                self.waiters.push(waiter);
            }
        }
    }

    fn reconcile_from(&mut self, start: ActionId) {
        if !self.history.is_active(start) {
            return;
        }
        let states = reconcile(&self.history, &mut self.warehouse, &self.mounts, start);
        self.events.next(HistoryEvent::Reconcile(start));

        let changed = self.mounts.iter().any(|mount| {
            match (self.published.get(&mount.id), states.get(&mount.id)) {
                (Some(before), Some(after)) => !Arc::ptr_eq(before, after),
                (None, None) => false,
                _ => true,
            }
        });
        if changed {
            self.published = states;
            for fork in &self.forks {
                fork.state_tx.send_replace(self.fork_state(fork.id));
            }
        }
        self.release_dirty = true;
    }

    fn dispatch_effects(&self, tag: &CommandTag, stage: LifecycleStage, payload: &Value) {
        for mount in &self.effects {
            if let Some(handler) = mount.table.get(tag, stage) {
                let repo = self.mint_repo(mount.fork);
                handler(&repo, payload);
            }
        }
    }

    fn archive(&mut self) {
        let outcome = self.history.archive();
        if outcome.dropped.is_empty() {
            return;
        }
        // Fold evicted roots oldest-first so the baseline ends at the
        // newest archived prefix state, then drop everything else.
        for folded in &outcome.folded {
            self.warehouse.fold_into_baseline(*folded);
        }
        self.discard(&outcome.dropped);
        tracing::debug!(
            dropped = outcome.dropped.len(),
            size = self.history.size(),
            "archived settled prefix"
        );
    }

    /// Forget removed nodes: snapshots, runtime companions, and a
    /// `Remove` notification each.
    fn discard(&mut self, removed: &[ActionId]) {
        for id in removed {
            self.warehouse.delete(*id);
            self.actions.remove(id);
            self.events.next(HistoryEvent::Remove(*id));
        }
    }

    fn fork_chain(&self, fork: ForkId) -> Vec<ForkId> {
        let mut chain = Vec::new();
        let mut cursor = Some(fork);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self
                .forks
                .iter()
                .find(|f| f.id == id)
                .and_then(|f| f.parent);
        }
        chain.reverse();
        chain
    }

    /// Merge the published slices visible to a fork: ancestors first, so
    /// a child mounting the same key shadows its parent.
    fn fork_state(&self, fork: ForkId) -> Value {
        let chain = self.fork_chain(fork);
        let mut map = serde_json::Map::new();
        for mount in &self.mounts {
            if chain.contains(&mount.fork) {
                let value = self
                    .published
                    .get(&mount.id)
                    .map(|state| (**state).clone())
                    .unwrap_or_else(|| (*mount.initial).clone());
                map.insert(mount.key.clone(), value);
            }
        }
        Value::Object(map)
    }

    fn serialize_fork(&self, fork: ForkId) -> Value {
        let chain = self.fork_chain(fork);
        let mut map = serde_json::Map::new();
        for mount in &self.mounts {
            if chain.contains(&mount.fork) {
                let state = self
                    .published
                    .get(&mount.id)
                    .cloned()
                    .unwrap_or_else(|| Arc::clone(&mount.initial));
                map.insert(mount.key.clone(), mount.domain.serialize(&state));
            }
        }
        Value::Object(map)
    }

    fn mint_action_handle(&self, id: ActionId) -> ActionHandle {
        let tag = self
            .history
            .node(id)
            .map(|n| n.tag.clone())
            .unwrap_or_else(|| CommandTag::literal(INIT_TAG));
        let view = self
            .actions
            .get(&id)
            .map(|runtime| runtime.view.subscribe())
            .unwrap_or_else(|| watch::channel(ActionView::unset()).1);
        ActionHandle::new(id, tag, self.tx.clone(), view)
    }

    fn mint_repo(&self, fork: ForkId) -> Repo {
        let state_rx = self
            .forks
            .iter()
            .find(|f| f.id == fork)
            .map(|f| f.state_tx.subscribe())
            .unwrap_or_else(|| watch::channel(Value::Null).1);
        Repo {
            tx: self.tx.clone(),
            ids: Arc::clone(&self.ids),
            fork,
            state_rx,
        }
    }

    fn flush_release(&mut self) {
        if self.release_dirty {
            self.release_dirty = false;
            self.events.next(HistoryEvent::Release);
        }
    }

    fn teardown(&mut self) {
        for mount in &mut self.mounts {
            mount.domain.teardown();
        }
        for mount in &mut self.effects {
            mount.effect.teardown();
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(());
        }
        tracing::debug!("repo actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::action::{ActionError, ActionOutcome};
    use crate::domain::test_fixtures::Counter;
    use crate::domain::{Domain, HandlerTable};
    use crate::subject::SubjectEvent;

    /// A counter whose command leaves actions pending until resolved by
    /// the test, for exercising out-of-order completion.
    struct ManualCounter {
        add: Command,
    }

    impl ManualCounter {
        fn new() -> Self {
            Self {
                add: Command::from_thunk("add", |_args, _ctx| {
                    // The action stays unset until the test drives it.
                }),
            }
        }
    }

    impl Domain for ManualCounter {
        fn initial_state(&self) -> Value {
            json!(0)
        }

        fn register(&self, table: &mut HandlerTable) {
            table.on(&self.add, |state, payload, _meta| {
                json!(state.as_i64().unwrap_or(0) + payload.as_i64().unwrap_or(0))
            });
        }
    }

    fn counter_repo() -> (Repo, Command) {
        let counter = Counter::new();
        let add = counter.add.clone();
        let repo = Repo::build().domain("count", counter).finish();
        (repo, add)
    }

    #[tokio::test]
    async fn pushing_a_value_command_updates_state() {
        let (repo, add) = counter_repo();

        repo.push(&add, vec![json!(2)]);
        let action = repo.push(&add, vec![json!(3)]);
        action.settled().await.expect("repo alive");

        assert_eq!(repo.state(), json!({"count": 5}));
    }

    #[tokio::test]
    async fn out_of_order_completion_resolves_in_tree_order() {
        let manual = ManualCounter::new();
        let add = manual.add.clone();
        let repo = Repo::build().domain("count", manual).finish();

        let one = repo.push(&add, vec![]);
        let two = repo.push(&add, vec![]);
        let three = repo.push(&add, vec![]);

        three.resolve(json!(3));
        three.settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 3}));

        two.resolve(json!(2));
        two.settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 5}));

        one.resolve(json!(1));
        one.settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 6}));
    }

    #[tokio::test]
    async fn future_commands_open_then_resolve() {
        let fetch = Command::from_future("fetch", |args| async move {
            Ok(json!({"got": args.first().cloned().unwrap_or(Value::Null)}))
        });
        let repo = Repo::build().finish();

        let action = repo.push(&fetch, vec![json!("q")]);
        let outcome = action.settled().await.expect("repo alive");
        assert_eq!(outcome, ActionOutcome::Done(json!({"got": "q"})));
    }

    #[tokio::test]
    async fn failed_futures_reject_with_the_error_payload() {
        let fetch = Command::from_future("fetch", |_args| async { Err(json!("offline")) });
        let repo = Repo::build().finish();

        let action = repo.push(&fetch, vec![]);
        let err = action.result().await.expect_err("the body failed");
        assert_eq!(err, ActionError::Failed(json!("offline")));
    }

    #[tokio::test]
    async fn thunks_stream_updates_in_order() {
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let gate = Arc::new(Mutex::new(Some(go_rx)));
        let stream = Command::from_thunk("stream", move |_args, ctx| {
            let gate = gate.lock().expect("gate lock").take();
            tokio::spawn(async move {
                if let Some(rx) = gate {
                    let _ = rx.await;
                }
                ctx.action.open(json!("start"));
                ctx.action.update(json!(1));
                ctx.action.update(json!(2));
                ctx.action.resolve(json!(3));
            });
        });
        let repo = Repo::build().finish();

        let action = repo.push(&stream, vec![]);
        let mut sub = action.subscribe().await.expect("repo alive");
        go_tx.send(()).expect("thunk waits on the gate");

        let mut seen = Vec::new();
        while let Some(event) = sub.recv().await {
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                break;
            }
        }
        let statuses: Vec<Status> = seen
            .iter()
            .map(|e| match e {
                SubjectEvent::Next(ev) => ev.status,
                SubjectEvent::Complete(Some(ev)) => ev.status,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(
            statuses,
            vec![Status::Open, Status::Update, Status::Update, Status::Done]
        );
    }

    #[tokio::test]
    async fn subscribing_after_completion_replays_the_terminal_event() {
        let (repo, add) = counter_repo();
        let action = repo.push(&add, vec![json!(1)]);
        action.settled().await.expect("repo alive");

        let mut sub = action.subscribe().await.expect("repo alive");
        match sub.recv().await {
            Some(SubjectEvent::Complete(Some(event))) => {
                assert_eq!(event.status, Status::Done);
                assert_eq!(event.payload, json!(1));
            }
            other => panic!("expected terminal replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn toggling_an_action_suppresses_its_effect() {
        let (repo, add) = counter_repo();
        repo.push(&add, vec![json!(2)]);
        let second = repo.push(&add, vec![json!(2)]);
        second.settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 4}));

        let size_before = repo.to_json().await.expect("repo alive")["size"].clone();
        second.toggle(false);
        // A round-trip drains the fire-and-forget toggle.
        let dump = repo.to_json().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 2}));
        assert_eq!(dump["size"], size_before, "the node is kept for undo");

        second.toggle(false);
        repo.to_json().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 4}));
    }

    #[tokio::test]
    async fn checkout_switches_between_branches() {
        let (repo, add) = counter_repo();
        let one = repo.push(&add, vec![json!(1)]);
        let two = repo.push(&add, vec![json!(2)]);
        two.settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 3}));

        // Branch off one and grow a second limb.
        repo.checkout(&one).await.expect("one is retained");
        assert_eq!(repo.state(), json!({"count": 1}));
        let three = repo.push(&add, vec![json!(10)]);
        three.settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 11}));

        // Jumping back restores the first branch's state.
        repo.checkout(&two).await.expect("two is retained");
        assert_eq!(repo.state(), json!({"count": 3}));
    }

    #[tokio::test]
    async fn checkout_of_an_unknown_action_errors() {
        let (repo, _add) = counter_repo();
        let err = repo
            .checkout_id(ActionId(999))
            .await
            .expect_err("no such action");
        assert!(matches!(
            err,
            RepoError::History(HistoryError::UnknownAction(999))
        ));
    }

    #[tokio::test]
    async fn wait_rejects_with_the_first_error() {
        let fail = Command::from_future("fail", |_args| async { Err(json!("first")) });
        let ok = Command::from_future("ok", |_args| async { Ok(json!(1)) });
        let repo = Repo::build().finish();

        repo.push(&fail, vec![]);
        repo.push(&ok, vec![]);

        let err = repo.wait().await.expect_err("one action failed");
        assert_eq!(err, json!("first"));
    }

    #[tokio::test]
    async fn wait_resolves_once_everything_settles() {
        let (repo, add) = counter_repo();
        repo.push(&add, vec![json!(1)]);
        repo.push(&add, vec![json!(2)]);
        repo.wait().await.expect("no failures");
        assert_eq!(repo.state(), json!({"count": 3}));
    }

    #[tokio::test]
    async fn cancel_runs_hooks_exactly_once() {
        let pending = Command::from_thunk("pending", |_args, _ctx| {});
        let repo = Repo::build().finish();
        let action = repo.push(&pending, vec![]);

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        action.on_cancel(move |_payload| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        action.cancel();
        action.cancel();
        let outcome = action.settled().await.expect("repo alive");
        assert_eq!(outcome, ActionOutcome::Cancelled(Value::Null));
        // Round-trip to drain the second (ignored) cancel.
        repo.to_json().await.expect("repo alive");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn effects_run_once_per_transition() {
        struct Tally {
            add: Command,
            calls: Arc<AtomicUsize>,
        }
        impl Effect for Tally {
            fn register(&self, table: &mut EffectTable) {
                let calls = Arc::clone(&self.calls);
                table.on(&self.add, move |_repo, _payload| {
                    calls.fetch_add(1, Ordering::SeqCst);
                });
            }
        }

        let (repo, add) = counter_repo();
        let calls = Arc::new(AtomicUsize::new(0));
        repo.add_effect(Tally {
            add: add.clone(),
            calls: Arc::clone(&calls),
        })
        .await
        .expect("repo alive");

        repo.push(&add, vec![json!(1)]);
        repo.push(&add, vec![json!(2)]);
        repo.wait().await.expect("no failures");
        repo.to_json().await.expect("repo alive");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn effects_can_push_follow_up_commands() {
        struct Chain {
            trigger: Command,
            follow: Command,
        }
        impl Effect for Chain {
            fn register(&self, table: &mut EffectTable) {
                let follow = self.follow.clone();
                table.on(&self.trigger, move |repo, _payload| {
                    repo.push(&follow, vec![json!(10)]);
                });
            }
        }

        let (repo, add) = counter_repo();
        let trigger = add.clone();
        repo.add_effect(Chain {
            trigger,
            follow: add.clone(),
        })
        .await
        .expect("repo alive");

        repo.push(&add, vec![json!(1)]);
        // First wait covers the original push; the effect's follow-up
        // lands right behind it.
        repo.wait().await.expect("no failures");
        repo.wait().await.expect("no failures");
        assert_eq!(repo.state(), json!({"count": 11}));
    }

    #[tokio::test]
    async fn thunks_adopt_sub_pushes_as_children() {
        let leaf = Command::returning("leaf");
        let sub = leaf.clone();
        let parent = Command::from_thunk("parent", move |_args, ctx| {
            ctx.repo.push(&sub, vec![json!(1)]);
            ctx.action.resolve(json!("spawned"));
        });
        let repo = Repo::build().finish();

        let action = repo.push(&parent, vec![]);
        action.settled().await.expect("repo alive");
        repo.wait().await.expect("no failures");

        let dump = repo.to_json().await.expect("repo alive");
        // genesis → parent → leaf
        let parent_node = &dump["tree"]["children"][0];
        assert_eq!(parent_node["command"], json!(parent.tag().as_str()));
        assert_eq!(
            parent_node["children"][0]["command"]
                .as_str()
                .expect("leaf recorded"),
            leaf.tag().as_str()
        );
    }

    #[tokio::test]
    async fn archive_bounds_history_and_preserves_state() {
        let counter = Counter::new();
        let add = counter.add.clone();
        let repo = Repo::build().limit(2).domain("count", counter).finish();

        for n in 1..=5 {
            repo.push(&add, vec![json!(n)]);
        }
        repo.wait().await.expect("no failures");

        let dump = repo.to_json().await.expect("repo alive");
        assert_eq!(dump["size"], json!(2));
        // The archived prefix still counts: state is the full sum.
        assert_eq!(repo.state(), json!({"count": 15}));
    }

    #[tokio::test]
    async fn reset_and_patch_inject_state() {
        let (repo, add) = counter_repo();
        repo.push(&add, vec![json!(5)]);
        repo.wait().await.expect("no failures");
        assert_eq!(repo.state(), json!({"count": 5}));

        repo.reset(json!({"count": 9})).settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 9}));

        repo.patch(json!({"other": 1})).settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 9}));

        repo.reset(json!({})).settled().await.expect("repo alive");
        assert_eq!(repo.state(), json!({"count": 0}));
    }

    #[tokio::test]
    async fn forks_inherit_and_layer_state() {
        let (repo, add) = counter_repo();
        repo.push(&add, vec![json!(3)]);
        repo.wait().await.expect("no failures");

        let child = repo.fork().await.expect("repo alive");
        assert_eq!(child.state(), json!({"count": 3}));

        let extra = Counter::new();
        let extra_add = extra.add.clone();
        child.add_domain("extra", extra).await.expect("repo alive");
        child.push(&extra_add, vec![json!(7)]);
        child.wait().await.expect("no failures");

        assert_eq!(child.state(), json!({"count": 3, "extra": 7}));
        // The parent does not see the child's slice.
        assert_eq!(repo.state(), json!({"count": 3}));
    }

    #[tokio::test]
    async fn history_events_narrate_the_lifecycle() {
        let (repo, add) = counter_repo();
        let mut events = repo.events().await.expect("repo alive");

        let action = repo.push(&add, vec![json!(1)]);
        action.settled().await.expect("repo alive");

        let mut seen = Vec::new();
        while let Some(SubjectEvent::Next(event)) = events.recv().await {
            let done = event == HistoryEvent::Release;
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(seen.contains(&HistoryEvent::Append(action.id())));
        assert!(
            seen.iter()
                .any(|e| matches!(e, HistoryEvent::Reconcile(_)))
        );
        assert_eq!(seen.last(), Some(&HistoryEvent::Release));
    }

    #[tokio::test]
    async fn release_batches_a_burst_into_one_notification() {
        let (repo, add) = counter_repo();
        // Queue a burst while the actor has not started draining it.
        for n in 0..4 {
            repo.push(&add, vec![json!(n)]);
        }
        let mut events = repo.events().await.expect("repo alive");
        repo.wait().await.expect("no failures");

        // Only drain what is already buffered.
        let mut releases = 0;
        while let Some(SubjectEvent::Next(event)) = events.try_recv() {
            if event == HistoryEvent::Release {
                releases += 1;
            }
        }
        assert!(releases >= 1);
        // Batching coalesces: far fewer releases than mutations.
        assert!(releases <= 4, "got {releases} releases for 4 pushes");
    }

    #[tokio::test]
    async fn serialize_runs_domain_hooks() {
        struct Doubling {
            add: Command,
        }
        impl Domain for Doubling {
            fn initial_state(&self) -> Value {
                json!(0)
            }
            fn register(&self, table: &mut HandlerTable) {
                table.on(&self.add, |state, payload, _| {
                    json!(state.as_i64().unwrap_or(0) + payload.as_i64().unwrap_or(0))
                });
            }
            fn serialize(&self, state: &Value) -> Value {
                json!({"value": state})
            }
        }

        let add = Command::returning("add");
        let repo = Repo::build()
            .domain("n", Doubling { add: add.clone() })
            .finish();
        repo.push(&add, vec![json!(4)]);
        repo.wait().await.expect("no failures");

        let exported = repo.serialize().await.expect("repo alive");
        assert_eq!(exported, json!({"n": {"value": 4}}));
    }

    #[tokio::test]
    async fn shutdown_runs_teardown_and_stops_the_actor() {
        struct Flagged {
            torn_down: Arc<AtomicUsize>,
        }
        impl Domain for Flagged {
            fn register(&self, _table: &mut HandlerTable) {}
            fn teardown(&mut self) {
                self.torn_down.fetch_add(1, Ordering::SeqCst);
            }
        }

        let torn_down = Arc::new(AtomicUsize::new(0));
        let repo = Repo::build()
            .domain(
                "flag",
                Flagged {
                    torn_down: Arc::clone(&torn_down),
                },
            )
            .finish();

        repo.shutdown().await.expect("shutdown is infallible");
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
        assert!(!repo.is_alive());

        // Idempotent: a second shutdown is a no-op.
        repo.shutdown().await.expect("still fine");

        let orphan = repo.push(&Command::returning("late"), vec![]);
        let err = orphan.settled().await.expect_err("actor is gone");
        assert!(matches!(err, RepoError::Gone));
    }
}
