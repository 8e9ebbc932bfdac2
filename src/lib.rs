//! Branchable action-history state runtime: pushed commands become
//! observable actions ordered in a prunable tree, and derived state is
//! folded from that history through pure domain reducers, memoized per
//! action.

mod action;
pub use action::{
    ActionError, ActionEvent, ActionHandle, ActionId, ActionOutcome, ActionState, Status,
    Transition,
};
mod command;
pub use command::{Body, BodyFuture, Command, CommandTag, LifecycleStage};
mod domain;
pub use domain::{ActionMeta, Domain, DomainHandler, HandlerTable};
mod effect;
pub use effect::{Effect, EffectHandler, EffectTable};
mod error;
pub use error::{HistoryError, RepoError};
mod history;
pub use history::{ActionNode, ArchiveOutcome, History, HistoryEvent};
mod reconciler;
mod repo;
pub use repo::{Repo, RepoBuilder, TaskContext};
mod subject;
pub use subject::{Subject, SubjectEvent, Subscription, hash, hash_map};
mod warehouse;
