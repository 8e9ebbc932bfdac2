//! Effect contract: side-effect observers of command lifecycle events.
//!
//! Effects mirror domains in how they register -- a table keyed by
//! `(CommandTag, LifecycleStage)` -- but their handlers receive the repo
//! handle and the payload, produce no state, and run at most once per
//! transition, after every domain has reconciled.

use std::collections::HashMap;

use serde_json::Value;

use crate::command::{Command, CommandTag, LifecycleStage};
use crate::repo::Repo;

/// A registered side-effect handler.
///
/// Handlers must not block: they run on the repo's single actor thread.
/// Pushing new actions from inside a handler is safe -- the push is
/// queued and dispatched after the current reconciliation settles.
pub type EffectHandler = Box<dyn Fn(&Repo, &Value) + Send>;

/// Dispatch table for one effect, built at registration time.
#[derive(Default)]
pub struct EffectTable {
    handlers: HashMap<(CommandTag, LifecycleStage), EffectHandler>,
}

impl EffectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the command's `done` stage.
    pub fn on(
        &mut self,
        command: &Command,
        handler: impl Fn(&Repo, &Value) + Send + 'static,
    ) -> &mut Self {
        self.on_stage(command, LifecycleStage::Done, handler)
    }

    /// Register a handler for a specific lifecycle stage of a command.
    pub fn on_stage(
        &mut self,
        command: &Command,
        stage: LifecycleStage,
        handler: impl Fn(&Repo, &Value) + Send + 'static,
    ) -> &mut Self {
        self.on_tag(command.tag().clone(), stage, handler)
    }

    /// Register against a raw tag, for string-identified commands.
    pub fn on_tag(
        &mut self,
        tag: CommandTag,
        stage: LifecycleStage,
        handler: impl Fn(&Repo, &Value) + Send + 'static,
    ) -> &mut Self {
        self.handlers.insert((tag, stage), Box::new(handler));
        self
    }

    /// Look up the handler for a dispatch key.
    pub(crate) fn get(
        &self,
        tag: &CommandTag,
        stage: LifecycleStage,
    ) -> Option<&EffectHandler> {
        self.handlers.get(&(tag.clone(), stage))
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A side-effect module reacting to command lifecycle events.
///
/// Unlike a [`Domain`](crate::Domain), an effect owns no state slice and
/// returns nothing; it observes transitions and acts on the outside
/// world (or pushes follow-up commands).
pub trait Effect: Send + 'static {
    /// Populate the dispatch table for this effect.
    fn register(&self, table: &mut EffectTable);

    /// Release resources when the owning repo shuts down.
    fn teardown(&mut self) {}
}
