//! Domain contract: pure state reducers mounted at a key.
//!
//! A domain owns one slice of derived state. Its handlers are pure,
//! total functions `(state, payload, meta) -> state` registered against
//! `(CommandTag, LifecycleStage)` pairs, so the `done` handler and the
//! `error` handler for the same command are distinct entries.

use std::collections::HashMap;

use serde_json::Value;

use crate::action::{ActionId, Status};
use crate::command::{Command, CommandTag, LifecycleStage};

/// Metadata handed to a handler alongside state and payload.
#[derive(Debug)]
pub struct ActionMeta<'a> {
    /// Identity of the action being replayed.
    pub id: ActionId,
    /// Identity of the command that produced it.
    pub tag: &'a CommandTag,
    /// The action's status at this replay step.
    pub status: Status,
}

/// A registered reducing handler.
pub type DomainHandler = Box<dyn Fn(&Value, &Value, &ActionMeta<'_>) -> Value + Send>;

/// Dispatch table built once at registration time.
///
/// Keys are explicit `(CommandTag, LifecycleStage)` pairs rather than
/// synthesized strings, so two same-named commands can never collide.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<(CommandTag, LifecycleStage), DomainHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the command's `done` stage, the common case.
    pub fn on(
        &mut self,
        command: &Command,
        handler: impl Fn(&Value, &Value, &ActionMeta<'_>) -> Value + Send + 'static,
    ) -> &mut Self {
        self.on_stage(command, LifecycleStage::Done, handler)
    }

    /// Register a handler for a specific lifecycle stage of a command.
    pub fn on_stage(
        &mut self,
        command: &Command,
        stage: LifecycleStage,
        handler: impl Fn(&Value, &Value, &ActionMeta<'_>) -> Value + Send + 'static,
    ) -> &mut Self {
        self.on_tag(command.tag().clone(), stage, handler)
    }

    /// Register against a raw tag, for string-identified commands.
    pub fn on_tag(
        &mut self,
        tag: CommandTag,
        stage: LifecycleStage,
        handler: impl Fn(&Value, &Value, &ActionMeta<'_>) -> Value + Send + 'static,
    ) -> &mut Self {
        self.handlers.insert((tag, stage), Box::new(handler));
        self
    }

    /// Look up the handler for a dispatch key.
    pub(crate) fn get(
        &self,
        tag: &CommandTag,
        stage: LifecycleStage,
    ) -> Option<&DomainHandler> {
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

/// A pure-state reducer module mounted at a state key.
///
/// # Contract
///
/// - [`initial_state`](Domain::initial_state) seeds the domain's slice
///   before any action has run.
/// - [`register`](Domain::register) must be deterministic: the table is
///   built once when the domain is mounted.
/// - Handlers must be pure: no I/O, no interior mutation of the inputs.
///   Given the same `(state, payload)` they must produce the same state,
///   because memoized replay may skip or repeat invocations.
/// - [`serialize`](Domain::serialize)/[`deserialize`](Domain::deserialize)
///   translate between the domain's working state and an external
///   representation (state injection, devtools export).
/// - [`teardown`](Domain::teardown) runs once when the owning repo shuts
///   down.
pub trait Domain: Send + 'static {
    /// The state this domain starts from.
    fn initial_state(&self) -> Value {
        Value::Null
    }

    /// Populate the dispatch table for this domain.
    fn register(&self, table: &mut HandlerTable);

    /// Translate working state to an external representation.
    fn serialize(&self, state: &Value) -> Value {
        state.clone()
    }

    /// Translate an external representation into working state.
    fn deserialize(&self, raw: Value) -> Value {
        raw
    }

    /// Release resources when the owning repo shuts down.
    fn teardown(&mut self) {}
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::{Domain, HandlerTable};
    use crate::command::Command;

    /// A numeric-sum domain used as a fixture across the crate's tests.
    ///
    /// Counts handler invocations so memoization behaviour is observable.
    pub(crate) struct Counter {
        pub add: Command,
        pub calls: Arc<AtomicUsize>,
    }

    impl Counter {
        pub(crate) fn new() -> Self {
            Self {
                add: Command::returning("add"),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Domain for Counter {
        fn initial_state(&self) -> Value {
            json!(0)
        }

        fn register(&self, table: &mut HandlerTable) {
            let calls = Arc::clone(&self.calls);
            table.on(&self.add, move |state, payload, _meta| {
                calls.fetch_add(1, Ordering::SeqCst);
                json!(state.as_i64().unwrap_or(0) + payload.as_i64().unwrap_or(0))
            });
        }
    }
}
