//! Command identity and execution bodies.
//!
//! A [`Command`] bundles a stable unique [`CommandTag`] with a body
//! factory. The tag is the dispatch key domains and effects register
//! handlers against, paired with a [`LifecycleStage`]; the body factory
//! decides, per push, how the action runs (immediate value, future, or
//! self-driven thunk).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::repo::TaskContext;

/// Counter backing tag uniqueness across the whole process.
static NEXT_TAG_SUFFIX: AtomicU64 = AtomicU64::new(0);

/// Base name used when a command is constructed without one.
const FALLBACK_NAME: &str = "_action";

/// Literal tags of the repo's built-in commands. The `$` prefix keeps
/// them out of the namespace user commands derive their tags from.
pub(crate) const INIT_TAG: &str = "$init";
pub(crate) const RESET_TAG: &str = "$reset";
pub(crate) const PATCH_TAG: &str = "$patch";

/// Stable, globally unique textual identity of a command.
///
/// Built commands get a numeric suffix so two same-named commands never
/// share handlers; plain string tags made via [`CommandTag::literal`] are
/// their own identity, unsuffixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandTag(Arc<str>);

impl CommandTag {
    /// Derive a fresh unique tag from a base name.
    pub(crate) fn unique(base: &str) -> Self {
        let base = if base.is_empty() { FALLBACK_NAME } else { base };
        let suffix = NEXT_TAG_SUFFIX.fetch_add(1, Ordering::Relaxed);
        CommandTag(Arc::from(format!("{base}.{suffix}")))
    }

    /// Use a plain string as its own identity, unsuffixed.
    ///
    /// Callers are responsible for keeping literal tags distinct.
    pub fn literal(name: impl Into<String>) -> Self {
        CommandTag(Arc::from(name.into()))
    }

    /// The textual form of the tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lifecycle stage a handler is registered against.
///
/// Together with a [`CommandTag`] this forms the dispatch key: the `done`
/// handler and the `error` handler for the same command are distinct
/// entries. `unset` and `unsubscribed` actions dispatch no handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    /// The action opened (work began).
    Open,
    /// A progress payload was emitted.
    Update,
    /// The action resolved successfully.
    Done,
    /// The action rejected with an error payload.
    Error,
    /// The action was cancelled.
    Cancel,
}

/// Boxed future form of an asynchronous command body.
pub type BodyFuture = Pin<Box<dyn Future<Output = Result<Value, Value>> + Send + 'static>>;

/// How a pushed action runs.
///
/// Produced by the command's body factory at push time and interpreted by
/// the repo: a plain value resolves immediately; a future opens the
/// action and resolves or rejects it on settlement; a thunk receives a
/// [`TaskContext`] and drives the action's transitions itself.
pub enum Body {
    /// Resolve immediately with this payload.
    Value(Value),
    /// Open with `open` as the optimistic payload, then resolve/reject
    /// when the future settles.
    Future { open: Value, future: BodyFuture },
    /// Hand control to the closure; it calls the transition methods,
    /// enabling streamed updates, sub-pushes, and polling protocols.
    Thunk(Box<dyn FnOnce(TaskContext) + Send + 'static>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Body::Future { open, .. } => f.debug_struct("Future").field("open", open).finish(),
            Body::Thunk(_) => f.write_str("Thunk(..)"),
        }
    }
}

/// Collapse pushed arguments into one payload value.
fn collapse_args(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

/// A pushable unit of work: unique identity plus a body factory.
///
/// `Clone` is cheap; clones share the same tag, so handlers registered
/// against the command fire for actions pushed through any clone.
///
/// # Examples
///
/// ```
/// use statefold::Command;
///
/// let add = Command::returning("add");
/// assert!(add.tag().as_str().starts_with("add."));
/// ```
#[derive(Clone)]
pub struct Command {
    tag: CommandTag,
    body: Arc<dyn Fn(Vec<Value>) -> Body + Send + Sync>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("tag", &self.tag).finish()
    }
}

impl Command {
    /// Build a command with an explicit body factory.
    ///
    /// The tag is assigned once here, so identity is idempotent: every
    /// clone and every push reuses it.
    pub fn new(name: &str, body: impl Fn(Vec<Value>) -> Body + Send + Sync + 'static) -> Self {
        Self {
            tag: CommandTag::unique(name),
            body: Arc::new(body),
        }
    }

    /// A command that resolves immediately with its argument.
    ///
    /// Zero args resolve with `Null`; a single arg resolves with that
    /// value; several args resolve with the argument array.
    pub fn returning(name: &str) -> Self {
        Self::new(name, |args| Body::Value(collapse_args(args)))
    }

    /// A command whose body is an async computation.
    ///
    /// The action opens when pushed, carrying the collapsed arguments as
    /// its optimistic payload, and resolves (`Ok`) or rejects (`Err`)
    /// when the future settles.
    pub fn from_future<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self::new(name, move |args| Body::Future {
            open: collapse_args(args.clone()),
            future: Box::pin(f(args)),
        })
    }

    /// A command whose body drives the action manually.
    ///
    /// The closure receives the pushed arguments and a [`TaskContext`]
    /// carrying the action handle and a repo handle for sub-pushes.
    pub fn from_thunk<F>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>, TaskContext) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |args| {
            let f = Arc::clone(&f);
            Body::Thunk(Box::new(move |ctx| f(args, ctx)))
        })
    }

    /// The command's dispatch identity.
    pub fn tag(&self) -> &CommandTag {
        &self.tag
    }

    /// Run the body factory for one push.
    pub(crate) fn invoke(&self, args: Vec<Value>) -> Body {
        (self.body)(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_named_commands_get_distinct_tags() {
        let a = Command::returning("fetch");
        let b = Command::returning("fetch");
        assert_ne!(a.tag(), b.tag());
        assert!(a.tag().as_str().starts_with("fetch."));
        assert!(b.tag().as_str().starts_with("fetch."));
    }

    #[test]
    fn clone_shares_the_tag() {
        let a = Command::returning("fetch");
        let b = a.clone();
        assert_eq!(a.tag(), b.tag());
    }

    #[test]
    fn empty_name_uses_the_fallback_base() {
        let cmd = Command::returning("");
        assert!(cmd.tag().as_str().starts_with("_action."));
    }

    #[test]
    fn literal_tag_is_unsuffixed_and_idempotent() {
        let a = CommandTag::literal("reset");
        let b = CommandTag::literal("reset");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "reset");
    }

    #[test]
    fn returning_with_no_args_yields_null() {
        let cmd = Command::returning("noop");
        match cmd.invoke(vec![]) {
            Body::Value(v) => assert_eq!(v, Value::Null),
            other => panic!("expected Value body, got {other:?}"),
        }
    }

    #[test]
    fn returning_with_one_arg_yields_it() {
        let cmd = Command::returning("add");
        match cmd.invoke(vec![json!(2)]) {
            Body::Value(v) => assert_eq!(v, json!(2)),
            other => panic!("expected Value body, got {other:?}"),
        }
    }

    #[test]
    fn returning_with_many_args_yields_the_array() {
        let cmd = Command::returning("pair");
        match cmd.invoke(vec![json!(1), json!(2)]) {
            Body::Value(v) => assert_eq!(v, json!([1, 2])),
            other => panic!("expected Value body, got {other:?}"),
        }
    }

    #[test]
    fn from_future_opens_with_the_collapsed_args() {
        let cmd = Command::from_future("load", |_args| async { Ok(json!("ready")) });
        match cmd.invoke(vec![json!("query")]) {
            Body::Future { open, .. } => assert_eq!(open, json!("query")),
            other => panic!("expected Future body, got {other:?}"),
        }
    }

    #[test]
    fn tag_display_matches_as_str() {
        let tag = CommandTag::literal("stamp");
        assert_eq!(tag.to_string(), tag.as_str());
    }
}
