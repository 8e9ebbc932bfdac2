//! Crate-level error types for store operations and history mutation.

/// Error returned when a handle-side operation against the repo fails.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The repo actor has exited, so no further operations can be processed.
    ///
    /// This happens after [`shutdown`](crate::Repo::shutdown), or when a
    /// domain/effect handler panicked and tore the actor down.
    #[error("repo is no longer running")]
    Gone,

    /// A history-level operation was rejected.
    ///
    /// Wraps the tree error, forwarding its `Display` and `Error` impls.
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Tree-level programmer errors.
///
/// These represent misuse of the history API rather than runtime
/// conditions to recover from: the referenced action is simply not where
/// the caller believed it to be.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The action id is not present in the retained tree.
    ///
    /// Raised by `checkout`, `toggle`, `remove`, and `prune` when handed
    /// an id that was never appended or has already been archived away.
    #[error("unable to checkout undefined action {0}")]
    UnknownAction(u64),

    /// `prune` was asked to drop a subtree that is still on the active
    /// branch. Disconnect it first (checkout a sibling branch).
    #[error("action {0} is on the active branch and cannot be pruned")]
    ActiveSubtree(u64),
}
