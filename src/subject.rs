//! Multicast observable primitive with last-value replay.
//!
//! A [`Subject`] fans every emission out to all live subscribers over
//! per-subscriber unbounded channels, so each subscriber sees events in
//! exactly the order they were emitted. A late subscriber is immediately
//! handed the most recent non-terminal event, or only the terminal event
//! if the subject has already settled.
//!
//! Subjects underpin the per-action event streams and the history event
//! stream; [`hash`] fans several subjects into one aggregate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};

/// One event on a [`Subject`].
///
/// `Complete`, `Error`, and `Unsubscribe` are terminal: the first terminal
/// emission wins and everything after it is silently dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum SubjectEvent<T> {
    /// A non-terminal value emission.
    Next(T),
    /// Successful termination, optionally carrying a final value.
    Complete(Option<T>),
    /// Failed termination carrying the error payload.
    Error(T),
    /// Explicit teardown without a value.
    Unsubscribe,
}

impl<T> SubjectEvent<T> {
    /// Whether this event ends the subject's stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubjectEvent::Next(_))
    }
}

/// A registered subscriber: its id and the sending half of its channel.
struct Subscriber<T> {
    id: u64,
    tx: mpsc::UnboundedSender<SubjectEvent<T>>,
}

struct SubjectInner<T> {
    /// Latest non-terminal emission, replayed to late subscribers.
    last: Option<T>,
    /// Terminal emission, if the subject has settled.
    terminal: Option<SubjectEvent<T>>,
    subscribers: Vec<Subscriber<T>>,
    /// Teardown callbacks, invoked exactly once on `unsubscribe`.
    teardowns: Vec<Box<dyn FnOnce() + Send>>,
    next_subscriber_id: u64,
}

/// Multicast, replay-last observable.
///
/// `Clone` is cheap: all state is behind one `Arc`. Emission methods are
/// synchronous; delivery into subscriber channels happens in call order.
pub struct Subject<T> {
    inner: Arc<Mutex<SubjectInner<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// Create an empty, unsettled subject.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubjectInner {
                last: None,
                terminal: None,
                subscribers: Vec::new(),
                teardowns: Vec::new(),
                next_subscriber_id: 0,
            })),
        }
    }

    /// Emit a non-terminal value to every live subscriber.
    ///
    /// Ignored once the subject has settled.
    pub fn next(&self, value: T) {
        let mut inner = self.lock();
        if inner.terminal.is_some() {
            return;
        }
        inner.last = Some(value.clone());
        broadcast(&mut inner, SubjectEvent::Next(value));
    }

    /// Terminate successfully, optionally carrying a final value.
    ///
    /// The first terminal call wins; later calls are no-ops.
    pub fn complete(&self, value: Option<T>) {
        self.settle(SubjectEvent::Complete(value));
    }

    /// Terminate with an error payload. First terminal call wins.
    pub fn error(&self, value: T) {
        self.settle(SubjectEvent::Error(value));
    }

    /// Terminate via explicit teardown.
    ///
    /// Runs every registered teardown callback exactly once, even if
    /// called repeatedly.
    pub fn unsubscribe(&self) {
        let teardowns = {
            let mut inner = self.lock();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(SubjectEvent::Unsubscribe);
            broadcast(&mut inner, SubjectEvent::Unsubscribe);
            inner.subscribers.clear();
            std::mem::take(&mut inner.teardowns)
        };
        // Run outside the lock: a teardown may touch this subject again.
        for teardown in teardowns {
            teardown();
        }
    }

    /// Register a teardown callback to run when the subject is
    /// unsubscribed. If the subject is already unsubscribed, the callback
    /// runs immediately.
    pub fn on_unsubscribe(&self, f: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut inner = self.lock();
            match inner.terminal {
                Some(SubjectEvent::Unsubscribe) => true,
                Some(_) => return,
                None => {
                    inner.teardowns.push(Box::new(f));
                    return;
                }
            }
        };
        if run_now {
            f();
        }
    }

    /// Whether a terminal event has been emitted.
    pub fn is_settled(&self) -> bool {
        self.lock().terminal.is_some()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Subscribe, receiving replay of the current state followed by every
    /// future emission in order.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // Replay: a settled subject yields only its terminal event and
        // registers no live subscriber; an unsettled one yields the latest
        // value, if any, then joins the broadcast list.
        let id = if let Some(terminal) = &inner.terminal {
            let _ = tx.send(terminal.clone());
            u64::MAX
        } else {
            if let Some(last) = &inner.last {
                let _ = tx.send(SubjectEvent::Next(last.clone()));
            }
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(Subscriber { id, tx });
            id
        };
        drop(inner);
        Subscription {
            id,
            rx,
            subject: Arc::downgrade(&self.inner),
        }
    }

    fn settle(&self, event: SubjectEvent<T>) {
        let mut inner = self.lock();
        if inner.terminal.is_some() {
            return;
        }
        inner.terminal = Some(event.clone());
        broadcast(&mut inner, event);
        inner.subscribers.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SubjectInner<T>> {
        // A poisoned lock means an emitter panicked mid-broadcast; the
        // subject contents are still coherent (plain data), so continue.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn broadcast<T: Clone>(inner: &mut SubjectInner<T>, event: SubjectEvent<T>) {
    // Dead receivers are dropped as they are discovered.
    inner
        .subscribers
        .retain(|sub| sub.tx.send(event.clone()).is_ok());
}

/// A disposable handle on one subscriber's event stream.
///
/// Disposal is idempotent: dropping the subscription or calling
/// [`dispose`](Subscription::dispose) more than once has no further
/// effect, and never re-invokes subject teardown.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<SubjectEvent<T>>,
    subject: Weak<Mutex<SubjectInner<T>>>,
}

impl<T> Subscription<T> {
    /// Receive the next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<SubjectEvent<T>> {
        self.rx.recv().await
    }

    /// Receive without waiting. `None` when no event is ready.
    pub fn try_recv(&mut self) -> Option<SubjectEvent<T>> {
        self.rx.try_recv().ok()
    }

    /// Detach this subscriber from the subject.
    pub fn dispose(&mut self) {
        if let Some(inner) = self.subject.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.subscribers.retain(|sub| sub.id != self.id);
        }
        self.subject = Weak::new();
        self.rx.close();
    }

    /// Convert into a plain stream of events (used by combinators).
    pub fn into_stream(self) -> UnboundedReceiverStream<SubjectEvent<T>> {
        // Move `rx` out without running `Drop` (which would dispose the
        // subscription and close the receiver, ending the stream).
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never used again and is never dropped, so each
        // field is read (moved out) exactly once.
        let rx = unsafe { std::ptr::read(&this.rx) };
        let _subject = unsafe { std::ptr::read(&this.subject) };
        UnboundedReceiverStream::new(rx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Fan several subjects into one, aggregating per-key last payloads.
///
/// The returned subject emits an object snapshot on every child emission,
/// completes with the final object once every child has completed, and
/// errors as soon as any child errors. Unsubscribing the composite
/// unsubscribes every child.
///
/// Must be called within a tokio runtime: the merge loop runs as a
/// spawned task.
pub fn hash(entries: Vec<(String, Subject<Value>)>) -> Subject<Value> {
    let out = Subject::new();

    if entries.is_empty() {
        out.complete(Some(Value::Object(serde_json::Map::new())));
        return out;
    }

    // Composite cancellation cascades to every child.
    let children: Vec<Subject<Value>> = entries.iter().map(|(_, s)| s.clone()).collect();
    out.on_unsubscribe(move || {
        for child in &children {
            child.unsubscribe();
        }
    });

    let mut streams: StreamMap<String, UnboundedReceiverStream<SubjectEvent<Value>>> =
        StreamMap::new();
    let mut acc = serde_json::Map::new();
    for (key, subject) in entries {
        acc.insert(key.clone(), Value::Null);
        streams.insert(key, subject.subscribe().into_stream());
    }

    let total = streams.len();
    let emitter = out.clone();
    tokio::spawn(async move {
        let mut completed = 0usize;
        while let Some((key, event)) = streams.next().await {
            match event {
                SubjectEvent::Next(value) => {
                    acc.insert(key, value);
                    emitter.next(Value::Object(acc.clone()));
                }
                SubjectEvent::Complete(value) => {
                    if let Some(value) = value {
                        acc.insert(key.clone(), value);
                    }
                    streams.remove(&key);
                    completed += 1;
                    if completed == total {
                        emitter.complete(Some(Value::Object(acc)));
                        return;
                    }
                    emitter.next(Value::Object(acc.clone()));
                }
                SubjectEvent::Error(payload) => {
                    emitter.error(payload);
                    return;
                }
                SubjectEvent::Unsubscribe => {
                    emitter.unsubscribe();
                    return;
                }
            }
        }
    });

    out
}

/// Convenience wrapper building a [`hash`] input from string keys.
pub fn hash_map(entries: HashMap<String, Subject<Value>>) -> Subject<Value> {
    let mut pairs: Vec<(String, Subject<Value>)> = entries.into_iter().collect();
    // Deterministic subscription order keeps replay behaviour stable.
    pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
    hash(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_sees_events_in_emission_order() {
        let subject: Subject<Value> = Subject::new();
        let mut sub = subject.subscribe();

        subject.next(json!(1));
        subject.next(json!(2));
        subject.complete(Some(json!(3)));

        assert_eq!(sub.recv().await, Some(SubjectEvent::Next(json!(1))));
        assert_eq!(sub.recv().await, Some(SubjectEvent::Next(json!(2))));
        assert_eq!(
            sub.recv().await,
            Some(SubjectEvent::Complete(Some(json!(3))))
        );
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn late_subscriber_replays_latest_value() {
        let subject: Subject<Value> = Subject::new();
        subject.next(json!("a"));
        subject.next(json!("b"));

        let mut sub = subject.subscribe();
        assert_eq!(sub.recv().await, Some(SubjectEvent::Next(json!("b"))));

        subject.next(json!("c"));
        assert_eq!(sub.recv().await, Some(SubjectEvent::Next(json!("c"))));
    }

    #[tokio::test]
    async fn settled_subject_replays_only_terminal_event() {
        let subject: Subject<Value> = Subject::new();
        subject.next(json!("progress"));
        subject.error(json!("boom"));

        let mut sub = subject.subscribe();
        assert_eq!(sub.recv().await, Some(SubjectEvent::Error(json!("boom"))));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn first_terminal_event_wins() {
        let subject: Subject<Value> = Subject::new();
        let mut sub = subject.subscribe();

        subject.complete(Some(json!(1)));
        subject.error(json!("late"));
        subject.next(json!("later"));

        assert_eq!(
            sub.recv().await,
            Some(SubjectEvent::Complete(Some(json!(1))))
        );
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn teardown_runs_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let subject: Subject<Value> = Subject::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        subject.on_unsubscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        subject.unsubscribe();
        subject.unsubscribe();
        subject.unsubscribe();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_registered_after_unsubscribe_runs_immediately() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let subject: Subject<Value> = Subject::new();
        subject.unsubscribe();

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        subject.on_unsubscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_does_not_run_on_complete() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let subject: Subject<Value> = Subject::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        subject.on_unsubscribe(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        subject.complete(None);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disposal_is_idempotent() {
        let subject: Subject<Value> = Subject::new();
        let mut sub = subject.subscribe();
        sub.dispose();
        sub.dispose();

        // Emissions after disposal are not delivered.
        subject.next(json!(1));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_every_event() {
        let subject: Subject<Value> = Subject::new();
        let mut a = subject.subscribe();
        let mut b = subject.subscribe();

        subject.next(json!(7));

        assert_eq!(a.recv().await, Some(SubjectEvent::Next(json!(7))));
        assert_eq!(b.recv().await, Some(SubjectEvent::Next(json!(7))));
    }

    #[tokio::test]
    async fn hash_aggregates_per_key_payloads() {
        let a: Subject<Value> = Subject::new();
        let b: Subject<Value> = Subject::new();
        let combined = hash(vec![("a".into(), a.clone()), ("b".into(), b.clone())]);
        let mut sub = combined.subscribe();

        a.next(json!(1));
        assert_eq!(
            sub.recv().await,
            Some(SubjectEvent::Next(json!({"a": 1, "b": null})))
        );

        b.next(json!(2));
        assert_eq!(
            sub.recv().await,
            Some(SubjectEvent::Next(json!({"a": 1, "b": 2})))
        );
    }

    #[tokio::test]
    async fn hash_completes_when_all_children_complete() {
        let a: Subject<Value> = Subject::new();
        let b: Subject<Value> = Subject::new();
        let combined = hash(vec![("a".into(), a.clone()), ("b".into(), b.clone())]);
        let mut sub = combined.subscribe();

        a.complete(Some(json!(1)));
        // One child done: still a progress emission, not completion.
        assert_eq!(
            sub.recv().await,
            Some(SubjectEvent::Next(json!({"a": 1, "b": null})))
        );

        b.complete(Some(json!(2)));
        assert_eq!(
            sub.recv().await,
            Some(SubjectEvent::Complete(Some(json!({"a": 1, "b": 2}))))
        );
    }

    #[tokio::test]
    async fn hash_errors_when_any_child_errors() {
        let a: Subject<Value> = Subject::new();
        let b: Subject<Value> = Subject::new();
        let combined = hash(vec![("a".into(), a.clone()), ("b".into(), b.clone())]);
        let mut sub = combined.subscribe();

        a.error(json!("nope"));
        assert_eq!(sub.recv().await, Some(SubjectEvent::Error(json!("nope"))));
    }

    #[tokio::test]
    async fn hash_cancel_cascades_to_children() {
        let a: Subject<Value> = Subject::new();
        let b: Subject<Value> = Subject::new();
        let combined = hash(vec![("a".into(), a.clone()), ("b".into(), b.clone())]);

        combined.unsubscribe();

        assert!(a.is_settled());
        assert!(b.is_settled());
    }

    #[tokio::test]
    async fn hash_of_nothing_completes_immediately() {
        let combined = hash(Vec::new());
        let mut sub = combined.subscribe();
        assert_eq!(
            sub.recv().await,
            Some(SubjectEvent::Complete(Some(json!({}))))
        );
    }
}
