// Per-resource transfer: append-only buffer, declared length, listeners and observers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::key::{Resource, ResourceKey};
use crate::error::FetchError;

/// Caller-side correlation handle for one request against a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Invoked after every byte delivery. Read bytes through the transfer, never cache them.
pub type ProgressFn = Arc<dyn Fn(RequestToken, &Transfer) + Send + Sync>;

/// Invoked once the transfer terminates, with every byte buffered so far.
pub type CompleteFn = Arc<dyn Fn(Bytes, Option<FetchError>) + Send + Sync>;

/// One caller's progress/completion pair, keyed by its request token.
#[derive(Clone)]
pub struct Listener {
    token: RequestToken,
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
}

impl Listener {
    pub fn new(token: RequestToken) -> Self {
        Self {
            token,
            progress: None,
            complete: None,
        }
    }

    pub fn on_progress(mut self, f: impl Fn(RequestToken, &Transfer) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(Bytes, Option<FetchError>) + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(f));
        self
    }

    pub fn token(&self) -> RequestToken {
        self.token
    }

    pub(crate) fn notify_progress(&self, transfer: &Transfer) {
        if let Some(progress) = &self.progress {
            progress(self.token, transfer);
        }
    }

    pub(crate) fn notify_complete(&self, bytes: Bytes, error: Option<FetchError>) {
        if let Some(complete) = &self.complete {
            complete(bytes, error);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("token", &self.token)
            .field("progress", &self.progress.is_some())
            .field("complete", &self.complete.is_some())
            .finish()
    }
}

/// A consumer whose continued existence keeps transfers alive.
///
/// Dropping the observer marks every handle derived from it dead; transfers
/// notice on their next observer-set mutation.
#[derive(Debug)]
pub struct Observer {
    handle: ObserverHandle,
}

impl Observer {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            handle: ObserverHandle {
                id: NEXT.fetch_add(1, Ordering::Relaxed),
                alive: Arc::new(AtomicBool::new(true)),
            },
        }
    }

    pub fn handle(&self) -> ObserverHandle {
        self.handle.clone()
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.handle.alive.store(false, Ordering::Release);
    }
}

/// Identity-comparable, non-owning reference to an [`Observer`].
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: u64,
    alive: Arc<AtomicBool>,
}

impl ObserverHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl PartialEq for ObserverHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObserverHandle {}

/// Where a transfer sits between creation and retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Network handle active, or queued for a fetch permit.
    Fetching,
    /// Network handle terminated; cache write-back in progress.
    Finalizing,
    /// Terminated and persisted; alive only for its observers.
    Finished,
}

/// Listener records plus the terminal outcome, guarded together so a listener
/// is either part of the completion fan-out or sees the recorded outcome.
#[derive(Default)]
struct ListenerSet {
    entries: Vec<Listener>,
    /// `Some(None)` once terminated successfully, `Some(Some(e))` on failure.
    outcome: Option<Option<FetchError>>,
}

/// The in-memory state of one fetch for one resource.
pub struct Transfer {
    resource: Resource,
    cancel: CancellationToken,
    buffer: Mutex<Vec<u8>>,
    total_length: OnceLock<u64>,
    listeners: Mutex<ListenerSet>,
    observers: Mutex<Vec<ObserverHandle>>,
    phase: Mutex<TransferPhase>,
    retiring: AtomicBool,
    evicted: AtomicBool,
    retired: watch::Sender<bool>,
}

impl Transfer {
    pub fn new(resource: Resource) -> Self {
        let (retired, _) = watch::channel(false);
        Self {
            resource,
            cancel: CancellationToken::new(),
            buffer: Mutex::new(Vec::new()),
            total_length: OnceLock::new(),
            listeners: Mutex::new(ListenerSet::default()),
            observers: Mutex::new(Vec::new()),
            phase: Mutex::new(TransferPhase::Fetching),
            retiring: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            retired,
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn key(&self) -> &ResourceKey {
        self.resource.key()
    }

    // --- buffer ---

    /// Append a chunk. Empty chunks are ignored.
    pub fn append(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.lock().extend_from_slice(chunk);
    }

    /// Point-in-time copy of every buffered byte.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer.lock())
    }

    /// Copy of `[start, end)` clamped to what is buffered. Empty when nothing overlaps.
    pub fn read_range(&self, start: u64, end: u64) -> Bytes {
        let buffer = self.buffer.lock();
        let len = buffer.len() as u64;
        let end = end.min(len);
        if start >= end {
            return Bytes::new();
        }
        Bytes::copy_from_slice(&buffer[start as usize..end as usize])
    }

    pub fn buffered_len(&self) -> u64 {
        self.buffer.lock().len() as u64
    }

    pub fn total_length(&self) -> Option<u64> {
        self.total_length.get().copied()
    }

    /// Record the declared total length. Only the first call has any effect.
    pub fn set_total_length(&self, total: u64) -> bool {
        let accepted = self.total_length.set(total).is_ok();
        if !accepted {
            debug!(
                "transfer {} ignoring total_length={} (already {:?})",
                self.key(),
                total,
                self.total_length()
            );
        }
        accepted
    }

    pub fn is_complete(&self) -> bool {
        match self.total_length() {
            Some(total) => self.buffered_len() >= total,
            None => false,
        }
    }

    // --- listeners ---

    /// Register a listener. Returns the terminal outcome when the transfer has
    /// already terminated, in which case the caller owes it a completion call.
    pub fn add_listener(&self, listener: Listener) -> Option<Option<FetchError>> {
        let mut set = self.listeners.lock();
        set.entries.push(listener);
        set.outcome.clone()
    }

    /// Detach the listener registered under `token`. Returns whether one was found.
    pub fn remove_listener(&self, token: RequestToken) -> bool {
        let mut set = self.listeners.lock();
        let before = set.entries.len();
        set.entries.retain(|l| l.token != token);
        set.entries.len() != before
    }

    /// Copy of the listener list, for fan-out without holding the lock.
    pub fn listeners(&self) -> Vec<Listener> {
        self.listeners.lock().entries.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    /// Record the outcome of the network handle and return the listeners that
    /// must be told. Only the first call records anything.
    pub(crate) fn terminate(&self, error: Option<FetchError>) -> Vec<Listener> {
        let mut set = self.listeners.lock();
        if set.outcome.is_some() {
            return Vec::new();
        }
        set.outcome = Some(error);
        set.entries.clone()
    }

    /// Outcome of the network handle, once terminated. `Some(None)` is success.
    pub fn outcome(&self) -> Option<Option<FetchError>> {
        self.listeners.lock().outcome.clone()
    }

    // --- observers ---

    /// Register interest. Dead handles are ignored and duplicates collapse.
    pub fn add_observer(&self, handle: ObserverHandle) {
        if !handle.is_live() {
            return;
        }
        let mut observers = self.observers.lock();
        observers.retain(ObserverHandle::is_live);
        if !observers.contains(&handle) {
            observers.push(handle);
        }
    }

    pub fn remove_observer(&self, handle: &ObserverHandle) {
        self.observers
            .lock()
            .retain(|h| h.is_live() && h != handle);
    }

    /// Drop reclaimed handles and return how many live ones remain.
    pub fn prune_and_count(&self) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(ObserverHandle::is_live);
        observers.len()
    }

    // --- lifecycle ---

    pub fn phase(&self) -> TransferPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: TransferPhase) {
        *self.phase.lock() = phase;
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the network handle. Buffered bytes are kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn mark_retiring(&self) {
        self.retiring.store(true, Ordering::Release);
    }

    /// Whether the transfer has been released by its last observer and must
    /// not accept new listeners.
    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    /// Flag the transfer's bytes as unusable: nothing may be written back.
    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.send_replace(true);
    }

    /// Resolves once the transfer has been removed from the active map.
    pub async fn wait_retired(&self) {
        let mut rx = self.retired.subscribe();
        let _ = rx.wait_for(|retired| *retired).await;
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("key", self.key())
            .field("buffered", &self.buffered_len())
            .field("total_length", &self.total_length())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> Transfer {
        Transfer::new(Resource::parse("https://media.example.com/a.mp4").unwrap())
    }

    #[test]
    fn test_append_grows_and_ignores_empty() {
        let t = transfer();
        t.append(b"abc");
        t.append(b"");
        t.append(b"de");
        assert_eq!(t.snapshot().as_ref(), b"abcde");
        assert_eq!(t.buffered_len(), 5);
        assert_eq!(t.read_range(1, 3).as_ref(), b"bc");
        assert_eq!(t.read_range(4, 100).as_ref(), b"e");
        assert!(t.read_range(5, 9).is_empty());
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let t = transfer();
        t.append(b"one");
        let snap = t.snapshot();
        t.append(b"two");
        assert_eq!(snap.as_ref(), b"one");
        assert_eq!(t.snapshot().as_ref(), b"onetwo");
    }

    #[test]
    fn test_total_length_set_once() {
        let t = transfer();
        assert_eq!(t.total_length(), None);
        assert!(t.set_total_length(1000));
        assert!(!t.set_total_length(2000));
        assert_eq!(t.total_length(), Some(1000));
    }

    #[test]
    fn test_remove_listener_by_token_only() {
        let t = transfer();
        t.add_listener(Listener::new(RequestToken::new(1)));
        t.add_listener(Listener::new(RequestToken::new(2)));
        t.add_listener(Listener::new(RequestToken::new(3)));

        assert!(t.remove_listener(RequestToken::new(2)));
        assert!(!t.remove_listener(RequestToken::new(2)));

        let tokens: Vec<u64> = t.listeners().iter().map(|l| l.token().id()).collect();
        assert_eq!(tokens, vec![1, 3]);
    }

    #[test]
    fn test_late_listener_sees_outcome() {
        let t = transfer();
        assert_eq!(t.add_listener(Listener::new(RequestToken::new(1))), None);

        let told = t.terminate(None);
        assert_eq!(told.len(), 1);
        assert!(t.terminate(Some(FetchError::Cancelled)).is_empty());

        assert_eq!(t.add_listener(Listener::new(RequestToken::new(2))), Some(None));
        assert_eq!(t.outcome(), Some(None));
    }

    #[test]
    fn test_observer_liveness_follows_owner() {
        let t = transfer();
        let a = Observer::new();
        let b = Observer::new();
        t.add_observer(a.handle());
        t.add_observer(a.handle());
        t.add_observer(b.handle());
        assert_eq!(t.prune_and_count(), 2);

        drop(b);
        assert_eq!(t.prune_and_count(), 1);

        t.remove_observer(&a.handle());
        assert_eq!(t.prune_and_count(), 0);
    }

    #[test]
    fn test_dead_observer_not_added() {
        let t = transfer();
        let handle = {
            let gone = Observer::new();
            gone.handle()
        };
        assert!(!handle.is_live());
        t.add_observer(handle);
        assert_eq!(t.prune_and_count(), 0);
    }
}
