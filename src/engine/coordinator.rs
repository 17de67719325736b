// Fetch coordinator: one live transfer per resource, progressive fan-out,
// cache seeding before a fetch and cache write-back after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{CacheEntry, CacheStore};
use super::key::{Resource, ResourceKey};
use super::stats::{StatsCollector, StatsSnapshot};
use super::transfer::{Listener, ObserverHandle, RequestToken, Transfer, TransferPhase};
use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::source::traits::{FetchRequest, Fetcher, ResponseHead};

type ActiveMap = HashMap<ResourceKey, Arc<Transfer>>;

/// A listener attached to an existing transfer, still owed its catch-up calls.
struct Attached {
    listener: Listener,
    outcome: Option<Option<FetchError>>,
}

struct Inner {
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<CacheStore>,
    active: Mutex<ActiveMap>,
    fetch_permits: Arc<Semaphore>,
    stats: Arc<StatsCollector>,
    shutdown_token: CancellationToken,
    /// Bumped by every `remove_download`, under the active-map lock.
    evictions: AtomicU64,
}

/// Coalesces concurrent requests per resource into a single network transfer.
///
/// The active map is the only shared table; its lock is held just long enough
/// to look up, insert or remove. Cache I/O, network calls and listener
/// callbacks all run outside it.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: EngineConfig, fetcher: Arc<dyn Fetcher>, cache: Arc<CacheStore>) -> Self {
        let permits = config.max_concurrent_fetches.max(1);
        info!("coordinator started, max_concurrent_fetches={}", permits);
        Self {
            inner: Arc::new(Inner {
                config,
                fetcher,
                cache,
                active: Mutex::new(HashMap::new()),
                fetch_permits: Arc::new(Semaphore::new(permits)),
                stats: Arc::new(StatsCollector::new()),
                shutdown_token: CancellationToken::new(),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    /// The live transfer for `key`, if any.
    pub fn transfer(&self, key: &ResourceKey) -> Option<Arc<Transfer>> {
        self.inner.active.lock().get(key).cloned()
    }

    pub fn active_transfers(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.active_transfers())
    }

    /// Request the bytes of `resource`.
    ///
    /// Joins the live transfer when there is one; otherwise seeds a new
    /// transfer from the cache and, unless the cache already holds every byte,
    /// starts a network fetch resuming after the cached prefix. Returns once
    /// the listener and observer are attached; results arrive through the
    /// listener.
    ///
    /// `range_hint` is the offset the caller is interested in. Buffers are
    /// always a prefix of the resource, so it does not move the fetch start.
    pub async fn start(
        &self,
        resource: &Resource,
        range_hint: Option<u64>,
        listener: Option<Listener>,
        observer: Option<ObserverHandle>,
    ) {
        if self.inner.shutdown_token.is_cancelled() {
            debug!("start after shutdown key={}", resource.key());
            if let Some(listener) = listener {
                listener.notify_complete(Bytes::new(), Some(FetchError::Shutdown));
            }
            return;
        }

        let key = resource.key();
        let mut listener = listener;
        let mut observer = observer;
        loop {
            // Join a live transfer, or wait out one that is retiring.
            let joined = try_join(&self.inner.active.lock(), key, &mut listener, &mut observer);
            match joined {
                Some(Join::Joined(transfer, attached)) => {
                    debug!("start| joined live transfer key={}", key);
                    deliver_catch_up(&transfer, attached);
                    return;
                }
                Some(Join::Retiring(transfer)) => {
                    debug!("start| waiting for retiring transfer key={}", key);
                    transfer.wait_retired().await;
                    continue;
                }
                None => {}
            }

            let generation = self.inner.evictions.load(Ordering::Acquire);
            let cached = self.inner.cache.load(key).await;

            let created = {
                let mut active = self.inner.active.lock();
                if self.inner.shutdown_token.is_cancelled() {
                    Err(Admission::ShutDown)
                } else if self.inner.evictions.load(Ordering::Acquire) != generation {
                    // An eviction landed while the cache loaded; the entry may be stale.
                    Err(Admission::Stale)
                } else if let Some(join) = try_join(&active, key, &mut listener, &mut observer) {
                    // Another caller created the transfer while the cache loaded.
                    Err(Admission::Raced(join))
                } else {
                    let transfer = Arc::new(Transfer::new(resource.clone()));
                    let offset = self.seed(&transfer, cached.as_ref());
                    let listener = listener.take();
                    if let Some(listener) = &listener {
                        transfer.add_listener(listener.clone());
                    }
                    if let Some(observer) = observer.take() {
                        transfer.add_observer(observer);
                    }
                    active.insert(key.clone(), Arc::clone(&transfer));
                    Ok((transfer, offset, listener))
                }
            };

            let (transfer, offset, listener) = match created {
                Ok(created) => created,
                Err(Admission::ShutDown) => {
                    debug!("start| shut down during cache load key={}", key);
                    if let Some(listener) = listener {
                        listener.notify_complete(Bytes::new(), Some(FetchError::Shutdown));
                    }
                    return;
                }
                Err(Admission::Stale) => {
                    debug!("start| evicted during cache load, reloading key={}", key);
                    continue;
                }
                Err(Admission::Raced(Join::Joined(transfer, attached))) => {
                    debug!("start| lost creation race, joined key={}", key);
                    deliver_catch_up(&transfer, attached);
                    return;
                }
                Err(Admission::Raced(Join::Retiring(transfer))) => {
                    transfer.wait_retired().await;
                    continue;
                }
            };

            let satisfied = cached.as_ref().is_some_and(CacheEntry::is_complete);
            info!(
                "start| new transfer key={} cached={} satisfied={} range_hint={:?}",
                key, offset, satisfied, range_hint
            );

            if offset > 0 {
                if let Some(listener) = &listener {
                    listener.notify_progress(&transfer);
                }
            }

            if satisfied {
                self.finish(&transfer, None, false).await;
            } else {
                let mut request = FetchRequest::new(resource.url().clone(), offset);
                request.headers = self
                    .inner
                    .config
                    .request_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator.run_transfer(transfer, request).await;
                });
            }
            return;
        }
    }

    /// Warm the cache for `resource` in the background. No-op when a complete
    /// artifact already exists.
    pub fn pre_download(&self, resource: &Resource) {
        if self.inner.cache.has_complete(resource.key()) {
            debug!("pre_download| already cached key={}", resource.key());
            return;
        }
        debug!("pre_download| key={}", resource.key());
        let coordinator = self.clone();
        let resource = resource.clone();
        tokio::spawn(async move {
            coordinator.start(&resource, None, None, None).await;
        });
    }

    /// Cancel any live transfer for `key` and evict both cache artifacts, so
    /// the next `start` fetches from scratch.
    ///
    /// A `start` whose cache lookup was already in flight discards that result
    /// and looks again once the eviction has run.
    pub async fn remove_download(&self, key: &ResourceKey) {
        let (removed, removal) = {
            let mut active = self.inner.active.lock();
            self.inner.evictions.fetch_add(1, Ordering::AcqRel);
            let removed = active.remove(key);
            if let Some(transfer) = &removed {
                transfer.mark_evicted();
                transfer.mark_retiring();
                transfer.cancel();
                transfer.mark_retired();
            }
            // Queued while the map is locked so no write-back can slip in after it.
            (removed.is_some(), self.inner.cache.remove(key))
        };
        removal.await;
        info!("remove_download| key={} had_transfer={}", key, removed);
    }

    /// Detach `observer` from the transfer for `key`. When no live observer
    /// remains the network handle stops and buffered bytes are written back;
    /// otherwise the transfer carries on for the others.
    pub fn cancel_download(&self, key: &ResourceKey, observer: Option<&ObserverHandle>) {
        let mut active = self.inner.active.lock();
        let Some(transfer) = active.get(key).map(Arc::clone) else {
            debug!("cancel| no transfer key={} active={}", key, active.len());
            return;
        };

        if let Some(observer) = observer {
            transfer.remove_observer(observer);
        }
        let remaining = transfer.prune_and_count();
        if remaining > 0 {
            debug!("cancel| still observed remaining={} key={}", remaining, key);
            return;
        }

        if transfer.phase() == TransferPhase::Finished {
            // Already terminated and persisted.
            active.remove(key);
            transfer.mark_retired();
            info!("cancel| retired finished transfer key={} active={}", key, active.len());
        } else {
            transfer.mark_retiring();
            transfer.cancel();
            info!("cancel| stopping transfer key={} buffered={}", key, transfer.buffered_len());
        }
    }

    /// Remove exactly one listener from the transfer for `key`.
    pub fn cancel_callback(&self, key: &ResourceKey, token: RequestToken) {
        let transfer = self.transfer(key);
        if let Some(transfer) = transfer {
            let removed = transfer.remove_listener(token);
            debug!("cancel_callback| key={} token={} removed={}", key, token.id(), removed);
        }
    }

    /// Stop accepting work and cancel every live transfer. Buffered bytes are
    /// still written back as the transfers wind down.
    pub fn shutdown(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.fetch_permits.close();
        let mut active = self.inner.active.lock();
        info!("coordinator shutdown, cancelling {} transfers", active.len());
        active.retain(|_, transfer| {
            transfer.mark_retiring();
            if transfer.phase() == TransferPhase::Finished {
                transfer.mark_retired();
                return false;
            }
            transfer.cancel();
            true
        });
    }

    /// Copy cached bytes into a fresh transfer. Returns the resume offset.
    fn seed(&self, transfer: &Transfer, cached: Option<&CacheEntry>) -> u64 {
        match cached {
            Some(entry) => {
                if entry.is_complete() {
                    self.inner.stats.record_complete_hit();
                } else {
                    self.inner.stats.record_partial_hit();
                }
                transfer.set_total_length(entry.total_length);
                transfer.append(&entry.bytes);
                entry.bytes.len() as u64
            }
            None => {
                self.inner.stats.record_miss();
                0
            }
        }
    }

    async fn run_transfer(&self, transfer: Arc<Transfer>, request: FetchRequest) {
        let cancel = transfer.cancel_token().clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.pump(&transfer, request) => result,
        };
        self.finish(&transfer, result.err(), true).await;
    }

    /// Wait for a fetch permit, then stream the response into the transfer.
    async fn pump(&self, transfer: &Transfer, request: FetchRequest) -> Result<(), FetchError> {
        let _permit = self
            .inner
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let _worker = WorkerGuard::new(&self.inner.stats);
        self.inner.stats.record_fetch_started();

        debug!(
            "fetch| key={} range={:?}",
            transfer.key(),
            request.range_header()
        );
        let offset = request.offset;
        let response = self.inner.fetcher.fetch(request).await?;
        let mut skip = self.on_response_head(transfer, &response.head, offset)?;

        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let mut chunk = chunk?;
            if skip > 0 {
                let n = skip.min(chunk.len() as u64);
                chunk = chunk.slice(n as usize..);
                skip -= n;
            }
            if chunk.is_empty() {
                continue;
            }
            self.on_chunk(transfer, &chunk);
        }
        Ok(())
    }

    /// Validate response metadata and record the total length. Returns how many
    /// leading body bytes duplicate the already-buffered prefix.
    fn on_response_head(&self, transfer: &Transfer, head: &ResponseHead, offset: u64) -> Result<u64, FetchError> {
        if !head.is_success() {
            warn!("fetch| key={} status={}", transfer.key(), head.status);
            return Err(FetchError::Http {
                status: head.status,
            });
        }

        if let Some(expected) = &self.inner.config.expected_content_type {
            let actual = head.mime_type().unwrap_or_default();
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(
                    "fetch| key={} unexpected content type {:?}, expected {}",
                    transfer.key(),
                    actual,
                    expected
                );
                return Err(FetchError::UnexpectedContentType {
                    expected: expected.clone(),
                    actual: actual.to_string(),
                });
            }
        }

        match head.total_length() {
            Some(total) => {
                if !transfer.set_total_length(total) && transfer.total_length() != Some(total) {
                    warn!(
                        "fetch| key={} origin reports total={} but cache declared {:?}",
                        transfer.key(),
                        total,
                        transfer.total_length()
                    );
                }
            }
            None => debug!("fetch| key={} total length unknown", transfer.key()),
        }

        if offset > 0 && !head.is_partial_content() {
            // Range ignored by the origin: the body restarts at byte 0.
            debug!("fetch| key={} range ignored, skipping {} bytes", transfer.key(), offset);
            return Ok(offset);
        }
        Ok(0)
    }

    fn on_chunk(&self, transfer: &Transfer, chunk: &Bytes) {
        transfer.append(chunk);
        self.inner.stats.record_downloaded(chunk.len() as u64);
        for listener in transfer.listeners() {
            listener.notify_progress(transfer);
        }
    }

    /// Tell every listener, write the buffer back, then retire the transfer if
    /// nobody observes it any more.
    async fn finish(&self, transfer: &Arc<Transfer>, error: Option<FetchError>, persist: bool) {
        transfer.set_phase(TransferPhase::Finalizing);
        let snapshot = transfer.snapshot();
        match &error {
            None => info!(
                "finish| success key={} total={:?} buffered={}",
                transfer.key(),
                transfer.total_length(),
                snapshot.len()
            ),
            Some(e) => info!(
                "finish| {} key={} total={:?} buffered={}",
                e,
                transfer.key(),
                transfer.total_length(),
                snapshot.len()
            ),
        }

        for listener in transfer.terminate(error.clone()) {
            listener.notify_complete(snapshot.clone(), error.clone());
        }

        if persist {
            let write_back = {
                let _active = self.inner.active.lock();
                match transfer.total_length() {
                    Some(total) if !transfer.is_evicted() => {
                        Some(self.inner.cache.store(transfer.key(), snapshot, total))
                    }
                    Some(_) => None,
                    None => {
                        debug!("finish| key={} not persisted, total length unknown", transfer.key());
                        None
                    }
                }
            };
            if let Some(write_back) = write_back {
                write_back.await;
            }
        }

        transfer.set_phase(TransferPhase::Finished);
        self.retire_if_unobserved(transfer);
    }

    fn retire_if_unobserved(&self, transfer: &Arc<Transfer>) {
        let mut active = self.inner.active.lock();
        let is_current = active
            .get(transfer.key())
            .is_some_and(|current| Arc::ptr_eq(current, transfer));
        if !is_current {
            transfer.mark_retired();
            return;
        }
        let remaining = transfer.prune_and_count();
        if transfer.is_retiring() || remaining == 0 {
            active.remove(transfer.key());
            transfer.mark_retired();
            debug!(
                "finish| removed transfer key={} active={}",
                transfer.key(),
                active.len()
            );
        } else {
            debug!(
                "finish| kept for {} observers key={}",
                remaining,
                transfer.key()
            );
        }
    }
}

enum Join {
    Joined(Arc<Transfer>, Option<Attached>),
    Retiring(Arc<Transfer>),
}

/// Why `start` did not create a transfer after its cache lookup.
enum Admission {
    ShutDown,
    Stale,
    Raced(Join),
}

/// Look up a live transfer for `key` and attach to it. Runs under the
/// active-map lock so retirement always sees the new observer.
fn try_join(
    active: &ActiveMap,
    key: &ResourceKey,
    listener: &mut Option<Listener>,
    observer: &mut Option<ObserverHandle>,
) -> Option<Join> {
    let transfer = active.get(key)?;
    if transfer.is_retiring() {
        return Some(Join::Retiring(Arc::clone(transfer)));
    }
    let attached = attach(transfer, listener.take(), observer.take());
    Some(Join::Joined(Arc::clone(transfer), attached))
}

fn attach(
    transfer: &Transfer,
    listener: Option<Listener>,
    observer: Option<ObserverHandle>,
) -> Option<Attached> {
    if let Some(observer) = observer {
        transfer.add_observer(observer);
    }
    listener.map(|listener| {
        let outcome = transfer.add_listener(listener.clone());
        Attached { listener, outcome }
    })
}

/// Bring a late joiner up to date: buffered-so-far, then the outcome if the
/// network handle already terminated.
fn deliver_catch_up(transfer: &Transfer, attached: Option<Attached>) {
    let Some(Attached { listener, outcome }) = attached else {
        return;
    };
    listener.notify_progress(transfer);
    if let Some(error) = outcome {
        listener.notify_complete(transfer.snapshot(), error);
    }
}

struct WorkerGuard<'a> {
    stats: &'a StatsCollector,
}

impl<'a> WorkerGuard<'a> {
    fn new(stats: &'a StatsCollector) -> Self {
        stats.increment_workers();
        Self { stats }
    }
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.stats.decrement_workers();
    }
}
