// Playback-adapter surface. A media player's resource loader issues byte
// requests tagged with its own tokens and holds one observer for its lifetime.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::config::DEFAULT_RELOAD_RETRIES;
use crate::engine::coordinator::Coordinator;
use crate::engine::key::Resource;
use crate::engine::transfer::{Listener, Observer, RequestToken};

/// One player's view of one resource.
///
/// Holds the observer that keeps the resource's transfer alive. Dropping the
/// session releases it exactly like [`LoaderSession::close`].
pub struct LoaderSession {
    coordinator: Coordinator,
    resource: Resource,
    observer: Observer,
    reloads_left: AtomicU32,
}

impl LoaderSession {
    pub fn new(coordinator: Coordinator, resource: Resource) -> Self {
        Self {
            coordinator,
            resource,
            observer: Observer::new(),
            reloads_left: AtomicU32::new(DEFAULT_RELOAD_RETRIES),
        }
    }

    pub fn with_reload_budget(self, reloads: u32) -> Self {
        self.reloads_left.store(reloads, Ordering::Relaxed);
        self
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn reloads_left(&self) -> u32 {
        self.reloads_left.load(Ordering::Relaxed)
    }

    /// Ask for the resource's bytes on behalf of one player request.
    pub async fn request(&self, listener: Listener, range_hint: Option<u64>) {
        self.coordinator
            .start(
                &self.resource,
                range_hint,
                Some(listener),
                Some(self.observer.handle()),
            )
            .await;
    }

    /// The player abandoned one request; the transfer is untouched.
    pub fn cancel_request(&self, token: RequestToken) {
        self.coordinator.cancel_callback(self.resource.key(), token);
    }

    /// Throw away cached and buffered bytes and fetch again, while the reload
    /// budget lasts. Returns `false` once the budget is spent.
    pub async fn reload(&self, listener: Listener) -> bool {
        let claimed = self
            .reloads_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1));
        let Ok(before) = claimed else {
            warn!("reload| budget exhausted key={}", self.resource.key());
            return false;
        };
        debug!(
            "reload| key={} reloads_left={}",
            self.resource.key(),
            before - 1
        );
        self.coordinator.remove_download(self.resource.key()).await;
        self.request(listener, None).await;
        true
    }

    /// Stop observing the resource. The transfer stops once no other observer remains.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for LoaderSession {
    fn drop(&mut self) {
        self.coordinator
            .cancel_download(self.resource.key(), Some(&self.observer.handle()));
    }
}
