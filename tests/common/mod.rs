// Shared fixtures: a scripted in-memory fetcher and a listener event recorder.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ma_stream_cache::api::simple::init_tracing;
use ma_stream_cache::config::EngineConfig;
use ma_stream_cache::engine::cache::CacheStore;
use ma_stream_cache::engine::coordinator::Coordinator;
use ma_stream_cache::engine::transfer::{Listener, RequestToken, Transfer};
use ma_stream_cache::error::FetchError;
use ma_stream_cache::source::traits::{FetchRequest, FetchResponse, Fetcher, ResponseHead};

/// Deterministic test payload.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A `video/mp4` response head. `range` is `(start, end, total)` for a 206.
pub fn mp4_head(status: u16, content_length: u64, range: Option<(u64, u64, u64)>) -> ResponseHead {
    ResponseHead {
        status,
        content_type: Some("video/mp4".to_string()),
        content_length: Some(content_length),
        content_range: range.map(|(s, e, t)| format!("bytes {}-{}/{}", s, e, t)),
    }
}

/// Push side of one scripted response body.
pub struct BodyFeed {
    tx: mpsc::UnboundedSender<Result<Bytes, FetchError>>,
}

impl BodyFeed {
    pub fn send(&self, data: &[u8]) {
        let _ = self.tx.send(Ok(Bytes::copy_from_slice(data)));
    }

    pub fn fail(&self, error: FetchError) {
        let _ = self.tx.send(Err(error));
    }

    /// End of body.
    pub fn finish(self) {}
}

struct Scripted {
    head: ResponseHead,
    body: mpsc::UnboundedReceiver<Result<Bytes, FetchError>>,
}

/// Hands out pre-scripted responses in order and records every request.
#[derive(Default)]
pub struct ScriptedFetcher {
    requests: Mutex<Vec<FetchRequest>>,
    responses: Mutex<VecDeque<Scripted>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, head: ResponseHead) -> BodyFeed {
        let (tx, body) = mpsc::unbounded_channel();
        self.responses.lock().push_back(Scripted { head, body });
        BodyFeed { tx }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().push(request);
        let scripted = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| FetchError::Network("no scripted response".to_string()))?;
        let body = stream::unfold(scripted.body, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(FetchResponse {
            head: scripted.head,
            body,
        })
    }
}

/// Captures what one listener observed.
#[derive(Default)]
pub struct Recorder {
    progress: Mutex<Vec<u64>>,
    completions: Mutex<Vec<(Bytes, Option<FetchError>)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn listener(self: &Arc<Self>, token: RequestToken) -> Listener {
        let on_progress = Arc::clone(self);
        let on_complete = Arc::clone(self);
        Listener::new(token)
            .on_progress(move |_token, transfer: &Transfer| {
                on_progress.progress.lock().push(transfer.buffered_len());
            })
            .on_complete(move |bytes, error| {
                on_complete.completions.lock().push((bytes, error));
            })
    }

    /// Buffered length seen at each progress call.
    pub fn progress(&self) -> Vec<u64> {
        self.progress.lock().clone()
    }

    pub fn completions(&self) -> Vec<(Bytes, Option<FetchError>)> {
        self.completions.lock().clone()
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub fetcher: Arc<ScriptedFetcher>,
    pub dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_cache_dir(dir.path().to_string_lossy());
    tweak(&mut config);
    let cache = Arc::new(CacheStore::open(&config).unwrap());
    let fetcher = ScriptedFetcher::new();
    let coordinator = Coordinator::new(config, fetcher.clone(), cache);
    Harness {
        coordinator,
        fetcher,
        dir,
    }
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
