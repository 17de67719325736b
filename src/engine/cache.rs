// On-disk resource cache: complete payloads plus resumable partial prefixes,
// all I/O funnelled through one sequential worker thread.

use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::key::ResourceKey;
use crate::config::EngineConfig;

/// Bytes recovered from the cache for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub bytes: Bytes,
    pub total_length: u64,
}

impl CacheEntry {
    pub fn is_complete(&self) -> bool {
        self.bytes.len() as u64 == self.total_length
    }
}

/// Serialized form of a partial artifact.
#[derive(Serialize, Deserialize)]
struct PartialArtifact<'a> {
    total_length: u64,
    #[serde(borrow)]
    bytes: &'a [u8],
}

/// Deterministic artifact naming inside the cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    dir: PathBuf,
    complete_suffix: String,
    partial_suffix: String,
}

impl CacheLayout {
    pub fn new(dir: impl Into<PathBuf>, complete_suffix: &str, partial_suffix: &str) -> Self {
        Self {
            dir: dir.into(),
            complete_suffix: complete_suffix.to_string(),
            partial_suffix: partial_suffix.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn complete_path(&self, key: &ResourceKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, self.complete_suffix))
    }

    pub fn partial_path(&self, key: &ResourceKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, self.partial_suffix))
    }
}

enum CacheCommand {
    Load {
        key: ResourceKey,
        reply: oneshot::Sender<Option<CacheEntry>>,
    },
    Store {
        key: ResourceKey,
        bytes: Bytes,
        total_length: u64,
        reply: oneshot::Sender<()>,
    },
    Remove {
        key: ResourceKey,
        reply: oneshot::Sender<()>,
    },
}

/// Persists and loads byte blobs keyed by [`ResourceKey`].
///
/// Every request is queued to a single worker thread at call time, so requests
/// execute strictly in submission order regardless of when the returned futures
/// are awaited. Filesystem failures never surface: they are logged and the
/// operation degrades to a miss or a no-op.
pub struct CacheStore {
    layout: CacheLayout,
    tx: Mutex<Option<mpsc::UnboundedSender<CacheCommand>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CacheStore {
    /// Open the store described by `config`, creating the directory if needed.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        if config.cache_dir.trim().is_empty() {
            return Err(anyhow!("cache_dir must not be empty"));
        }
        let layout = CacheLayout::new(
            &config.cache_dir,
            &config.complete_suffix,
            &config.partial_suffix,
        );
        Self::with_layout(layout)
    }

    pub fn with_layout(layout: CacheLayout) -> Result<Self> {
        fs::create_dir_all(layout.dir())
            .with_context(|| format!("create cache dir {}", layout.dir().display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker_layout = layout.clone();
        let worker = thread::Builder::new()
            .name("cache-io".to_string())
            .spawn(move || run_worker(worker_layout, rx))
            .context("spawn cache worker")?;

        info!("cache store opened at {}", layout.dir().display());
        Ok(Self {
            layout,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Synchronous existence check for the complete artifact.
    pub fn has_complete(&self, key: &ResourceKey) -> bool {
        self.layout.complete_path(key).is_file()
    }

    /// Load the complete artifact, else the partial one, else miss.
    pub fn load(&self, key: &ResourceKey) -> impl Future<Output = Option<CacheEntry>> + Send + 'static {
        let rx = self.submit(|reply| CacheCommand::Load {
            key: key.clone(),
            reply,
        });
        async move {
            match rx {
                Some(rx) => rx.await.ok().flatten(),
                None => None,
            }
        }
    }

    /// Persist `bytes`: promoted to a complete artifact when it covers
    /// `total_length`, otherwise written as a partial artifact.
    pub fn store(
        &self,
        key: &ResourceKey,
        bytes: Bytes,
        total_length: u64,
    ) -> impl Future<Output = ()> + Send + 'static {
        let rx = self.submit(|reply| CacheCommand::Store {
            key: key.clone(),
            bytes,
            total_length,
            reply,
        });
        wait_done(rx)
    }

    /// Delete both artifacts for `key`. Idempotent.
    pub fn remove(&self, key: &ResourceKey) -> impl Future<Output = ()> + Send + 'static {
        let rx = self.submit(|reply| CacheCommand::Remove {
            key: key.clone(),
            reply,
        });
        wait_done(rx)
    }

    /// Stop accepting requests. Already queued requests still run; the worker
    /// exits once the queue drains.
    pub fn shutdown(&self) {
        if self.tx.lock().take().is_some() {
            debug!("cache store shutting down");
        }
        // Detach rather than join: callers may be on a runtime thread.
        self.worker.lock().take();
    }

    fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CacheCommand,
    ) -> Option<oneshot::Receiver<T>> {
        let (reply, rx) = oneshot::channel();
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!("cache store closed, request dropped");
            return None;
        };
        if tx.send(make(reply)).is_err() {
            warn!("cache worker gone, request dropped");
            return None;
        }
        Some(rx)
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn wait_done(rx: Option<oneshot::Receiver<()>>) {
    if let Some(rx) = rx {
        let _ = rx.await;
    }
}

fn run_worker(layout: CacheLayout, mut rx: mpsc::UnboundedReceiver<CacheCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            CacheCommand::Load { key, reply } => {
                let _ = reply.send(load_entry(&layout, &key));
            }
            CacheCommand::Store {
                key,
                bytes,
                total_length,
                reply,
            } => {
                if let Err(e) = store_entry(&layout, &key, &bytes, total_length) {
                    warn!("cache store failed key={}: {:#}", key, e);
                }
                let _ = reply.send(());
            }
            CacheCommand::Remove { key, reply } => {
                remove_file_logged(&layout.partial_path(&key));
                remove_file_logged(&layout.complete_path(&key));
                debug!("cache removed key={}", key);
                let _ = reply.send(());
            }
        }
    }
    debug!("cache worker exited");
}

fn load_entry(layout: &CacheLayout, key: &ResourceKey) -> Option<CacheEntry> {
    let complete = layout.complete_path(key);
    if complete.is_file() {
        match fs::read(&complete) {
            Ok(data) => {
                debug!("cache hit (complete) key={} bytes={}", key, data.len());
                let total_length = data.len() as u64;
                return Some(CacheEntry {
                    bytes: Bytes::from(data),
                    total_length,
                });
            }
            Err(e) => warn!("cache read failed {}: {}", complete.display(), e),
        }
    }

    let partial = layout.partial_path(key);
    if !partial.is_file() {
        debug!("cache miss key={}", key);
        return None;
    }

    match read_partial(&partial) {
        Ok(entry) => {
            debug!(
                "cache hit (partial) key={} bytes={}/{}",
                key,
                entry.bytes.len(),
                entry.total_length
            );
            Some(entry)
        }
        Err(e) => {
            warn!("discarding corrupt partial {}: {:#}", partial.display(), e);
            remove_file_logged(&partial);
            None
        }
    }
}

fn read_partial(path: &Path) -> Result<CacheEntry> {
    let raw = fs::read(path)?;
    let artifact: PartialArtifact<'_> = postcard::from_bytes(&raw)?;
    if artifact.total_length == 0 || artifact.bytes.len() as u64 > artifact.total_length {
        return Err(anyhow!(
            "inconsistent partial: {} bytes of declared {}",
            artifact.bytes.len(),
            artifact.total_length
        ));
    }
    Ok(CacheEntry {
        bytes: Bytes::copy_from_slice(artifact.bytes),
        total_length: artifact.total_length,
    })
}

fn store_entry(layout: &CacheLayout, key: &ResourceKey, bytes: &[u8], total_length: u64) -> Result<()> {
    if bytes.is_empty() {
        debug!("cache store skipped key={}: no bytes", key);
        return Ok(());
    }
    let len = bytes.len() as u64;
    if len > total_length {
        return Err(anyhow!("{} bytes exceed declared length {}", len, total_length));
    }

    fs::create_dir_all(layout.dir())?;

    if len == total_length {
        write_atomic(layout.dir(), &layout.complete_path(key), bytes)?;
        remove_file_logged(&layout.partial_path(key));
        info!("cache stored complete key={} bytes={}", key, len);
    } else {
        let encoded = postcard::to_stdvec(&PartialArtifact {
            total_length,
            bytes,
        })?;
        write_atomic(layout.dir(), &layout.partial_path(key), &encoded)?;
        info!("cache stored partial key={} bytes={}/{}", key, len, total_length);
    }
    Ok(())
}

/// Write through a sibling temp file so readers never observe a half-written artifact.
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

fn remove_file_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("remove {} failed: {}", path.display(), e),
    }
}
