// Image service: memory, then disk, then network. Persists finished transfers.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};
use url::Url;

use super::coordinator::{DownloadHandle, FinishedHook, SessionDelegate};
use super::disk::DiskCache;
use super::memory::{CacheEntry, EntryKind, MemoryCache};
use super::stats::{StatsCollector, StatsSnapshot};
use super::task::Completion;
use crate::config::ServiceConfig;
use crate::decode::{DecodedImage, Decoder, ImageCrateDecoder};
use crate::error::{ImageError, ImageResult};
use crate::source::http_source::HttpTransport;
use crate::source::traits::Transport;

/// Process-wide image cache. Construct once and share it (it is cheap to
/// put behind an `Arc`); every method takes `&self`.
pub struct ImageService {
    memory: Arc<MemoryCache>,
    disk: Arc<DiskCache>,
    delegate: SessionDelegate,
    decoder: Arc<dyn Decoder>,
    stats: Arc<StatsCollector>,
    runtime: Handle,
}

/// Handle of a transfer that may only start later, from the disk queue.
#[derive(Default)]
struct PendingHandle {
    handle: Option<DownloadHandle>,
    cancelled: bool,
}

type HandleSlot = Arc<Mutex<PendingHandle>>;

impl ImageService {
    /// Service backed by `reqwest` and the `image` crate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.request_timeout())?;
        Self::with_parts(config, Arc::new(transport), Arc::new(ImageCrateDecoder))
    }

    pub fn with_parts(
        config: &ServiceConfig,
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
    ) -> Result<Self> {
        let memory = Arc::new(MemoryCache::new(config.memory_capacity_bytes));
        let disk = Arc::new(DiskCache::new(config.cache_path())?);
        let stats = Arc::new(StatsCollector::new());
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("image service needs a tokio runtime: {}", e))?;

        let hook: FinishedHook = {
            let memory = Arc::clone(&memory);
            let disk = Arc::clone(&disk);
            Arc::new(move |url: &Url, entry: CacheEntry| persist(&memory, &disk, url, entry))
        };
        let delegate = SessionDelegate::new(
            transport,
            Arc::clone(&decoder),
            Arc::clone(&memory),
            Arc::clone(&stats),
            hook,
        );

        info!(
            "image service ready memory_capacity={} cache_dir={}",
            config.memory_capacity_bytes,
            disk.folder().display()
        );

        Ok(Self {
            memory,
            disk,
            delegate,
            decoder,
            stats,
            runtime,
        })
    }

    /// Look up `url` in memory, then on disk, then over the network.
    ///
    /// A memory hit calls `on_result` before returning. A disk hit calls it
    /// from the blocking pool. Both return `None`. A miss returns the handle
    /// of the (possibly shared) transfer, and `on_result` fires once the
    /// transfer ends or the handle is cancelled.
    ///
    /// If a disk entry turns out to be unreadable, the network transfer that
    /// replaces it starts after this call has returned `None`, so it cannot be
    /// cancelled through `fetch`. Use [`load`](Self::load) when cancellation
    /// matters; dropping its future cancels that transfer too.
    pub fn fetch<F>(&self, url: &Url, scale: f32, on_result: F) -> Option<DownloadHandle>
    where
        F: FnOnce(ImageResult<DecodedImage>) + Send + 'static,
    {
        self.lookup(url, scale, on_result, None)
    }

    fn lookup<F>(
        &self,
        url: &Url,
        scale: f32,
        on_result: F,
        slot: Option<HandleSlot>,
    ) -> Option<DownloadHandle>
    where
        F: FnOnce(ImageResult<DecodedImage>) + Send + 'static,
    {
        self.stats.record_fetch();

        if let Some(entry) = self.memory.get(url) {
            if entry.kind == EntryKind::Downloaded {
                self.stats.record_memory_hit();
                debug!("memory hit url={}", url);
                on_result(self.decoder.decode(&entry.data, scale));
                return None;
            }
        }

        let key = DiskCache::cache_key(url);
        if self.disk.is_cached(&key) {
            self.stats.record_disk_hit();
            debug!("disk hit url={} key={}", url, key);
            let memory = Arc::clone(&self.memory);
            let decoder = Arc::clone(&self.decoder);
            let delegate = self.delegate.clone();
            let runtime = self.runtime.clone();
            let url = url.clone();
            self.disk.load(key, move |data| match data {
                Some(data) => {
                    memory.put(url, Some(CacheEntry::downloaded(data.clone())));
                    // Keep the I/O queue free for other jobs.
                    runtime.spawn_blocking(move || on_result(decoder.decode(&data, scale)));
                }
                None => {
                    // Vanished or unreadable: fall back to the network.
                    let handle = delegate.request(&url, Completion::new(scale, on_result));
                    if let Some(slot) = slot {
                        attach(&slot, handle);
                    }
                }
            });
            return None;
        }

        Some(self.delegate.request(url, Completion::new(scale, on_result)))
    }

    /// Future form of `fetch`. Dropping the future before it resolves
    /// cancels this caller's interest in the transfer.
    pub async fn load(&self, url: &Url, scale: f32) -> ImageResult<DecodedImage> {
        let (tx, rx) = oneshot::channel::<ImageResult<DecodedImage>>();
        let slot = HandleSlot::default();
        let on_result = move |result| {
            let _ = tx.send(result);
        };
        if let Some(handle) = self.lookup(url, scale, on_result, Some(Arc::clone(&slot))) {
            attach(&slot, handle);
        }
        let mut guard = CancelOnDrop(Some(slot));
        let result = rx.await.unwrap_or(Err(ImageError::Cancelled));
        guard.0 = None;
        result
    }

    /// Persist a finished transfer. Downloaded bytes go to both tiers;
    /// a resumable prefix stays in memory only.
    pub fn store(&self, url: &Url, entry: CacheEntry) {
        persist(&self.memory, &self.disk, url, entry);
    }

    /// Evict `url` from both tiers.
    pub fn remove(&self, url: &Url) {
        self.memory.remove(url);
        self.disk.remove(DiskCache::cache_key(url));
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Wait for queued disk writes to land.
    pub async fn flush(&self) {
        self.disk.flush().await;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    pub fn delegate(&self) -> &SessionDelegate {
        &self.delegate
    }
}

fn persist(memory: &MemoryCache, disk: &DiskCache, url: &Url, entry: CacheEntry) {
    let to_disk = match entry.kind {
        EntryKind::Downloaded => Some(entry.data.clone()),
        EntryKind::Resumable(_) => None,
    };
    memory.put(url.clone(), Some(entry));
    if let Some(data) = to_disk {
        disk.store(DiskCache::cache_key(url), data);
    }
}

/// Park `handle` in `slot`, or cancel it right away if the waiter is gone.
fn attach(slot: &HandleSlot, handle: DownloadHandle) {
    let mut pending = slot.lock();
    if pending.cancelled {
        drop(pending);
        handle.cancel();
    } else {
        pending.handle = Some(handle);
    }
}

struct CancelOnDrop(Option<HandleSlot>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(slot) = self.0.take() else {
            return;
        };
        let handle = {
            let mut pending = slot.lock();
            pending.cancelled = true;
            pending.handle.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}
