// In-flight transfer coordinator. Coalesces requests per URL, drives the
// transport callbacks, and decides whether an interrupted transfer can resume.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use url::Url;

use super::memory::{CacheEntry, MemoryCache};
use super::stats::StatsCollector;
use super::task::{Completion, DataTask, FinishedTask, TaskPhase};
use crate::decode::Decoder;
use crate::error::ImageError;
use crate::source::traits::{
    ResponseDisposition, ResponseHead, TransferEvents, TransferKey, TransferRequest, Transport,
};

/// Called with the bytes of every finished transfer: `Downloaded` on
/// success, `Resumable` for an interrupted transfer worth continuing.
pub type FinishedHook = Arc<dyn Fn(&Url, CacheEntry) + Send + Sync>;

/// Owns the URL → in-flight transfer map.
#[derive(Clone)]
pub struct SessionDelegate {
    inner: Arc<DelegateInner>,
}

struct DelegateInner {
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn Decoder>,
    /// Blocking pool for decoding finished transfers; `None` decodes inline.
    decode_runtime: Option<Handle>,
    memory: Arc<MemoryCache>,
    stats: Arc<StatsCollector>,
    on_task_finished: FinishedHook,
    tasks: Mutex<HashMap<Url, Arc<DataTask>>>,
    next_serial: AtomicU64,
}

/// A caller's claim on an in-flight transfer. Cancelling it withdraws only
/// this caller; once the transfer has finished it does nothing.
pub struct DownloadHandle {
    key: TransferKey,
    token: u64,
    delegate: Weak<DelegateInner>,
}

impl DownloadHandle {
    pub fn cancel(&self) {
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.cancel(&self.key, self.token);
        }
    }

    pub fn url(&self) -> &Url {
        &self.key.url
    }
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("url", &self.key.url.as_str())
            .field("serial", &self.key.serial)
            .field("token", &self.token)
            .finish()
    }
}

impl SessionDelegate {
    /// Created inside a tokio runtime, finished transfers are decoded on its
    /// blocking pool. Otherwise they are decoded on the transport's thread.
    pub fn new(
        transport: Arc<dyn Transport>,
        decoder: Arc<dyn Decoder>,
        memory: Arc<MemoryCache>,
        stats: Arc<StatsCollector>,
        on_task_finished: FinishedHook,
    ) -> Self {
        Self {
            inner: Arc::new(DelegateInner {
                transport,
                decoder,
                decode_runtime: Handle::try_current().ok(),
                memory,
                stats,
                on_task_finished,
                tasks: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    /// Attach `completion` to the in-flight transfer for `url`, or start one.
    ///
    /// A new transfer resumes from a `Resumable` memory entry when there is
    /// one. Never blocks on I/O; the completion fires later from the
    /// transport's context.
    pub fn request(&self, url: &Url, completion: Completion) -> DownloadHandle {
        let mut completion = completion;
        loop {
            let seed = self.inner.memory.resumable(url);

            let mut tasks = self.inner.tasks.lock();
            let existing = tasks.get(url).cloned();
            if let Some(task) = existing {
                drop(tasks);
                match task.add_completion(completion) {
                    Ok(token) => {
                        self.inner.stats.record_coalesced();
                        debug!(
                            "transfer {}#{} coalesced token={}",
                            url,
                            task.key().serial,
                            token
                        );
                        task.resume();
                        return self.handle(&task, token);
                    }
                    Err(returned) => {
                        // Finished or cancelled between lookup and attach.
                        completion = returned;
                        self.inner.forget(&task);
                        continue;
                    }
                }
            }

            let task = Arc::new(self.new_task(url, seed, completion));
            tasks.insert(url.clone(), Arc::clone(&task));
            drop(tasks);

            let resumed = task.resume_offset() > 0;
            self.inner.stats.record_network_request(resumed);
            info!(
                "transfer {}#{} created resume_from={}",
                url,
                task.key().serial,
                task.resume_offset()
            );
            task.resume();
            return self.handle(&task, DataTask::FIRST_TOKEN);
        }
    }

    /// Same as `handle.cancel()`.
    pub fn cancel(&self, handle: &DownloadHandle) {
        self.inner.cancel(&handle.key, handle.token);
    }

    pub fn active_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_active(&self, url: &Url) -> bool {
        self.inner.tasks.lock().contains_key(url)
    }

    fn new_task(
        &self,
        url: &Url,
        seed: Option<(Bytes, Option<String>)>,
        first: Completion,
    ) -> DataTask {
        let key = TransferKey {
            url: url.clone(),
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
        };

        let (request, seed_bytes) = match seed {
            Some((bytes, validator)) if !bytes.is_empty() => (
                TransferRequest {
                    key: key.clone(),
                    range_start: Some(bytes.len() as u64),
                    if_range: validator,
                },
                Some(bytes),
            ),
            _ => (TransferRequest::plain(key.clone()), None),
        };

        let inner = Arc::downgrade(&self.inner);
        let events: Weak<dyn TransferEvents> = inner;
        let transport_task = self.inner.transport.data_task(request, events);
        DataTask::new(key, transport_task, seed_bytes, first)
    }

    fn handle(&self, task: &DataTask, token: u64) -> DownloadHandle {
        DownloadHandle {
            key: task.key().clone(),
            token,
            delegate: Arc::downgrade(&self.inner),
        }
    }
}

impl DelegateInner {
    /// The active record for `key`, ignoring records from other transfers of
    /// the same URL.
    fn task_for(&self, key: &TransferKey) -> Option<Arc<DataTask>> {
        self.tasks
            .lock()
            .get(&key.url)
            .filter(|task| task.key().serial == key.serial)
            .cloned()
    }

    /// Drop `task` from the active map if it is still the current record.
    fn forget(&self, task: &Arc<DataTask>) {
        let mut tasks = self.tasks.lock();
        if tasks
            .get(&task.key().url)
            .map(|current| Arc::ptr_eq(current, task))
            .unwrap_or(false)
        {
            tasks.remove(&task.key().url);
        }
    }

    fn cancel(&self, key: &TransferKey, token: u64) {
        let Some(task) = self.task_for(key) else {
            debug!("cancel ignored, transfer {}#{} already gone", key.url, key.serial);
            return;
        };
        let Some((completion, drained)) = task.remove_completion(token) else {
            return;
        };

        completion.notify(Err(ImageError::Cancelled));

        if drained {
            self.forget(&task);
            task.cancel_transport();
            info!("transfer {}#{} cancelled by last waiter", key.url, key.serial);
        } else {
            debug!(
                "transfer {}#{} token={} withdrawn, {} waiters left",
                key.url,
                key.serial,
                token,
                task.completion_count()
            );
        }
    }

    fn finish_success(&self, task: &Arc<DataTask>) {
        self.forget(task);
        let Some(finished) = task.finish(|_, _, _| TaskPhase::Completed) else {
            return;
        };
        info!(
            "transfer {}#{} completed bytes={} waiters={}",
            task.key().url,
            task.key().serial,
            finished.data.len(),
            finished.completions.len()
        );

        // Persist first so a waiter that immediately fetches again hits memory.
        (self.on_task_finished)(&task.key().url, CacheEntry::downloaded(finished.data.clone()));
        self.deliver_decoded(finished);
    }

    fn finish_failure(&self, task: &Arc<DataTask>, error: anyhow::Error) {
        self.forget(task);
        let Some(finished) = task.finish(|data, response, offset| {
            if is_resumable(data, response, offset) {
                TaskPhase::Resumable
            } else {
                TaskPhase::Failed
            }
        }) else {
            return;
        };
        self.stats.record_failed();

        if finished.phase == TaskPhase::Resumable {
            let validator = finished.response.as_ref().and_then(ResponseHead::validator);
            info!(
                "transfer {}#{} interrupted at {} bytes, kept as resumable validator={:?}",
                task.key().url,
                task.key().serial,
                finished.data.len(),
                validator
            );
            (self.on_task_finished)(
                &task.key().url,
                CacheEntry::resumable(finished.data.clone(), validator),
            );
        } else {
            warn!(
                "transfer {}#{} failed: {}",
                task.key().url,
                task.key().serial,
                error
            );
        }

        let error = ImageError::download(error);
        for completion in finished.completions {
            completion.notify(Err(error.clone()));
        }
    }

    fn fail_invalid_response(&self, task: &Arc<DataTask>, status: u16) {
        self.forget(task);
        let Some(finished) = task.finish(|_, _, _| TaskPhase::Failed) else {
            return;
        };
        self.stats.record_failed();
        warn!(
            "transfer {}#{} rejected status={}",
            task.key().url,
            task.key().serial,
            status
        );
        if task.resume_offset() > 0 {
            // The server refused the range; start over next time.
            self.memory.discard_resumable(&task.key().url);
        }
        for completion in finished.completions {
            completion.notify(Err(ImageError::InvalidResponse {
                status: Some(status),
            }));
        }
    }

    /// Decode the shared bytes once per waiter, each at its own scale.
    fn deliver_decoded(&self, finished: FinishedTask) {
        let decoder = Arc::clone(&self.decoder);
        let deliver = move || {
            for completion in finished.completions {
                let result = decoder.decode(&finished.data, completion.scale);
                completion.notify(result);
            }
        };
        match &self.decode_runtime {
            Some(runtime) => {
                runtime.spawn_blocking(deliver);
            }
            None => deliver(),
        }
    }
}

impl TransferEvents for DelegateInner {
    fn did_receive_response(&self, key: &TransferKey, head: ResponseHead) -> ResponseDisposition {
        let Some(task) = self.task_for(key) else {
            return ResponseDisposition::Cancel;
        };
        if !(200..400).contains(&head.status) {
            self.fail_invalid_response(&task, head.status);
            task.cancel_transport();
            return ResponseDisposition::Cancel;
        }
        task.did_receive_response(head);
        ResponseDisposition::Allow
    }

    fn did_receive_data(&self, key: &TransferKey, chunk: Bytes) {
        if let Some(task) = self.task_for(key) {
            self.stats.record_downloaded(chunk.len() as u64);
            task.append(&chunk);
        }
    }

    fn did_complete(&self, key: &TransferKey, error: Option<anyhow::Error>) {
        let Some(task) = self.task_for(key) else {
            return;
        };
        match error {
            None => self.finish_success(&task),
            Some(error) => self.finish_failure(&task, error),
        }
    }
}

/// A failed transfer can be continued later when it holds a non-empty prefix
/// shorter than the declared total, came from a 200 or 206, and the server
/// advertised byte ranges.
pub fn is_resumable(data: &[u8], response: Option<&ResponseHead>, range_offset: u64) -> bool {
    let Some(head) = response else {
        return false;
    };
    if data.is_empty() || !(head.status == 200 || head.status == 206) {
        return false;
    }
    if !head.accepts_byte_ranges() {
        return false;
    }
    head.expected_total_length(range_offset)
        .map(|total| (data.len() as u64) < total)
        .unwrap_or(false)
}
