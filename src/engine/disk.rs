// Disk tier: one file per URL, named by the SHA-256 of the URL, with all
// reads and writes serialized on a single background queue.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use filetime::FileTime;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::config::DISK_TEMP_SUFFIX;

type LoadCallback = Box<dyn FnOnce(Option<Bytes>) + Send + 'static>;

enum DiskJob {
    Store { key: String, data: Bytes },
    Load { key: String, on_loaded: LoadCallback },
    Remove { key: String },
    Flush { done: oneshot::Sender<()> },
}

/// Best-effort file cache. I/O errors are logged and reported as misses,
/// never as failures.
pub struct DiskCache {
    folder: PathBuf,
    queue: mpsc::UnboundedSender<DiskJob>,
}

impl DiskCache {
    /// Create the cache folder and start the I/O queue.
    ///
    /// Must be called from within a tokio runtime; the queue worker is spawned
    /// onto it.
    pub fn new(folder: impl Into<PathBuf>) -> Result<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder)
            .map_err(|e| anyhow!("cannot create cache dir {}: {}", folder.display(), e))?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow!("disk cache needs a tokio runtime: {}", e))?;

        let (queue, jobs) = mpsc::unbounded_channel();
        runtime.spawn(run_io_queue(folder.clone(), jobs));
        debug!("disk cache ready at {}", folder.display());

        Ok(Self { folder, queue })
    }

    /// Hex-encoded SHA-256 of the URL's string form.
    pub fn cache_key(url: &Url) -> String {
        let digest = Sha256::digest(url.as_str().as_bytes());
        format!("{:x}", digest)
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.folder.join(key)
    }

    /// Whether a completed file exists for `key`. Checked synchronously.
    pub fn is_cached(&self, key: &str) -> bool {
        self.path_for_key(key).is_file()
    }

    /// Modification stamp written with the entry.
    pub fn stored_at(&self, key: &str) -> Option<SystemTime> {
        fs::metadata(self.path_for_key(key))
            .and_then(|m| m.modified())
            .ok()
    }

    /// Queue a write of `data` under `key`.
    pub fn store(&self, key: String, data: Bytes) {
        if self.queue.send(DiskJob::Store { key, data }).is_err() {
            warn!("disk queue closed, dropping write");
        }
    }

    /// Queue a read of `key`. `on_loaded` runs on the I/O queue with the bytes,
    /// or `None` when the file is missing or unreadable.
    pub fn load<F>(&self, key: String, on_loaded: F)
    where
        F: FnOnce(Option<Bytes>) + Send + 'static,
    {
        let job = DiskJob::Load {
            key,
            on_loaded: Box::new(on_loaded),
        };
        if let Err(mpsc::error::SendError(job)) = self.queue.send(job) {
            warn!("disk queue closed, treating read as a miss");
            if let DiskJob::Load { on_loaded, .. } = job {
                on_loaded(None);
            }
        }
    }

    pub fn remove(&self, key: String) {
        let _ = self.queue.send(DiskJob::Remove { key });
    }

    /// Wait until every job queued before this call has finished.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(DiskJob::Flush { done }).is_ok() {
            let _ = wait.await;
        }
    }
}

async fn run_io_queue(folder: PathBuf, mut jobs: mpsc::UnboundedReceiver<DiskJob>) {
    while let Some(job) = jobs.recv().await {
        let folder = folder.clone();
        let outcome = tokio::task::spawn_blocking(move || run_job(&folder, job)).await;
        if let Err(e) = outcome {
            warn!("disk job panicked: {}", e);
        }
    }
    debug!("disk queue for {} stopped", folder.display());
}

fn run_job(folder: &Path, job: DiskJob) {
    match job {
        DiskJob::Store { key, data } => {
            let path = folder.join(&key);
            if let Err(e) = write_entry(&path, &data) {
                warn!("disk write failed key={}: {}", key, e);
            } else {
                debug!("disk stored key={} bytes={}", key, data.len());
            }
        }
        DiskJob::Load { key, on_loaded } => {
            let path = folder.join(&key);
            let data = match fs::read(&path) {
                Ok(bytes) => Some(Bytes::from(bytes)),
                Err(e) => {
                    debug!("disk read miss key={}: {}", key, e);
                    None
                }
            };
            on_loaded(data);
        }
        DiskJob::Remove { key } => {
            let _ = fs::remove_file(folder.join(&key));
        }
        DiskJob::Flush { done } => {
            let _ = done.send(());
        }
    }
}

/// Write through a temp file so `is_cached` never sees a half-written entry,
/// then stamp the time rounded up to the next whole second.
fn write_entry(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(DISK_TEMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    let result = (|| -> Result<()> {
        fs::write(&tmp, data)?;
        let stamp = FileTime::from_unix_time(ceil_unix_secs(SystemTime::now()), 0);
        filetime::set_file_times(&tmp, stamp, stamp)?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn ceil_unix_secs(at: SystemTime) -> i64 {
    let since = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since.as_secs() + u64::from(since.subsec_nanos() > 0);
    secs as i64
}
