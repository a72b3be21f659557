// Live statistics: tier hits, coalescing and download throughput.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    download_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub fetches: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub network_requests: u64,
    pub coalesced_requests: u64,
    pub resumed_requests: u64,
    pub failed_transfers: u64,
    pub downloaded_bytes: u64,
    pub download_bps: u64,
    pub cache_hit_rate: f64,
}

pub struct StatsCollector {
    fetches: AtomicU64,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    network_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    resumed_requests: AtomicU64,
    failed_transfers: AtomicU64,
    download_bytes_total: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            fetches: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            network_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
            resumed_requests: AtomicU64::new(0),
            failed_transfers: AtomicU64::new(0),
            download_bytes_total: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                download_bytes: 0,
            }),
        }
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A new transport call; `resumed` when it carries a Range header.
    pub fn record_network_request(&self, resumed: bool) {
        self.network_requests.fetch_add(1, Ordering::Relaxed);
        if resumed {
            self.resumed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_coalesced(&self) {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.download_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let current_download = self.download_bytes_total.load(Ordering::Relaxed);

        let download_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                (current_download.saturating_sub(sample.download_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.download_bytes = current_download;
            bps
        };

        let fetches = self.fetches.load(Ordering::Relaxed);
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let disk_hits = self.disk_hits.load(Ordering::Relaxed);
        let cache_hit_rate = if fetches > 0 {
            (memory_hits + disk_hits) as f64 / fetches as f64
        } else {
            0.0
        };

        StatsSnapshot {
            fetches,
            memory_hits,
            disk_hits,
            network_requests: self.network_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            resumed_requests: self.resumed_requests.load(Ordering::Relaxed),
            failed_transfers: self.failed_transfers.load(Ordering::Relaxed),
            downloaded_bytes: current_download,
            download_bps,
            cache_hit_rate,
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.download_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
