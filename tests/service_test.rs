mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;
use url::Url;

use ma_image_cache::config::ServiceConfig;
use ma_image_cache::decode::DecodedImage;
use ma_image_cache::engine::disk::DiskCache;
use ma_image_cache::engine::memory::{CacheEntry, EntryKind};
use ma_image_cache::error::{ImageError, ImageResult};
use ma_image_cache::ImageService;

use common::{image_bytes, PrefixDecoder, Results, ScriptedTransport, ThreadRecordingDecoder};

fn config(dir: &TempDir) -> ServiceConfig {
    ServiceConfig {
        cache_dir: dir.path().to_string_lossy().into_owned(),
        memory_capacity_bytes: 64 * 1024,
        ..Default::default()
    }
}

fn service(dir: &TempDir, transport: Arc<ScriptedTransport>) -> ImageService {
    ImageService::with_parts(&config(dir), transport, Arc::new(PrefixDecoder)).unwrap()
}

fn url(path: &str) -> Url {
    Url::parse(&format!("https://images.test/{}", path)).unwrap()
}

async fn wait_for_calls(transport: &ScriptedTransport, count: usize) {
    for _ in 0..200 {
        if transport.call_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} transport calls", count);
}

fn fetch_async(
    service: &ImageService,
    url: &Url,
    scale: f32,
) -> (bool, oneshot::Receiver<ImageResult<DecodedImage>>) {
    let (tx, rx) = oneshot::channel();
    let handle = service.fetch(url, scale, move |result| {
        let _ = tx.send(result);
    });
    (handle.is_some(), rx)
}

#[tokio::test]
async fn test_network_then_memory() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(&dir, transport.clone());
    let u = url("a.png");

    let (has_handle, rx) = fetch_async(&service, &u, 1.0);
    assert!(has_handle);
    transport.last_call().serve(&image_bytes(8));
    assert!(rx.await.unwrap().is_ok());

    // Memory hit resolves before fetch returns.
    let results = Results::default();
    let handle = service.fetch(&u, 2.0, results.sink());
    assert!(handle.is_none());
    let delivered = results.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].as_ref().unwrap().scale(), 2.0);

    assert_eq!(transport.call_count(), 1);
    let stats = service.stats();
    assert_eq!(stats.fetches, 2);
    assert_eq!(stats.memory_hits, 1);
    assert_eq!(stats.network_requests, 1);
}

#[tokio::test]
async fn test_disk_hit_after_memory_cleared() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(&dir, transport.clone());
    let u = url("b.png");
    let body = image_bytes(5);

    let (_, rx) = fetch_async(&service, &u, 1.0);
    transport.last_call().serve(&body);
    rx.await.unwrap().unwrap();
    service.flush().await;

    let key = DiskCache::cache_key(&u);
    assert!(service.disk().is_cached(&key));
    assert_eq!(std::fs::read(service.disk().path_for_key(&key)).unwrap(), body);

    service.clear_memory();
    assert!(service.memory().is_empty());

    let (has_handle, rx) = fetch_async(&service, &u, 1.0);
    assert!(!has_handle);
    let image = rx.await.unwrap().unwrap();
    assert_eq!(image.pixel_size(), (5, 1));

    assert_eq!(transport.call_count(), 1);
    assert_eq!(service.stats().disk_hits, 1);
    let entry = service.memory().get(&u).expect("repopulated from disk");
    assert_eq!(entry.kind, EntryKind::Downloaded);
}

#[tokio::test]
async fn test_resumable_stays_out_of_disk() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(&dir, transport.clone());
    let u = url("c.png");

    let (_, rx) = fetch_async(&service, &u, 1.0);
    let call = transport.last_call();
    call.respond(
        200,
        &[
            ("Content-Length", "100"),
            ("Accept-Ranges", "bytes"),
            ("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
        ],
    );
    call.send(&image_bytes(37));
    call.fail("network lost");
    assert!(matches!(rx.await.unwrap(), Err(ImageError::Download(_))));
    service.flush().await;

    assert!(!service.disk().is_cached(&DiskCache::cache_key(&u)));
    let entry = service.memory().get(&u).unwrap();
    assert_eq!(
        entry.kind,
        EntryKind::Resumable(Some("Wed, 21 Oct 2015 07:28:00 GMT".into()))
    );

    // The next fetch skips the partial entry and resumes from it.
    let (has_handle, rx) = fetch_async(&service, &u, 1.0);
    assert!(has_handle);
    let resumed = transport.last_call();
    assert_eq!(resumed.header("Range").as_deref(), Some("bytes=40-"));
    resumed.respond(206, &[("Content-Range", "bytes 40-99/100")]);
    resumed.send(&[0u8; 60]);
    resumed.complete();
    assert_eq!(rx.await.unwrap().unwrap().pixel_size(), (97, 1));
}

#[tokio::test]
async fn test_load_future() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = Arc::new(service(&dir, transport.clone()));
    let u = url("d.png");

    let task = {
        let service = Arc::clone(&service);
        let u = u.clone();
        tokio::spawn(async move { service.load(&u, 3.0).await })
    };
    wait_for_calls(&transport, 1).await;
    transport.last_call().serve(&image_bytes(2));

    let image = task.await.unwrap().unwrap();
    assert_eq!(image.scale(), 3.0);
}

#[tokio::test]
async fn test_dropped_load_cancels_transfer() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(&dir, transport.clone());
    let u = url("e.png");

    let outcome = tokio::time::timeout(Duration::from_millis(20), service.load(&u, 1.0)).await;
    assert!(outcome.is_err());

    let call = transport.last_call();
    assert!(call.is_cancelled());
    assert!(!service.delegate().is_active(&u));
}

#[tokio::test]
async fn test_remove_evicts_both_tiers() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(&dir, transport.clone());
    let u = url("f.png");

    service.store(&u, CacheEntry::downloaded(image_bytes(1).into()));
    service.flush().await;
    let key = DiskCache::cache_key(&u);
    assert!(service.disk().is_cached(&key));

    service.remove(&u);
    service.flush().await;
    assert!(service.memory().get(&u).is_none());
    assert!(!service.disk().is_cached(&key));

    let (has_handle, _rx) = fetch_async(&service, &u, 1.0);
    assert!(has_handle);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_undecodable_cached_bytes() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(&dir, transport.clone());
    let u = url("g.png");

    service.store(&u, CacheEntry::downloaded(b"garbage".to_vec().into()));
    let results = Results::default();
    assert!(service.fetch(&u, 1.0, results.sink()).is_none());
    assert!(matches!(results.take()[0], Err(ImageError::Decoding)));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_network_decode_runs_off_transport_thread() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let decoder = Arc::new(ThreadRecordingDecoder::default());
    let service = ImageService::with_parts(&config(&dir), transport.clone(), decoder.clone())
        .unwrap();
    let u = url("h.png");

    let (_, rx) = fetch_async(&service, &u, 1.0);
    // The scripted transport delivers its callbacks on this thread.
    transport.last_call().serve(&image_bytes(2));
    rx.await.unwrap().unwrap();

    let threads = decoder.threads();
    assert_eq!(threads.len(), 1);
    assert_ne!(threads[0], std::thread::current().id());
}

#[tokio::test]
async fn test_dropped_load_cancels_disk_fallback() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let service = service(&dir, transport.clone());
    let u = url("i.png");
    let key = DiskCache::cache_key(&u);

    service.store(&u, CacheEntry::downloaded(image_bytes(4).into()));
    service.flush().await;
    service.clear_memory();

    // Hold the I/O queue so the file is still there when `load` checks, but
    // gone by the time its read runs.
    let (release, gate) = std::sync::mpsc::channel::<()>();
    service.disk().load("held".into(), move |_| {
        let _ = gate.recv();
    });
    service.disk().remove(key.clone());

    let outcome = tokio::time::timeout(Duration::from_millis(20), service.load(&u, 1.0)).await;
    assert!(outcome.is_err());
    release.send(()).unwrap();

    wait_for_calls(&transport, 1).await;
    for _ in 0..200 {
        if transport.last_call().is_cancelled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(transport.last_call().is_cancelled());
    assert!(!service.delegate().is_active(&u));
    assert_eq!(service.stats().disk_hits, 1);
}
