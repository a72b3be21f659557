// Caller-side loader: tracks one image slot from empty to success or failure.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::decode::{DecodedImage, ImageProcessor};
use crate::engine::coordinator::DownloadHandle;
use crate::engine::service::ImageService;
use crate::error::ImageError;

#[derive(Debug, Clone)]
pub enum LoadPhase {
    Empty,
    Success(DecodedImage),
    Failure(ImageError),
}

impl LoadPhase {
    pub fn is_success(&self) -> bool {
        matches!(self, LoadPhase::Success(_))
    }
}

/// Binds a URL and scale to a shared [`ImageService`] and publishes the
/// outcome on a watch channel.
pub struct ImageLoader {
    service: Arc<ImageService>,
    url: Option<Url>,
    scale: f32,
    processor: Option<Arc<dyn ImageProcessor>>,
    phase: watch::Sender<LoadPhase>,
    handle: Mutex<Option<DownloadHandle>>,
}

impl ImageLoader {
    pub fn new(service: Arc<ImageService>, url: Option<Url>, scale: f32) -> Self {
        let (phase, _) = watch::channel(LoadPhase::Empty);
        Self {
            service,
            url,
            scale,
            processor: None,
            phase,
            handle: Mutex::new(None),
        }
    }

    /// Apply `processor` to every image this loader publishes.
    pub fn with_processor(mut self, processor: Arc<dyn ImageProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadPhase> {
        self.phase.subscribe()
    }

    /// Start loading. No-op without a URL or once an image has been delivered.
    pub fn load(&self) {
        let Some(url) = self.url.as_ref() else {
            return;
        };
        if self.phase.borrow().is_success() {
            return;
        }

        let phase = self.phase.clone();
        let processor = self.processor.clone();
        let handle = self.service.fetch(url, self.scale, move |result| match result {
            Ok(image) => {
                let image = match processor {
                    Some(processor) => processor.process(image),
                    None => image,
                };
                phase.send_replace(LoadPhase::Success(image));
            }
            Err(err) if err.is_cancelled() => {
                debug!("load cancelled");
            }
            Err(err) => {
                phase.send_replace(LoadPhase::Failure(err));
            }
        });

        if let Some(previous) = std::mem::replace(&mut *self.handle.lock(), handle) {
            previous.cancel();
        }
    }

    /// Cancel the in-flight request, if any. The phase is left as it was.
    pub fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.cancel();
    }
}
