#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use ma_image_cache::decode::{DecodedImage, Decoder};
use ma_image_cache::error::ImageError;
use ma_image_cache::source::traits::{
    ResponseDisposition, ResponseHead, TransferEvents, TransferKey, TransferRequest, Transport,
    TransportTask,
};

/// Transport that performs no I/O. Every created call is recorded so a test
/// can play the server side by hand.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: Mutex<Vec<Arc<ScriptedCall>>>,
}

pub struct ScriptedCall {
    pub request: TransferRequest,
    events: Weak<dyn TransferEvents>,
    resumed: AtomicUsize,
    cancelled: AtomicBool,
}

struct CallHandle(Arc<ScriptedCall>);

impl TransportTask for CallHandle {
    fn resume(&self) {
        self.0.resumed.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Transport for ScriptedTransport {
    fn data_task(
        &self,
        request: TransferRequest,
        events: Weak<dyn TransferEvents>,
    ) -> Box<dyn TransportTask> {
        let call = Arc::new(ScriptedCall {
            request,
            events,
            resumed: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        });
        self.calls.lock().push(Arc::clone(&call));
        Box::new(CallHandle(call))
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call(&self, index: usize) -> Arc<ScriptedCall> {
        Arc::clone(&self.calls.lock()[index])
    }

    pub fn last_call(&self) -> Arc<ScriptedCall> {
        let calls = self.calls.lock();
        Arc::clone(calls.last().expect("no transport call was made"))
    }
}

impl ScriptedCall {
    pub fn key(&self) -> &TransferKey {
        &self.request.key
    }

    pub fn resume_count(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.request
            .headers()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn respond(&self, status: u16, headers: &[(&str, &str)]) -> ResponseDisposition {
        let events = self.events.upgrade().expect("coordinator dropped");
        events.did_receive_response(self.key(), ResponseHead::new(status, header_map(headers)))
    }

    pub fn send(&self, chunk: &[u8]) {
        let events = self.events.upgrade().expect("coordinator dropped");
        events.did_receive_data(self.key(), Bytes::copy_from_slice(chunk));
    }

    pub fn complete(&self) {
        let events = self.events.upgrade().expect("coordinator dropped");
        events.did_complete(self.key(), None);
    }

    pub fn fail(&self, message: &str) {
        let events = self.events.upgrade().expect("coordinator dropped");
        events.did_complete(self.key(), Some(anyhow::anyhow!(message.to_string())));
    }

    /// Full 200 response with `body`, then success.
    pub fn serve(&self, body: &[u8]) {
        let len = body.len().to_string();
        self.respond(200, &[("Content-Length", len.as_str())]);
        self.send(body);
        self.complete();
    }
}

pub fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).expect("header name"),
            HeaderValue::from_str(value).expect("header value"),
        );
    }
    map
}

/// Accepts any payload starting with `IMG`; the image is 1 pixel wide per
/// byte of payload after the prefix.
pub struct PrefixDecoder;

pub const IMAGE_MAGIC: &[u8] = b"IMG";

impl Decoder for PrefixDecoder {
    fn decode(&self, bytes: &[u8], scale: f32) -> Result<DecodedImage, ImageError> {
        let Some(rest) = bytes.strip_prefix(IMAGE_MAGIC) else {
            return Err(ImageError::Decoding);
        };
        let width = rest.len().max(1) as u32;
        Ok(DecodedImage::new(image::DynamicImage::new_rgba8(width, 1), scale))
    }
}

/// `PrefixDecoder` that refuses any scale above `max_scale`.
pub struct ScaleLimitedDecoder {
    pub max_scale: f32,
}

impl Decoder for ScaleLimitedDecoder {
    fn decode(&self, bytes: &[u8], scale: f32) -> Result<DecodedImage, ImageError> {
        if scale > self.max_scale {
            return Err(ImageError::Decoding);
        }
        PrefixDecoder.decode(bytes, scale)
    }
}

/// `PrefixDecoder` that remembers which threads it ran on.
#[derive(Default)]
pub struct ThreadRecordingDecoder {
    threads: Mutex<Vec<ThreadId>>,
}

impl ThreadRecordingDecoder {
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }
}

impl Decoder for ThreadRecordingDecoder {
    fn decode(&self, bytes: &[u8], scale: f32) -> Result<DecodedImage, ImageError> {
        self.threads.lock().push(thread::current().id());
        PrefixDecoder.decode(bytes, scale)
    }
}

pub fn image_bytes(payload_len: usize) -> Vec<u8> {
    let mut bytes = IMAGE_MAGIC.to_vec();
    bytes.extend((0..payload_len).map(|i| (i % 251) as u8));
    bytes
}

/// Collects completion results for later inspection.
#[derive(Clone, Default)]
pub struct Results {
    inner: Arc<Mutex<Vec<Result<DecodedImage, ImageError>>>>,
}

impl Results {
    pub fn sink(&self) -> impl FnOnce(Result<DecodedImage, ImageError>) + Send + 'static {
        let inner = Arc::clone(&self.inner);
        move |result| inner.lock().push(result)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn take(&self) -> Vec<Result<DecodedImage, ImageError>> {
        std::mem::take(&mut *self.inner.lock())
    }
}
