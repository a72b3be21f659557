use std::sync::Weak;

use bytes::Bytes;
use reqwest::header::{self, HeaderMap};
use url::Url;

/// Identifies one transfer. Successive transfers for the same URL get
/// distinct serials, so late callbacks from a torn-down transfer can be told
/// apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub url: Url,
    pub serial: u64,
}

/// A GET, optionally resuming from `range_start`.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub key: TransferKey,
    /// Sent as `Range: bytes=<start>-`.
    pub range_start: Option<u64>,
    /// Sent as `If-Range`; only meaningful together with `range_start`.
    pub if_range: Option<String>,
}

impl TransferRequest {
    pub fn plain(key: TransferKey) -> Self {
        Self {
            key,
            range_start: None,
            if_range: None,
        }
    }

    /// Extra request headers as (name, value) pairs.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(start) = self.range_start {
            headers.push(("Range", format!("bytes={}-", start)));
            if let Some(validator) = &self.if_range {
                headers.push(("If-Range", validator.clone()));
            }
        }
        headers
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: u16, headers: HeaderMap) -> Self {
        Self { status, headers }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `Accept-Ranges: bytes`, case-insensitive.
    pub fn accepts_byte_ranges(&self) -> bool {
        self.header(header::ACCEPT_RANGES.as_str())
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false)
    }

    /// ETag if present, otherwise Last-Modified.
    pub fn validator(&self) -> Option<String> {
        self.header(header::ETAG.as_str())
            .or_else(|| self.header(header::LAST_MODIFIED.as_str()))
            .map(str::to_string)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Full size of the resource as declared by this response.
    ///
    /// A 206 reports it in `Content-Range: bytes a-b/<total>`; when the total
    /// is `*` the body length is added to `range_offset`. Any other status
    /// reports it as `Content-Length`. A sum that overflows `u64` is no
    /// usable length.
    pub fn expected_total_length(&self, range_offset: u64) -> Option<u64> {
        if self.status == 206 {
            let total = self
                .header(header::CONTENT_RANGE.as_str())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.trim().parse::<u64>().ok());
            total.or_else(|| {
                self.content_length()
                    .and_then(|len| range_offset.checked_add(len))
            })
        } else {
            self.content_length()
        }
    }
}

/// Whether the transport should keep reading after the response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Allow,
    Cancel,
}

/// Callbacks a transport delivers for one transfer, in order: at most one
/// `did_receive_response`, any number of `did_receive_data`, then one
/// `did_complete`. After `cancel()` or a `Cancel` disposition the transport
/// may stop without calling `did_complete`.
pub trait TransferEvents: Send + Sync {
    fn did_receive_response(&self, key: &TransferKey, head: ResponseHead) -> ResponseDisposition;
    fn did_receive_data(&self, key: &TransferKey, chunk: Bytes);
    fn did_complete(&self, key: &TransferKey, error: Option<anyhow::Error>);
}

/// One not-yet-started or running network call.
pub trait TransportTask: Send + Sync {
    /// Start the call. Calling it again is a no-op.
    fn resume(&self);
    fn cancel(&self);
}

/// Creates network calls. Creating a task performs no I/O.
pub trait Transport: Send + Sync {
    fn data_task(
        &self,
        request: TransferRequest,
        events: Weak<dyn TransferEvents>,
    ) -> Box<dyn TransportTask>;
}
