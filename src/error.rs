// Error kinds surfaced to fetch callers.

use std::sync::Arc;

/// Result type delivered to fetch completions.
pub type ImageResult<T> = Result<T, ImageError>;

/// Failure delivered to a single fetch caller.
///
/// Cloneable so one transfer failure can fan out to every waiting caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageError {
    /// Bytes could not be interpreted as an image.
    #[error("image decoding failed")]
    Decoding,

    /// The caller cancelled its own interest in the transfer.
    #[error("download cancelled")]
    Cancelled,

    /// Transport failure, including timeouts and interrupted bodies.
    #[error("download failed: {0}")]
    Download(Arc<anyhow::Error>),

    /// Response status outside 200..400, or no usable response at all.
    #[error("invalid response (status {status:?})")]
    InvalidResponse { status: Option<u16> },
}

impl ImageError {
    pub fn download(err: anyhow::Error) -> Self {
        ImageError::Download(Arc::new(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImageError::Cancelled)
    }
}
