// Remote image cache: memory tier, disk tier, and a coalescing, resumable HTTP fetcher.

pub mod api;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod source;

pub use decode::{DecodedImage, Decoder, ImageCrateDecoder, ImageProcessor};
pub use engine::coordinator::DownloadHandle;
pub use engine::service::ImageService;
pub use error::ImageError;
