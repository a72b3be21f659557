// Transport abstraction: the callback protocol the coordinator drives, plus the HTTP backend.

pub mod http_source;
pub mod traits;

pub use http_source::HttpTransport;
pub use traits::{
    ResponseDisposition, ResponseHead, TransferEvents, TransferKey, TransferRequest, Transport,
    TransportTask,
};
