use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::Client;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::traits::{
    ResponseDisposition, ResponseHead, TransferEvents, TransferRequest, Transport, TransportTask,
};

/// `Transport` backed by a shared `reqwest` client. Each task streams its
/// body on the runtime it was created from.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    runtime: Handle,
}

impl HttpTransport {
    /// Build a client with a whole-request timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Self::with_client(client)
    }

    pub fn with_client(client: Client) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("http transport needs a tokio runtime: {}", e))?;
        Ok(Self { client, runtime })
    }
}

impl Transport for HttpTransport {
    fn data_task(
        &self,
        request: TransferRequest,
        events: Weak<dyn TransferEvents>,
    ) -> Box<dyn TransportTask> {
        Box::new(HttpDataTask {
            client: self.client.clone(),
            runtime: self.runtime.clone(),
            request,
            events,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }
}

struct HttpDataTask {
    client: Client,
    runtime: Handle,
    request: TransferRequest,
    events: Weak<dyn TransferEvents>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl TransportTask for HttpDataTask {
    fn resume(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let client = self.client.clone();
        let request = self.request.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        self.runtime.spawn(async move {
            let url = request.key.url.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("http transfer cancelled url={}", url);
                }
                _ = run_transfer(client, request, events) => {}
            }
        });
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn run_transfer(client: Client, request: TransferRequest, events: Weak<dyn TransferEvents>) {
    let key = &request.key;

    let mut req = client.get(key.url.clone());
    for (name, value) in request.headers() {
        req = req.header(name, value);
    }

    let mut resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("http request failed url={}: {}", key.url, e);
            if let Some(events) = events.upgrade() {
                events.did_complete(key, Some(anyhow::Error::new(e)));
            }
            return;
        }
    };

    let head = ResponseHead::new(resp.status().as_u16(), resp.headers().clone());
    debug!(
        "http response url={} status={} range_start={:?}",
        key.url, head.status, request.range_start
    );
    match events.upgrade() {
        Some(events) => {
            if events.did_receive_response(key, head) == ResponseDisposition::Cancel {
                return;
            }
        }
        None => return,
    }

    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => match events.upgrade() {
                Some(events) => events.did_receive_data(key, chunk),
                None => return,
            },
            Ok(None) => {
                if let Some(events) = events.upgrade() {
                    events.did_complete(key, None);
                }
                return;
            }
            Err(e) => {
                warn!("http body interrupted url={}: {}", key.url, e);
                if let Some(events) = events.upgrade() {
                    events.did_complete(key, Some(anyhow::Error::new(e)));
                }
                return;
            }
        }
    }
}
