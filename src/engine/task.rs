// Per-URL transfer record: buffered bytes, waiting completions, lifecycle phase.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::decode::DecodedImage;
use crate::error::ImageError;
use crate::source::traits::{ResponseHead, TransferKey, TransportTask};

pub type CompletionHandler = Box<dyn FnOnce(Result<DecodedImage, ImageError>) + Send + 'static>;

/// A waiting caller: its decode scale and the callback to notify exactly once.
pub struct Completion {
    pub scale: f32,
    pub handler: CompletionHandler,
}

impl Completion {
    pub fn new<F>(scale: f32, handler: F) -> Self
    where
        F: FnOnce(Result<DecodedImage, ImageError>) + Send + 'static,
    {
        Self {
            scale,
            handler: Box::new(handler),
        }
    }

    pub fn notify(self, result: Result<DecodedImage, ImageError>) {
        (self.handler)(result)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("scale", &self.scale).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Created,
    Started,
    Receiving,
    Completed,
    Failed,
    Resumable,
    Cancelled,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskPhase::Completed | TaskPhase::Failed | TaskPhase::Resumable | TaskPhase::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskPhase) -> bool {
        use TaskPhase::*;
        match (self, next) {
            (Created, Started) | (Created, Cancelled) => true,
            (Started, Receiving) | (Receiving, Receiving) => true,
            (Started | Receiving, Completed | Failed | Resumable | Cancelled) => true,
            _ => false,
        }
    }
}

struct TaskState {
    phase: TaskPhase,
    data: BytesMut,
    response: Option<ResponseHead>,
    completions: BTreeMap<u64, Completion>,
    next_token: u64,
}

impl TaskState {
    fn transition(&mut self, next: TaskPhase) -> bool {
        if self.phase.can_transition_to(next) {
            self.phase = next;
            true
        } else {
            false
        }
    }
}

/// Everything a terminal transfer hands back for delivery.
#[derive(Debug)]
pub struct FinishedTask {
    pub phase: TaskPhase,
    pub data: Bytes,
    pub response: Option<ResponseHead>,
    /// Drained in registration order.
    pub completions: Vec<Completion>,
}

/// One in-flight transfer shared by every caller waiting on the same URL.
pub struct DataTask {
    key: TransferKey,
    transport: Box<dyn TransportTask>,
    resume_offset: u64,
    state: Mutex<TaskState>,
}

impl DataTask {
    /// Token of the completion passed to `new`.
    pub const FIRST_TOKEN: u64 = 0;

    /// Create a record holding its first completion. `seed` is the resumable
    /// prefix the request asks the server to continue from.
    pub fn new(
        key: TransferKey,
        transport: Box<dyn TransportTask>,
        seed: Option<Bytes>,
        first: Completion,
    ) -> Self {
        let data = seed.map(|b| BytesMut::from(&b[..])).unwrap_or_default();
        let resume_offset = data.len() as u64;
        let mut completions = BTreeMap::new();
        completions.insert(Self::FIRST_TOKEN, first);
        Self {
            key,
            transport,
            resume_offset,
            state: Mutex::new(TaskState {
                phase: TaskPhase::Created,
                data,
                response: None,
                completions,
                next_token: Self::FIRST_TOKEN + 1,
            }),
        }
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    /// Length of the seeded prefix (0 for a fresh transfer).
    pub fn resume_offset(&self) -> u64 {
        self.resume_offset
    }

    pub fn phase(&self) -> TaskPhase {
        self.state.lock().phase
    }

    pub fn completion_count(&self) -> usize {
        self.state.lock().completions.len()
    }

    pub fn buffered_len(&self) -> usize {
        self.state.lock().data.len()
    }

    /// Start the transport call. Only the first call has any effect.
    pub fn resume(&self) {
        let start = self.state.lock().transition(TaskPhase::Started);
        if start {
            debug!("transfer {}#{} started", self.key.url, self.key.serial);
            self.transport.resume();
        }
    }

    pub fn cancel_transport(&self) {
        self.transport.cancel();
    }

    /// Register another waiter. A terminal record hands the completion back.
    pub fn add_completion(&self, completion: Completion) -> Result<u64, Completion> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return Err(completion);
        }
        let token = state.next_token;
        state.next_token += 1;
        state.completions.insert(token, completion);
        Ok(token)
    }

    /// Withdraw one waiter. Returns the completion and whether it was the last
    /// one, in which case the record is now `Cancelled`. `None` if the token is
    /// unknown or the record already finished.
    pub fn remove_completion(&self, token: u64) -> Option<(Completion, bool)> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return None;
        }
        let completion = state.completions.remove(&token)?;
        let drained = state.completions.is_empty();
        if drained {
            state.transition(TaskPhase::Cancelled);
        }
        Some((completion, drained))
    }

    /// Record the response head. A plain 200 means the server ignored any
    /// range, so the seeded prefix is dropped.
    pub fn did_receive_response(&self, head: ResponseHead) {
        let mut state = self.state.lock();
        if !state.transition(TaskPhase::Receiving) {
            return;
        }
        if head.status == 200 && !state.data.is_empty() {
            debug!(
                "transfer {} got 200 to a range request, discarding {} seeded bytes",
                self.key.url,
                state.data.len()
            );
            state.data.clear();
        }
        state.response = Some(head);
    }

    pub fn append(&self, chunk: &[u8]) {
        let mut state = self.state.lock();
        if state.transition(TaskPhase::Receiving) {
            state.data.extend_from_slice(chunk);
        }
    }

    /// Move to the terminal phase chosen by `decide` and drain every waiting
    /// completion in the same critical section, so no cancel can slip in
    /// between. Returns `None` if the record was already terminal.
    pub fn finish<F>(&self, decide: F) -> Option<FinishedTask>
    where
        F: FnOnce(&[u8], Option<&ResponseHead>, u64) -> TaskPhase,
    {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return None;
        }
        let phase = decide(&state.data[..], state.response.as_ref(), self.resume_offset);
        if !state.transition(phase) {
            return None;
        }
        let completions = std::mem::take(&mut state.completions).into_values().collect();
        let data = std::mem::take(&mut state.data).freeze();
        Some(FinishedTask {
            phase,
            data,
            response: state.response.clone(),
            completions,
        })
    }
}

impl fmt::Debug for DataTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTask")
            .field("key", &self.key)
            .field("resume_offset", &self.resume_offset)
            .field("phase", &self.phase())
            .finish()
    }
}
