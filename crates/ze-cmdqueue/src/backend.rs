use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

use crate::allocation::AllocationId;
use crate::list::EngineGroup;
use crate::queue::QueuePriority;

/// One primary batch handed to the command stream receiver.
#[derive(Debug, Clone)]
pub struct Submission {
    pub context_id: u32,
    pub engine: EngineGroup,
    pub priority: QueuePriority,
    /// GPU address of the first packet in `commands`.
    pub batch_address: u64,
    pub commands: Vec<u8>,
    /// Value the batch's trailing post-sync writes to `tag_address` once it retires.
    pub task_count: u64,
    pub tag_address: u64,
    /// Every allocation the batch (or a batch it jumps to) may touch.
    pub residency: Vec<AllocationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("device lost")]
    DeviceLost,
    #[error("out of submission resources")]
    OutOfResources,
    #[error("timed out waiting for completion")]
    Timeout,
    #[error("{0}")]
    Internal(String),
}

/// Boundary between the queue and whatever executes its batches.
///
/// Completion is reported per context as the highest retired task count; task counts on a
/// context are submitted in increasing order and retire in order.
pub trait SubmissionBackend {
    /// Queue `submission` for execution. An `Err` means nothing was queued.
    fn submit(&mut self, submission: Submission) -> Result<(), BackendError>;

    fn completed_task_count(&mut self, context_id: u32) -> u64;

    /// Block until `context_id` has retired `task_count`, or `timeout` elapses.
    fn wait(
        &mut self,
        context_id: u32,
        task_count: u64,
        timeout: Option<Duration>,
    ) -> Result<(), BackendError>;
}

/// Handle to a command stream receiver shared between queues.
pub type SharedBackend = Arc<Mutex<dyn SubmissionBackend + Send>>;

pub fn shared<B: SubmissionBackend + Send + 'static>(backend: B) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}

pub(crate) fn lock(
    backend: &SharedBackend,
) -> MutexGuard<'_, dyn SubmissionBackend + Send + 'static> {
    backend.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Accepts submissions and never completes them.
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SubmissionBackend for NullBackend {
    fn submit(&mut self, _submission: Submission) -> Result<(), BackendError> {
        Ok(())
    }

    fn completed_task_count(&mut self, _context_id: u32) -> u64 {
        0
    }

    fn wait(
        &mut self,
        _context_id: u32,
        task_count: u64,
        _timeout: Option<Duration>,
    ) -> Result<(), BackendError> {
        if task_count == 0 {
            Ok(())
        } else {
            Err(BackendError::Timeout)
        }
    }
}

/// Records every submission and retires it on the spot.
///
/// Completions can be held back to model in-flight work, and a one-shot failure can be armed
/// to exercise submission error paths.
#[derive(Debug, Default)]
pub struct ImmediateBackend {
    submissions: Vec<Submission>,
    completed: HashMap<u32, u64>,
    pending: VecDeque<(u32, u64)>,
    hold_completions: bool,
    fail_next: Option<BackendError>,
}

impl ImmediateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn take_submissions(&mut self) -> Vec<Submission> {
        std::mem::take(&mut self.submissions)
    }

    /// While set, submissions stay in flight until [`Self::complete_pending`].
    pub fn set_hold_completions(&mut self, hold: bool) {
        self.hold_completions = hold;
    }

    pub fn complete_pending(&mut self) {
        while let Some((context_id, task_count)) = self.pending.pop_front() {
            self.retire(context_id, task_count);
        }
    }

    pub fn fail_next_submit(&mut self, err: BackendError) {
        self.fail_next = Some(err);
    }

    fn retire(&mut self, context_id: u32, task_count: u64) {
        let completed = self.completed.entry(context_id).or_insert(0);
        *completed = (*completed).max(task_count);
    }
}

impl SubmissionBackend for ImmediateBackend {
    fn submit(&mut self, submission: Submission) -> Result<(), BackendError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }

        let key = (submission.context_id, submission.task_count);
        self.submissions.push(submission);
        if self.hold_completions {
            self.pending.push_back(key);
        } else {
            self.retire(key.0, key.1);
        }
        Ok(())
    }

    fn completed_task_count(&mut self, context_id: u32) -> u64 {
        self.completed.get(&context_id).copied().unwrap_or(0)
    }

    fn wait(
        &mut self,
        context_id: u32,
        task_count: u64,
        _timeout: Option<Duration>,
    ) -> Result<(), BackendError> {
        // Held work only moves when the test says so.
        if self.completed_task_count(context_id) >= task_count {
            Ok(())
        } else {
            Err(BackendError::Timeout)
        }
    }
}
