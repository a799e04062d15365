//! Lifecycle notifications broadcast by a [`crate::WorkQueue`].

use crate::envelope::Envelope;
use crate::error::JobError;
use crate::job::JobId;

/// Capacity of the event channel. Slow subscribers skip older events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// An event observed through [`crate::WorkQueue::subscribe`].
#[derive(Debug, Clone)]
pub enum WorkQueueEvent {
    /// The queue connected, declared its topology and started consuming.
    Ready { component: String, instance: String },

    /// Something failed outside a handler's control: connecting, a lost
    /// consumer, a malformed delivery or a job for an unknown worker.
    Error(JobError),

    /// A job was delivered, with its headers as received.
    NewWork(Envelope),

    /// A handler succeeded and the delivery was acknowledged.
    Completed { job_id: JobId, worker: String },

    /// A failed job was parked in the wait queue.
    Retrying {
        job_id: JobId,
        worker: String,
        made_attempts: u32,
        delay_ms: u64,
    },

    /// A job ran out of retries, or could not be decoded, and was moved
    /// to the failed queue.
    DeadLettered {
        job_id: Option<JobId>,
        worker: Option<String>,
        reason: String,
    },
}

impl WorkQueueEvent {
    /// Short name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkQueueEvent::Ready { .. } => "ready",
            WorkQueueEvent::Error(_) => "error",
            WorkQueueEvent::NewWork(_) => "new_work",
            WorkQueueEvent::Completed { .. } => "completed",
            WorkQueueEvent::Retrying { .. } => "retrying",
            WorkQueueEvent::DeadLettered { .. } => "dead_lettered",
        }
    }
}
