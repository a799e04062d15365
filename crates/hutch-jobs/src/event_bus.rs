//! Worker-name to handler dispatch.

use crate::error::{JobError, JobResult};
use crate::job::JobId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Context passed to a handler with each delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// Job ID, stable across retries.
    pub job_id: JobId,

    /// Worker name the job was sent to.
    pub worker: String,

    /// Current delivery (1-based). The first delivery is attempt 1.
    pub attempt: u32,

    /// Retries allowed after the first delivery.
    pub max_retry: u32,

    /// True if the broker delivered this message before without it being settled.
    pub redelivered: bool,

    /// Instance handling the job.
    pub instance: String,
}

impl JobContext {
    /// Returns true if a failure now sends the job to the failed queue.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt > self.max_retry
    }

    /// Returns how many retries remain after this delivery.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retry.saturating_sub(self.attempt.saturating_sub(1))
    }
}

/// Handles jobs for one worker name.
///
/// Implemented for any `Fn(Value, JobContext) -> impl Future<Output = Result<(), JobError>>`,
/// so closures can be registered directly:
///
/// ```rust,ignore
/// queue.on("resize_image", |payload: Value, ctx: JobContext| async move {
///     resize(&payload["path"]).await.map_err(JobError::handler)
/// });
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Processes one delivery. `Err` triggers a retry or dead-lettering.
    async fn handle(&self, payload: Value, ctx: JobContext) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: JobContext) -> Result<(), JobError> {
        (self)(payload, ctx).await
    }
}

/// Maps worker names to handlers.
///
/// Registration is last-write-wins: registering a second handler for the
/// same name replaces the first.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    registration_count: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            registration_count: AtomicU64::new(0),
        }
    }

    /// Registers `handler` for `worker`. Returns true if it replaced an
    /// existing handler.
    pub fn on(&self, worker: impl Into<String>, handler: impl JobHandler) -> bool {
        let worker = worker.into();
        let seq = self.registration_count.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = self
            .handlers
            .write()
            .insert(worker.clone(), Arc::new(handler))
            .is_some();

        if replaced {
            warn!(worker = %worker, registration_seq = seq, "Handler replaced");
        } else {
            info!(worker = %worker, registration_seq = seq, "Handler registered");
        }
        replaced
    }

    /// Removes the handler for `worker`. Returns true if one was registered.
    pub fn off(&self, worker: &str) -> bool {
        let removed = self.handlers.write().remove(worker).is_some();
        if removed {
            info!(worker = %worker, "Handler removed");
        }
        removed
    }

    /// Returns true if `worker` has a handler.
    pub fn has_handler(&self, worker: &str) -> bool {
        self.handlers.read().contains_key(worker)
    }

    /// Registered worker names, sorted.
    pub fn workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total registrations since creation, replacements included.
    pub fn registration_count(&self) -> u64 {
        self.registration_count.load(Ordering::Relaxed)
    }

    /// Runs the handler registered for `worker`.
    ///
    /// Fails with [`JobError::UnknownWorker`] when nothing is registered.
    /// The handler runs without the registry lock held, so handlers may
    /// register or remove handlers themselves.
    pub async fn emit(&self, worker: &str, payload: Value, ctx: JobContext) -> JobResult<()> {
        let handler = {
            let handlers = self.handlers.read();
            handlers.get(worker).cloned()
        };
        let handler = handler.ok_or_else(|| JobError::UnknownWorker(worker.to_string()))?;
        handler.handle(payload, ctx).await
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("workers", &self.workers())
            .finish_non_exhaustive()
    }
}
