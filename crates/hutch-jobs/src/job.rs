//! Job builder and identifiers.

use crate::backoff::Backoff;
use crate::envelope::{Envelope, JobHeaders};
use crate::error::{JobError, JobResult};
use crate::work_queue::WorkQueue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier, stable across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job priority levels.
///
/// The numeric value travels in the `priority` header; lower values are
/// more urgent. `Ord` follows urgency, so `Critical` is the greatest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i8)]
pub enum Priority {
    /// Background work.
    Low = 10,
    /// Default priority.
    #[default]
    Normal = 0,
    /// Slightly ahead of normal work.
    Medium = -5,
    /// Important work.
    High = -10,
    /// Time-sensitive work.
    Critical = -15,
}

impl Priority {
    /// All levels, least urgent first.
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Normal,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    /// Returns the numeric wire value.
    pub fn value(self) -> i8 {
        self as i8
    }

    /// Returns the AMQP message priority (higher is more urgent).
    pub fn broker_priority(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 3,
            Priority::Medium => 4,
            Priority::High => 5,
            Priority::Critical => 6,
        }
    }

    /// Returns the level name.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.broker_priority().cmp(&other.broker_priority())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                JobError::InvalidConfiguration(format!(
                    "unknown priority '{s}' (expected low, normal, medium, high or critical)"
                ))
            })
    }
}

impl TryFrom<&str> for Priority {
    type Error = JobError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<i64> for Priority {
    type Error = JobError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Priority::ALL
            .into_iter()
            .find(|p| i64::from(p.value()) == value)
            .ok_or_else(|| JobError::InvalidConfiguration(format!("unknown priority value {value}")))
    }
}

impl From<Priority> for i8 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

/// A unit of work being configured before it is sent.
///
/// Created by [`WorkQueue::create_job`]. Setters validate their argument
/// and return the job for chaining; [`Job::send`] consumes it, so a job
/// cannot be changed once it is on the wire.
///
/// ```rust,ignore
/// let id = queue
///     .create_job("resize_image", json!({ "path": "/tmp/a.png" }))
///     .max_retry(4)?
///     .delay(5000)?
///     .backoff("exponential")?
///     .priority("low")?
///     .send()
///     .await?;
/// ```
#[must_use = "a job does nothing until it is sent"]
pub struct Job<'q> {
    queue: &'q WorkQueue,
    id: JobId,
    worker: String,
    payload: Value,
    priority: Priority,
    delay_ms: u64,
    backoff: Backoff,
    max_retry: u32,
}

impl<'q> Job<'q> {
    pub(crate) fn new(queue: &'q WorkQueue, worker: String, payload: Value, max_retry: u32) -> Self {
        Self {
            queue,
            id: JobId::new(),
            worker,
            payload,
            priority: Priority::Normal,
            delay_ms: 0,
            backoff: Backoff::Fixed,
            max_retry,
        }
    }

    /// Sets the priority from a [`Priority`] or a level name.
    pub fn priority<P>(mut self, level: P) -> JobResult<Self>
    where
        P: TryInto<Priority>,
        JobError: From<P::Error>,
    {
        self.priority = level.try_into()?;
        Ok(self)
    }

    /// Sets the base delay in milliseconds. Negative values are rejected.
    pub fn delay<N>(mut self, ms: N) -> JobResult<Self>
    where
        N: TryInto<u64> + fmt::Display + Copy,
    {
        self.delay_ms = ms
            .try_into()
            .map_err(|_| JobError::InvalidConfiguration(format!("delay must be a non-negative number of milliseconds, got {ms}")))?;
        Ok(self)
    }

    /// Sets the base delay from a Duration.
    pub fn delay_for(mut self, delay: Duration) -> JobResult<Self> {
        self.delay_ms = u64::try_from(delay.as_millis())
            .map_err(|_| JobError::InvalidConfiguration(format!("delay {delay:?} is too large")))?;
        Ok(self)
    }

    /// Sets the backoff strategy from a [`Backoff`] or a strategy name.
    pub fn backoff<B>(mut self, strategy: B) -> JobResult<Self>
    where
        B: TryInto<Backoff>,
        JobError: From<B::Error>,
    {
        self.backoff = strategy.try_into()?;
        Ok(self)
    }

    /// Sets how many times a failed job is retried. Negative values are rejected.
    pub fn max_retry<N>(mut self, retries: N) -> JobResult<Self>
    where
        N: TryInto<u32> + fmt::Display + Copy,
    {
        self.max_retry = retries
            .try_into()
            .map_err(|_| JobError::InvalidConfiguration(format!("max retry must be a non-negative integer, got {retries}")))?;
        Ok(self)
    }

    /// Returns the job ID.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Returns the worker name.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Builds the wire envelope for the first delivery.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            headers: JobHeaders {
                job_id: self.id.clone(),
                worker_id: self.worker.clone(),
                priority: self.priority,
                delay_ms: self.delay_ms,
                backoff: self.backoff,
                max_attempts: self.max_retry,
                made_attempts: 0,
            },
            payload: self.payload.clone(),
        }
    }

    /// Publishes the job to every replica of the component.
    ///
    /// Resolves once the broker has accepted the message, not when a
    /// handler has run. Fails immediately with [`JobError::NotConnected`]
    /// when the queue has no live connection; nothing is buffered.
    pub async fn send(self) -> JobResult<JobId> {
        if self.worker.is_empty() {
            return Err(JobError::InvalidConfiguration("worker name must not be empty".to_string()));
        }
        let envelope = self.envelope();
        self.queue.publish_new(&envelope).await?;
        Ok(self.id)
    }
}

impl fmt::Debug for Job<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("priority", &self.priority)
            .field("delay_ms", &self.delay_ms)
            .field("backoff", &self.backoff)
            .field("max_retry", &self.max_retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_priority_sorts_by_urgency() {
        let mut levels = vec![
            Priority::Critical,
            Priority::Low,
            Priority::High,
            Priority::Normal,
            Priority::Medium,
        ];
        levels.sort();
        assert_eq!(levels, Priority::ALL.to_vec());
        assert_eq!(Priority::ALL.iter().max(), Some(&Priority::Critical));
    }

    #[test]
    fn test_priority_values() {
        assert_eq!(Priority::Low.value(), 10);
        assert_eq!(Priority::Normal.value(), 0);
        assert_eq!(Priority::Medium.value(), -5);
        assert_eq!(Priority::High.value(), -10);
        assert_eq!(Priority::Critical.value(), -15);
    }

    #[test]
    fn test_broker_priority_follows_urgency() {
        let mapped: Vec<u8> = Priority::ALL.iter().map(|p| p.broker_priority()).collect();
        assert!(mapped.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_priority_from_name_and_value() {
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert_eq!(Priority::try_from(-10i64).unwrap(), Priority::High);
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(JobError::InvalidConfiguration(_))
        ));
        assert!(Priority::try_from(3i64).is_err());
    }
}
