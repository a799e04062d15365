//! Wire format of a job: broker headers plus a JSON body.

use crate::backoff::Backoff;
use crate::broker::{HeaderTable, HeaderValue, Message, MessageProperties};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, Priority};
use serde_json::Value;

/// Header names.
pub mod headers {
    pub const JOB_ID: &str = "jobId";
    pub const WORKER_ID: &str = "worker_id";
    pub const PRIORITY: &str = "priority";
    pub const DELAY: &str = "delay";
    pub const BACKOFF: &str = "backoff";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const MADE_ATTEMPTS: &str = "made_attempts";
}

const CONTENT_TYPE_JSON: &str = "application/json";

/// Job metadata travelling in message headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeaders {
    pub job_id: JobId,
    pub worker_id: String,
    pub priority: Priority,
    /// Base delay in milliseconds.
    pub delay_ms: u64,
    pub backoff: Backoff,
    /// Retries allowed after the first delivery.
    pub max_attempts: u32,
    /// Failed deliveries so far. Zero on the first delivery.
    pub made_attempts: u32,
}

impl JobHeaders {
    /// Encodes the headers as a broker header table.
    pub fn to_table(&self) -> HeaderTable {
        let mut table = HeaderTable::new();
        table.insert(headers::JOB_ID.into(), self.job_id.as_str().into());
        table.insert(headers::WORKER_ID.into(), self.worker_id.clone().into());
        table.insert(headers::PRIORITY.into(), i64::from(self.priority.value()).into());
        table.insert(
            headers::DELAY.into(),
            i64::try_from(self.delay_ms).unwrap_or(i64::MAX).into(),
        );
        table.insert(headers::BACKOFF.into(), self.backoff.as_str().into());
        table.insert(headers::MAX_ATTEMPTS.into(), i64::from(self.max_attempts).into());
        table.insert(headers::MADE_ATTEMPTS.into(), i64::from(self.made_attempts).into());
        table
    }

    /// Decodes headers, accepting integers sent either as integers or as
    /// numeric strings. Unknown headers are ignored.
    pub fn from_table(table: &HeaderTable) -> JobResult<Self> {
        let priority = int_header(table, headers::PRIORITY)?;
        Ok(Self {
            job_id: JobId::from_string(string_header(table, headers::JOB_ID)?),
            worker_id: string_header(table, headers::WORKER_ID)?,
            priority: Priority::try_from(priority).map_err(|_| {
                JobError::MalformedEnvelope(format!("unknown priority value {priority}"))
            })?,
            delay_ms: ranged(table, headers::DELAY)?,
            backoff: string_header(table, headers::BACKOFF)?
                .parse::<Backoff>()
                .map_err(|e: JobError| JobError::MalformedEnvelope(e.to_string()))?,
            max_attempts: ranged(table, headers::MAX_ATTEMPTS)?,
            made_attempts: ranged(table, headers::MADE_ATTEMPTS)?,
        })
    }

    /// Returns true when the retry budget is spent.
    pub fn is_exhausted(&self) -> bool {
        self.made_attempts >= self.max_attempts
    }
}

fn string_header(table: &HeaderTable, name: &str) -> JobResult<String> {
    match table.get(name) {
        Some(HeaderValue::String(s)) => Ok(s.clone()),
        Some(HeaderValue::Int(i)) => Ok(i.to_string()),
        None => Err(JobError::MalformedEnvelope(format!("missing header '{name}'"))),
    }
}

fn int_header(table: &HeaderTable, name: &str) -> JobResult<i64> {
    match table.get(name) {
        Some(HeaderValue::Int(i)) => Ok(*i),
        Some(HeaderValue::String(s)) => s.trim().parse().map_err(|_| {
            JobError::MalformedEnvelope(format!("header '{name}' is not an integer: '{s}'"))
        }),
        None => Err(JobError::MalformedEnvelope(format!("missing header '{name}'"))),
    }
}

fn ranged<T: TryFrom<i64>>(table: &HeaderTable, name: &str) -> JobResult<T> {
    let value = int_header(table, name)?;
    T::try_from(value)
        .map_err(|_| JobError::MalformedEnvelope(format!("header '{name}' out of range: {value}")))
}

/// A job as it travels through the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub headers: JobHeaders,
    pub payload: Value,
}

impl Envelope {
    /// Encodes the envelope as a persistent JSON message.
    pub fn to_message(&self) -> JobResult<Message> {
        Ok(Message {
            properties: MessageProperties {
                headers: self.headers.to_table(),
                expiration: None,
                priority: Some(self.headers.priority.broker_priority()),
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                message_id: Some(self.headers.job_id.to_string()),
                persistent: true,
            },
            body: serde_json::to_vec(&self.payload)?,
        })
    }

    /// Decodes a delivered message. Any decoding problem is reported as
    /// [`JobError::MalformedEnvelope`].
    pub fn from_message(message: &Message) -> JobResult<Self> {
        let headers = JobHeaders::from_table(&message.properties.headers)?;
        let payload = if message.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&message.body)
                .map_err(|e| JobError::MalformedEnvelope(format!("body is not JSON: {e}")))?
        };
        Ok(Self { headers, payload })
    }

    /// Returns a copy with `made_attempts` replaced.
    pub fn with_made_attempts(&self, made_attempts: u32) -> Self {
        let mut next = self.clone();
        next.headers.made_attempts = made_attempts;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope {
            headers: JobHeaders {
                job_id: JobId::from_string("job-1"),
                worker_id: "resize".to_string(),
                priority: Priority::High,
                delay_ms: 250,
                backoff: Backoff::Exponential,
                max_attempts: 3,
                made_attempts: 0,
            },
            payload: json!({ "path": "/tmp/a.png" }),
        }
    }

    #[test]
    fn test_header_names_on_the_wire() {
        let table = sample().headers.to_table();
        assert_eq!(table.get("jobId"), Some(&HeaderValue::String("job-1".into())));
        assert_eq!(table.get("worker_id"), Some(&HeaderValue::String("resize".into())));
        assert_eq!(table.get("priority"), Some(&HeaderValue::Int(-10)));
        assert_eq!(table.get("delay"), Some(&HeaderValue::Int(250)));
        assert_eq!(table.get("backoff"), Some(&HeaderValue::String("exponential".into())));
        assert_eq!(table.get("max_attempts"), Some(&HeaderValue::Int(3)));
        assert_eq!(table.get("made_attempts"), Some(&HeaderValue::Int(0)));
    }

    #[test]
    fn test_message_properties() {
        let message = sample().to_message().unwrap();
        assert_eq!(message.properties.priority, Some(5));
        assert_eq!(message.properties.message_id.as_deref(), Some("job-1"));
        assert_eq!(message.properties.content_type.as_deref(), Some("application/json"));
        assert!(message.properties.persistent);
        assert!(message.properties.expiration.is_none());

        let decoded = Envelope::from_message(&message).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let mut table = sample().headers.to_table();
        table.insert("made_attempts".into(), HeaderValue::String("2".into()));
        table.insert("delay".into(), HeaderValue::String("1000".into()));

        let headers = JobHeaders::from_table(&table).unwrap();
        assert_eq!(headers.made_attempts, 2);
        assert_eq!(headers.delay_ms, 1000);
    }

    #[test]
    fn test_missing_header_is_malformed() {
        let mut table = sample().headers.to_table();
        table.remove("worker_id");

        let err = JobHeaders::from_table(&table).unwrap_err();
        assert!(matches!(err, JobError::MalformedEnvelope(msg) if msg.contains("worker_id")));
    }

    #[test]
    fn test_negative_attempts_are_malformed() {
        let mut table = sample().headers.to_table();
        table.insert("made_attempts".into(), HeaderValue::Int(-1));
        assert!(matches!(
            JobHeaders::from_table(&table),
            Err(JobError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_non_json_body_is_malformed() {
        let mut message = sample().to_message().unwrap();
        message.body = b"not json".to_vec();
        assert!(matches!(
            Envelope::from_message(&message),
            Err(JobError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_exhaustion() {
        let envelope = sample();
        assert!(!envelope.headers.is_exhausted());
        assert!(envelope.with_made_attempts(3).headers.is_exhausted());
        assert_eq!(envelope.with_made_attempts(2).headers.job_id, envelope.headers.job_id);
    }
}
