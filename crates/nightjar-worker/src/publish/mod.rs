//! Completion event publication.
//!
//! After a file is finalized, one completion record is published to the
//! message bus. Delivery is at-least-once; the event carries a
//! `correlationId` (`"{workerId}:{fileId}:{monotonicStamp}"`) so
//! downstream consumers can deduplicate redelivered events.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nightjar_core::{FileId, WorkerId};

use crate::error::Result;

/// Completion record for one finalized output file.
///
/// Serialized as camelCase JSON on the wire:
///
/// ```json
/// {"workerId":"LoanWorker","fileId":"loans-csv","eventType":"export.completed",
///  "completedAt":"2024-03-07T06:00:12Z","totalRows":100000,
///  "correlationId":"LoanWorker:loans-csv:1709791212345"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    /// The workload that produced the file.
    pub worker_id: WorkerId,
    /// The finalized output file.
    pub file_id: FileId,
    /// Configured event type discriminator for consumers.
    pub event_type: String,
    /// When the file was finalized (UTC).
    pub completed_at: DateTime<Utc>,
    /// Number of data lines in the published file.
    pub total_rows: u64,
    /// Deduplication identity for at-least-once delivery.
    pub correlation_id: String,
}

impl CompletionEvent {
    /// Creates a completion event stamped at `completed_at`.
    ///
    /// The correlation id embeds the completion instant's millisecond
    /// timestamp as its monotonic stamp.
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        file_id: FileId,
        event_type: impl Into<String>,
        total_rows: u64,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let correlation_id = format!(
            "{worker_id}:{file_id}:{}",
            completed_at.timestamp_millis()
        );
        Self {
            worker_id,
            file_id,
            event_type: event_type.into(),
            completed_at,
            total_rows,
            correlation_id,
        }
    }

    /// The record key: `"{workerId}:{fileId}"`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.worker_id, self.file_id)
    }
}

/// At-least-once publisher of completion records.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one completion record to the configured topic.
    ///
    /// # Errors
    ///
    /// Returns a publish error when the bus rejects or times out; the
    /// orchestrator's retry policy applies above this call.
    async fn publish_completed(&self, event: &CompletionEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn event() -> CompletionEvent {
        CompletionEvent::new(
            WorkerId::new("LoanWorker").expect("valid"),
            FileId::new("loans-csv").expect("valid"),
            "export.completed",
            100_000,
            Utc.with_ymd_and_hms(2024, 3, 7, 6, 0, 12).unwrap(),
        )
    }

    #[test]
    fn key_is_worker_and_file() {
        assert_eq!(event().key(), "LoanWorker:loans-csv");
    }

    #[test]
    fn correlation_embeds_millisecond_stamp() {
        let event = event();
        assert_eq!(
            event.correlation_id,
            format!(
                "LoanWorker:loans-csv:{}",
                event.completed_at.timestamp_millis()
            )
        );
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(event()).expect("serialize");

        assert_eq!(json["workerId"], "LoanWorker");
        assert_eq!(json["fileId"], "loans-csv");
        assert_eq!(json["eventType"], "export.completed");
        assert_eq!(json["totalRows"], 100_000);
        assert!(json["completedAt"]
            .as_str()
            .expect("string timestamp")
            .starts_with("2024-03-07T06:00:12"));
        assert!(json["correlationId"]
            .as_str()
            .expect("string correlation")
            .starts_with("LoanWorker:loans-csv:"));
    }

    #[test]
    fn round_trips_through_json() {
        let original = event();
        let json = serde_json::to_string(&original).expect("serialize");
        let parsed: CompletionEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, original);
    }
}
