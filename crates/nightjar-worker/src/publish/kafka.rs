//! Kafka event publisher.
//!
//! Publishes completion records to the configured topic, keyed by
//! `"{workerId}:{fileId}"` and partitioned by key hash. Sends are
//! bounded by the configured bus timeout; the orchestrator's retry
//! policy applies above this client, keeping delivery at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use rskafka::client::partition::{Compression, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::publish::{CompletionEvent, EventPublisher};

/// Kafka producer for completion events.
///
/// Thread-safe; share across tasks via `Arc`.
pub struct KafkaEventPublisher {
    client: Arc<Client>,
    topic: String,
    partitions: u32,
    timeout: std::time::Duration,
}

impl KafkaEventPublisher {
    /// Connects to the configured brokers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the brokers are unreachable.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let client = ClientBuilder::new(config.bootstrap_servers.clone())
            .build()
            .await
            .map_err(|e| Error::configuration(format!("kafka connection failed: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            topic: config.topic.clone(),
            partitions: config.partitions,
            timeout: config.timeout(),
        })
    }

    fn publish_err(event: &CompletionEvent, message: impl Into<String>) -> Error {
        Error::Publish {
            file_id: event.file_id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish_completed(&self, event: &CompletionEvent) -> Result<()> {
        let key = event.key();
        let payload =
            serde_json::to_vec(event).map_err(|e| Self::publish_err(event, e.to_string()))?;

        let partition_client = self
            .client
            .partition_client(
                &self.topic,
                partition_for_key(&key, self.partitions),
                UnknownTopicHandling::Retry,
            )
            .await
            .map_err(|e| Self::publish_err(event, format!("partition client: {e}")))?;

        let record = Record {
            key: Some(key.into_bytes()),
            value: Some(payload),
            headers: Default::default(),
            timestamp: chrono::Utc::now(),
        };

        let produce = partition_client.produce(vec![record], Compression::NoCompression);
        match tokio::time::timeout(self.timeout, produce).await {
            Ok(Ok(_offsets)) => {
                tracing::debug!(
                    worker_id = %event.worker_id,
                    file_id = %event.file_id,
                    topic = %self.topic,
                    "completion event published"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(Self::publish_err(event, e.to_string())),
            Err(_) => Err(Self::publish_err(
                event,
                format!("send timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// Computes the partition for a record key using consistent hashing.
fn partition_for_key(key: &str, partitions: u32) -> i32 {
    let hash: u32 = key
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_add(u32::from(b)));
    i32::try_from(hash % partitions.max(1)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_hash_is_stable_and_bounded() {
        let a = partition_for_key("LoanWorker:loans-csv", 16);
        let b = partition_for_key("LoanWorker:loans-csv", 16);
        assert_eq!(a, b);
        assert!((0..16).contains(&a));
    }

    #[test]
    fn single_partition_topics_always_get_zero() {
        assert_eq!(partition_for_key("anything", 1), 0);
        assert_eq!(partition_for_key("anything", 0), 0);
    }
}
