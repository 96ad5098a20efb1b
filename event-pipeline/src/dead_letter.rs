use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::KafkaConfig;
use crate::error::DeadLetterError;
use crate::event::OriginalEvent;

pub const ERROR_LOCATION: &str = "plugin_server_ingest_event";

/// What lands on the dead letter topic when an event fails processing. Built
/// from the event the invocation started with, never from a step's
/// intermediate arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub id: Uuid,
    pub event_uuid: Uuid,
    pub event: String,
    pub properties: String,
    pub distinct_id: String,
    pub team_id: Option<i32>,
    pub elements_chain: String,
    pub ip: String,
    pub site_url: String,
    pub now: String,
    pub raw_payload: String,
    pub error_timestamp: DateTime<Utc>,
    pub error_location: String,
    pub error: String,
    pub tags: Vec<String>,
}

impl DeadLetterEnvelope {
    pub fn from_failure(
        original: &OriginalEvent,
        error: &str,
        error_timestamp: DateTime<Utc>,
    ) -> Result<Self, DeadLetterError> {
        Ok(DeadLetterEnvelope {
            id: Uuid::new_v4(),
            event_uuid: original.uuid(),
            event: original.event().to_string(),
            properties: serde_json::to_string(original.properties())?,
            distinct_id: original.distinct_id().to_string(),
            team_id: original.team_id(),
            elements_chain: original.elements_chain().unwrap_or_default().to_string(),
            ip: original.ip().unwrap_or_default().to_string(),
            site_url: original.site_url().to_string(),
            now: original.now(),
            raw_payload: serde_json::to_string(original)?,
            error_timestamp,
            error_location: ERROR_LOCATION.to_string(),
            error: error.to_string(),
            tags: vec!["plugin_server".to_string(), "ingest_event".to_string()],
        })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterEmitter: Send + Sync {
    async fn submit(&self, envelope: DeadLetterEnvelope) -> Result<(), DeadLetterError>;
}

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {}

pub fn create_kafka_producer(config: &KafkaConfig) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    client_config.create_with_context(KafkaContext)
}

/// Produces envelopes to a Kafka topic, keyed by event uuid so retries of the
/// same event land on the same partition.
pub struct KafkaDeadLetterEmitter {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterEmitter {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: impl Into<String>) -> Self {
        KafkaDeadLetterEmitter {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterEmitter for KafkaDeadLetterEmitter {
    async fn submit(&self, envelope: DeadLetterEnvelope) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(&envelope)?;
        let key = envelope.event_uuid.to_string();

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(error, _)| DeadLetterError::Kafka(error))?;

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((error, _))) => Err(DeadLetterError::Kafka(error)),
            Err(_) => Err(DeadLetterError::Canceled),
        }
    }
}
