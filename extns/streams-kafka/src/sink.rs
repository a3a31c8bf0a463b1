use std::collections::HashMap;
use std::mem;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream::FuturesUnordered};
use rdkafka::{
    ClientConfig,
    config::RDKafkaLogLevel,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use streams_core::{Envelope, LogPosition, Origin, Position, Router, Sink};
use tracing::{debug, error};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

const ENV_SINK_TOPIC: &str = "STREAMS_KAFKA_SINK_TOPIC";
const ENV_SINK_BUFFER_SIZE: &str = "STREAMS_KAFKA_SINK_BUFFER_SIZE";
const ENV_SINK_SET_PARTITION_KEY: &str = "STREAMS_KAFKA_SINK_SET_PARTITION_KEY";

const DEFAULT_BUFFER_SIZE: usize = 1000;
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// The authentication mechanism to use for the Kafka producer.
    pub auth: Option<KafkaSaslAuth>,
    /// The TLS configuration for the Kafka producer.
    pub tls: Option<TlsConfig>,
    /// Whether the envelope key is used as the record key, which decides the partition.
    pub set_partition_key: bool,
    /// Number of envelopes buffered before they are sent.
    pub buffer_size: usize,
}

impl Default for KafkaSinkConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            topic: String::new(),
            auth: None,
            tls: None,
            set_partition_key: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl KafkaSinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(Error::Config(
                "Brokers must have at least one broker".to_string(),
            ));
        }
        if self.topic.is_empty() {
            return Err(Error::Config("Topic must not be empty".to_string()));
        }
        if self.buffer_size < 1 {
            return Err(Error::Config("BufferSize must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env = crate::kafka_env(env_vars);

        let mut config = KafkaSinkConfig {
            brokers: crate::brokers_from_env(&env)?,
            topic: crate::required(&env, ENV_SINK_TOPIC)?.trim().to_string(),
            auth: crate::auth_from_env(&env)?,
            tls: crate::tls_from_env(&env)?,
            ..Default::default()
        };
        if let Some(buffer_size) = crate::parse_optional(&env, ENV_SINK_BUFFER_SIZE)? {
            config.buffer_size = buffer_size;
        }
        if let Some(set_partition_key) = crate::parse_optional(&env, ENV_SINK_SET_PARTITION_KEY)? {
            config.set_partition_key = set_partition_key;
        }

        config.validate()?;
        Ok(config)
    }
}

fn owned_headers(headers: &HashMap<String, String>) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value),
            })
        })
}

/// Writes envelopes to one Kafka topic. Envelopes are buffered and sent once `buffer_size` is
/// reached, or when the graph flushes before a commit. Positions are marked only after the broker
/// accepted the record.
pub struct KafkaSink {
    topic: String,
    producer: FutureProducer,
    set_partition_key: bool,
    buffer_size: usize,
    buffer: Vec<Envelope<LogPosition>>,
    router: Option<Router<LogPosition>>,
}

impl KafkaSink {
    pub fn connect(config: KafkaSinkConfig) -> Result<Self> {
        config.validate()?;

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", "5000")
            .set("client.id", "streams-kafka-sink")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(&mut client_config, config.tls, config.auth);

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| Error::Kafka(format!("Failed to create producer: {e}")))?;

        Ok(KafkaSink {
            topic: config.topic,
            producer,
            set_partition_key: config.set_partition_key,
            buffer_size: config.buffer_size,
            buffer: Vec::with_capacity(config.buffer_size),
            router: None,
        })
    }

    /// Number of envelopes waiting to be sent.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn send_buffered(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let router = self
            .router
            .as_ref()
            .ok_or_else(|| Error::Other("Kafka sink is not wired into a graph".to_string()))?;

        let batch = mem::take(&mut self.buffer);
        let batch_len = batch.len();
        let mut send_futures = FuturesUnordered::new();
        for envelope in batch {
            let topic = self.topic.as_str();
            let producer = &self.producer;
            let set_partition_key = self.set_partition_key;
            send_futures.push(async move {
                let mut record: FutureRecord<'_, [u8], [u8]> =
                    FutureRecord::to(topic).headers(owned_headers(&envelope.headers));
                if let Some(value) = envelope.value.as_deref() {
                    record = record.payload(value);
                }
                if set_partition_key {
                    if let Some(key) = envelope.key.as_deref() {
                        record = record.key(key);
                    }
                }
                let status = producer
                    .send(record, SEND_TIMEOUT)
                    .await
                    .map(|_| ())
                    .map_err(|(e, _)| e);
                (envelope, status)
            });
        }

        let mut sent = Vec::with_capacity(batch_len);
        let mut failed_count = 0;
        let mut last_error = None;
        while let Some((envelope, status)) = send_futures.next().await {
            if let Err(e) = status {
                error!(?e, topic = %self.topic, "Sending payload to Kafka topic");
                failed_count += 1;
                last_error = Some(e);
            }
            sent.push(envelope);
        }
        drop(send_futures);

        if let Some(e) = last_error {
            // the whole batch is sent again, nothing of it is marked.
            sent.append(&mut self.buffer);
            self.buffer = sent;
            return Err(Error::Kafka(format!(
                "Sending {failed_count} of {batch_len} payloads to kafka: {e:?}"
            )));
        }

        for mut envelope in sent {
            if let Some(position) = envelope.take_position() {
                router.mark(position.with_origin(Origin::Processing));
            }
        }
        debug!(count = batch_len, topic = %self.topic, "Sent envelopes to Kafka");
        Ok(())
    }
}

#[async_trait]
impl Sink<LogPosition> for KafkaSink {
    fn with_router(&mut self, router: Router<LogPosition>) -> streams_core::Result<()> {
        self.router = Some(router);
        Ok(())
    }

    async fn process(&mut self, envelope: Envelope<LogPosition>) -> streams_core::Result<()> {
        self.buffer.push(envelope);
        if self.buffer.len() >= self.buffer_size {
            self.send_buffered().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> streams_core::Result<()> {
        Ok(self.send_buffered().await?)
    }

    async fn close(&mut self) -> streams_core::Result<()> {
        Ok(self.send_buffered().await?)
    }
}
