use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::{Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use streams_core::{Envelope, LogPosition, Origin, Source};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, KafkaSaslAuth, Result, TlsConfig};

const ENV_SOURCE_TOPICS: &str = "STREAMS_KAFKA_SOURCE_TOPICS";
const ENV_CONSUMER_GROUP: &str = "STREAMS_KAFKA_CONSUMER_GROUP";
const ENV_BATCH_SIZE: &str = "STREAMS_KAFKA_BATCH_SIZE";
const ENV_READ_TIMEOUT_MS: &str = "STREAMS_KAFKA_READ_TIMEOUT_MS";

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The Kafka topics to consume messages from.
    pub topics: Vec<String>,
    /// The consumer group to use for the Kafka consumer.
    pub consumer_group: String,
    /// The authentication mechanism to use for the Kafka consumer.
    pub auth: Option<KafkaSaslAuth>,
    /// The TLS configuration for the Kafka consumer.
    pub tls: Option<TlsConfig>,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
    /// Maximum number of messages fetched from the consumer in one read.
    pub batch_size: usize,
    /// How long one read waits for the batch to fill up.
    pub read_timeout: Duration,
}

impl Default for KafkaSourceConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            topics: Vec::new(),
            consumer_group: String::new(),
            auth: None,
            tls: None,
            kafka_raw_config: HashMap::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl KafkaSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(Error::Config(
                "Brokers must have at least one broker".to_string(),
            ));
        }
        if self.topics.is_empty() {
            return Err(Error::Config("Topics must have at least one topic".to_string()));
        }
        if self.consumer_group.is_empty() {
            return Err(Error::Config("ConsumerGroup must not be empty".to_string()));
        }
        if self.batch_size < 1 {
            return Err(Error::Config("BatchSize must be at least 1".to_string()));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::Config(
                "ReadTimeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env = crate::kafka_env(env_vars);

        let mut config = KafkaSourceConfig {
            brokers: crate::brokers_from_env(&env)?,
            topics: crate::split_list(crate::required(&env, ENV_SOURCE_TOPICS)?),
            consumer_group: crate::required(&env, ENV_CONSUMER_GROUP)?.to_string(),
            auth: crate::auth_from_env(&env)?,
            tls: crate::tls_from_env(&env)?,
            ..Default::default()
        };
        if let Some(batch_size) = crate::parse_optional(&env, ENV_BATCH_SIZE)? {
            config.batch_size = batch_size;
        }
        if let Some(millis) = crate::parse_optional::<u64>(&env, ENV_READ_TIMEOUT_MS)? {
            config.read_timeout = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Message represents a message received from Kafka which is handed to the graph as an [Envelope].
#[derive(Debug)]
pub struct KafkaMessage {
    /// The topic name.
    pub topic: String,
    /// The user payload.
    pub value: Bytes,
    /// Key of the message
    pub key: Option<Bytes>,
    /// The partition number.
    pub partition: i32,
    /// The offset of the message.
    pub offset: i64,
    /// The headers of the message.
    pub headers: HashMap<String, String>,
}

impl From<KafkaMessage> for Envelope<LogPosition> {
    fn from(message: KafkaMessage) -> Self {
        let mut envelope = Envelope::with_value(message.value)
            .with_headers(message.headers)
            .with_position(LogPosition::single(
                message.topic,
                message.partition,
                message.offset,
                Origin::Source,
            ));
        envelope.key = message.key;
        envelope
    }
}

/// Represents a Kafka offset for a specific topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KafkaOffset {
    /// The topic name
    pub topic: String,
    /// The partition id within a topic
    pub partition: i32,
    /// The offset of the last processed message within a partition
    pub offset: i64,
}

/// Offsets of `position` that belong to `topics`.
fn offsets_to_commit(position: &LogPosition, topics: &[String]) -> Vec<KafkaOffset> {
    position
        .filter_streams(topics)
        .entries()
        .iter()
        .map(|entry| KafkaOffset {
            topic: entry.stream.clone(),
            partition: entry.partition,
            offset: entry.offset,
        })
        .collect()
}

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka.
struct KafkaContext;

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!("Committing offsets: {:?}", result);
    }
}

enum KafkaActorMessage {
    Read {
        respond_to: oneshot::Sender<Option<Result<Vec<KafkaMessage>>>>,
    },
    Ack {
        offsets: Vec<KafkaOffset>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Pending {
        respond_to: oneshot::Sender<Result<usize>>,
    },
}

type StreamsConsumer = StreamConsumer<KafkaContext>;

struct KafkaActor {
    consumer: Arc<StreamsConsumer>,
    read_timeout: Duration,
    batch_size: usize,
    topics: Vec<String>,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
    cancel_token: CancellationToken,
}

impl KafkaActor {
    async fn start(
        config: KafkaSourceConfig,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", "earliest");
        if !config.kafka_raw_config.is_empty() {
            info!(
                "Applying user-specified kafka config: {}",
                config
                    .kafka_raw_config
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            for (key, value) in config.kafka_raw_config {
                client_config.set(key, value);
            }
        }
        client_config
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        crate::update_auth_config(&mut client_config, config.tls, config.auth);

        let consumer: Arc<StreamsConsumer> = Arc::new(
            client_config
                .create_with_context(KafkaContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        // subscribing to a missing topic does not fail, reads start once the topic exists.
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topics: {err}")))?;

        let mut actor = KafkaActor {
            consumer,
            read_timeout: config.read_timeout,
            batch_size: config.batch_size,
            topics: config.topics,
            handler_rx,
            cancel_token,
        };

        // subscribe() succeeds with invalid credentials, a metadata round trip does not.
        let pending = actor
            .pending_messages()
            .await
            .map_err(|err| Error::Kafka(format!("Failed to get pending messages: {err}")))?;
        info!(pending, topics = ?actor.topics, "Kafka consumer connected");

        tokio::spawn(async move {
            // the actor stops once every sender of handler_rx is dropped.
            actor.run().await;
            info!("Kafka consumer stopped");
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Read { respond_to } => {
                let messages = self.read_messages().await;
                if respond_to.send(messages).is_err() {
                    error!("Failed to send messages from Kafka actor, receiver dropped");
                }
            }
            KafkaActorMessage::Ack {
                offsets,
                respond_to,
            } => {
                let status = self.ack_messages(offsets).await;
                if respond_to.send(status).is_err() {
                    error!("Failed to send ack status from Kafka actor, receiver dropped");
                }
            }
            KafkaActorMessage::Pending { respond_to } => {
                let pending = self.pending_messages().await;
                if respond_to.send(pending).is_err() {
                    error!("Failed to send pending count from Kafka actor, receiver dropped");
                }
            }
        }
    }

    /// Reads up to batch_size messages, waiting at most read_timeout. None once cancelled.
    async fn read_messages(&mut self) -> Option<Result<Vec<KafkaMessage>>> {
        if self.cancel_token.is_cancelled() {
            return None;
        }

        let mut messages: Vec<KafkaMessage> = vec![];
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);

        // a successful read resets the failure count
        const MAX_FAILURE_COUNT: usize = 10;
        let mut continuous_failure_count = 0;
        loop {
            if messages.len() >= self.batch_size {
                break;
            }
            tokio::select! {
                biased;

                _ = &mut timeout => {
                    break;
                }

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            continuous_failure_count = 0;
                            msg
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                return Some(Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                ))));
                            }
                            warn!(?e, "Failed to read messages, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let mut headers: HashMap<String, String> = match message.headers() {
                        Some(headers) => headers
                            .iter()
                            .map(|header| {
                                (
                                    header.key.to_string(),
                                    String::from_utf8_lossy(header.value.unwrap_or_default()).to_string(),
                                )
                            })
                            .collect(),
                        None => HashMap::new(),
                    };
                    headers.insert(crate::KAFKA_TOPIC_HEADER_KEY.to_string(), message.topic().to_string());

                    messages.push(KafkaMessage {
                        topic: message.topic().to_string(),
                        // a message without payload is handed over with an empty value.
                        value: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
                        key: message.key().map(Bytes::copy_from_slice),
                        partition: message.partition(),
                        offset: message.offset(),
                        headers,
                    });
                }
            }
        }
        debug!(msg_count = messages.len(), "Read messages from Kafka");
        Some(Ok(messages))
    }

    /// Commits offset + 1 of the highest offset per topic partition, the next message to read.
    async fn ack_messages(&mut self, offsets: Vec<KafkaOffset>) -> Result<()> {
        // topic -> partition -> offset
        let mut topic_partition_offsets: HashMap<String, HashMap<i32, i64>> = HashMap::new();
        for kafka_offset in offsets {
            topic_partition_offsets
                .entry(kafka_offset.topic)
                .or_default()
                .entry(kafka_offset.partition)
                .and_modify(|current| *current = (*current).max(kafka_offset.offset))
                .or_insert(kafka_offset.offset);
        }

        let mut tpl = TopicPartitionList::new();
        for (topic, partition_offsets) in &topic_partition_offsets {
            for (partition, offset) in partition_offsets {
                tpl.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))
                    .map_err(|e| {
                        Error::Kafka(format!("Failed to add partition offset for commit: {e}"))
                    })?;
            }
        }

        // a synchronous commit blocks until the broker answers.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Other(format!("Waiting for commit task to complete: {e:?}")))?
    }

    /// Sum of (high watermark - committed offset) of every partition of every topic.
    async fn pending_messages(&mut self) -> Result<usize> {
        let timeout = Duration::from_secs(5);
        let mut handles = Vec::new();
        for topic in &self.topics {
            let consumer = Arc::clone(&self.consumer);
            let topic = topic.clone();

            // metadata and watermark lookups block, run them off the runtime.
            handles.push(tokio::task::spawn_blocking(move || {
                let metadata = consumer
                    .fetch_metadata(Some(&topic), timeout)
                    .map_err(|e| Error::Kafka(format!("Failed to fetch metadata: {e}")))?;
                let Some(topic_metadata) = metadata.topics().first() else {
                    warn!(topic, "No topic metadata found");
                    return Ok(0);
                };
                let mut topic_pending = 0;
                for partition in topic_metadata.partitions().iter().map(|p| p.id()) {
                    let mut tpl = TopicPartitionList::new();
                    tpl.add_partition(&topic, partition);
                    let committed = consumer.committed_offsets(tpl, timeout).map_err(|e| {
                        Error::Kafka(format!("Failed to get committed offsets: {e}"))
                    })?;
                    let (low, high) = consumer
                        .fetch_watermarks(&topic, partition, timeout)
                        .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))?;
                    let committed_offset = match committed.elements_for_topic(&topic).first() {
                        Some(element) => match element.offset() {
                            Offset::Offset(offset) => offset,
                            _ => low,
                        },
                        None => low,
                    };
                    topic_pending += usize::try_from(high - committed_offset).unwrap_or(0);
                }
                Ok(topic_pending)
            }));
        }

        let mut total_pending = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(count)) => total_pending += count,
                Ok(Err(e)) => {
                    error!(?e, "Error fetching pending messages");
                    return Err(e);
                }
                Err(e) => {
                    error!(?e, "Tokio task join error fetching pending messages");
                    return Err(Error::Other(format!("Tokio task join error: {e}")));
                }
            }
        }
        Ok(total_pending)
    }
}

/// Handle to the consumer actor.
#[derive(Clone)]
struct KafkaConsumerHandle {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaConsumerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> KafkaActorMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.actor_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Other("Actor task terminated".into()))?;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))
    }

    async fn read_messages(&self) -> Option<Result<Vec<KafkaMessage>>> {
        self.request(|respond_to| KafkaActorMessage::Read { respond_to })
            .await
            .unwrap_or_else(|e| Some(Err(e)))
    }

    async fn ack_messages(&self, offsets: Vec<KafkaOffset>) -> Result<()> {
        self.request(|respond_to| KafkaActorMessage::Ack {
            offsets,
            respond_to,
        })
        .await?
    }

    async fn pending_messages(&self) -> Result<usize> {
        self.request(|respond_to| KafkaActorMessage::Pending { respond_to })
            .await?
    }
}

/// Kafka consumer group source. Reads in batches and hands out one envelope per `consume()`,
/// each carrying `{topic, partition, offset, Source}`.
pub struct KafkaSource {
    handle: Option<KafkaConsumerHandle>,
    topics: Vec<String>,
    buffer: VecDeque<KafkaMessage>,
    cancel_token: CancellationToken,
}

impl KafkaSource {
    pub async fn connect(config: KafkaSourceConfig) -> Result<Self> {
        config.validate()?;
        let topics = config.topics.clone();
        let cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, rx, cancel_token.clone()).await?;
        Ok(Self {
            handle: Some(KafkaConsumerHandle { actor_tx: tx }),
            topics,
            buffer: VecDeque::new(),
            cancel_token,
        })
    }

    fn handle(&self) -> Result<&KafkaConsumerHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Other("Kafka source is closed".to_string()))
    }

    /// Number of messages not yet committed by the consumer group.
    pub async fn pending(&self) -> Result<usize> {
        self.handle()?.pending_messages().await
    }
}

#[async_trait]
impl Source<LogPosition> for KafkaSource {
    async fn consume(&mut self) -> streams_core::Result<Envelope<LogPosition>> {
        if self.buffer.is_empty() {
            let read = self.handle()?.read_messages().await;
            match read {
                Some(messages) => self.buffer.extend(messages?),
                None => return Ok(Envelope::empty()),
            }
        }
        Ok(self
            .buffer
            .pop_front()
            .map(Envelope::from)
            .unwrap_or_else(Envelope::empty))
    }

    async fn commit(&mut self, position: Option<LogPosition>) -> streams_core::Result<()> {
        let Some(position) = position else {
            return Ok(());
        };
        let offsets = offsets_to_commit(&position, &self.topics);
        if offsets.is_empty() {
            return Ok(());
        }
        debug!(?offsets, "Committing Kafka offsets");
        self.handle()?.ack_messages(offsets).await?;
        Ok(())
    }

    async fn close(&mut self) -> streams_core::Result<()> {
        self.cancel_token.cancel();
        // dropping the last sender stops the actor, which drops the consumer.
        self.handle = None;
        if !self.buffer.is_empty() {
            info!(
                dropped = self.buffer.len(),
                "Kafka source closed with unconsumed messages"
            );
            self.buffer.clear();
        }
        Ok(())
    }
}

#[cfg(feature = "kafka-tests-utils")]
pub mod test_utils {
    use std::time::Duration;

    use rdkafka::ClientConfig;
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::producer::{FutureProducer, FutureRecord};

    pub async fn setup_test_topic(partitions: i32) -> (FutureProducer, String) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create producer");

        let topic_name = format!(
            "streams_kafka_test_topic_{}",
            uuid::Uuid::new_v4().simple()
        );

        let admin_client = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create::<AdminClient<_>>()
            .expect("Failed to create admin client");

        let topic_config =
            NewTopic::new(topic_name.as_str(), partitions, TopicReplication::Fixed(1));
        admin_client
            .create_topics(&[topic_config], &AdminOptions::new())
            .await
            .expect("Failed to create topic");

        (producer, topic_name)
    }

    pub async fn produce_test_messages(producer: &FutureProducer, topic: &str, count: usize) {
        for i in 0..count {
            let payload = format!("message {i}");
            let key = format!("key {i}");
            let record = FutureRecord::to(topic).payload(&payload).key(&key);
            producer
                .send(record, Duration::from_secs(5))
                .await
                .expect("Failed to send message");
        }
    }
}
