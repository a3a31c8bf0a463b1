//! Runs a Kafka to Kafka pipeline: envelopes consumed from the source topics are written to the
//! sink topic, and the source offsets are committed once the sink has acknowledged them.
//!
//! Everything is configured through the environment, see `Settings`, `KafkaSourceConfig` and
//! `KafkaSinkConfig`.

use std::collections::HashMap;
use std::env;
use std::error::Error;

use streams_core::{Executor, Graph, LogPosition, Settings};
use streams_kafka::{KafkaSink, KafkaSinkConfig, KafkaSource, KafkaSourceConfig};
use tracing::{error, info, warn};

mod setup_tracing;

const SOURCE_STAGE: &str = "kafka-source";
const SINK_STAGE: &str = "kafka-sink";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let vars: HashMap<String, String> = env::vars().collect();
    let settings = Settings::load(vars.clone())?;
    let source_config = KafkaSourceConfig::load(vars.clone())?;
    let sink_config = KafkaSinkConfig::load(vars)?;
    info!(
        ?settings,
        topics = ?source_config.topics,
        sink_topic = %sink_config.topic,
        "Starting pipeline"
    );

    let source = KafkaSource::connect(source_config).await?;
    let sink = KafkaSink::connect(sink_config)?;

    let graph: Graph<LogPosition> = Graph::builder()
        .merge_policy(settings.merge_policy)
        .source(SOURCE_STAGE, source)
        .sink(SINK_STAGE, sink, &[SOURCE_STAGE])
        .build()?;

    let executor = Executor::with_config(graph, settings.executor);
    executor.on_error(|e| error!(stage = e.stage(), "{e}"));
    executor.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, committing and closing the pipeline");

    // close even when the last commit fails, the offsets are re-delivered on the next start.
    if let Err(e) = executor.commit().await {
        warn!(?e, "Final commit failed");
    }
    executor.close().await?;

    match streams_core::encode_metrics() {
        Ok(metrics) => info!("Final metrics\n{metrics}"),
        Err(e) => warn!(?e, "Encoding metrics"),
    }
    Ok(())
}
