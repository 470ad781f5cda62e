//! topicq CLI: operator interface to queues and topics.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use topicq::config::{Config, DriverKind};
use topicq::consumer::{Consumer, ConsumerConfig};
use topicq::destination::DestinationRegistry;
use topicq::driver::{self, Session};
use topicq::message::{Message, OutgoingMessage, Priority, PropertyValue};
use topicq::processor::{ProcessResult, Processor, ProcessorError, Subscription};
use topicq::producer::Producer;
use topicq::provision::provision_queues;
use topicq::router::ProcessorRegistry;
use topicq::telemetry::{TelemetryConfig, init_telemetry};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "topicq", about = "Topic-addressed message queue tool")]
struct Cli {
    /// Environment file to load before reading configuration
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare every queue in the topic catalog
    Provision,
    /// Publish a single message
    Send {
        /// Topic to publish to
        topic: String,
        /// JSON body
        #[arg(long)]
        body: Option<String>,
        /// Message property as key=value (repeatable)
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, PropertyValue)>,
        /// very_low | low | normal | high | very_high
        #[arg(long)]
        priority: Option<Priority>,
        /// Delivery delay in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Consume queues, logging and acknowledging every message
    Drain {
        /// Queue to drain (defaults to every catalog queue)
        #[arg(long)]
        queue: Vec<String>,
        /// Stop each queue's consumer after this many messages
        #[arg(long)]
        message_limit: Option<u64>,
        /// Stop after this many seconds
        #[arg(long)]
        time_limit: Option<u64>,
    },
}

fn parse_property(raw: &str) -> Result<(String, PropertyValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let value = if let Ok(v) = value.parse::<i64>() {
        PropertyValue::Int(v)
    } else if let Ok(v) = value.parse::<f64>() {
        PropertyValue::Float(v)
    } else if let Ok(v) = value.parse::<bool>() {
        PropertyValue::Bool(v)
    } else {
        PropertyValue::String(value.to_string())
    };
    Ok((key.to_string(), value))
}

/// Acknowledges everything it sees, after logging it.
struct DrainProcessor {
    topics: Vec<String>,
}

#[async_trait]
impl Processor for DrainProcessor {
    fn name(&self) -> &str {
        "drain"
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        self.topics.iter().map(|t| Subscription::new(t)).collect()
    }

    async fn process(
        &self,
        message: &Message,
        _session: &dyn Session,
    ) -> Result<ProcessResult, ProcessorError> {
        info!(
            topic = %message.topic,
            message_id = %message.id,
            delivery = message.delivery_count,
            body = %message.body,
            "drained"
        );
        Ok(ProcessResult::Ack)
    }
}

fn load_registry(config: &Config) -> anyhow::Result<DestinationRegistry> {
    let mut builder = DestinationRegistry::builder(&config.queue_prefix);
    if config.topics_file.exists() {
        builder = builder.load_catalog(&config.topics_file)?;
    } else {
        warn!(path = %config.topics_file.display(), "topic catalog not found, no topics registered");
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "topicq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    if config.driver == DriverKind::Memory {
        warn!("using the in-memory driver; nothing outlives this process");
    }

    match cli.command {
        Command::Provision => cmd_provision(&config).await,
        Command::Send {
            topic,
            body,
            properties,
            priority,
            delay_ms,
        } => cmd_send(&config, topic, body, properties, priority, delay_ms).await,
        Command::Drain {
            queue,
            message_limit,
            time_limit,
        } => cmd_drain(&config, queue, message_limit, time_limit).await,
    }
}

async fn cmd_provision(config: &Config) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let driver = driver::connect(config).await?;

    let report = provision_queues(&registry, driver.as_ref(), |queue| println!("{queue}")).await;

    for failure in &report.failed {
        eprintln!("failed: {} ({})", failure.queue, failure.error);
    }
    if !report.is_success() {
        anyhow::bail!(
            "{} of {} queue(s) failed to provision",
            report.failed.len(),
            report.failed.len() + report.created.len()
        );
    }
    Ok(())
}

async fn cmd_send(
    config: &Config,
    topic: String,
    body: Option<String>,
    properties: Vec<(String, PropertyValue)>,
    priority: Option<Priority>,
    delay_ms: Option<u64>,
) -> anyhow::Result<()> {
    let registry = Arc::new(load_registry(config)?);
    let driver = driver::connect(config).await?;
    if config.driver == DriverKind::Memory {
        provision_queues(&registry, driver.as_ref(), |_| {}).await;
    }
    let producer = Producer::new(registry, driver);

    let body: serde_json::Value = match body {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut outgoing = OutgoingMessage::new(body);
    for (key, value) in properties {
        outgoing = outgoing.property(key, value);
    }
    if let Some(priority) = priority {
        outgoing = outgoing.priority(priority);
    }
    if let Some(ms) = delay_ms {
        outgoing = outgoing.delay(Duration::from_millis(ms));
    }

    let id = producer.publish(&topic, outgoing).await?;
    println!("Sent: {id} → {topic}");
    Ok(())
}

async fn cmd_drain(
    config: &Config,
    queues: Vec<String>,
    message_limit: Option<u64>,
    time_limit: Option<u64>,
) -> anyhow::Result<()> {
    let registry = load_registry(config)?;
    let queues = if queues.is_empty() {
        registry.queues().into_iter().map(|(name, _)| name).collect()
    } else {
        queues
    };
    if queues.is_empty() {
        anyhow::bail!("no queues to drain");
    }

    let topics = queues
        .iter()
        .flat_map(|q| registry.topics_for_queue(q))
        .map(str::to_string)
        .collect();
    let processors = ProcessorRegistry::builder()
        .register(DrainProcessor { topics })
        .build();

    let driver = driver::connect(config).await?;
    if config.driver == DriverKind::Memory {
        provision_queues(&registry, driver.as_ref(), |_| {}).await;
    }
    let consumer = Consumer::new(
        driver,
        Arc::new(processors),
        ConsumerConfig {
            message_limit,
            time_limit: time_limit.map(Duration::from_secs),
            ..ConsumerConfig::from(config)
        },
    );

    let stopper = consumer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    let mut handles = Vec::new();
    for queue in queues {
        let consumer = consumer.clone();
        handles.push(tokio::spawn(async move {
            let report = consumer.run(&queue).await;
            (queue, report)
        }));
    }

    let mut failed = false;
    for handle in handles {
        let (queue, report) = handle.await?;
        match report {
            Ok(report) => println!(
                "{queue}: {} received, {} acknowledged",
                report.received, report.acknowledged
            ),
            Err(e) => {
                eprintln!("{queue}: {e}");
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("one or more consumers stopped on a transport error");
    }
    Ok(())
}
