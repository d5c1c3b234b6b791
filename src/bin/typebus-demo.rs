//! Демонстрация typebus поверх брокера в памяти процесса или, при сборке с
//! фичей `kafka` и адресе `kafka://...`, поверх кластера Kafka.
//!
//! `pubsub` поднимает три endpoint'а (sales публикует, billing и audit
//! подписываются на разные уровни иерархии) и печатает статистику насосов.
//! `check` загружает настройки и выполняет проверку на старте.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use typebus::{
    handler_fn, init_logging, BrokerConnector, ContextBag, InMemoryBroker, InMemorySubscriptionStore,
    IncomingMessage, OutgoingMessage, TransportInfrastructure, TransportOperation,
    TransportSettings, TransportTransaction, TypeDescriptor, TypeRegistry,
};

#[derive(Parser)]
#[command(name = "typebus-demo")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "typebus demo on an in-process broker or Kafka", long_about = None)]
struct Cli {
    /// Файл настроек (TOML, YAML или JSON)
    #[arg(short, long, env = "TYPEBUS_CONFIG")]
    config: Option<PathBuf>,
    /// Уровень логирования
    #[arg(short, long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Публикация и получение событий тремя endpoint'ами
    Pubsub {
        /// Сколько событий опубликовать
        #[arg(short = 'n', long, default_value = "10")]
        messages: usize,
        /// Воркеров на endpoint
        #[arg(short, long, default_value = "2")]
        workers: usize,
        /// Партиций в создаваемых топиках
        #[arg(short, long, default_value = "4")]
        partitions: u32,
    },
    /// Загрузить настройки и проверить связь с брокером
    Check,
}

/// Брокер по адресу из настроек.
fn connector(settings: &TransportSettings) -> Result<Arc<dyn BrokerConnector>> {
    let address = settings.broker_address.as_str();
    if address.starts_with("kafka://") {
        #[cfg(feature = "kafka")]
        return Ok(Arc::new(typebus::KafkaConnector::new(address)));
        #[cfg(not(feature = "kafka"))]
        bail!("'{address}' needs a build with the `kafka` feature");
    }
    Ok(Arc::new(InMemoryBroker::builder().address(address).build()))
}

fn registry(settings: &TransportSettings) -> Result<TypeRegistry> {
    let mut builder = TypeRegistry::builder().universal_root(settings.universal_root.as_str());
    if let Some(marker) = &settings.catch_all_marker {
        builder = builder.catch_all_marker(marker.as_str());
    }
    let registry = builder
        .register(TypeDescriptor::interface("Sales.IOrderEvent"))
        .register(TypeDescriptor::class("Sales.OrderEvent").implements("Sales.IOrderEvent"))
        .register(TypeDescriptor::class("Sales.OrderPlaced").extends("Sales.OrderEvent"))
        .register(TypeDescriptor::class("Sales.OrderCancelled").extends("Sales.OrderEvent"))
        .build()
        .context("building type registry")?;
    Ok(registry)
}

fn load_settings(cli: &Cli) -> Result<TransportSettings> {
    let settings = match &cli.config {
        Some(path) => TransportSettings::load_from(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => TransportSettings::new("sales", "memory"),
    };
    Ok(settings)
}

async fn run_pubsub(
    base: TransportSettings,
    messages: usize,
    workers: usize,
    partitions: u32,
) -> Result<()> {
    let broker = connector(&base)?;
    let store = Arc::new(InMemorySubscriptionStore::new());
    let registry = Arc::new(registry(&base)?);

    let endpoint = |name: &str| {
        let settings = TransportSettings {
            endpoint_name: name.to_string(),
            max_concurrency: workers,
            partitions,
            ..base.clone()
        };
        TransportInfrastructure::new(
            settings,
            Arc::clone(&broker),
            Arc::clone(&registry),
            store.clone(),
        )
    };
    let sales = endpoint("sales")?;
    let billing = endpoint("billing")?;
    let audit = endpoint("audit")?;

    for (infra, interest) in [(&billing, "Sales.OrderPlaced"), (&audit, "Sales.IOrderEvent")] {
        infra
            .subscription_manager()
            .await?
            .subscribe(interest, &ContextBag::new())
            .await
            .with_context(|| format!("subscribing to {interest}"))?;
        let name = infra.settings().endpoint_name.clone();
        infra
            .start_receiving(
                Arc::new(handler_fn(move |msg: IncomingMessage| {
                    let name = name.clone();
                    async move {
                        info!(
                            endpoint = %name,
                            message_type = msg.message_type().unwrap_or_default(),
                            message_id = msg.message_id().unwrap_or_default(),
                            position = %msg.position,
                            "Received"
                        );
                        Ok(())
                    }
                })),
                None,
            )
            .await?;
    }

    let dispatcher = sales.dispatcher().await?;
    for i in 0..messages {
        let message_type = if i % 3 == 2 {
            "Sales.OrderCancelled"
        } else {
            "Sales.OrderPlaced"
        };
        let message = OutgoingMessage::builder(message_type)
            .body(format!("{{\"order\":{i}}}"))
            .time_to_be_received(Duration::from_secs(60))
            .build();
        let outcome = dispatcher
            .dispatch(
                TransportOperation::publish(message),
                &TransportTransaction::new(),
                &ContextBag::new(),
            )
            .await?;
        debug!(writes = outcome.total_writes(), message_type, "Published");
    }

    let placed = messages - messages / 3;
    let expected = [(&billing, placed as u64), (&audit, messages as u64)];
    tokio::time::timeout(Duration::from_secs(10), async {
        while expected
            .iter()
            .any(|(infra, n)| infra.pump().stats().delivered < *n)
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("endpoints did not receive all messages in time")?;

    for infra in [&billing, &audit] {
        infra.stop_receiving().await?;
        let stats = infra.pump().stats();
        println!(
            "{:<8} delivered={} failed={} discarded={} parked={}",
            infra.settings().endpoint_name,
            stats.delivered,
            stats.failed,
            stats.discarded,
            stats.parked
        );
    }
    Ok(())
}

async fn run_check(settings: TransportSettings) -> Result<()> {
    let infra = TransportInfrastructure::new(
        settings.clone(),
        connector(&settings)?,
        Arc::new(registry(&settings)?),
        Arc::new(InMemorySubscriptionStore::new()),
    )?;
    infra.startup_check().await?;
    println!("endpoint:  {}", settings.endpoint_name);
    println!("topic:     {}", infra.local_topic());
    println!("broker:    {}", settings.broker_address);
    println!("workers:   {}", settings.max_concurrency);
    println!("error:     {}", settings.error_topic().unwrap_or("<disabled>"));
    println!("types:     {}", infra.registry().len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(&cli)?;
    settings.logging.level = cli.log_level.clone();
    let logging = init_logging(settings.logging.clone())?;

    let result = match cli.command {
        Commands::Pubsub {
            messages,
            workers,
            partitions,
        } => {
            if workers == 0 || partitions == 0 {
                bail!("workers and partitions must be positive");
            }
            run_pubsub(settings, messages, workers, partitions).await
        }
        Commands::Check => run_check(settings).await,
    };

    logging.shutdown();
    result
}
