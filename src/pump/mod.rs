//! Насос сообщений: чтение топиков endpoint'а, декодирование конвертов,
//! вызов обработчика и фиксация прогресса.
//!
//! Доставка «как минимум один раз»: смещение фиксируется только после
//! успешной обработки. Воркеры независимы, каждый держит своего потребителя
//! в группе endpoint'а и потому читает непересекающиеся партиции.

pub mod handler;
pub mod poison;
pub mod state;
pub mod stats;
pub mod topics;
mod worker;

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, info_span, warn, Instrument};
use typebus_error::{BrokerError, ErrorExt, PumpError};

pub use handler::{handler_fn, FnHandler, IncomingMessage, MessageHandler};
pub use poison::{default_policy, LogAndAcknowledge, ParkInErrorTopic, PoisonAction, PoisonMessagePolicy};
pub use state::PumpState;
pub use stats::{PumpStats, PumpStatsSnapshot};
pub use topics::{ConsumedTopics, TopicUse};

use self::worker::{Worker, WorkerExit};
use crate::{
    broker::{BrokerConnector, BrokerConsumer, BrokerProducer, OffsetReset},
    config::TransportSettings,
    envelope::EnvelopeCodec,
    logging::log_by_status,
};

/// Параметры насоса.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpSettings {
    /// Имя endpoint'а; оно же имя группы потребителей.
    pub endpoint: String,
    /// Число параллельных воркеров.
    pub workers: usize,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Пауза после неудачного чтения.
    pub poll_retry_delay: Duration,
    /// Столько неудачных чтений подряд переводят насос в `Faulted`.
    pub max_poll_failures: u32,
    /// Пауза перед повторной доставкой после ошибки обработчика.
    pub redelivery_delay: Duration,
    pub stop_timeout: Duration,
    pub offset_reset: OffsetReset,
    /// Подтверждать без обработки сообщения с истёкшим TTL.
    pub discard_expired: bool,
}

impl PumpSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            workers: 1,
            batch_size: 100,
            poll_timeout: Duration::from_millis(250),
            poll_retry_delay: Duration::from_millis(200),
            max_poll_failures: 10,
            redelivery_delay: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(30),
            offset_reset: OffsetReset::Earliest,
            discard_expired: true,
        }
    }
}

impl From<&TransportSettings> for PumpSettings {
    fn from(s: &TransportSettings) -> Self {
        Self {
            endpoint: s.endpoint_name.clone(),
            workers: s.max_concurrency.max(1),
            batch_size: s.poll_batch_size.max(1),
            poll_timeout: Duration::from_millis(s.poll_timeout_ms),
            poll_retry_delay: Duration::from_millis(s.poll_retry_delay_ms),
            max_poll_failures: s.max_poll_failures.max(1),
            redelivery_delay: Duration::from_millis(s.redelivery_delay_ms),
            stop_timeout: Duration::from_millis(s.stop_timeout_ms),
            offset_reset: s.offset_reset,
            discard_expired: s.discard_expired,
        }
    }
}

struct RunningPump {
    shutdown: Arc<watch::Sender<bool>>,
    supervisor: JoinHandle<()>,
}

type Connected = (Arc<dyn BrokerProducer>, Vec<Box<dyn BrokerConsumer>>);

/// Насос сообщений endpoint'а.
///
/// `start`/`stop` сериализуются между собой. Остановка кооперативная:
/// обработчики не прерываются, ожидание ограничено `stop_timeout`.
pub struct MessagePump {
    settings: Arc<PumpSettings>,
    connector: Arc<dyn BrokerConnector>,
    topics: ConsumedTopics,
    codec: &'static EnvelopeCodec,
    state: Arc<watch::Sender<PumpState>>,
    stats: Arc<PumpStats>,
    last_error: Arc<Mutex<Option<PumpError>>>,
    lifecycle: tokio::sync::Mutex<Option<RunningPump>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl MessagePump {
    pub fn new(
        settings: PumpSettings,
        connector: Arc<dyn BrokerConnector>,
        topics: ConsumedTopics,
        codec: &'static EnvelopeCodec,
    ) -> Self {
        let (state, _) = watch::channel(PumpState::Stopped);
        Self {
            settings: Arc::new(settings),
            connector,
            topics,
            codec,
            state: Arc::new(state),
            stats: Arc::new(PumpStats::new()),
            last_error: Arc::new(Mutex::new(None)),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Подключает воркеров и начинает доставку.
    ///
    /// Допустим только из `Stopped`. Ошибка подключения возвращает насос в
    /// `Stopped`; уже созданные потребители закрываются.
    pub async fn start(
        &self,
        handler: Arc<dyn MessageHandler>,
        poison: Arc<dyn PoisonMessagePolicy>,
    ) -> Result<(), PumpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if current != PumpState::Stopped {
            return Err(PumpError::InvalidState {
                expected: PumpState::Stopped.as_str(),
                actual: current.to_string(),
            });
        }
        if let Some(previous) = lifecycle.take() {
            let _ = previous.supervisor.await;
        }

        self.state.send_replace(PumpState::Starting);
        self.last_error.lock().take();
        info!(
            endpoint = %self.settings.endpoint,
            workers = self.settings.workers,
            "Starting message pump"
        );

        let topics_rx = self.topics.watch();
        let (producer, consumers) = match self.connect_workers().await {
            Ok(connected) => connected,
            Err(err) => {
                error!(endpoint = %self.settings.endpoint, error = %err, "Pump failed to connect");
                self.state.send_replace(PumpState::Stopped);
                return Err(PumpError::Connect(err));
            }
        };

        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        self.state.send_replace(PumpState::Running);

        for (index, consumer) in consumers.into_iter().enumerate() {
            let worker = Worker {
                index,
                consumer,
                producer: Arc::clone(&producer),
                handler: Arc::clone(&handler),
                poison: Arc::clone(&poison),
                codec: self.codec,
                settings: Arc::clone(&self.settings),
                stats: Arc::clone(&self.stats),
                topics: topics_rx.clone(),
                shutdown: shutdown.subscribe(),
            };
            let span = info_span!("pump_worker", endpoint = %self.settings.endpoint, worker = index);
            let handle = tokio::spawn(worker.run().instrument(span));

            let exit_tx = exit_tx.clone();
            tokio::spawn(async move {
                let exit = match handle.await {
                    Ok(exit) => exit,
                    Err(join) => {
                        error!(worker = index, error = %join, "Pump worker panicked");
                        WorkerExit::Panicked
                    }
                };
                let _ = exit_tx.send((index, exit));
            });
        }
        drop(exit_tx);

        let supervisor = tokio::spawn(supervise(
            exit_rx,
            Arc::clone(&self.state),
            Arc::clone(&shutdown),
            Arc::clone(&self.last_error),
        ));
        *lifecycle = Some(RunningPump {
            shutdown,
            supervisor,
        });

        info!(endpoint = %self.settings.endpoint, topics = ?self.topics.snapshot(), "Message pump running");
        Ok(())
    }

    /// Останавливает насос и ждёт завершения воркеров не дольше
    /// `stop_timeout`.
    ///
    /// Повторный вызов после таймаута продолжает ожидание. Остановка
    /// остановленного насоса ничего не делает.
    pub async fn stop(&self) -> Result<(), PumpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.as_mut() else {
            return Ok(());
        };

        self.state.send_if_modified(|state| {
            if *state == PumpState::Running {
                *state = PumpState::Stopping;
                true
            } else {
                false
            }
        });
        running.shutdown.send_replace(true);
        info!(endpoint = %self.settings.endpoint, "Stopping message pump");

        match tokio::time::timeout(self.settings.stop_timeout, &mut running.supervisor).await {
            Ok(_) => {
                lifecycle.take();
                Ok(())
            }
            Err(_) => {
                let timeout_ms = self.settings.stop_timeout.as_millis() as u64;
                warn!(
                    endpoint = %self.settings.endpoint,
                    timeout_ms,
                    "Pump did not stop in time, handlers still running"
                );
                Err(PumpError::StopTimeout { timeout_ms })
            }
        }
    }

    pub fn state(&self) -> PumpState {
        *self.state.borrow()
    }

    /// Наблюдатель за сменой состояний.
    pub fn watch_state(&self) -> watch::Receiver<PumpState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> PumpStatsSnapshot {
        self.stats.snapshot()
    }

    /// Причина последнего перехода в `Faulted`.
    pub fn last_error(&self) -> Option<PumpError> {
        self.last_error.lock().clone()
    }

    pub fn topics(&self) -> &ConsumedTopics {
        &self.topics
    }

    pub fn settings(&self) -> &PumpSettings {
        &self.settings
    }

    /// Производитель для парковки и по потребителю на воркера, каждый уже
    /// подписан на текущий набор топиков.
    async fn connect_workers(&self) -> Result<Connected, BrokerError> {
        let producer = self.connector.producer().await?;
        let topics = self.topics.snapshot();
        let mut consumers: Vec<Box<dyn BrokerConsumer>> = Vec::with_capacity(self.settings.workers);

        for index in 0..self.settings.workers {
            let connected = async {
                let mut consumer = self
                    .connector
                    .consumer(
                        &self.settings.endpoint,
                        &index.to_string(),
                        self.settings.offset_reset,
                    )
                    .await?;
                if let Err(err) = consumer.subscribe(&topics).await {
                    consumer.close().await;
                    return Err(err);
                }
                Ok::<_, BrokerError>(consumer)
            }
            .await;

            match connected {
                Ok(consumer) => consumers.push(consumer),
                Err(err) => {
                    for mut consumer in consumers {
                        consumer.close().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok((producer, consumers))
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut() {
            running.shutdown.send_replace(true);
        }
    }
}

/// Ждёт завершения всех воркеров. Сбой одного воркера переводит насос в
/// `Faulted` и останавливает остальных.
async fn supervise(
    mut exits: mpsc::UnboundedReceiver<(usize, WorkerExit)>,
    state: Arc<watch::Sender<PumpState>>,
    shutdown: Arc<watch::Sender<bool>>,
    last_error: Arc<Mutex<Option<PumpError>>>,
) {
    while let Some((worker, exit)) = exits.recv().await {
        let fault = match exit {
            WorkerExit::Stopped => None,
            WorkerExit::Faulted(err) => Some(err),
            WorkerExit::Panicked => Some(PumpError::WorkerPanicked { worker }),
        };
        let Some(err) = fault else {
            continue;
        };

        log_by_status!(err.status_code(), worker, error = %err, "Pump faulted");
        last_error.lock().get_or_insert(err);
        state.send_if_modified(|s| {
            if *s == PumpState::Running {
                *s = PumpState::Faulted;
                true
            } else {
                false
            }
        });
        shutdown.send_replace(true);
    }

    state.send_replace(PumpState::Stopped);
    info!("Message pump stopped");
}
