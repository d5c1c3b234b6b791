use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use typebus_error::{DecodeError, HandlerError, PumpError};

use super::{
    handler::{IncomingMessage, MessageHandler},
    poison::{parked_envelope, PoisonAction, PoisonMessagePolicy},
    stats::PumpStats,
    topics::TopicUse,
    PumpSettings,
};
use crate::{
    broker::{BrokerConsumer, BrokerProducer, BrokerRecord},
    context::{ContextBag, TransportTransaction},
    envelope::{headers::is_expired, EnvelopeCodec},
};

/// Как воркер завершился.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    Stopped,
    Faulted(PumpError),
    Panicked,
}

/// Судьба одной записи.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acknowledge,
    Redeliver,
}

/// Один воркер насоса: собственный потребитель группы, одна запись в
/// обработке за раз.
pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) consumer: Box<dyn BrokerConsumer>,
    pub(crate) producer: Arc<dyn BrokerProducer>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) poison: Arc<dyn PoisonMessagePolicy>,
    pub(crate) codec: &'static EnvelopeCodec,
    pub(crate) settings: Arc<PumpSettings>,
    pub(crate) stats: Arc<PumpStats>,
    pub(crate) topics: watch::Receiver<BTreeMap<String, TopicUse>>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// Цикл воркера. Потребитель закрывается на любом пути выхода.
    pub(crate) async fn run(mut self) -> WorkerExit {
        debug!(worker = self.index, "Worker started");
        let exit = self.run_loop().await;
        self.consumer.close().await;
        debug!(worker = self.index, ?exit, "Worker finished");
        exit
    }

    async fn run_loop(&mut self) -> WorkerExit {
        let mut failures: u32 = 0;
        let mut resubscribe = false;

        loop {
            if self.is_shutting_down() {
                return WorkerExit::Stopped;
            }

            if self.topics.has_changed().unwrap_or(false) {
                resubscribe = true;
            }
            if resubscribe {
                let names: Vec<String> = self.topics.borrow_and_update().keys().cloned().collect();
                match self.consumer.subscribe(&names).await {
                    Ok(()) => {
                        resubscribe = false;
                        debug!(worker = self.index, topics = ?names, "Consumer resubscribed");
                    }
                    Err(err) => {
                        if let Some(exit) = self.on_broker_failure(&mut failures, err).await {
                            return exit;
                        }
                        continue;
                    }
                }
            }

            let polled = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return WorkerExit::Stopped,
                polled = self.consumer.poll(self.settings.batch_size, self.settings.poll_timeout) => polled,
            };

            match polled {
                Ok(records) => {
                    failures = 0;
                    if !records.is_empty() {
                        self.process_batch(records).await;
                    }
                }
                Err(err) => {
                    if let Some(exit) = self.on_broker_failure(&mut failures, err).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Учитывает сбой связи с брокером. Возвращает `Some`, если воркер должен
    /// завершиться.
    async fn on_broker_failure(
        &mut self,
        failures: &mut u32,
        err: typebus_error::BrokerError,
    ) -> Option<WorkerExit> {
        *failures += 1;
        self.stats.record_poll_failure();
        if *failures >= self.settings.max_poll_failures {
            error!(
                worker = self.index,
                failures = *failures,
                error = %err,
                "Broker unreachable, giving up"
            );
            return Some(WorkerExit::Faulted(PumpError::Faulted {
                failures: *failures,
                last: err,
            }));
        }
        warn!(
            worker = self.index,
            failures = *failures,
            error = %err,
            "Poll failed, retrying"
        );
        if self.pause(self.settings.poll_retry_delay).await {
            return Some(WorkerExit::Stopped);
        }
        None
    }

    /// Обрабатывает пачку по порядку. После неудачи в партиции её остаток
    /// в пачке пропускается, а чтение перематывается на неудачную запись.
    async fn process_batch(
        &mut self,
        records: Vec<BrokerRecord>,
    ) {
        let mut blocked = HashSet::new();

        for record in records {
            if self.is_shutting_down() {
                break;
            }
            let partition = (
                Arc::clone(&record.position.topic),
                record.position.partition,
            );
            if blocked.contains(&partition) {
                continue;
            }

            match self.process(&record).await {
                Outcome::Acknowledge => self.commit(&record).await,
                Outcome::Redeliver => {
                    if let Err(err) = self.consumer.seek(&record.position).await {
                        warn!(
                            worker = self.index,
                            position = %record.position,
                            error = %err,
                            "Failed to rewind partition"
                        );
                    }
                    blocked.insert(partition);
                }
            }
        }

        if !blocked.is_empty() {
            self.pause(self.settings.redelivery_delay).await;
        }
    }

    async fn process(
        &mut self,
        record: &BrokerRecord,
    ) -> Outcome {
        let envelope = match self.codec.decode(&record.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    worker = self.index,
                    topic = %record.position.topic,
                    partition = record.position.partition,
                    offset = record.position.offset,
                    error = %err,
                    "Failed to decode record"
                );
                return self.on_poison(record, &err).await;
            }
        };

        if self.settings.discard_expired && is_expired(&envelope.headers, Utc::now()) {
            self.stats.record_discarded();
            info!(
                worker = self.index,
                position = %record.position,
                message_id = envelope.message_id().unwrap_or_default(),
                "Discarding expired message"
            );
            return Outcome::Acknowledge;
        }

        let message = IncomingMessage::new(envelope, record.position.clone());
        let message_id = message.message_id().unwrap_or_default().to_string();
        let message_type = message.message_type().unwrap_or_default().to_string();

        let handler = Arc::clone(&self.handler);
        let invocation = tokio::spawn(async move {
            let mut transaction = TransportTransaction::new();
            let mut context = ContextBag::new();
            handler.handle(message, &mut transaction, &mut context).await
        });
        let result = match invocation.await {
            Ok(result) => result,
            Err(join) => Err(HandlerError::new(format!("handler panicked: {join}"))),
        };

        match result {
            Ok(()) => {
                self.stats.record_delivered();
                debug!(
                    worker = self.index,
                    position = %record.position,
                    %message_id,
                    %message_type,
                    "Message handled"
                );
                Outcome::Acknowledge
            }
            Err(err) => {
                self.stats.record_failed();
                warn!(
                    worker = self.index,
                    position = %record.position,
                    %message_id,
                    %message_type,
                    error = %err,
                    "Handler failed, message will be redelivered"
                );
                Outcome::Redeliver
            }
        }
    }

    async fn on_poison(
        &mut self,
        record: &BrokerRecord,
        err: &DecodeError,
    ) -> Outcome {
        match self.poison.on_decode_failure(record, err) {
            PoisonAction::Acknowledge => {
                self.stats.record_poison_acknowledged();
                Outcome::Acknowledge
            }
            PoisonAction::Park { error_topic } => {
                let envelope = parked_envelope(record, err);
                let payload = match self.codec.encode_envelope(&envelope) {
                    Ok(payload) => payload,
                    Err(encode) => {
                        // Повтор не поможет: запись не помещается в конверт.
                        error!(
                            worker = self.index,
                            position = %record.position,
                            error = %encode,
                            "Cannot park record, acknowledging"
                        );
                        self.stats.record_poison_acknowledged();
                        return Outcome::Acknowledge;
                    }
                };
                match self.producer.produce(&error_topic, None, payload).await {
                    Ok(parked_at) => {
                        self.stats.record_parked();
                        info!(
                            worker = self.index,
                            position = %record.position,
                            parked_at = %parked_at,
                            "Record parked"
                        );
                        Outcome::Acknowledge
                    }
                    Err(produce) => {
                        warn!(
                            worker = self.index,
                            position = %record.position,
                            error_topic = %error_topic,
                            error = %produce,
                            "Failed to park record, will retry"
                        );
                        Outcome::Redeliver
                    }
                }
            }
        }
    }

    async fn commit(
        &mut self,
        record: &BrokerRecord,
    ) {
        if let Err(err) = self.consumer.commit(&record.position).await {
            warn!(
                worker = self.index,
                position = %record.position,
                error = %err,
                "Commit failed"
            );
        }
    }

    /// Пауза, прерываемая остановкой. `true`, если пришёл сигнал остановки.
    async fn pause(
        &mut self,
        duration: Duration,
    ) -> bool {
        if duration.is_zero() {
            return self.is_shutting_down();
        }
        tokio::select! {
            _ = self.shutdown.changed() => true,
            _ = tokio::time::sleep(duration) => self.is_shutting_down(),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
