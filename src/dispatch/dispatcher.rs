use std::{collections::BTreeSet, sync::Arc};

use bytes::Bytes;
use chrono::Utc;
use tracing::debug;
use typebus_error::{BrokerError, DispatchError, ErrorExt};

use super::{MessageIntent, OutgoingMessage, Routing, TransportOperation, TransportOperations};
use crate::{
    broker::{BrokerProducer, RecordPosition},
    context::{ContextBag, TransportTransaction},
    envelope::{
        header,
        headers::{set_time_sent, set_time_to_be_received},
        EnvelopeCodec, Headers,
    },
    hierarchy::TypeRegistry,
    logging::log_by_status,
    routing::validate_topic_name,
    subscription::SubscriptionStore,
};

/// Итог одной операции.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub message_id: String,
    pub intent: MessageIntent,
    /// Позиции записанных записей; пусто для публикации без подписчиков.
    pub positions: Vec<RecordPosition>,
}

/// Итог вызова `dispatch`, по операциям в исходном порядке.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub operations: Vec<OperationOutcome>,
}

impl DispatchOutcome {
    pub fn total_writes(&self) -> usize {
        self.operations.iter().map(|o| o.positions.len()).sum()
    }
}

/// Превращает send/publish в записи брокера.
///
/// Send пишет ровно одну запись в топик получателя. Publish пишет по одной
/// записи в топик каждого предка типа, на который есть подписка; все записи
/// несут один и тот же `MessageId`. Между топиками атомарности нет: уже
/// записанное при частичном сбое не откатывается.
pub struct Dispatcher {
    local_topic: String,
    producer: Arc<dyn BrokerProducer>,
    registry: Arc<TypeRegistry>,
    store: Arc<dyn SubscriptionStore>,
    codec: &'static EnvelopeCodec,
}

impl Dispatcher {
    pub fn new(
        local_topic: impl Into<String>,
        producer: Arc<dyn BrokerProducer>,
        registry: Arc<TypeRegistry>,
        store: Arc<dyn SubscriptionStore>,
        codec: &'static EnvelopeCodec,
    ) -> Self {
        Self {
            local_topic: local_topic.into(),
            producer,
            registry,
            store,
            codec,
        }
    }

    /// Выполняет операции по порядку, останавливаясь на первой ошибке.
    ///
    /// Транзакция и контекст передаются насквозь и не читаются: транспорт
    /// работает в режиме receive-only.
    pub async fn dispatch(
        &self,
        operations: impl Into<TransportOperations>,
        _transaction: &TransportTransaction,
        _context: &ContextBag,
    ) -> Result<DispatchOutcome, DispatchError> {
        let operations: TransportOperations = operations.into();
        let mut outcome = DispatchOutcome::default();
        for op in operations {
            let positions = match &op.routing {
                Routing::Send(address) => {
                    let topic = address.to_topic()?;
                    vec![self.unicast(&op, &topic).await?]
                }
                Routing::Reply(topic) => {
                    validate_topic_name(topic)?;
                    vec![self.unicast(&op, topic).await?]
                }
                Routing::Publish => self.multicast(&op).await?,
            };
            outcome.operations.push(OperationOutcome {
                message_id: op.message.message_id.clone(),
                intent: op.intent(),
                positions,
            });
        }
        Ok(outcome)
    }

    async fn unicast(
        &self,
        op: &TransportOperation,
        topic: &str,
    ) -> Result<RecordPosition, DispatchError> {
        let payload = self.encode(&op.message, op.intent())?;
        let position = self
            .producer
            .produce(topic, None, payload)
            .await
            .map_err(|source| DispatchError::Broker {
                topic: topic.to_string(),
                source,
            })?;
        debug!(
            message_id = %op.message.message_id,
            message_type = %op.message.message_type,
            intent = %op.intent(),
            topic,
            partition = position.partition,
            offset = position.offset,
            "Message sent"
        );
        Ok(position)
    }

    async fn multicast(
        &self,
        op: &TransportOperation,
    ) -> Result<Vec<RecordPosition>, DispatchError> {
        let message = &op.message;
        let ancestry = self.registry.ancestry(message.message_type.as_str())?;

        // Набор топиков фиксируется до первой записи: подписки, изменённые
        // после этого момента, на публикацию не влияют.
        let mut topics = BTreeSet::new();
        for ancestor in ancestry.iter() {
            let found = self
                .store
                .topics_for(ancestor.as_str())
                .await
                .map_err(|e| DispatchError::Store {
                    reason: e.to_string(),
                })?;
            topics.extend(found);
        }

        if topics.is_empty() {
            debug!(
                message_id = %message.message_id,
                message_type = %message.message_type,
                "No subscribers, publish is a no-op"
            );
            return Ok(Vec::new());
        }

        let payload = self.encode(message, MessageIntent::Publish)?;
        let mut delivered: Vec<RecordPosition> = Vec::with_capacity(topics.len());
        let mut failed: Vec<(String, BrokerError)> = Vec::new();

        for topic in topics {
            match self.producer.produce(&topic, None, payload.clone()).await {
                Ok(position) => {
                    debug!(
                        message_id = %message.message_id,
                        message_type = %message.message_type,
                        topic = %topic,
                        partition = position.partition,
                        offset = position.offset,
                        "Message published"
                    );
                    delivered.push(position);
                }
                Err(err) => {
                    log_by_status!(
                        err.status_code(),
                        message_id = %message.message_id,
                        topic = %topic,
                        error = %err,
                        "Publish to topic failed"
                    );
                    failed.push((topic, err));
                }
            }
        }

        if failed.is_empty() {
            return Ok(delivered);
        }
        if delivered.is_empty() && failed.len() == 1 {
            let (topic, source) = failed.remove(0);
            return Err(DispatchError::Broker { topic, source });
        }
        Err(DispatchError::PartialFanout {
            message_id: message.message_id.clone(),
            delivered: delivered.into_iter().map(|p| p.topic.to_string()).collect(),
            failed,
        })
    }

    /// Заголовки окончательно формируются здесь, до первой записи.
    fn encode(
        &self,
        message: &OutgoingMessage,
        intent: MessageIntent,
    ) -> Result<Bytes, DispatchError> {
        let headers = self.finalize_headers(message, intent);
        Ok(self.codec.encode(&headers, &message.body)?)
    }

    fn finalize_headers(
        &self,
        message: &OutgoingMessage,
        intent: MessageIntent,
    ) -> Headers {
        let mut headers = message.headers.clone();
        let type_name = message.message_type.to_string();
        headers.insert(header::MESSAGE_ID.to_string(), message.message_id.clone());
        headers.insert(header::CORRELATION_ID.to_string(), type_name.clone());
        headers.insert(header::ENCLOSED_MESSAGE_TYPES.to_string(), type_name);
        headers.insert(header::MESSAGE_INTENT.to_string(), intent.to_string());
        set_time_sent(&mut headers, Utc::now());
        if let Some(ttl) = message.time_to_be_received() {
            set_time_to_be_received(&mut headers, ttl);
        }
        if intent == MessageIntent::Send {
            headers
                .entry(header::REPLY_TO_ADDRESS.to_string())
                .or_insert_with(|| self.local_topic.clone());
        }
        headers
    }
}
