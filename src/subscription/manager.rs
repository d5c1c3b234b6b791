use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use typebus_error::{ErrorExt, ProvisionError, SubscriptionError};

use super::{Subscription, SubscriptionStore};
use crate::{
    context::ContextBag, hierarchy::TypeName, logging::log_by_status, provision::TopicProvisioner,
    pump::ConsumedTopics, routing::type_topic,
};

/// Подписка и отписка endpoint'а на типы сообщений.
///
/// Разрешение «push при подписке»: подписка на тип `I` записывает ровно
/// одну пару `(I, topic(I))`, а насос endpoint'а начинает читать этот топик.
/// Публикация типа `T` затем пишет в топики всех предков `T`, у которых
/// есть подписки.
///
/// Вызовы для одного и того же типа сериализуются; для разных типов
/// выполняются параллельно.
pub struct SubscriptionManager {
    endpoint: String,
    store: Arc<dyn SubscriptionStore>,
    provisioner: Arc<TopicProvisioner>,
    consumed: ConsumedTopics,
    locks: DashMap<TypeName, Arc<Mutex<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        endpoint: impl Into<String>,
        store: Arc<dyn SubscriptionStore>,
        provisioner: Arc<TopicProvisioner>,
        consumed: ConsumedTopics,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            store,
            provisioner,
            consumed,
            locks: DashMap::new(),
        }
    }

    /// Подписывает endpoint на `event_type`. Идемпотентна.
    ///
    /// Тип не обязан быть зарегистрирован в реестре: подписка на тип, который
    /// никто не публикует, просто ничего не получает. Новая подписка видит
    /// только публикации после своего подтверждения: до записи в хранилище
    /// группа endpoint'а ставится на конец топика типа.
    pub async fn subscribe(
        &self,
        event_type: &str,
        _context: &ContextBag,
    ) -> Result<(), SubscriptionError> {
        let interest = TypeName::new(event_type);
        let record = self.record_for(&interest)?;

        let lock = self.lock_for(&interest);
        let guard = lock.lock().await;

        let result = async {
            self.provisioner
                .ensure_topics(&[record.topic.as_str()])
                .await
                .map_err(|e| provision_error(&interest, e))?;

            if self.store.contains(&record).await? {
                // Запись могла остаться с прошлого запуска: читаем топик с
                // зафиксированного прогресса.
                self.consumed.add(&record.topic);
                debug!(message_type = %interest, "Already subscribed");
                return Ok(());
            }

            self.provisioner
                .admin()
                .commit_end_offsets(&self.endpoint, &record.topic)
                .await
                .map_err(|source| SubscriptionError::Offsets {
                    topic: record.topic.clone(),
                    source,
                })?;
            self.store.add(&record).await?;
            self.consumed.add(&record.topic);
            info!(
                endpoint = %self.endpoint,
                message_type = %interest,
                topic = %record.topic,
                "Subscribed"
            );
            Ok::<(), SubscriptionError>(())
        }
        .await;

        drop(guard);
        drop(lock);
        self.release_lock(&interest);
        result
    }

    /// Отписывает endpoint от `event_type`. Отписка от несуществующей
    /// подписки ничего не делает.
    pub async fn unsubscribe(
        &self,
        event_type: &str,
        _context: &ContextBag,
    ) -> Result<(), SubscriptionError> {
        let interest = TypeName::new(event_type);
        let record = self.record_for(&interest)?;

        let lock = self.lock_for(&interest);
        let guard = lock.lock().await;

        let result = async {
            if !self.store.remove(&record).await? {
                debug!(message_type = %interest, "Not subscribed, nothing to remove");
                return Ok(());
            }
            self.consumed.remove(&record.topic);
            if let Err(err) = self
                .provisioner
                .admin()
                .delete_group_offsets(&self.endpoint, &record.topic)
                .await
            {
                // Прогресс перезаписывается при следующей подписке.
                log_by_status!(
                    err.status_code(),
                    topic = %record.topic,
                    error = %err,
                    "Failed to drop group offsets"
                );
            }
            info!(
                endpoint = %self.endpoint,
                message_type = %interest,
                topic = %record.topic,
                "Unsubscribed"
            );
            Ok::<(), SubscriptionError>(())
        }
        .await;

        drop(guard);
        drop(lock);
        self.release_lock(&interest);
        result
    }

    /// Активные подписки этого endpoint'а.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, SubscriptionError> {
        let all = self.store.subscriptions().await?;
        Ok(all
            .into_iter()
            .filter(|s| s.subscriber == self.endpoint)
            .collect())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn record_for(
        &self,
        interest: &TypeName,
    ) -> Result<Subscription, SubscriptionError> {
        let topic = type_topic(interest.as_str()).map_err(|source| SubscriptionError::Topic {
            type_name: interest.to_string(),
            source,
        })?;
        Ok(Subscription {
            interest_type: interest.clone(),
            topic,
            subscriber: self.endpoint.clone(),
        })
    }

    fn lock_for(
        &self,
        interest: &TypeName,
    ) -> Arc<Mutex<()>> {
        self.locks
            .entry(interest.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Убирает мьютекс типа, если его больше никто не ждёт.
    fn release_lock(
        &self,
        interest: &TypeName,
    ) {
        self.locks
            .remove_if(interest, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn provision_error(
    interest: &TypeName,
    err: ProvisionError,
) -> SubscriptionError {
    match err {
        ProvisionError::InvalidTopic(source) => SubscriptionError::Topic {
            type_name: interest.to_string(),
            source,
        },
        ProvisionError::Broker { topic, source } => SubscriptionError::Provision { topic, source },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        broker::{
            BrokerAdmin, BrokerConnector, BrokerConsumer, BrokerProducer, InMemoryBroker,
            OffsetReset, TopicSpec,
        },
        subscription::InMemorySubscriptionStore,
    };

    const PLACED: &str = "typebus-types.Sales-OrderPlaced";

    fn manager(
        broker: &InMemoryBroker,
        store: Arc<InMemorySubscriptionStore>,
        consumed: ConsumedTopics,
    ) -> SubscriptionManager {
        let provisioner = Arc::new(TopicProvisioner::new(Arc::new(broker.clone()), 1, 1));
        SubscriptionManager::new("billing", store, provisioner, consumed)
    }

    /// Тест проверяет полный цикл: топик создан, запись сохранена, насос
    /// читает топик; после отписки всё откатывается.
    #[tokio::test]
    async fn test_subscribe_then_unsubscribe() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemorySubscriptionStore::new());
        let consumed = ConsumedTopics::new();
        let mgr = manager(&broker, Arc::clone(&store), consumed.clone());
        let ctx = ContextBag::new();

        mgr.subscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        mgr.subscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        assert_eq!(broker.topic_names(), vec![PLACED.to_string()]);
        assert!(consumed.contains(PLACED));
        assert_eq!(store.len(), 1);
        assert_eq!(mgr.subscriptions().await.unwrap().len(), 1);
        assert_eq!(broker.committed_offset("billing", PLACED, 0), Some(0));

        mgr.unsubscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        assert!(!consumed.contains(PLACED));
        assert!(store.is_empty());
        assert_eq!(broker.committed_offset("billing", PLACED, 0), None);

        // Повторная отписка — no-op.
        mgr.unsubscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        assert!(mgr.locks.is_empty());
    }

    /// Тест проверяет, что повторная подписка на уже сохранённую запись не
    /// требует второй отписки.
    #[tokio::test]
    async fn test_resubscribe_to_stored_record_needs_one_unsubscribe() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemorySubscriptionStore::new());
        let consumed = ConsumedTopics::new();
        let mgr = manager(&broker, Arc::clone(&store), consumed.clone());
        let ctx = ContextBag::new();

        mgr.subscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        // Восстановление после перезапуска добавляет тот же топик.
        consumed.add(PLACED);
        mgr.subscribe("Sales.OrderPlaced", &ctx).await.unwrap();

        mgr.unsubscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        assert!(!consumed.contains(PLACED));
    }

    /// Тест проверяет, что подписка не получает записей, опубликованных до
    /// неё, в том числе после отписки и новой подписки.
    #[tokio::test]
    async fn test_subscription_starts_at_end_of_topic() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, Arc::new(InMemorySubscriptionStore::new()), ConsumedTopics::new());
        let ctx = ContextBag::new();
        let wait = Duration::from_millis(30);

        broker
            .create_topic(&TopicSpec::new(PLACED, 1, 1))
            .await
            .unwrap();
        broker.produce(PLACED, None, Bytes::from_static(b"before")).await.unwrap();
        mgr.subscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        broker.produce(PLACED, None, Bytes::from_static(b"after")).await.unwrap();

        let mut consumer = broker.consumer("billing", "0", OffsetReset::Earliest).await.unwrap();
        consumer.subscribe(&[PLACED.to_string()]).await.unwrap();
        let batch = consumer.poll(10, wait).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(&batch[0].payload[..], b"after");
        consumer.commit(&batch[0].position).await.unwrap();
        consumer.close().await;

        mgr.unsubscribe("Sales.OrderPlaced", &ctx).await.unwrap();
        broker.produce(PLACED, None, Bytes::from_static(b"between")).await.unwrap();
        mgr.subscribe("Sales.OrderPlaced", &ctx).await.unwrap();

        let mut consumer = broker.consumer("billing", "0", OffsetReset::Earliest).await.unwrap();
        consumer.subscribe(&[PLACED.to_string()]).await.unwrap();
        assert!(consumer.poll(10, wait).await.unwrap().is_empty());
    }

    /// Тест проверяет, что конкурентные вызовы для одного типа не теряют
    /// обновлений и не возвращают ошибок.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_type() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemorySubscriptionStore::new());
        let consumed = ConsumedTopics::new();
        let mgr = Arc::new(manager(&broker, Arc::clone(&store), consumed.clone()));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let mgr = Arc::clone(&mgr);
            tasks.push(tokio::spawn(async move {
                let ctx = ContextBag::new();
                if i % 2 == 0 {
                    mgr.subscribe("Orders.Placed", &ctx).await
                } else {
                    mgr.unsubscribe("Orders.Placed", &ctx).await
                }
            }));
        }
        for t in tasks {
            tokio::time::timeout(Duration::from_secs(5), t)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }

        // Последний писатель побеждает: хранилище и набор топиков согласованы.
        let subscribed = store.len() == 1;
        assert_eq!(consumed.contains("typebus-types.Orders-Placed"), subscribed);
    }

    #[tokio::test]
    async fn test_provision_failure_leaves_no_record() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemorySubscriptionStore::new());
        let consumed = ConsumedTopics::new();
        let mgr = manager(&broker, Arc::clone(&store), consumed.clone());

        broker.set_reachable(false);
        let err = mgr
            .subscribe("Orders.Placed", &ContextBag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Provision { .. }));
        assert!(store.is_empty());
        assert!(consumed.snapshot().is_empty());
    }
}
