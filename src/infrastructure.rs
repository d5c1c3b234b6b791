//! Контракт с хостом: четыре лениво создаваемые точки входа (насос,
//! диспетчер, создание топиков, управление подписками) и описание
//! возможностей транспорта.
//!
//! Хост сам вызывает start/stop; транспорт не владеет временем жизни
//! процесса.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell as AsyncOnceCell;
use tracing::{debug, info};
use typebus_error::{ResultExt, StackError, TransportResult};

use crate::{
    broker::BrokerConnector,
    config::TransportSettings,
    dispatch::{DeliveryConstraint, Dispatcher},
    envelope::{install_codec, EnvelopeCodec},
    hierarchy::TypeRegistry,
    provision::TopicProvisioner,
    pump::{default_policy, ConsumedTopics, MessageHandler, MessagePump, PoisonMessagePolicy, PumpSettings},
    routing::LogicalAddress,
    subscription::{SubscriptionManager, SubscriptionStore},
};

/// Способ адресации исходящих сообщений.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Unicast,
    Multicast,
}

/// Как транспорт доставляет каждый вид исходящих сообщений.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundRoutingPolicy {
    pub sends: AddressingMode,
    pub publishes: AddressingMode,
    pub replies: AddressingMode,
}

/// Транзакционный режим: только подтверждение приёма.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReceiveOnly,
}

/// Возможности транспорта, которые вызывает хост.
#[async_trait]
pub trait TransportCapabilities: Send + Sync {
    fn configure_receive(&self) -> Arc<MessagePump>;

    async fn configure_send(&self) -> TransportResult<Arc<Dispatcher>>;

    async fn configure_subscriptions(&self) -> TransportResult<Arc<SubscriptionManager>>;

    async fn provision(&self) -> TransportResult<()>;
}

/// Инфраструктура транспорта одного endpoint'а.
pub struct TransportInfrastructure {
    settings: TransportSettings,
    connector: Arc<dyn BrokerConnector>,
    registry: Arc<TypeRegistry>,
    store: Arc<dyn SubscriptionStore>,
    codec: &'static EnvelopeCodec,
    local_topic: String,
    consumed: ConsumedTopics,
    pump: once_cell::sync::OnceCell<Arc<MessagePump>>,
    dispatcher: AsyncOnceCell<Arc<Dispatcher>>,
    provisioner: AsyncOnceCell<Arc<TopicProvisioner>>,
    subscriptions: AsyncOnceCell<Arc<SubscriptionManager>>,
    provisioned: AsyncOnceCell<()>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl TransportInfrastructure {
    /// Проверяет настройки и устанавливает процессный кодек.
    ///
    /// Ошибки конфигурации возвращаются здесь, до какого-либо обращения к
    /// брокеру.
    pub fn new(
        settings: TransportSettings,
        connector: Arc<dyn BrokerConnector>,
        registry: Arc<TypeRegistry>,
        store: Arc<dyn SubscriptionStore>,
    ) -> TransportResult<Self> {
        settings.validate().context("invalid transport settings")?;
        let local_topic = settings
            .local_address()
            .to_topic()
            .context("invalid endpoint name")?;
        let codec = install_codec(settings.codec);

        // Входной топик endpoint'а читается всегда.
        let consumed = ConsumedTopics::new();
        consumed.pin(&local_topic);

        info!(
            endpoint = %settings.endpoint_name,
            broker = %connector.address(),
            types = registry.len(),
            "Transport infrastructure created"
        );

        Ok(Self {
            settings,
            connector,
            registry,
            store,
            codec,
            local_topic,
            consumed,
            pump: once_cell::sync::OnceCell::new(),
            dispatcher: AsyncOnceCell::new(),
            provisioner: AsyncOnceCell::new(),
            subscriptions: AsyncOnceCell::new(),
            provisioned: AsyncOnceCell::new(),
        })
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn local_topic(&self) -> &str {
        &self.local_topic
    }

    pub fn consumed_topics(&self) -> &ConsumedTopics {
        &self.consumed
    }

    pub fn routing_policy(&self) -> OutboundRoutingPolicy {
        OutboundRoutingPolicy {
            sends: AddressingMode::Unicast,
            publishes: AddressingMode::Multicast,
            replies: AddressingMode::Unicast,
        }
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::ReceiveOnly
    }

    pub fn supports_constraint(
        &self,
        constraint: &DeliveryConstraint,
    ) -> bool {
        matches!(constraint, DeliveryConstraint::DiscardIfNotReceivedBefore(_))
    }

    /// Физический топик логического адреса.
    pub fn to_transport_address(
        &self,
        address: &LogicalAddress,
    ) -> TransportResult<String> {
        Ok(address.to_topic()?)
    }

    /// Экземпляры endpoint'а не различаются: все читают один топик.
    pub fn bind_to_local_endpoint(
        &self,
        instance: LogicalAddress,
    ) -> LogicalAddress {
        instance
    }

    /// Проверка на старте: настройки валидны, брокер отвечает.
    pub async fn startup_check(&self) -> TransportResult<()> {
        self.settings.validate()?;
        let admin = self
            .connector
            .admin()
            .await
            .context("broker connectivity check")?;
        let topics = admin
            .list_topics()
            .await
            .context("broker connectivity check")?;
        debug!(existing_topics = topics.len(), "Startup check passed");
        Ok(())
    }

    /// Насос endpoint'а. Создаётся один раз; подключение происходит в
    /// `start`.
    pub fn pump(&self) -> Arc<MessagePump> {
        Arc::clone(self.pump.get_or_init(|| {
            Arc::new(MessagePump::new(
                PumpSettings::from(&self.settings),
                Arc::clone(&self.connector),
                self.consumed.clone(),
                self.codec,
            ))
        }))
    }

    pub async fn dispatcher(&self) -> TransportResult<Arc<Dispatcher>> {
        let dispatcher = self
            .dispatcher
            .get_or_try_init(|| async {
                let producer = self
                    .connector
                    .producer()
                    .await
                    .context("connecting dispatcher")?;
                Ok::<_, StackError>(Arc::new(Dispatcher::new(
                    self.local_topic.clone(),
                    producer,
                    Arc::clone(&self.registry),
                    Arc::clone(&self.store),
                    self.codec,
                )))
            })
            .await?;
        Ok(Arc::clone(dispatcher))
    }

    pub async fn provisioner(&self) -> TransportResult<Arc<TopicProvisioner>> {
        let provisioner = self
            .provisioner
            .get_or_try_init(|| async {
                let admin = self
                    .connector
                    .admin()
                    .await
                    .context("connecting provisioner")?;
                Ok::<_, StackError>(Arc::new(TopicProvisioner::new(
                    admin,
                    self.settings.partitions,
                    self.settings.replication_factor,
                )))
            })
            .await?;
        Ok(Arc::clone(provisioner))
    }

    pub async fn subscription_manager(&self) -> TransportResult<Arc<SubscriptionManager>> {
        let manager = self
            .subscriptions
            .get_or_try_init(|| async {
                let provisioner = self.provisioner().await?;
                Ok::<_, StackError>(Arc::new(SubscriptionManager::new(
                    self.settings.endpoint_name.clone(),
                    Arc::clone(&self.store),
                    provisioner,
                    self.consumed.clone(),
                )))
            })
            .await?;
        Ok(Arc::clone(manager))
    }

    /// Создаёт входной топик и топик ошибок, восстанавливает чтение топиков
    /// подписок, уже сохранённых в хранилище. Повторный вызов ничего не
    /// делает.
    pub async fn provision(&self) -> TransportResult<()> {
        self.provisioned
            .get_or_try_init(|| async {
                let provisioner = self.provisioner().await?;

                let mut topics = vec![self.local_topic.clone()];
                if let Some(error_topic) = self.settings.error_topic() {
                    topics.push(error_topic.to_string());
                }
                provisioner
                    .ensure_topics(&topics)
                    .await
                    .context("provisioning endpoint topics")?;

                let restored: Vec<String> = self
                    .store
                    .subscriptions()
                    .await?
                    .into_iter()
                    .filter(|s| s.subscriber == self.settings.endpoint_name)
                    .map(|s| s.topic)
                    .collect();
                provisioner
                    .ensure_topics(&restored)
                    .await
                    .context("provisioning subscription topics")?;
                for topic in &restored {
                    self.consumed.add(topic);
                }

                info!(
                    endpoint = %self.settings.endpoint_name,
                    topics = ?topics,
                    restored_subscriptions = restored.len(),
                    "Endpoint provisioned"
                );
                Ok::<_, StackError>(())
            })
            .await?;
        Ok(())
    }

    /// Создаёт топики и запускает насос с политикой poison-сообщений по
    /// умолчанию, если своя не задана.
    pub async fn start_receiving(
        &self,
        handler: Arc<dyn MessageHandler>,
        poison: Option<Arc<dyn PoisonMessagePolicy>>,
    ) -> TransportResult<()> {
        self.provision().await?;
        let poison = poison.unwrap_or_else(|| default_policy(self.settings.error_topic()));
        self.pump()
            .start(handler, poison)
            .await
            .context("starting message pump")?;
        Ok(())
    }

    pub async fn stop_receiving(&self) -> TransportResult<()> {
        if let Some(pump) = self.pump.get() {
            pump.stop().await.context("stopping message pump")?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransportCapabilities for TransportInfrastructure {
    fn configure_receive(&self) -> Arc<MessagePump> {
        self.pump()
    }

    async fn configure_send(&self) -> TransportResult<Arc<Dispatcher>> {
        self.dispatcher().await
    }

    async fn configure_subscriptions(&self) -> TransportResult<Arc<SubscriptionManager>> {
        self.subscription_manager().await
    }

    async fn provision(&self) -> TransportResult<()> {
        TransportInfrastructure::provision(self).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use typebus_error::StatusCode;

    use super::*;
    use crate::{
        broker::InMemoryBroker,
        context::ContextBag,
        hierarchy::TypeRegistry,
        routing::type_topic,
        subscription::{InMemorySubscriptionStore, Subscription},
    };

    fn infrastructure(broker: &InMemoryBroker) -> TransportInfrastructure {
        infrastructure_with_store(broker, Arc::new(InMemorySubscriptionStore::new()))
    }

    fn infrastructure_with_store(
        broker: &InMemoryBroker,
        store: Arc<InMemorySubscriptionStore>,
    ) -> TransportInfrastructure {
        let settings = TransportSettings {
            max_concurrency: 2,
            ..TransportSettings::new("billing", "memory")
        };
        TransportInfrastructure::new(
            settings,
            Arc::new(broker.clone()),
            Arc::new(TypeRegistry::builder().build().unwrap()),
            store,
        )
        .unwrap()
    }

    /// Тест проверяет, что каждая точка входа возвращает один и тот же
    /// экземпляр при повторных запросах.
    #[tokio::test]
    async fn test_singletons() {
        let broker = InMemoryBroker::new();
        let infra = infrastructure(&broker);

        assert!(Arc::ptr_eq(&infra.pump(), &infra.configure_receive()));
        assert!(Arc::ptr_eq(
            &infra.dispatcher().await.unwrap(),
            &infra.configure_send().await.unwrap()
        ));
        assert!(Arc::ptr_eq(
            &infra.subscription_manager().await.unwrap(),
            &infra.configure_subscriptions().await.unwrap()
        ));
        assert!(Arc::ptr_eq(
            &infra.provisioner().await.unwrap(),
            &infra.provisioner().await.unwrap()
        ));
        assert_eq!(infra.pump().settings().workers, 2);
    }

    #[test]
    fn test_invalid_settings_fail_fast() {
        let broker = InMemoryBroker::new();
        let err = TransportInfrastructure::new(
            TransportSettings::new("billing", ""),
            Arc::new(broker),
            Arc::new(TypeRegistry::builder().build().unwrap()),
            Arc::new(InMemorySubscriptionStore::new()),
        )
        .err()
        .unwrap();
        assert_eq!(err.status_code(), StatusCode::MissingConfig);
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let broker = InMemoryBroker::new();
        let infra = infrastructure(&broker);

        infra.provision().await.unwrap();
        TransportCapabilities::provision(&infra).await.unwrap();
        assert_eq!(
            broker.topic_names(),
            vec!["billing".to_string(), "error".to_string()]
        );
        assert_eq!(infra.consumed_topics().snapshot(), vec!["billing".to_string()]);
    }

    /// Тест проверяет восстановление чтения топиков подписок, сохранённых
    /// в хранилище до перезапуска.
    #[tokio::test]
    async fn test_provision_restores_subscriptions() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemorySubscriptionStore::new());
        let placed = type_topic("Sales.OrderPlaced").unwrap();
        let shipped = type_topic("Sales.OrderShipped").unwrap();
        store
            .add(&Subscription {
                interest_type: "Sales.OrderPlaced".into(),
                topic: placed.clone(),
                subscriber: "billing".into(),
            })
            .await
            .unwrap();
        store
            .add(&Subscription {
                interest_type: "Sales.OrderShipped".into(),
                topic: shipped.clone(),
                subscriber: "shipping".into(),
            })
            .await
            .unwrap();

        let infra = infrastructure_with_store(&broker, store);
        infra.provision().await.unwrap();

        assert!(infra.consumed_topics().contains(&placed));
        assert!(!infra.consumed_topics().contains(&shipped));
        assert_eq!(broker.partition_count(&placed), Some(1));

        // Отписка после восстановления убирает топик из чтения.
        let manager = infra.subscription_manager().await.unwrap();
        manager
            .unsubscribe("Sales.OrderPlaced", &ContextBag::new())
            .await
            .unwrap();
        assert!(!infra.consumed_topics().contains(&placed));
    }

    /// Тест проверяет, что подписка до первого `provision` снимается одной
    /// отпиской: восстановление не добавляет топик второй раз.
    #[tokio::test]
    async fn test_subscribe_before_provision_then_unsubscribe() {
        let broker = InMemoryBroker::new();
        let infra = infrastructure(&broker);
        let placed = type_topic("Sales.OrderPlaced").unwrap();
        let manager = infra.subscription_manager().await.unwrap();

        manager
            .subscribe("Sales.OrderPlaced", &ContextBag::new())
            .await
            .unwrap();
        infra.provision().await.unwrap();
        assert!(infra.consumed_topics().contains(&placed));

        manager
            .unsubscribe("Sales.OrderPlaced", &ContextBag::new())
            .await
            .unwrap();
        assert!(!infra.consumed_topics().contains(&placed));
        assert_eq!(infra.consumed_topics().snapshot(), vec!["billing".to_string()]);
    }

    #[tokio::test]
    async fn test_startup_check_reports_connectivity() {
        let broker = InMemoryBroker::new();
        let infra = infrastructure(&broker);
        infra.startup_check().await.unwrap();

        broker.set_reachable(false);
        let err = infra.startup_check().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_receive_lifecycle() {
        let broker = InMemoryBroker::new();
        let infra = infrastructure(&broker);

        infra
            .start_receiving(Arc::new(crate::pump::handler_fn(|_msg| async { Ok(()) })), None)
            .await
            .unwrap();
        assert_eq!(infra.pump().state(), crate::pump::PumpState::Running);
        assert_eq!(broker.member_count("billing"), 2);

        tokio::time::timeout(Duration::from_secs(5), infra.stop_receiving())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.member_count("billing"), 0);
    }

    #[test]
    fn test_capabilities() {
        let broker = InMemoryBroker::new();
        let infra = infrastructure(&broker);
        let policy = infra.routing_policy();
        assert_eq!(policy.sends, AddressingMode::Unicast);
        assert_eq!(policy.publishes, AddressingMode::Multicast);
        assert_eq!(policy.replies, AddressingMode::Unicast);
        assert_eq!(infra.transaction_mode(), TransactionMode::ReceiveOnly);
        assert!(infra.supports_constraint(&DeliveryConstraint::DiscardIfNotReceivedBefore(
            Duration::from_secs(1)
        )));

        let address = LogicalAddress::with_qualifier("sales", "audit");
        assert_eq!(infra.to_transport_address(&address).unwrap(), "sales.audit");
        assert_eq!(infra.bind_to_local_endpoint(address.clone()), address);
        assert!(infra
            .to_transport_address(&LogicalAddress::new("a.b"))
            .is_err());
    }
}
