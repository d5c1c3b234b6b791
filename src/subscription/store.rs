use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use typebus_error::SubscriptionError;

use crate::hierarchy::TypeName;

/// Запись о подписке: endpoint `subscriber` получает сообщения с типом
/// интереса `interest_type` из топика `topic`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription {
    pub interest_type: TypeName,
    pub topic: String,
    pub subscriber: String,
}

/// Хранилище подписок «тип интереса → топик(и)».
///
/// Реализация должна быть безопасна для конкурентного использования;
/// сериализацию вызовов для одного типа обеспечивает менеджер подписок.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Добавляет запись. `true`, если её раньше не было.
    async fn add(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, SubscriptionError>;

    /// Удаляет запись. `false`, если её не было.
    async fn remove(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, SubscriptionError>;

    async fn contains(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, SubscriptionError>;

    /// Топики всех активных подписок на тип `interest_type`, без повторов.
    async fn topics_for(
        &self,
        interest_type: &str,
    ) -> Result<Vec<String>, SubscriptionError>;

    async fn subscriptions(&self) -> Result<Vec<Subscription>, SubscriptionError>;
}

/// Хранилище подписок в памяти процесса. Может разделяться несколькими
/// endpoint'ами одного процесса через `Arc`.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    records: DashMap<TypeName, BTreeSet<Subscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn add(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, SubscriptionError> {
        Ok(self
            .records
            .entry(subscription.interest_type.clone())
            .or_default()
            .insert(subscription.clone()))
    }

    async fn remove(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, SubscriptionError> {
        let removed = match self.records.get_mut(&subscription.interest_type) {
            Some(mut set) => set.remove(subscription),
            None => false,
        };
        self.records
            .remove_if(&subscription.interest_type, |_, set| set.is_empty());
        Ok(removed)
    }

    async fn contains(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, SubscriptionError> {
        Ok(self
            .records
            .get(&subscription.interest_type)
            .is_some_and(|set| set.contains(subscription)))
    }

    async fn topics_for(
        &self,
        interest_type: &str,
    ) -> Result<Vec<String>, SubscriptionError> {
        let Some(set) = self.records.get(interest_type) else {
            return Ok(Vec::new());
        };
        let topics: BTreeSet<String> = set.iter().map(|s| s.topic.clone()).collect();
        Ok(topics.into_iter().collect())
    }

    async fn subscriptions(&self) -> Result<Vec<Subscription>, SubscriptionError> {
        let mut all: Vec<Subscription> = self
            .records
            .iter()
            .flat_map(|e| e.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort();
        Ok(all)
    }
}
