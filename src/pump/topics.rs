use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::watch;

/// Почему насос читает топик.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicUse {
    /// Входной топик endpoint'а; отписка его не убирает.
    pub pinned: bool,
    /// Топик активной подписки endpoint'а.
    pub subscribed: bool,
}

/// Набор топиков, которые читает насос.
///
/// Менеджер подписок добавляет и убирает топики во время работы; воркеры
/// насоса следят за изменениями через `watch` и переподписывают своих
/// потребителей. У endpoint'а не больше одной подписки на топик, поэтому
/// повторное `add` ничего не меняет, а одно `remove` снимает подписку.
#[derive(Debug, Clone)]
pub struct ConsumedTopics {
    tx: Arc<watch::Sender<BTreeMap<String, TopicUse>>>,
}

impl Default for ConsumedTopics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumedTopics {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BTreeMap::new());
        Self { tx: Arc::new(tx) }
    }

    /// Закрепляет топик. `true`, если топик появился в наборе.
    pub fn pin(
        &self,
        topic: &str,
    ) -> bool {
        self.mark(topic, |u| &mut u.pinned)
    }

    /// Отмечает топик как подписанный. `true`, если топик появился в наборе.
    pub fn add(
        &self,
        topic: &str,
    ) -> bool {
        self.mark(topic, |u| &mut u.subscribed)
    }

    /// Снимает подписку с топика. `true`, если топик покинул набор.
    pub fn remove(
        &self,
        topic: &str,
    ) -> bool {
        let mut left = false;
        self.tx.send_if_modified(|topics| {
            let Some(usage) = topics.get_mut(topic) else {
                return false;
            };
            if !usage.subscribed {
                return false;
            }
            usage.subscribed = false;
            if !usage.pinned {
                topics.remove(topic);
                left = true;
            }
            left
        });
        left
    }

    pub fn contains(
        &self,
        topic: &str,
    ) -> bool {
        self.tx.borrow().contains_key(topic)
    }

    pub fn usage(
        &self,
        topic: &str,
    ) -> Option<TopicUse> {
        self.tx.borrow().get(topic).copied()
    }

    /// Текущий набор имён, в порядке сортировки.
    pub fn snapshot(&self) -> Vec<String> {
        self.tx.borrow().keys().cloned().collect()
    }

    pub fn watch(&self) -> watch::Receiver<BTreeMap<String, TopicUse>> {
        self.tx.subscribe()
    }

    /// Ставит флаг; подписчики уведомляются только при появлении топика.
    fn mark(
        &self,
        topic: &str,
        flag: impl Fn(&mut TopicUse) -> &mut bool,
    ) -> bool {
        let mut appeared = false;
        self.tx.send_if_modified(|topics| {
            appeared = !topics.contains_key(topic);
            *flag(topics.entry(topic.to_string()).or_default()) = true;
            appeared
        });
        appeared
    }
}
