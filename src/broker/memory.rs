use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace};
use typebus_error::BrokerError;
use xxhash_rust::xxh64::xxh64;

use super::{
    BrokerAdmin, BrokerConnector, BrokerConsumer, BrokerProducer, BrokerRecord, OffsetReset,
    RecordPosition, TopicCreation, TopicSpec,
};

type PartitionKey = (Arc<str>, u32);

/// Брокер с партиционированными журналами в памяти процесса.
///
/// Поддерживает:
/// - Топики из нескольких партиций с журналом только на дозапись
/// - Партиционирование по ключу (`xxh64`) и round-robin для записей без ключа
/// - Группы потребителей с распределением партиций между участниками
/// - Зафиксированные смещения групп и сброс `earliest`/`latest`
/// - Внедрение сбоев связи для тестов
///
/// Клон разделяет состояние с оригиналом.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

/// Построитель [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryBrokerBuilder {
    address: String,
    default_partitions: u32,
    auto_create_topics: bool,
}

struct BrokerState {
    address: String,
    default_partitions: u32,
    auto_create_topics: bool,
    topics: DashMap<Arc<str>, Arc<TopicLog>>,
    groups: DashMap<String, Arc<GroupState>>,
    /// Будит потребителей при дозаписи и при освобождении партиций.
    changed: Notify,
    reachable: AtomicBool,
    fail_produces: AtomicU32,
    fail_polls: AtomicU32,
    unavailable_topics: Mutex<HashSet<String>>,
}

struct TopicLog {
    partitions: Vec<RwLock<Vec<StoredRecord>>>,
    next_partition: AtomicUsize,
}

#[derive(Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    payload: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct GroupState {
    inner: Mutex<GroupInner>,
    committed: DashMap<PartitionKey, u64>,
    /// Нижняя граница чтения: записи ниже неё группе не выдаются, даже если
    /// участник уже держит более раннюю позицию.
    floors: DashMap<PartitionKey, u64>,
}

#[derive(Default)]
struct GroupInner {
    /// Участник → его топики.
    members: BTreeMap<String, Vec<String>>,
    /// Партиция → участник, который сейчас из неё читает.
    owners: HashMap<PartitionKey, String>,
}

/// Потребитель [`InMemoryBroker`].
pub struct InMemoryConsumer {
    broker: Arc<BrokerState>,
    group: Arc<GroupState>,
    member_id: String,
    reset: OffsetReset,
    /// Следующее смещение для выборки по каждой занятой партиции.
    positions: BTreeMap<PartitionKey, u64>,
    cursor: usize,
    closed: bool,
}

impl Default for InMemoryBrokerBuilder {
    fn default() -> Self {
        Self {
            address: "memory://local".to_string(),
            default_partitions: 1,
            auto_create_topics: false,
        }
    }
}

impl InMemoryBrokerBuilder {
    pub fn address(
        mut self,
        address: impl Into<String>,
    ) -> Self {
        self.address = address.into();
        self
    }

    /// Число партиций для автоматически созданных топиков.
    pub fn default_partitions(
        mut self,
        partitions: u32,
    ) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    /// Создавать топик при первой записи в него.
    pub fn auto_create_topics(
        mut self,
        enabled: bool,
    ) -> Self {
        self.auto_create_topics = enabled;
        self
    }

    pub fn build(self) -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::new(BrokerState {
                address: self.address,
                default_partitions: self.default_partitions,
                auto_create_topics: self.auto_create_topics,
                topics: DashMap::new(),
                groups: DashMap::new(),
                changed: Notify::new(),
                reachable: AtomicBool::new(true),
                fail_produces: AtomicU32::new(0),
                fail_polls: AtomicU32::new(0),
                unavailable_topics: Mutex::new(HashSet::new()),
            }),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы InMemoryBroker
////////////////////////////////////////////////////////////////////////////////

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBrokerBuilder::default().build()
    }

    pub fn builder() -> InMemoryBrokerBuilder {
        InMemoryBrokerBuilder::default()
    }

    /// Следующие `n` вызовов `produce` завершатся ошибкой связи.
    pub fn fail_next_produces(
        &self,
        n: u32,
    ) {
        self.state.fail_produces.store(n, Ordering::SeqCst);
    }

    /// Следующие `n` вызовов `poll` завершатся ошибкой связи.
    pub fn fail_next_polls(
        &self,
        n: u32,
    ) {
        self.state.fail_polls.store(n, Ordering::SeqCst);
    }

    /// Делает запись в конкретный топик невозможной (или снова возможной).
    pub fn set_topic_unavailable(
        &self,
        topic: &str,
        unavailable: bool,
    ) {
        let mut set = self.state.unavailable_topics.lock();
        if unavailable {
            set.insert(topic.to_string());
        } else {
            set.remove(topic);
        }
    }

    /// Имитирует полную недоступность брокера.
    pub fn set_reachable(
        &self,
        reachable: bool,
    ) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
        self.state.changed.notify_waiters();
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .topics
            .iter()
            .map(|e| e.key().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn partition_count(
        &self,
        topic: &str,
    ) -> Option<u32> {
        self.state
            .topics
            .get(topic)
            .map(|t| t.partitions.len() as u32)
    }

    /// Все записи топика: по партициям, внутри партиции по смещению.
    pub fn records(
        &self,
        topic: &str,
    ) -> Vec<BrokerRecord> {
        let Some(log) = self.state.topics.get(topic).map(|t| Arc::clone(t.value())) else {
            return Vec::new();
        };
        let name: Arc<str> = Arc::from(topic);
        let mut out = Vec::new();
        for (p, partition) in log.partitions.iter().enumerate() {
            let guard = partition.read();
            for (offset, rec) in guard.iter().enumerate() {
                out.push(rec.to_record(&name, p as u32, offset as u64));
            }
        }
        out
    }

    /// Зафиксированное смещение группы (следующая непрочитанная запись).
    pub fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
    ) -> Option<u64> {
        let g = self.state.groups.get(group)?;
        let key: PartitionKey = (Arc::from(topic), partition);
        let value = g.committed.get(&key).map(|v| *v);
        value
    }

    pub fn member_count(
        &self,
        group: &str,
    ) -> usize {
        self.state
            .groups
            .get(group)
            .map(|g| g.inner.lock().members.len())
            .unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<(), BrokerError> {
        self.state.check_reachable()
    }
}

impl BrokerState {
    fn check_reachable(&self) -> Result<(), BrokerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(self.unreachable("broker is down"))
        }
    }

    fn unreachable(
        &self,
        reason: &str,
    ) -> BrokerError {
        BrokerError::Unreachable {
            address: self.address.clone(),
            reason: reason.to_string(),
        }
    }

    /// Уменьшает счётчик внедрённых сбоев; `true`, если сбой нужно выдать.
    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn create_topic(
        &self,
        name: &str,
        partitions: u32,
    ) -> (Arc<TopicLog>, TopicCreation) {
        let key: Arc<str> = Arc::from(name);
        let mut created = false;
        let log = self
            .topics
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(TopicLog::new(partitions))
            })
            .clone();
        if created {
            debug!(topic = name, partitions, "Topic created");
            self.changed.notify_waiters();
            (log, TopicCreation::Created)
        } else {
            (log, TopicCreation::AlreadyExists)
        }
    }
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1))
                .map(|_| RwLock::new(Vec::new()))
                .collect(),
            next_partition: AtomicUsize::new(0),
        }
    }

    fn select_partition(
        &self,
        key: Option<&[u8]>,
    ) -> usize {
        let n = self.partitions.len();
        match key {
            Some(k) => (xxh64(k, 0) % n as u64) as usize,
            None => self.next_partition.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    fn len(
        &self,
        partition: u32,
    ) -> u64 {
        self.partitions
            .get(partition as usize)
            .map(|p| p.read().len() as u64)
            .unwrap_or(0)
    }
}

impl StoredRecord {
    fn to_record(
        &self,
        topic: &Arc<str>,
        partition: u32,
        offset: u64,
    ) -> BrokerRecord {
        BrokerRecord {
            position: RecordPosition {
                topic: Arc::clone(topic),
                partition,
                offset,
            },
            key: self.key.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Реализация трейтов брокера
////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Bytes,
    ) -> Result<RecordPosition, BrokerError> {
        self.check_reachable()?;
        if BrokerState::take_fault(&self.state.fail_produces) {
            return Err(self.state.unreachable("injected produce failure"));
        }
        if self.state.unavailable_topics.lock().contains(topic) {
            return Err(BrokerError::Timeout {
                operation: format!("produce to '{topic}'"),
            });
        }

        let log = match self.state.topics.get(topic) {
            Some(entry) => Arc::clone(entry.value()),
            None if self.state.auto_create_topics => {
                self.state
                    .create_topic(topic, self.state.default_partitions)
                    .0
            }
            None => {
                return Err(BrokerError::UnknownTopic {
                    topic: topic.to_string(),
                })
            }
        };

        let partition = log.select_partition(key);
        let offset = {
            let mut guard = log.partitions[partition].write();
            guard.push(StoredRecord {
                key: key.map(Bytes::copy_from_slice),
                payload,
                timestamp: Utc::now(),
            });
            (guard.len() - 1) as u64
        };
        trace!(topic, partition, offset, "Record appended");
        self.state.changed.notify_waiters();

        Ok(RecordPosition::new(topic, partition as u32, offset))
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryBroker {
    async fn create_topic(
        &self,
        spec: &TopicSpec,
    ) -> Result<TopicCreation, BrokerError> {
        self.check_reachable()?;
        if spec.name.is_empty() {
            return Err(BrokerError::Rejected {
                reason: "topic name is empty".to_string(),
            });
        }
        if spec.partitions == 0 {
            return Err(BrokerError::Rejected {
                reason: format!("topic '{}' must have at least one partition", spec.name),
            });
        }
        Ok(self.state.create_topic(&spec.name, spec.partitions).1)
    }

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        self.check_reachable()?;
        Ok(self.topic_names())
    }

    async fn commit_end_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<(), BrokerError> {
        self.check_reachable()?;
        let log = self
            .state
            .topics
            .get(topic)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| BrokerError::UnknownTopic {
                topic: topic.to_string(),
            })?;
        let group_state = self
            .state
            .groups
            .entry(group.to_string())
            .or_default()
            .clone();
        let name: Arc<str> = Arc::from(topic);
        for partition in 0..log.partitions.len() as u32 {
            let end = log.len(partition);
            let key: PartitionKey = (Arc::clone(&name), partition);
            group_state.committed.insert(key.clone(), end);
            group_state.floors.insert(key, end);
            debug!(group, topic, partition, offset = end, "Group moved to end of partition");
        }
        Ok(())
    }

    async fn delete_group_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<(), BrokerError> {
        self.check_reachable()?;
        if let Some(group_state) = self.state.groups.get(group) {
            group_state.committed.retain(|(t, _), _| &**t != topic);
            group_state.floors.retain(|(t, _), _| &**t != topic);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    fn address(&self) -> &str {
        &self.state.address
    }

    async fn producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        self.check_reachable()?;
        Ok(Arc::new(self.clone()))
    }

    async fn admin(&self) -> Result<Arc<dyn BrokerAdmin>, BrokerError> {
        self.check_reachable()?;
        Ok(Arc::new(self.clone()))
    }

    async fn consumer(
        &self,
        group: &str,
        member: &str,
        reset: OffsetReset,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.check_reachable()?;
        let group_state = self
            .state
            .groups
            .entry(group.to_string())
            .or_default()
            .clone();
        Ok(Box::new(InMemoryConsumer {
            broker: Arc::clone(&self.state),
            group: group_state,
            member_id: format!("{group}/{member}"),
            reset,
            positions: BTreeMap::new(),
            cursor: 0,
            closed: false,
        }))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Потребитель
////////////////////////////////////////////////////////////////////////////////

impl InMemoryConsumer {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Disconnected);
        }
        self.broker.check_reachable()
    }

    /// Партиции, которые должны принадлежать этому участнику: все партиции
    /// подписанных топиков раздаются по кругу участникам, подписанным на
    /// соответствующий топик.
    fn desired_assignment(
        &self,
        inner: &GroupInner,
    ) -> BTreeSet<PartitionKey> {
        let topics: BTreeSet<&String> = inner.members.values().flatten().collect();
        let mut out = BTreeSet::new();
        let mut index = 0usize;
        for topic in topics {
            let Some(log) = self.broker.topics.get(topic.as_str()).map(|t| Arc::clone(t.value()))
            else {
                continue;
            };
            let candidates: Vec<&String> = inner
                .members
                .iter()
                .filter(|(_, ts)| ts.contains(topic))
                .map(|(m, _)| m)
                .collect();
            let name: Arc<str> = Arc::from(topic.as_str());
            for p in 0..log.partitions.len() as u32 {
                if candidates[index % candidates.len()] == &self.member_id {
                    out.insert((Arc::clone(&name), p));
                }
                index += 1;
            }
        }
        out
    }

    /// Освобождает чужие теперь партиции и занимает свободные свои.
    fn rebalance(&mut self) {
        let mut inner = self.group.inner.lock();
        let desired = self.desired_assignment(&inner);
        let mut released = false;

        let stale: Vec<PartitionKey> = self
            .positions
            .keys()
            .filter(|k| !desired.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.positions.remove(&key);
            if inner.owners.get(&key) == Some(&self.member_id) {
                inner.owners.remove(&key);
                released = true;
            }
            debug!(member = %self.member_id, topic = %key.0, partition = key.1, "Partition revoked");
        }

        for key in desired {
            if self.positions.contains_key(&key) {
                continue;
            }
            match inner.owners.get(&key) {
                Some(owner) if owner != &self.member_id => continue,
                _ => {}
            }
            let start = match self.group.committed.get(&key) {
                Some(offset) => *offset,
                None => match self.reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => self
                        .broker
                        .topics
                        .get(&*key.0)
                        .map(|t| t.len(key.1))
                        .unwrap_or(0),
                },
            };
            debug!(
                member = %self.member_id,
                topic = %key.0,
                partition = key.1,
                offset = start,
                "Partition assigned"
            );
            inner.owners.insert(key.clone(), self.member_id.clone());
            self.positions.insert(key, start);
        }
        drop(inner);

        if released {
            self.broker.changed.notify_waiters();
        }
    }

    fn fetch(
        &mut self,
        max: usize,
    ) -> Vec<BrokerRecord> {
        let keys: Vec<PartitionKey> = self.positions.keys().cloned().collect();
        if keys.is_empty() || max == 0 {
            return Vec::new();
        }
        let start = self.cursor % keys.len();
        self.cursor = self.cursor.wrapping_add(1);

        let mut out = Vec::new();
        for key in keys[start..].iter().chain(keys[..start].iter()) {
            if out.len() >= max {
                break;
            }
            let Some(log) = self.broker.topics.get(&*key.0).map(|t| Arc::clone(t.value())) else {
                continue;
            };
            let Some(partition) = log.partitions.get(key.1 as usize) else {
                continue;
            };
            let Some(pos) = self.positions.get_mut(key) else {
                continue;
            };
            if let Some(floor) = self.group.floors.get(key).map(|f| *f) {
                *pos = (*pos).max(floor);
            }
            let guard = partition.read();
            let from = (*pos as usize).min(guard.len());
            let to = (from + (max - out.len())).min(guard.len());
            for (i, rec) in guard[from..to].iter().enumerate() {
                out.push(rec.to_record(&key.0, key.1, (from + i) as u64));
            }
            *pos = to as u64;
        }
        out
    }

    fn leave_group(&mut self) {
        let mut inner = self.group.inner.lock();
        inner.members.remove(&self.member_id);
        let member_id = &self.member_id;
        inner.owners.retain(|_, owner| owner != member_id);
        drop(inner);
        self.positions.clear();
        self.broker.changed.notify_waiters();
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn subscribe(
        &mut self,
        topics: &[String],
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        {
            let mut inner = self.group.inner.lock();
            let mut sorted = topics.to_vec();
            sorted.sort();
            sorted.dedup();
            inner.members.insert(self.member_id.clone(), sorted);
        }
        self.rebalance();
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn poll(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        self.ensure_open()?;
        if BrokerState::take_fault(&self.broker.fail_polls) {
            return Err(self.broker.unreachable("injected poll failure"));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let broker = Arc::clone(&self.broker);
            let notified = broker.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.rebalance();
            let batch = self.fetch(max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            tokio::select! {
                _ = &mut notified => {
                    self.ensure_open()?;
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn commit(
        &mut self,
        position: &RecordPosition,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let key: PartitionKey = (Arc::clone(&position.topic), position.partition);
        self.group.committed.insert(key, position.offset + 1);
        Ok(())
    }

    async fn seek(
        &mut self,
        position: &RecordPosition,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let key: PartitionKey = (Arc::clone(&position.topic), position.partition);
        match self.positions.get_mut(&key) {
            Some(pos) => {
                *pos = position.offset;
                Ok(())
            }
            None => Err(BrokerError::InvalidPartition {
                topic: position.topic.to_string(),
                partition: position.partition,
            }),
        }
    }

    fn assignment(&self) -> Vec<(Arc<str>, u32)> {
        self.positions.keys().cloned().collect()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.leave_group();
        debug!(member = %self.member_id, "Consumer closed");
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.leave_group();
        }
    }
}
