use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Потокобезопасные счётчики насоса. Разделяются всеми воркерами.
#[derive(Debug, Default)]
pub struct PumpStats {
    /// Записи, успешно обработанные и подтверждённые
    delivered: AtomicU64,
    /// Ошибки обработчика (запись будет доставлена повторно)
    failed: AtomicU64,
    /// Записи с истёкшим TTL, подтверждённые без обработки
    discarded: AtomicU64,
    /// Нечитаемые записи, переложенные в топик ошибок
    parked: AtomicU64,
    /// Нечитаемые записи, подтверждённые без перекладывания
    poison_acknowledged: AtomicU64,
    /// Неудачные чтения из брокера
    poll_failures: AtomicU64,
}

/// Снимок счётчиков.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStatsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub discarded: u64,
    pub parked: u64,
    pub poison_acknowledged: u64,
    pub poll_failures: u64,
}

impl PumpStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_parked(&self) {
        self.parked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poison_acknowledged(&self) {
        self.poison_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            poison_acknowledged: self.poison_acknowledged.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
        }
    }
}
