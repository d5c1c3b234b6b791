use std::fmt;

use serde::Serialize;

/// Состояние насоса в его жизненном цикле.
///
/// ```text
/// Stopped -> Starting -> Running -> Stopping -> Stopped
///                        Running -> Faulted  -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PumpState {
    /// Потребители не подключены
    Stopped,
    /// Подключение и получение назначения партиций; доставки ещё нет
    Starting,
    /// Чтение и доставка
    Running,
    /// Новые доставки запрещены, текущие обработчики завершаются
    Stopping,
    /// Неустранимая ошибка; воркеры освобождают ресурсы
    Faulted,
}

impl PumpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Faulted => "Faulted",
        }
    }

    /// Допустим ли переход `self -> next`.
    pub fn can_transition_to(
        &self,
        next: PumpState,
    ) -> bool {
        use PumpState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Faulted)
                | (Stopping, Stopped)
                | (Faulted, Stopped)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for PumpState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
