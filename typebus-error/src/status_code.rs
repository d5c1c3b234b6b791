use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "serde_repr")]
use serde_repr::{Deserialize_repr, Serialize_repr};
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок транспорта.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки данных
/// - 3xxx: Конфигурация (фатальные, до перехода в `Running`)
/// - 6xxx: Связь с брокером
/// - 7xxx: Подписки и маршрутизация
/// - 8xxx: Протокол конверта
/// - 9xxx: Насос сообщений и обработчики
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[cfg_attr(feature = "serde_repr", derive(Serialize_repr, Deserialize_repr))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Unexpected = 1001,
    Internal = 1002,
    InvalidArgs = 1003,
    NotImplemented = 1004,

    // === 2xxx: Ошибки данных ===
    NotFound = 2000,
    AlreadyExists = 2001,
    InvalidData = 2002,

    // === 3xxx: Конфигурация ===
    InvalidConfig = 3000,
    MissingConfig = 3001,
    InvalidTopicName = 3002,
    UnknownMessageType = 3003,
    InvalidTypeHierarchy = 3004,

    // === 6xxx: Связь с брокером ===
    Io = 6000,
    ConnectionFailed = 6001,
    ConnectionClosed = 6002,
    Timeout = 6003,
    BrokerRejected = 6004,
    PartialDelivery = 6005,

    // === 7xxx: Подписки/маршрутизация ===
    SubscriptionFailed = 7000,
    UnknownTopic = 7001,
    InvalidPartition = 7002,

    // === 8xxx: Протокол конверта ===
    EncodingError = 8000,
    DecodingError = 8001,
    ChecksumMismatch = 8002,
    UnsupportedVersion = 8003,
    SizeLimit = 8004,
    InvalidUtf8 = 8005,

    // === 9xxx: Насос/обработчики ===
    InvalidState = 9000,
    PumpFaulted = 9001,
    HandlerFailed = 9002,
    StopTimeout = 9003,
    WorkerPanicked = 9004,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Возвращает `true`, если операцию с этим кодом имеет смысл повторить.
    ///
    /// Сюда попадают только ошибки связи: решение о повторе принимает
    /// вызывающая сторона, транспорт сам backoff не реализует.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed | Self::ConnectionClosed | Self::PartialDelivery
        )
    }

    /// Вернёт `true`, если переданный `code` означает успешный результат.
    pub fn is_success(code: u32) -> bool {
        Self::Success as u32 == code
    }

    /// Ошибка конфигурации (диапазон 3xxx) — фатальна на старте.
    pub fn is_configuration_error(&self) -> bool {
        (3000..=3999).contains(&self.code())
    }

    /// Ошибка связи с брокером (диапазон 6xxx).
    pub fn is_connectivity_error(&self) -> bool {
        (6000..=6999).contains(&self.code())
    }

    /// Ошибка протокола конверта (диапазон 8xxx).
    pub fn is_protocol_error(&self) -> bool {
        (8000..=8999).contains(&self.code())
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::NotFound | Self::AlreadyExists => LogLevel::Debug,
            Self::InvalidArgs
            | Self::InvalidData
            | Self::InvalidConfig
            | Self::MissingConfig
            | Self::InvalidTopicName
            | Self::UnknownMessageType
            | Self::InvalidTypeHierarchy => LogLevel::Info,
            Self::Timeout
            | Self::ConnectionFailed
            | Self::ConnectionClosed
            | Self::PartialDelivery
            | Self::HandlerFailed => LogLevel::Warn,
            Self::Internal | Self::PumpFaulted | Self::WorkerPanicked => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
