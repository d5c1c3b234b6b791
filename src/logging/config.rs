use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use typebus_error::ConfigError;

/// Формат вывода событий.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: "logging.format".into(),
                reason: format!("unknown log format '{other}'"),
            }),
        }
    }
}

/// Настройки вывода в консоль.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub with_ansi: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_line_numbers: bool,
}

/// Настройки файлового вывода с ежедневной ротацией.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: bool,
    /// Каталог для файлов журнала; создаётся при инициализации
    pub directory: PathBuf,
    /// Префикс имени файла, к нему добавляется дата
    pub prefix: String,
    /// Формат файла; по умолчанию JSON
    pub format: LogFormat,
}

/// Конфигурация логирования.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Уровень по умолчанию (`trace`..`error`) или полная директива
    /// `EnvFilter`. `RUST_LOG` имеет приоритет.
    pub level: String,
    pub format: LogFormat,
    pub console: ConsoleConfig,
    pub file: FileConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            with_ansi: true,
            with_target: true,
            with_thread_ids: false,
            with_line_numbers: false,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("logs"),
            prefix: "typebus.log".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            console: ConsoleConfig::default(),
            file: FileConfig::default(),
        }
    }
}

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

impl LoggingConfig {
    /// Переменные `TYPEBUS_LOG_LEVEL`, `TYPEBUS_LOG_FORMAT` и
    /// `TYPEBUS_LOG_DIR` перекрывают значения конфигурации.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = std::env::var("TYPEBUS_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(format) = std::env::var("TYPEBUS_LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Ok(dir) = std::env::var("TYPEBUS_LOG_DIR") {
            self.file.enabled = true;
            self.file.directory = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "logging.level".into(),
            });
        }
        if self.file.enabled && self.file.prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "logging.file.prefix".into(),
                reason: "file prefix must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Директива для `EnvFilter`. Голый уровень применяется к крейту и ко
    /// всему остальному; полная директива передаётся как есть.
    pub fn build_filter_directive(&self) -> String {
        let level = self.level.trim().to_ascii_lowercase();
        if LEVELS.contains(&level.as_str()) {
            format!("{level},typebus={level}")
        } else {
            self.level.trim().to_string()
        }
    }

    pub fn ensure_log_dir(&self) -> std::io::Result<()> {
        if self.file.enabled {
            std::fs::create_dir_all(&self.file.directory)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_filter_directive() {
        let cfg = LoggingConfig {
            level: "DEBUG".into(),
            ..Default::default()
        };
        assert_eq!(cfg.build_filter_directive(), "debug,typebus=debug");

        let cfg = LoggingConfig {
            level: "warn,typebus::pump=trace".into(),
            ..Default::default()
        };
        assert_eq!(cfg.build_filter_directive(), "warn,typebus::pump=trace");
    }

    #[test]
    fn test_validate() {
        assert!(LoggingConfig::default().validate().is_ok());

        let cfg = LoggingConfig {
            level: " ".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingValue { .. })));
    }

    /// Тест проверяет перекрытие настроек переменными окружения.
    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("TYPEBUS_LOG_LEVEL", "trace");
        std::env::set_var("TYPEBUS_LOG_FORMAT", "json");
        let mut cfg = LoggingConfig::default();
        cfg.apply_env_overrides().unwrap();
        std::env::remove_var("TYPEBUS_LOG_LEVEL");
        std::env::remove_var("TYPEBUS_LOG_FORMAT");

        assert_eq!(cfg.level, "trace");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(!cfg.file.enabled);
    }

    #[test]
    #[serial]
    fn test_bad_format_from_env() {
        std::env::set_var("TYPEBUS_LOG_FORMAT", "xml");
        let mut cfg = LoggingConfig::default();
        let result = cfg.apply_env_overrides();
        std::env::remove_var("TYPEBUS_LOG_FORMAT");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
