use std::time::{Duration, Instant};

use tracing_appender::non_blocking::WorkerGuard;

/// Handle для управления lifecycle логирования.
///
/// Держит `WorkerGuard` файлового вывода: пока handle жив, фоновый поток
/// записи работает. `shutdown` сбрасывает буфер явно.
pub struct LoggingHandle {
    file_guard: Option<WorkerGuard>,
    flush_timeout: Duration,
    shut_down: bool,
}

impl LoggingHandle {
    pub fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            file_guard,
            flush_timeout: Duration::from_secs(5),
            shut_down: false,
        }
    }

    pub fn with_flush_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn has_file_sink(&self) -> bool {
        self.file_guard.is_some()
    }

    /// Сбрасывает буферы и освобождает guard'ы.
    pub fn shutdown(mut self) {
        self.shut_down = true;
        tracing::info!("Logging shutdown");

        let start = Instant::now();
        drop(self.file_guard.take());
        let elapsed = start.elapsed();

        if elapsed > self.flush_timeout {
            eprintln!(
                "WARNING: Logging shutdown took {}ms (timeout: {}ms)",
                elapsed.as_millis(),
                self.flush_timeout.as_millis()
            );
        }
    }

    /// То же из async-контекста: сброс выполняется в блокирующем потоке и
    /// ограничен таймаутом.
    pub async fn shutdown_async(mut self) {
        self.shut_down = true;
        let timeout = self.flush_timeout;
        let guard = self.file_guard.take();

        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || drop(guard))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("Logging shutdown task panicked: {e}"),
            Err(_) => eprintln!(
                "WARNING: Logging shutdown exceeded timeout of {}ms",
                timeout.as_millis()
            ),
        }
    }
}

impl Drop for LoggingHandle {
    fn drop(&mut self) {
        if !self.shut_down && self.file_guard.is_some() {
            eprintln!(
                "WARNING: LoggingHandle dropped without explicit shutdown(). \
                 Some logs may be lost."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_without_file_sink() {
        let handle = LoggingHandle::new(None).with_flush_timeout(Duration::from_millis(10));
        assert!(!handle.has_file_sink());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_async_releases_guard() {
        let (_writer, guard) = tracing_appender::non_blocking(std::io::sink());
        let handle = LoggingHandle::new(Some(guard));
        assert!(handle.has_file_sink());
        handle.shutdown_async().await;
    }
}
