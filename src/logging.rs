use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;

use crate::core::config::LogLevel;

/// Buffered log lines kept for slow `/api/logs` subscribers.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 500;

/// Tees formatted log lines into a broadcast channel (served as SSE) and,
/// unless suppressed, to stdout.
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).to_string();
        let _ = self.sender.send(msg); // Ignored if no receivers
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Installs the global subscriber and returns the sender feeding `/api/logs`.
pub(crate) fn init(level: LogLevel) -> broadcast::Sender<String> {
    let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::from(level))
        .with_ansi(false)
        .with_writer(SseMakeWriter {
            sender: sender.clone(),
            suppress_stdout: false,
        })
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Logging was already initialized");
    }
    sender
}
