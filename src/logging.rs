//! Structured logging setup: one `fmt` layer to stderr, a second
//! appending to a log file, filtered by an `EnvFilter` seeded from
//! `RUST_LOG`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. Safe to call once per process; a
/// second call is a no-op failure that this crate ignores, since the
/// `watch` and `status` subcommands both want logging initialized
/// without coordinating who goes first.
pub fn init_logging() {
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("incubar=debug")),
        );

    let _ = subscriber.try_init();
}

fn file_writer() -> LogFileWriter {
    LogFileWriter {
        file: log_file().clone(),
    }
}

fn log_file() -> &'static Arc<Mutex<std::fs::File>> {
    static FILE: std::sync::OnceLock<Arc<Mutex<std::fs::File>>> = std::sync::OnceLock::new();
    FILE.get_or_init(|| Arc::new(Mutex::new(open_log_file().unwrap_or_else(|_| open_fallback_log_file()))))
}

fn open_log_file() -> io::Result<std::fs::File> {
    let data_dir = dirs::data_dir().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "missing data directory"))?;
    let log_dir = data_dir.join("IncuBar");
    std::fs::create_dir_all(&log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("incubar.log"))
}

fn open_fallback_log_file() -> std::fs::File {
    let mut path = PathBuf::from(std::env::temp_dir());
    path.push("incubar.log");
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .unwrap_or_else(|_| std::fs::File::create(path).expect("fallback log file must be creatable"))
}

#[derive(Clone)]
struct LogFileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriterGuard {
            file: self.file.clone(),
        }
    }
}

struct LogFileWriterGuard {
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for LogFileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut file) => file.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Ok(()),
        }
    }
}
