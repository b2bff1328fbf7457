//! Buffer for log entries emitted before the real logger exists
//!
//! Configuration loading runs before `init_logging` knows the level and
//! format, so early messages are captured here and replayed once the
//! subscriber is installed. A fatal entry flushes the buffer immediately and
//! calls the exit function.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once, OnceLock};

use tracing::{debug, error, info, warn};

use crate::logs::LogLevel;

/// One buffered entry
#[derive(Debug, Clone, PartialEq)]
pub struct InitLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl InitLogEntry {
    /// Message followed by `key=value` fields
    pub fn render(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {}", self.message, fields)
    }
}

/// Destination of replayed entries
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: &InitLogEntry);
}

/// Replays entries through `tracing`
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, entry: &InitLogEntry) {
        let line = entry.render();
        match entry.level {
            LogLevel::Trace | LogLevel::Debug => debug!("{}", line),
            LogLevel::Info => info!("{}", line),
            LogLevel::Warn => warn!("{}", line),
            LogLevel::Error => error!("{}", line),
        }
    }
}

type ExitFn = Arc<dyn Fn(i32) + Send + Sync>;

struct Inner {
    entries: Vec<InitLogEntry>,
    fatal: bool,
    exit_fn: ExitFn,
}

/// Mutex-guarded buffer of pending entries
pub struct InitLogStorage {
    inner: Mutex<Inner>,
}

impl InitLogStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                fatal: false,
                exit_fn: Arc::new(|code| std::process::exit(code)),
            }),
        }
    }

    pub fn push(&self, entry: InitLogEntry) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a fatal entry was recorded
    pub fn is_fatal(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).fatal
    }

    /// Replace the function called after a fatal entry is flushed
    pub fn set_exit_fn(&self, exit_fn: impl Fn(i32) + Send + Sync + 'static) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.exit_fn = Arc::new(exit_fn);
    }

    /// Drain entries at or above `min_level` into `sink`; lower entries are dropped
    pub fn flush_into(&self, min_level: LogLevel, sink: &dyn LogSink) -> usize {
        let entries = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut inner.entries)
        };
        let mut emitted = 0;
        for entry in entries.iter().filter(|e| e.level >= min_level) {
            sink.emit(entry);
            emitted += 1;
        }
        emitted
    }

    fn fatal(&self, entry: InitLogEntry, sink: &dyn LogSink) {
        let exit_fn = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.fatal = true;
            inner.entries.push(entry);
            inner.exit_fn.clone()
        };
        self.flush_into(LogLevel::Trace, sink);
        exit_fn(1);
    }
}

impl Default for InitLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

static STORAGE: OnceLock<InitLogStorage> = OnceLock::new();
static SIGNAL_FLUSH: Once = Once::new();

/// Process-wide init-log buffer
pub fn init_storage() -> &'static InitLogStorage {
    STORAGE.get_or_init(InitLogStorage::new)
}

/// Flush the process-wide buffer on SIGINT or SIGTERM; registers at most once
pub fn setup_signal_flush() {
    SIGNAL_FLUSH.call_once(|| {
        tokio::spawn(async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let (Ok(mut sigterm), Ok(mut sigint)) =
                    (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
                else {
                    return;
                };
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            init_storage().flush_into(LogLevel::Trace, &TracingSink);
        });
    });
}

/// Builder for buffered entries
pub struct InitLogger<'a> {
    storage: &'a InitLogStorage,
    sink: &'a dyn LogSink,
    fields: BTreeMap<String, String>,
    fatal: bool,
}

impl<'a> InitLogger<'a> {
    pub fn new(storage: &'a InitLogStorage, sink: &'a dyn LogSink) -> Self {
        Self {
            storage,
            sink,
            fields: BTreeMap::new(),
            fatal: false,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_error(self, err: &dyn std::error::Error) -> Self {
        self.with_field("error", err)
    }

    /// Make the next `error` flush the buffer and exit
    pub fn with_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    fn log(self, level: LogLevel, message: &str) {
        let entry = InitLogEntry {
            level,
            message: message.to_string(),
            fields: self.fields,
        };
        if self.fatal && level == LogLevel::Error {
            self.storage.fatal(entry, self.sink);
        } else {
            self.storage.push(entry);
        }
    }

    pub fn debug(self, message: &str) {
        self.log(LogLevel::Debug, message)
    }

    pub fn info(self, message: &str) {
        self.log(LogLevel::Info, message)
    }

    pub fn warn(self, message: &str) {
        self.log(LogLevel::Warn, message)
    }

    pub fn error(self, message: &str) {
        self.log(LogLevel::Error, message)
    }
}

/// Logger over the process-wide buffer
pub fn init_logger() -> InitLogger<'static> {
    InitLogger::new(init_storage(), &TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct CollectSink(Mutex<Vec<String>>);

    impl LogSink for CollectSink {
        fn emit(&self, entry: &InitLogEntry) {
            self.0.lock().unwrap().push(entry.render());
        }
    }

    #[test]
    fn test_flush_respects_level() {
        let storage = InitLogStorage::new();
        let sink = CollectSink::default();
        InitLogger::new(&storage, &sink).debug("noise");
        InitLogger::new(&storage, &sink)
            .with_field("path", "/etc/config.yaml")
            .warn("config missing");
        assert_eq!(storage.len(), 2);

        assert_eq!(storage.flush_into(LogLevel::Info, &sink), 1);
        assert!(storage.is_empty());
        assert_eq!(
            sink.0.lock().unwrap().as_slice(),
            &["config missing path=/etc/config.yaml".to_string()]
        );
    }

    #[test]
    fn test_fatal_flushes_and_exits() {
        let storage = InitLogStorage::new();
        let sink = CollectSink::default();
        let code = Arc::new(AtomicI32::new(0));
        let seen = code.clone();
        storage.set_exit_fn(move |c| seen.store(c, Ordering::SeqCst));

        InitLogger::new(&storage, &sink).info("starting");
        InitLogger::new(&storage, &sink)
            .with_fatal()
            .with_error(&std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            .error("cannot continue");

        assert_eq!(code.load(Ordering::SeqCst), 1);
        assert!(storage.is_fatal());
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }
}
