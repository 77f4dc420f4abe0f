//! Yogi logging.
//!
//! All crates in the workspace log through the re-exported [`tracing`]
//! macros; a global dispatcher (see [`layer`]) routes those events into the
//! sink table alongside records produced directly via [`Logger::log`]. Three
//! sinks exist: console, file and hook. Each sink has its own verbosity,
//! each logger (component) has one as well, and a record is published when
//! it passes both.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use yogi_primitives::Timestamp;

mod layer;
mod sinks;

pub use layer::install_dispatcher;
pub use sinks::{ConsoleStream, HookFn};

// Internal logging for the other workspace crates goes through these.
pub use tracing::{debug, error, info, trace, warn};

/// Default format for log entry timestamps.
pub const DEFAULT_LOG_TIME_FORMAT: &str = "%F %T.%3";

/// Default format for log entries.
///
/// `$t`: timestamp, `$T`: thread id, `$s`: severity tag, `$c`: component,
/// `$m`: message, `$<`/`$>`: start/end of the colored region.
pub const DEFAULT_LOG_FORMAT: &str = "$t [T$T] $<$s $c: $m$>";

/// Errors produced by the logging subsystem.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// Component filter is not a valid regular expression
    #[error("Invalid regular expression: {0}")]
    InvalidRegex(regex::Error),
    /// Verbosity string does not name a verbosity level
    #[error("Invalid verbosity \"{0}\"")]
    InvalidVerbosity(String),
    /// Log file could not be opened
    #[error("Could not open log file: {0}")]
    OpenFileFailed(#[source] std::io::Error),
    /// Time format string is not valid
    #[error(transparent)]
    InvalidTimeFormat(#[from] yogi_primitives::TimeError),
}

/// Severity levels, in decreasing order of importance.
///
/// [`Verbosity::None`] disables a sink or logger entirely.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(i32)]
pub enum Verbosity {
    None = -1,
    Fatal = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Verbosity {
    pub const DEFAULT: Verbosity = Verbosity::Info;

    fn from_i32(value: i32) -> Verbosity {
        match value {
            -1 => Verbosity::None,
            0 => Verbosity::Fatal,
            1 => Verbosity::Error,
            2 => Verbosity::Warning,
            3 => Verbosity::Info,
            4 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }

    /// Three-letter tag used in formatted log entries.
    pub fn tag(self) -> &'static str {
        match self {
            Verbosity::None => "---",
            Verbosity::Fatal => "FAT",
            Verbosity::Error => "ERR",
            Verbosity::Warning => "WRN",
            Verbosity::Info => "IFO",
            Verbosity::Debug => "DBG",
            Verbosity::Trace => "TRC",
        }
    }
}

impl FromStr for Verbosity {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Verbosity::None),
            "FATAL" => Ok(Verbosity::Fatal),
            "ERROR" => Ok(Verbosity::Error),
            "WARNING" => Ok(Verbosity::Warning),
            "INFO" => Ok(Verbosity::Info),
            "DEBUG" => Ok(Verbosity::Debug),
            "TRACE" => Ok(Verbosity::Trace),
            _ => Err(LoggerError::InvalidVerbosity(s.to_string())),
        }
    }
}

/// One log record on its way to the sinks.
#[derive(Debug, Clone)]
pub struct LogRecord<'a> {
    pub severity: Verbosity,
    pub timestamp: Timestamp,
    pub thread_id: u32,
    pub component: &'a str,
    pub message: &'a str,
}

/// A named log source with its own verbosity.
pub struct Logger {
    component: String,
    verbosity: AtomicI32,
}

static LOGGERS: Lazy<Mutex<Vec<Weak<Logger>>>> = Lazy::new(|| Mutex::new(Vec::new()));

// Loggers implicitly created for tracing targets, keyed by target name.
static TARGET_LOGGERS: Lazy<Mutex<HashMap<String, Arc<Logger>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static APP_LOGGER: Lazy<Arc<Logger>> = Lazy::new(|| Logger::new("App"));

impl Logger {
    pub fn new(component: impl Into<String>) -> Arc<Logger> {
        let logger = Arc::new(Logger {
            component: component.into(),
            verbosity: AtomicI32::new(Verbosity::DEFAULT as i32),
        });

        let mut loggers = LOGGERS.lock().expect("Mutex poisoned");
        loggers.retain(|weak| weak.strong_count() > 0);
        loggers.push(Arc::downgrade(&logger));

        logger
    }

    /// The process-wide default logger.
    pub fn app() -> Arc<Logger> {
        Arc::clone(&APP_LOGGER)
    }

    pub(crate) fn for_target(target: &str) -> Arc<Logger> {
        let mut map = TARGET_LOGGERS.lock().expect("Mutex poisoned");
        Arc::clone(
            map.entry(target.to_string())
                .or_insert_with(|| Logger::new(target)),
        )
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_i32(self.verbosity.load(Ordering::Relaxed))
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.verbosity.store(verbosity as i32, Ordering::Relaxed);
    }

    /// Publishes `msg` to every sink whose verbosity admits `severity`.
    pub fn log(&self, severity: Verbosity, msg: &str) {
        if severity == Verbosity::None || severity > self.verbosity() {
            return;
        }

        let record = LogRecord {
            severity,
            timestamp: Timestamp::now(),
            thread_id: current_thread_id(),
            component: &self.component,
            message: msg,
        };

        sinks::publish(&record);
    }
}

/// Sets the verbosity of every logger whose component matches `components_re`
/// and returns how many were affected.
pub fn set_components_verbosity(
    components_re: &str,
    verbosity: Verbosity,
) -> Result<usize, LoggerError> {
    let re = Regex::new(components_re).map_err(LoggerError::InvalidRegex)?;

    let loggers = LOGGERS.lock().expect("Mutex poisoned");
    let mut count = 0;
    for weak in loggers.iter() {
        if let Some(logger) = weak.upgrade() {
            if re.is_match(logger.component()) {
                logger.set_verbosity(verbosity);
                count += 1;
            }
        }
    }

    Ok(count)
}

/// Enables console logging; `Verbosity::None` disables it again.
pub fn configure_console_logging(
    verbosity: Verbosity,
    stream: ConsoleStream,
    color: bool,
    timefmt: Option<&str>,
    fmt: Option<&str>,
) {
    layer::install_dispatcher();
    sinks::configure_console(verbosity, stream, color, timefmt, fmt);
}

/// Enables file logging and returns the generated filename.
///
/// Time placeholders in `filename` are substituted with the current time,
/// which makes per-run log files like `yogi_%F_%H%M%S.log` possible.
pub fn configure_file_logging(
    verbosity: Verbosity,
    filename: &str,
    timefmt: Option<&str>,
    fmt: Option<&str>,
) -> Result<Option<String>, LoggerError> {
    layer::install_dispatcher();
    sinks::configure_file(verbosity, filename, timefmt, fmt)
}

/// Enables hook logging; every record passing `verbosity` is handed to `fn`.
pub fn configure_hook_logging(verbosity: Verbosity, hook: Option<HookFn>) {
    layer::install_dispatcher();
    sinks::configure_hook(verbosity, hook);
}

// The hook sink is global; tests that reconfigure it serialize on this.
#[cfg(test)]
pub(crate) static TEST_HOOK_LOCK: Mutex<()> = Mutex::new(());

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small per-process thread id, stable for the thread's lifetime.
pub fn current_thread_id() -> u32 {
    THREAD_ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_str() {
        assert_eq!("info".parse::<Verbosity>().unwrap(), Verbosity::Info);
        assert_eq!("TRACE".parse::<Verbosity>().unwrap(), Verbosity::Trace);
        assert_eq!("None".parse::<Verbosity>().unwrap(), Verbosity::None);
        assert!("chatty".parse::<Verbosity>().is_err());
    }

    #[test]
    fn verbosity_ordering() {
        assert!(Verbosity::Fatal < Verbosity::Error);
        assert!(Verbosity::Info < Verbosity::Trace);
        assert!(Verbosity::None < Verbosity::Fatal);
    }

    #[test]
    fn component_verbosity_regex() {
        let a = Logger::new("Yogi.Branch");
        let b = Logger::new("Yogi.MessageTransport");
        let c = Logger::new("Other");

        let n = set_components_verbosity("Yogi\\..*", Verbosity::Trace).unwrap();
        assert!(n >= 2);
        assert_eq!(a.verbosity(), Verbosity::Trace);
        assert_eq!(b.verbosity(), Verbosity::Trace);
        assert_eq!(c.verbosity(), Verbosity::DEFAULT);

        assert!(set_components_verbosity("[", Verbosity::Info).is_err());
    }

    #[test]
    fn hook_sink_receives_records() {
        use std::sync::mpsc;

        let _guard = crate::TEST_HOOK_LOCK.lock().expect("Mutex poisoned");

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        configure_hook_logging(
            Verbosity::Debug,
            Some(Box::new(move |record| {
                if record.component != "HookTest" {
                    return;
                }
                let _ = tx
                    .lock()
                    .expect("Mutex poisoned")
                    .send((record.severity, record.component.to_string(), record.message.to_string()));
            })),
        );

        let logger = Logger::new("HookTest");
        logger.log(Verbosity::Info, "hello");
        logger.log(Verbosity::Trace, "filtered out by the sink verbosity");

        let (severity, component, message) = rx.recv().unwrap();
        assert_eq!(severity, Verbosity::Info);
        assert_eq!(component, "HookTest");
        assert_eq!(message, "hello");
        assert!(rx.try_recv().is_err());

        configure_hook_logging(Verbosity::None, None);
    }

    #[test]
    fn logger_verbosity_filters_records() {
        use std::sync::atomic::AtomicUsize;

        let _guard = crate::TEST_HOOK_LOCK.lock().expect("Mutex poisoned");

        static COUNT: AtomicUsize = AtomicUsize::new(0);
        configure_hook_logging(
            Verbosity::Trace,
            Some(Box::new(|record| {
                if record.component == "FilterTest" {
                    COUNT.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );

        let logger = Logger::new("FilterTest");
        logger.set_verbosity(Verbosity::Warning);
        logger.log(Verbosity::Error, "published");
        logger.log(Verbosity::Info, "suppressed");

        assert_eq!(COUNT.load(Ordering::SeqCst), 1);
        configure_hook_logging(Verbosity::None, None);
    }
}
