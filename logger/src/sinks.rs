//! The global sink table: console, file and hook sinks with individual
//! verbosities. Sinks are reconfigured at runtime; publishing takes the table
//! lock only long enough to format and write one record.

use std::fs::File;
use std::io::Write;

use once_cell::sync::Lazy;
use std::sync::Mutex;
use yogi_primitives::Timestamp;

use crate::{LogRecord, LoggerError, Verbosity, DEFAULT_LOG_FORMAT, DEFAULT_LOG_TIME_FORMAT};

/// Destination stream for console logging.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Callback type of the hook sink.
pub type HookFn = Box<dyn Fn(&LogRecord<'_>) + Send + 'static>;

struct TextFormat {
    timefmt: String,
    fmt: String,
}

impl TextFormat {
    fn new(timefmt: Option<&str>, fmt: Option<&str>) -> TextFormat {
        TextFormat {
            timefmt: timefmt.unwrap_or(DEFAULT_LOG_TIME_FORMAT).to_string(),
            fmt: fmt.unwrap_or(DEFAULT_LOG_FORMAT).to_string(),
        }
    }

    /// Renders one entry; `color` wraps the `$<`..`$>` region in `codes`.
    fn render(&self, record: &LogRecord<'_>, color: Option<&'static str>) -> String {
        let time = record
            .timestamp
            .format(Some(&self.timefmt))
            .unwrap_or_default();

        let mut out = String::with_capacity(self.fmt.len() + record.message.len() + 16);
        let mut chars = self.fmt.chars();
        while let Some(ch) = chars.next() {
            if ch != '$' {
                out.push(ch);
                continue;
            }

            match chars.next() {
                Some('t') => out.push_str(&time),
                Some('T') => out.push_str(&record.thread_id.to_string()),
                Some('s') => out.push_str(record.severity.tag()),
                Some('c') => out.push_str(record.component),
                Some('m') => out.push_str(record.message),
                Some('<') => {
                    if let Some(codes) = color {
                        out.push_str(codes);
                    }
                }
                Some('>') => {
                    if color.is_some() {
                        out.push_str("\x1b[0m");
                    }
                }
                Some('$') => out.push('$'),
                Some(other) => {
                    out.push('$');
                    out.push(other);
                }
                None => out.push('$'),
            }
        }

        out
    }
}

fn severity_color(severity: Verbosity) -> &'static str {
    match severity {
        Verbosity::Fatal => "\x1b[1;31m",
        Verbosity::Error => "\x1b[31m",
        Verbosity::Warning => "\x1b[33m",
        Verbosity::Info => "\x1b[32m",
        Verbosity::Debug => "\x1b[36m",
        _ => "\x1b[90m",
    }
}

struct ConsoleSink {
    stream: ConsoleStream,
    color: bool,
    format: TextFormat,
}

impl ConsoleSink {
    fn publish(&self, record: &LogRecord<'_>) {
        let color = self.color.then(|| severity_color(record.severity));
        let line = self.format.render(record, color);

        match self.stream {
            ConsoleStream::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{line}");
            }
            ConsoleStream::Stderr => {
                let mut out = std::io::stderr().lock();
                let _ = writeln!(out, "{line}");
            }
        }
    }
}

struct FileSink {
    file: File,
    filename: String,
    format: TextFormat,
}

impl FileSink {
    fn new(
        filename_template: &str,
        timefmt: Option<&str>,
        fmt: Option<&str>,
    ) -> Result<FileSink, LoggerError> {
        let filename = Timestamp::now().format(Some(filename_template))?;
        let file = File::create(&filename).map_err(LoggerError::OpenFileFailed)?;

        Ok(FileSink {
            file,
            filename,
            format: TextFormat::new(timefmt, fmt),
        })
    }

    fn publish(&mut self, record: &LogRecord<'_>) {
        let line = self.format.render(record, None);
        let _ = writeln!(self.file, "{line}");
        let _ = self.file.flush();
    }
}

struct HookSink {
    hook: HookFn,
}

#[derive(Default)]
struct SinkTable {
    console: Option<ConsoleSink>,
    console_verbosity: Option<Verbosity>,
    file: Option<FileSink>,
    file_verbosity: Option<Verbosity>,
    hook: Option<HookSink>,
    hook_verbosity: Option<Verbosity>,
}

static SINKS: Lazy<Mutex<SinkTable>> = Lazy::new(|| Mutex::new(SinkTable::default()));

pub(crate) fn configure_console(
    verbosity: Verbosity,
    stream: ConsoleStream,
    color: bool,
    timefmt: Option<&str>,
    fmt: Option<&str>,
) {
    let mut sinks = SINKS.lock().expect("Mutex poisoned");
    if verbosity == Verbosity::None {
        sinks.console = None;
        sinks.console_verbosity = None;
        return;
    }

    sinks.console = Some(ConsoleSink {
        stream,
        color,
        format: TextFormat::new(timefmt, fmt),
    });
    sinks.console_verbosity = Some(verbosity);
}

pub(crate) fn configure_file(
    verbosity: Verbosity,
    filename: &str,
    timefmt: Option<&str>,
    fmt: Option<&str>,
) -> Result<Option<String>, LoggerError> {
    let mut sinks = SINKS.lock().expect("Mutex poisoned");
    sinks.file = None;
    sinks.file_verbosity = None;
    if verbosity == Verbosity::None {
        return Ok(None);
    }

    let sink = FileSink::new(filename, timefmt, fmt)?;
    let generated = sink.filename.clone();
    sinks.file = Some(sink);
    sinks.file_verbosity = Some(verbosity);

    Ok(Some(generated))
}

pub(crate) fn configure_hook(verbosity: Verbosity, hook: Option<HookFn>) {
    let mut sinks = SINKS.lock().expect("Mutex poisoned");
    if verbosity == Verbosity::None || hook.is_none() {
        sinks.hook = None;
        sinks.hook_verbosity = None;
        return;
    }

    sinks.hook = hook.map(|hook| HookSink { hook });
    sinks.hook_verbosity = Some(verbosity);
}

/// Hands `record` to every sink whose verbosity admits it.
pub(crate) fn publish(record: &LogRecord<'_>) {
    let mut sinks = SINKS.lock().expect("Mutex poisoned");

    if let (Some(verbosity), Some(console)) = (sinks.console_verbosity, sinks.console.as_ref()) {
        if record.severity <= verbosity {
            console.publish(record);
        }
    }

    if let (Some(verbosity), Some(file)) = (sinks.file_verbosity, sinks.file.as_mut()) {
        if record.severity <= verbosity {
            file.publish(record);
        }
    }

    if let (Some(verbosity), Some(hook)) = (sinks.hook_verbosity, sinks.hook.as_ref()) {
        if record.severity <= verbosity {
            (hook.hook)(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(severity: Verbosity, message: &'a str) -> LogRecord<'a> {
        LogRecord {
            severity,
            timestamp: Timestamp::from_ns_since_epoch(1_234_356_789_123_000_000),
            thread_id: 7,
            component: "Test",
            message,
        }
    }

    #[test]
    fn render_default_format() {
        let format = TextFormat::new(None, None);
        let line = format.render(&record(Verbosity::Info, "hello"), None);
        assert_eq!(line, "2009-02-11 12:53:09.123 [T7] IFO Test: hello");
    }

    #[test]
    fn render_with_color_region() {
        let format = TextFormat::new(None, Some("$<$m$>"));
        let line = format.render(&record(Verbosity::Error, "boom"), Some("\x1b[31m"));
        assert_eq!(line, "\x1b[31mboom\x1b[0m");

        let plain = format.render(&record(Verbosity::Error, "boom"), None);
        assert_eq!(plain, "boom");
    }

    #[test]
    fn render_escaped_dollar() {
        let format = TextFormat::new(None, Some("$$ $m"));
        assert_eq!(format.render(&record(Verbosity::Info, "x"), None), "$ x");
    }

    #[test]
    fn file_sink_writes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir
            .path()
            .join("yogi_%Y.log")
            .to_string_lossy()
            .into_owned();

        let mut sink = FileSink::new(&template, None, Some("$s $m")).unwrap();
        assert!(sink.filename.contains("yogi_2"));
        sink.publish(&record(Verbosity::Warning, "to file"));

        let contents = std::fs::read_to_string(&sink.filename).unwrap();
        assert_eq!(contents, "WRN to file\n");
    }
}
