//! Bridge from `tracing` into the sink table.
//!
//! Internal code across the workspace logs with the re-exported `tracing`
//! macros; this dispatcher turns each event into a [`LogRecord`] whose
//! component is the event target and routes it through the per-target
//! logger's verbosity before it reaches the sinks.

use std::fmt::Write;

use once_cell::sync::OnceCell;
use tracing_core::field::{Field, Visit};
use tracing_core::span::{Attributes, Id, Record};
use tracing_core::{Event, Level, Metadata, Subscriber};

use crate::{current_thread_id, sinks, LogRecord, Logger, Verbosity};
use yogi_primitives::Timestamp;

fn severity_of(level: &Level) -> Verbosity {
    match *level {
        Level::ERROR => Verbosity::Error,
        Level::WARN => Verbosity::Warning,
        Level::INFO => Verbosity::Info,
        Level::DEBUG => Verbosity::Debug,
        Level::TRACE => Verbosity::Trace,
    }
}

struct SinkDispatcher;

impl Subscriber for SinkDispatcher {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        // Cheap pre-filter; the per-logger verbosity is checked in event().
        severity_of(metadata.level()) <= Verbosity::Trace
    }

    fn new_span(&self, _attrs: &Attributes<'_>) -> Id {
        // Spans are not used for sink output.
        Id::from_u64(1)
    }

    fn record(&self, _id: &Id, _record: &Record<'_>) {}

    fn record_follows_from(&self, _id: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let severity = severity_of(event.metadata().level());
        let logger = Logger::for_target(event.metadata().target());
        if severity > logger.verbosity() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            severity,
            timestamp: Timestamp::now(),
            thread_id: current_thread_id(),
            component: logger.component(),
            message: &visitor.message,
        };

        sinks::publish(&record);
    }

    fn enter(&self, _id: &Id) {}

    fn exit(&self, _id: &Id) {}
}

/// Collects the `message` field plus any other fields as `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let mut rendered = String::new();
            let _ = write!(rendered, "{value:?}");
            if self.message.is_empty() {
                self.message = rendered;
            } else {
                self.message.insert_str(0, &(rendered + " "));
            }
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            if self.message.is_empty() {
                self.message = value.to_string();
            } else {
                self.message.insert_str(0, &format!("{value} "));
            }
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={}", field.name(), value);
        }
    }
}

static DISPATCHER: OnceCell<()> = OnceCell::new();

/// Installs the sink dispatcher as the global `tracing` subscriber.
///
/// Idempotent; if another subscriber is already installed (embedding
/// applications may bring their own) this is a no-op and only records
/// produced via [`Logger::log`] reach the sinks.
pub fn install_dispatcher() {
    DISPATCHER.get_or_init(|| {
        let _ = tracing::subscriber::set_global_default(SinkDispatcher);
    });
}
