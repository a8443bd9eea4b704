//! Structured logging for the demo binary.
//!
//! Library code (everything under `src/` other than this module and
//! `bin/`) only ever emits `tracing` events; it never installs a global
//! subscriber, since that decision belongs to whatever process embeds the
//! transport. This module is used by `src/bin/rdma_loopback_demo.rs` to
//! set one up for itself, the same way the teacher's `main.rs` builds a
//! colorized `fmt` layer before doing anything else.

use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
// Correct the import paths for tracing_subscriber items.
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// This formatter is designed to provide clean, user-facing output where the
/// entire log line is colored according to its severity level, without any
/// extra metadata like timestamps or log levels printed.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        // This is necessary because the format_fields method writes directly.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        // Apply color based on the event's log level.
        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        // Write the colored line to the actual output.
        writeln!(writer, "{}", colored_output)
    }
}

/// Install a colorized `tracing` subscriber at the given level. Intended
/// for the demo binary and for tests that want readable output; library
/// code never calls this itself.
pub fn init(level: tracing::Level) {
    use tracing_subscriber::prelude::*;

    let layer = tracing_subscriber::fmt::layer()
        .event_format(ColorizedFormatter)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level));

    // Ignore the error: tests may call this more than once across threads.
    let _ = tracing_subscriber::registry().with(layer).try_init();
}