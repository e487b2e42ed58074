// Copyright (c) The cascade Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logging setup.
//!
//! Everything in cascade logs through [`tracing`]. Drivers call [`init_logging`] once to print
//! those events to stderr, filtered by the `CASCADE_LOG` environment variable.

use crate::errors::InitLoggingError;
use std::{ffi::OsString, fmt, sync::Once};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// The environment variable holding the log filter, in `tracing-subscriber`'s `Targets` syntax
/// (for example `info` or `cascade_runner=debug`).
pub const LOG_ENV: &str = "CASCADE_LOG";

static INIT_LOGGER: Once = Once::new();

/// Installs a stderr logger filtered by [`LOG_ENV`], defaulting to `info`.
///
/// Only the first call installs a logger; later calls still validate the filter. If another
/// global subscriber is already installed, it is left in place.
pub fn init_logging() -> Result<(), InitLoggingError> {
    let targets = parse_targets(std::env::var_os(LOG_ENV))?;

    INIT_LOGGER.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .event_format(SimpleFormatter)
            .with_writer(std::io::stderr)
            .with_filter(targets);

        // Fails only if a global subscriber was set elsewhere, which is fine.
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });

    Ok(())
}

fn parse_targets(value: Option<OsString>) -> Result<Targets, InitLoggingError> {
    let value = value
        .unwrap_or_default()
        .into_string()
        .map_err(|_| InitLoggingError::NotUnicode { var: LOG_ENV })?;

    // If the level string is empty, use the standard level filter instead.
    if value.is_empty() {
        Ok(Targets::new().with_default(LevelFilter::INFO))
    } else {
        value
            .parse()
            .map_err(|error| InitLoggingError::Parse {
                var: LOG_ENV,
                error,
            })
    }
}

struct SimpleFormatter;

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let level = match *metadata.level() {
            Level::ERROR => "error",
            Level::WARN => "warning",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "trace",
        };
        write!(writer, "{level}: ")?;

        let mut visitor = MessageVisitor {
            writer: &mut writer,
            // Show other fields for debug or trace output.
            show_other: *metadata.level() >= Level::DEBUG,
            error: None,
        };

        event.record(&mut visitor);

        if let Some(error) = visitor.error {
            return Err(error);
        }

        writeln!(writer)
    }
}

static MESSAGE_FIELD: &str = "message";

struct MessageVisitor<'writer, 'a> {
    writer: &'a mut format::Writer<'writer>,
    show_other: bool,
    error: Option<fmt::Error>,
}

impl Visit for MessageVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == MESSAGE_FIELD {
            if let Err(error) = write!(self.writer, "{value:?}") {
                self.error = Some(error);
            }
        } else if self.show_other {
            if let Err(error) = write!(self.writer, "; {} = {:?}", field.name(), value) {
                self.error = Some(error);
            }
        }
    }
}
