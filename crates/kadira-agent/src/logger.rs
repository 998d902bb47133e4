// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structured event logging and the process log format.
//!
//! Two concerns live here:
//!
//! - [`EventLogger`] is the sink the models write structured error and method call events
//!   to. [`TracingLogger`] forwards them as `tracing` events on the `kadira_agent::events` target.
//! - [`Formatter`] renders every `tracing` event of the process as
//!
//! ```text
//! KADIRA | LEVEL | [span{fields}: ] message fields
//! ```

use serde_json::{Map, Value};
use std::error::Error;
use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub type LogFields = Map<String, Value>;

pub trait EventLogger: Send + Sync {
    fn info(&self, message: &str, fields: LogFields);
    fn error(&self, message: &str, fields: LogFields);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl EventLogger for TracingLogger {
    fn info(&self, message: &str, fields: LogFields) {
        let fields = Value::Object(fields);
        tracing::info!(target: "kadira_agent::events", fields = %fields, "{message}");
    }

    fn error(&self, message: &str, fields: LogFields) {
        let fields = Value::Object(fields);
        tracing::error!(target: "kadira_agent::events", fields = %fields, "{message}");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "KADIRA | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. `log_level` accepts anything `EnvFilter` does, e.g.
/// `info` or `kadira_agent=debug`.
pub fn init(log_level: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter)?)
        .with_ansi(false)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("Logging subsystem enabled");
    Ok(())
}

/// Builds a [`LogFields`] map from `key => value` pairs.
#[macro_export]
macro_rules! log_fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut fields = $crate::logger::LogFields::new();
        $(fields.insert($key.to_string(), ::serde_json::json!($value));)*
        fields
    }};
}
