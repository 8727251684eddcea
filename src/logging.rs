//! Pluggable diagnostic sink for the limiter.
//!
//! The limiter never talks to `tracing` directly; it logs through a
//! [`Logger`] so embedding services can route diagnostics wherever they
//! like. [`TracingLogger`] is the default and forwards to `tracing` events.

use std::fmt::{self, Display, Write as _};
use std::sync::Arc;

use tracing::field::{self, DisplayValue};
use tracing::{debug, error, info};

/// Structured key/value pairs attached to a log line.
pub type Fields<'a> = &'a [(&'static str, &'a dyn Display)];

/// Diagnostic sink used by the limiter and its decay loop.
pub trait Logger: Send + Sync + 'static {
    /// Return a logger that prefixes every line with `fields`.
    fn with(&self, fields: Fields<'_>) -> Arc<dyn Logger>;

    /// Log at debug level.
    fn debug(&self, msg: &str, fields: Fields<'_>);

    /// Log at info level.
    fn info(&self, msg: &str, fields: Fields<'_>);

    /// Log at error level.
    fn error(&self, msg: &str, fields: Fields<'_>);
}

/// [`Logger`] that emits `tracing` events under the `tokengate` target.
///
/// `key` and `count` become fields of their own on the event. Context
/// added through [`Logger::with`] and any other per-call fields are
/// rendered into a single `fields` value.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    context: Vec<(&'static str, String)>,
}

/// Per-call fields sorted into the event's own fields and the rest.
struct Split<'a> {
    key: Option<DisplayValue<&'a dyn Display>>,
    count: Option<DisplayValue<&'a dyn Display>>,
    rest: String,
}

impl TracingLogger {
    /// Create a logger with no context.
    pub fn new() -> Self {
        Self::default()
    }

    fn render(&self, fields: Fields<'_>) -> String {
        let mut out = String::new();
        let context = self.context.iter().map(|(k, v)| (*k, v as &dyn Display));
        let extra = fields.iter().map(|(k, v)| (*k, *v));

        for (key, value) in context.chain(extra) {
            if !out.is_empty() {
                out.push(' ');
            }
            // Writing to a String cannot fail.
            let _ = write!(out, "{}={}", key, value);
        }

        out
    }

    fn split<'a>(&self, fields: Fields<'a>) -> Split<'a> {
        let mut key = None;
        let mut count = None;
        let mut rest = Vec::with_capacity(fields.len());

        for &(name, value) in fields {
            match name {
                "key" if key.is_none() => key = Some(field::display(value)),
                "count" if count.is_none() => count = Some(field::display(value)),
                _ => rest.push((name, value)),
            }
        }

        Split {
            key,
            count,
            rest: self.render(&rest),
        }
    }
}

impl Logger for TracingLogger {
    fn with(&self, fields: Fields<'_>) -> Arc<dyn Logger> {
        let mut context = self.context.clone();
        context.extend(fields.iter().map(|(k, v)| (*k, v.to_string())));
        Arc::new(TracingLogger { context })
    }

    fn debug(&self, msg: &str, fields: Fields<'_>) {
        let Split { key, count, rest } = self.split(fields);
        debug!(target: "tokengate", key, count, fields = %rest, "{}", msg);
    }

    fn info(&self, msg: &str, fields: Fields<'_>) {
        let Split { key, count, rest } = self.split(fields);
        info!(target: "tokengate", key, count, fields = %rest, "{}", msg);
    }

    fn error(&self, msg: &str, fields: Fields<'_>) {
        let Split { key, count, rest } = self.split(fields);
        error!(target: "tokengate", key, count, fields = %rest, "{}", msg);
    }
}

impl fmt::Display for TracingLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&[]))
    }
}
