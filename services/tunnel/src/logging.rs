//! Log line formatting for the tunnel client.
//!
//! Lines look like `[timestamp] [tunnel-component] [level] message`. The
//! component column comes from a `component` field, set through the
//! `component_*` macros; events without one are attributed to the service.

use anyhow::Result;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 9;

/// Crates whose events follow the configured level
const LOG_TARGETS: [&str; 3] = ["redb_tunnel", "tunnel_session", "tunnel_wire"];

/// Log at info level, attributed to a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn level, attributed to a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log at debug level, attributed to a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Log at error level, attributed to a component
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter producing aligned, optionally coloured lines
pub struct TunnelLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl TunnelLogFormatter {
    /// Formatter for `service_name`, coloured when attached to a terminal
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Force colours on or off
    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LOG_LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }
}

impl<S, N> FormatEvent<S, N> for TunnelLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            self.paint(COLOR_CYAN),
            timestamp,
            self.format_service_name(visitor.component.as_deref()),
            self.color_for_level(level),
            Self::format_log_level(level),
            self.paint(COLOR_RESET),
        )?;
        writeln!(writer, "{}{}", visitor.message, self.paint(COLOR_RESET))
    }
}

/// Pulls the message and component out of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

fn unquote(value: String) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => value,
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = unquote(format!("{:?}", value)),
            "component" => self.component = Some(unquote(format!("{:?}", value))),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

/// Filter passing `level` for the tunnel crates and info for everything else
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::new("info");
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{}={}", target, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber
pub fn init_logging(level: &str) -> Result<()> {
    let filter = build_filter(level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(TunnelLogFormatter::new("tunnel"))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(filter: &str, log: impl FnOnce()) -> String {
        let sink = Capture::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(build_filter(filter).unwrap())
            .with_writer(move || writer.clone())
            .event_format(TunnelLogFormatter::new("tunnel").with_color(false))
            .finish();
        tracing::subscriber::with_default(subscriber, log);
        let bytes = sink.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_service_name_column() {
        let formatter = TunnelLogFormatter::new("tunnel").with_color(false);
        let name = formatter.format_service_name(Some("hop"));
        assert_eq!(name.len(), SERVICE_NAME_WIDTH);
        assert!(name.starts_with("tunnel-hop "));

        assert_eq!(formatter.format_service_name(None).trim_end(), "tunnel");

        let long = formatter.format_service_name(Some("a-really-long-component"));
        assert_eq!(long.chars().count(), SERVICE_NAME_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_color_toggle() {
        let formatter = TunnelLogFormatter::new("tunnel").with_color(false);
        assert_eq!(formatter.color_for_level(&Level::ERROR), "");
        let formatter = formatter.with_color(true);
        assert_eq!(formatter.color_for_level(&Level::ERROR), COLOR_BRIGHT_RED);
    }

    #[test]
    fn test_component_lines() {
        let output = capture("debug", || {
            component_info!("config", "Loaded configuration from {}", "tunnel.yaml");
            tracing::warn!("plain event");
        });

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[tunnel-config"));
        assert!(lines[0].contains("ℹ INFO"));
        assert!(lines[0].ends_with("Loaded configuration from tunnel.yaml"));
        assert!(lines[1].contains("[tunnel "));
        assert!(lines[1].contains("⚠ WARN"));
        assert!(lines[1].ends_with("plain event"));
    }

    #[test]
    fn test_level_filter() {
        let output = capture("warn", || {
            component_debug!("client", "hidden");
            component_error!("client", "shown");
        });
        assert!(!output.contains("hidden"));
        assert!(output.contains("shown"));
    }

    #[test]
    fn test_filter_covers_tunnel_crates() {
        let filter = build_filter("debug").unwrap().to_string();
        for target in LOG_TARGETS {
            assert!(filter.contains(&format!("{}=debug", target)));
        }
    }
}
