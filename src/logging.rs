//! Log formatting for shardfs processes
//!
//! Every line starts with the host name and, for servers, the node id so
//! that logs from several servers can be merged and still be told apart.
//! Output carries no ANSI color codes.

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

use crate::metadata::ServerId;

/// Event formatter with a `[host/node_N]` prefix
///
/// Line layout:
/// `[host/node_0] 2024-01-01T00:00:00.000000Z INFO  span{a=1}:span2: target:file:line: message`
pub struct HostnameFormatter {
    prefix: String,
    with_location: bool,
}

impl HostnameFormatter {
    pub fn new() -> Self {
        Self {
            prefix: hostname(),
            with_location: true,
        }
    }

    /// Tag lines with the server id as well
    pub fn for_server(server_id: ServerId) -> Self {
        Self {
            prefix: format!("{}/node_{}", hostname(), server_id),
            with_location: true,
        }
    }

    pub fn with_location(mut self, enabled: bool) -> Self {
        self.with_location = enabled;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for HostnameFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn hostname() -> String {
    gethostname::gethostname()
        .to_str()
        .unwrap_or("unknown")
        .to_string()
}

impl<S, N> FormatEvent<S, N> for HostnameFormatter
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
        let meta = event.metadata();
        let datetime: chrono::DateTime<chrono::Utc> = std::time::SystemTime::now().into();

        write!(
            writer,
            "[{}] {} {:5} ",
            self.prefix,
            datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            meta.level()
        )?;

        // root から順に span{fields}: を並べる
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, ":")?;
            }
            write!(writer, " ")?;
        }

        write!(writer, "{}", meta.target())?;
        if self.with_location {
            if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
                write!(writer, ":{}:{}", file, line)?;
            }
        }

        write!(writer, ": ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn install(level: &str, formatter: HostnameFormatter) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    // RUST_LOG が設定されていればそちらを優先する
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let prefix = formatter.prefix().to_string();

    let fmt_layer = fmt::layer()
        .event_format(formatter)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
        return;
    }
    tracing::info!("Logging initialized ({})", prefix);
}

/// Initialize tracing with the hostname formatter (client processes)
pub fn init_with_hostname(level: &str) {
    install(level, HostnameFormatter::new());
}

/// Initialize tracing for a metadata server
pub fn init_for_server(level: &str, server_id: ServerId) {
    install(level, HostnameFormatter::for_server(server_id));
}
