use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// UTC wall-clock timestamp in `YYYY-MM-DD_HH:MM:SS` form
struct UtcTimestamp;

impl FormatTime for UtcTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Utc::now().format("%Y-%m-%d_%H:%M:%S"))
    }
}

/// One diagnostic line: `<timestamp> <LEVEL>: <message>`
struct LineFormat;

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARNING",
        Level::ERROR => "ERROR",
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        UtcTimestamp.format_time(&mut writer)?;
        write!(writer, " {}: ", level_label(event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Route all diagnostics to stderr as `<timestamp> <LEVEL>: <message>` lines.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .event_format(LineFormat)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_matches_expected_shape() {
        let mut rendered = String::new();
        UtcTimestamp
            .format_time(&mut Writer::new(&mut rendered))
            .unwrap();
        // e.g. 2026-08-02_13:59:01
        assert_eq!(rendered.len(), 19);
        assert_eq!(rendered.as_bytes()[4], b'-');
        assert_eq!(rendered.as_bytes()[10], b'_');
        assert_eq!(rendered.as_bytes()[13], b':');
    }

    #[test]
    fn level_labels_match_the_log_contract() {
        assert_eq!(level_label(&Level::INFO), "INFO");
        assert_eq!(level_label(&Level::WARN), "WARNING");
        assert_eq!(level_label(&Level::ERROR), "ERROR");
    }
}
