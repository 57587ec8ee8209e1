use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Metadata};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             folio_fetch=DEBUG,\
             folio_stress=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             folio_fetch=TRACE,\
             folio_stress=TRACE"
        }
    }
}

/// Picks the filter directives, preferring a non-empty `RUST_LOG` over the configured level.
fn filter_directives(level: LevelFilter, rust_log: Option<String>) -> String {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| get_rust_log(level).to_owned())
}

/// Resolves [`LogFormat::Auto`] depending on whether a user is watching the output.
fn resolve_format(format: LogFormat, attended: bool) -> LogFormat {
    match (format, attended) {
        (LogFormat::Auto, true) => LogFormat::Pretty,
        (LogFormat::Auto, false) => LogFormat::Simplified,
        (format, _) => format,
    }
}

/// Decides what the sentry layer does with a log record.
///
/// Errors are reported as events, `INFO` and `WARN` as logs. Failed fetches are logged at
/// `DEBUG`; those are kept as breadcrumbs so they show up next to the errors they lead to.
fn sentry_event_filter(metadata: &Metadata<'_>) -> EventFilter {
    match *metadata.level() {
        Level::ERROR => EventFilter::Event | EventFilter::Log,
        Level::WARN | Level::INFO => EventFilter::Log,
        Level::DEBUG if metadata.target().starts_with("folio_fetch") => EventFilter::Breadcrumb,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// Initializes logging for a process embedding the fetch layer.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration. Additionally, this toggles `RUST_BACKTRACE` based on the
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces)
/// config value.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives = filter_directives(config.logging.level, env::var("RUST_LOG").ok());

    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true);

        match resolve_format(config.logging.format, console::user_attended()) {
            LogFormat::Json => layer
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
            LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
            LogFormat::Auto | LogFormat::Pretty => layer.pretty().boxed(),
        }
    }
    .with_filter(EnvFilter::new(&directives));

    let sentry_layer = sentry::integrations::tracing::layer().event_filter(sentry_event_filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
