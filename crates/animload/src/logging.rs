use std::env;

use animload_service::config::{Config, LogFormat};
use animload_service::logging::json_layer;
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => {
            "INFO,\
             moka=WARN"
        }
        LevelFilter::DEBUG => {
            "INFO,\
             moka=WARN,\
             animload=DEBUG,\
             animload_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             moka=WARN,\
             animload=TRACE,\
             animload_service=TRACE"
        }
    }
}

/// Initializes logging for the command line.
///
/// `RUST_LOG` takes precedence over the configured level. `RUST_BACKTRACE` is switched on
/// when [`enable_backtraces`](animload_service::config::Logging::enable_backtraces) is set.
///
/// # Safety
/// Must be called while the process is still single-threaded, as it may modify the environment
/// with [`std::env::set_var`].
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: the caller guarantees that no other thread reads the environment.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level).to_string());

    // logs go to stderr, stdout is reserved for the tables
    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
            .with_writer(std::io::stderr);

        match (config.logging.format, console::user_attended_stderr()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                layer.compact().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => json_layer(std::io::stderr),
        }
    }
    .with_filter(EnvFilter::new(&rust_log));

    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// Reports a fatal error, through the logger if it would show errors and on `stderr` otherwise.
pub fn ensure_log_error(error: &anyhow::Error) {
    let logged = tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current();
    if logged {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
