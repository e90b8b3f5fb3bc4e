use std::io;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::filter::FilterFn;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the stdout and daily-rolling file layers.
///
/// `RUST_LOG` overrides the stdout filter when set.
pub fn configure_logging() {
    // sqlx logs every statement at INFO, which drowns out merge actions
    let custom_filter = FilterFn::new(|metadata| {
        !(metadata.level() == &Level::INFO && metadata.target().starts_with("sqlx::query"))
    });

    let stdout_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,llm_request=warn,db_query=warn,sqlx=off"));

    let stdout_log = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(stdout_filter)
        .with_filter(custom_filter);

    let file_appender = rolling::daily("logs", "kgdedup.log");
    let file_log = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new(
            "info,dedup=debug,llm_request=debug,db_query=info,sqlx=warn",
        ));

    tracing_subscriber::Registry::default()
        .with(stdout_log)
        .with(file_log)
        .init();
}
