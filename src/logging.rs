use crate::config::AppConfig;
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber: rolling file plus stdout, or JSON to file.
///
/// Keep the returned guard alive for the life of the process or buffered
/// lines are lost on exit.
pub fn init_logging(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    let file_appender =
        RollingFileAppender::new(rotation(&config.rotation)?, &config.log_dir, &config.log_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(config)))?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // Each line carries the span of the pool worker that emitted it
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).try_init()?;
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).try_init()?;
    }

    Ok(guard)
}

pub fn rotation(name: &str) -> anyhow::Result<Rotation> {
    match name {
        "hourly" => Ok(Rotation::HOURLY),
        "daily" => Ok(Rotation::DAILY),
        "never" => Ok(Rotation::NEVER),
        other => anyhow::bail!("unknown log rotation: {}", other),
    }
}

/// Base level, sqlx statements muted to warn, then per-target overrides
/// such as `transfer_event_pool::event_pool::reaper=debug`
pub fn filter_directives(config: &AppConfig) -> String {
    let mut directives = vec![config.log_level.clone(), "sqlx=warn".to_string()];
    directives.extend(config.log_directives.iter().cloned());
    directives.join(",")
}

/// Span wrapping one background task of the pool
pub fn worker_span(worker: &'static str) -> Span {
    tracing::info_span!("pool_worker", worker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(directives: &[&str]) -> AppConfig {
        let mut config = AppConfig::from_yaml(
            "log_level: info\nlog_dir: ./logs\nlog_file: pool.log\nuse_json: false\n\
             rotation: never\ngateway:\n  host: 127.0.0.1\n  port: 8080\n",
        )
        .unwrap();
        config.log_directives = directives.iter().map(|d| d.to_string()).collect();
        config
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives(&config(&[])), "info,sqlx=warn");
        assert_eq!(
            filter_directives(&config(&["transfer_event_pool::event_pool::reaper=debug"])),
            "info,sqlx=warn,transfer_event_pool::event_pool::reaper=debug"
        );
        assert!(EnvFilter::try_new(filter_directives(&config(&["tower_http=trace"]))).is_ok());
    }

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly").unwrap(), Rotation::HOURLY);
        assert_eq!(rotation("never").unwrap(), Rotation::NEVER);
        assert!(rotation("weekly").is_err());
    }
}
