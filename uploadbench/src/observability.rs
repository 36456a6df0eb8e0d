use std::env;
use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{LogFormat, Logging};

/// Installs the global subscriber writing to stderr.
pub fn init_tracing(logging: &Logging) {
    let (level, env_filter) = parse_rust_log(logging.level);

    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let format = match resolve_format(logging.format) {
        LogFormat::Json => format.json().flatten_event(true).boxed(),
        LogFormat::Simplified => format.with_ansi(false).boxed(),
        LogFormat::Pretty | LogFormat::Auto => format.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(format.with_filter(level))
        .with(env_filter)
        .init();
}

fn resolve_format(format: LogFormat) -> LogFormat {
    match format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

/// Returns the maximum level and the per-module filter.
///
/// `RUST_LOG` overrides the configured level if it is a plain level. Otherwise, it is used
/// literally as a filter directive.
pub fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "WARN,\
        uploadbench=TRACE,\
        uploadbench_service=TRACE,\
        ",
    );

    (level, env_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_format_is_kept() {
        assert_eq!(resolve_format(LogFormat::Json), LogFormat::Json);
        assert_eq!(resolve_format(LogFormat::Simplified), LogFormat::Simplified);
        assert_ne!(resolve_format(LogFormat::Auto), LogFormat::Auto);
    }

    #[test]
    fn rust_log_level() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RUST_LOG", "debug");
            let (level, _) = parse_rust_log(LevelFilter::WARN);
            assert_eq!(level, LevelFilter::DEBUG);

            jail.set_env("RUST_LOG", "uploadbench::scheduler=trace");
            let (level, filter) = parse_rust_log(LevelFilter::WARN);
            assert_eq!(level, LevelFilter::TRACE);
            assert!(filter.to_string().contains("uploadbench::scheduler=trace"));

            Ok(())
        });
    }
}
