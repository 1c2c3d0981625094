//! Tracing setup: stdout plus optional hourly-rotated info/error files.

use frontgate_core::{GateError, GateResult};
use std::path::Path;
use tracing::{Level, Metadata};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// One week of hourly files.
const MAX_LOG_FILES: usize = 24 * 7;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. Events below WARN go to `info_path`, WARN
/// and above to `error_path`. The returned guards flush the file writers and
/// must be held until shutdown.
pub fn init(
    level: &str,
    info_path: Option<&Path>,
    error_path: Option<&Path>,
) -> GateResult<Vec<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let mut guards = Vec::new();

    let info_layer = match info_path {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(path)?);
            guards.push(guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter_fn(below_warn)),
            )
        }
        None => None,
    };

    let error_layer = match error_path {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(path)?);
            guards.push(guard);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter_fn(warn_and_above)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(info_layer)
        .with(error_layer)
        .try_init()
        .map_err(|e| GateError::Config(format!("tracing init failed: {e}")))?;

    Ok(guards)
}

fn below_warn(meta: &Metadata<'_>) -> bool {
    *meta.level() > Level::WARN
}

fn warn_and_above(meta: &Metadata<'_>) -> bool {
    *meta.level() <= Level::WARN
}

/// `/var/log/frontgate/info.log` rotates as `info.log.YYYY-MM-DD-HH` in the same directory.
fn rolling_appender(path: &Path) -> GateResult<RollingFileAppender> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let prefix = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GateError::Config(format!("invalid log path: {}", path.display())))?;

    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .map_err(|e| GateError::Config(format!("cannot open log {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_split() {
        // tracing orders levels by verbosity: ERROR < WARN < INFO.
        assert!(Level::INFO > Level::WARN);
        assert!(Level::DEBUG > Level::WARN);
        assert!(Level::ERROR <= Level::WARN);
    }

    #[test]
    fn appender_in_temp_dir() {
        let dir = std::env::temp_dir().join(format!("frontgate-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(rolling_appender(&dir.join("info.log")).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
