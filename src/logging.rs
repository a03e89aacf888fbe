//! Tracing subscriber setup for the CLI.
//!
//! Logs go to stderr so stdout stays clean for JSON output. `RUST_LOG`
//! overrides the verbosity flag when set.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Default filter for a `-v` count.
pub fn level_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "partner_search=info,warn",
        2 => "partner_search=debug,info",
        _ => "trace",
    }
}

/// Install the global subscriber. The returned guard flushes the log file
/// on drop and must be held for the life of the process.
pub fn init(verbose: u8, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(verbose)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(file_writer))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
            Ok(None)
        }
    }
}
