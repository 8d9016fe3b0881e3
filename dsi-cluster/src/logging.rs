use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::LoggingConfig;
use crate::error::{ClusterError, ClusterResult};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over everything; otherwise `debug` forces the debug
/// level and the configured level applies. Output goes to stdout, or is
/// appended to `log_file` when one is given.
pub fn init_tracing(
    logging: &LoggingConfig,
    log_file: Option<&Path>,
    debug: bool,
) -> ClusterResult<()> {
    let level = if debug { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };
    let ansi = log_file.is_none();

    let result = match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(false)
            .try_init(),
        "pretty" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init(),
        other => {
            return Err(ClusterError::config(format!(
                "unknown log format '{}', expected pretty or json",
                other
            )));
        }
    };

    result.map_err(|e| ClusterError::config(format!("failed to initialize logging: {}", e)))
}
