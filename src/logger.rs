use std::fs;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset. Transport internals are noisy at
/// debug and info.
const DEFAULT_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn,mio=warn,cpal=warn";

/// Initialize structured logging.
///
/// Sets up:
/// - File output: `{log_dir}/tutor.log.<date>`, daily rotation, latest 5 kept.
/// - Console output on stderr (stdout carries the IPC stream).
/// - Environment filter from `RUST_LOG`, defaulting to `info`.
///
/// Falls back to stderr only if the log directory is unusable. Returns an
/// error if a global subscriber is already set.
pub fn init(log_dir: &Path) -> Result<(), String> {
    let file_appender = fs::create_dir_all(log_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("tutor")
                .filename_suffix("log")
                .max_log_files(5)
                .build(log_dir)
                .map_err(|e| e.to_string())
        });

    let (file_layer, file_error) = match file_appender {
        Ok(appender) => (
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| e.to_string())?;

    match file_error {
        None => tracing::info!(log_dir = %log_dir.display(), "Logger initialized"),
        Some(e) => tracing::warn!(
            log_dir = %log_dir.display(),
            "File logging disabled: {}",
            e
        ),
    }
    Ok(())
}
