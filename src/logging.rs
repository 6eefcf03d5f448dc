//! Logging setup
//!
//! Debug builds log to stderr; release builds log to a daily rolling file so
//! the host application can ship the log with bug reports.

use std::path::Path;
use tracing::level_filters::LevelFilter;

/// Initialize tracing for the capture engine (call once at startup)
///
/// `log_dir` is only used by release builds. Initializing twice is harmless.
#[allow(unused_variables)]
pub fn init_logging(log_dir: Option<&Path>) -> Result<(), String> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    {
        let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        let log_dir = log_dir
            .map(|p| p.join("logs"))
            .unwrap_or_else(|| std::path::PathBuf::from("logs"));

        std::fs::create_dir_all(&log_dir).map_err(|e| {
            format!(
                "Failed to create log directory {}: {}",
                log_dir.display(),
                e
            )
        })?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "capture_core");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Logging lasts until process exit
        std::mem::forget(guard);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .try_init();
    }

    tracing::info!("capture core initialized v{}", crate::VERSION);
    Ok(())
}

fn resolve_log_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => parse_level(&val),
        Err(_) => LevelFilter::INFO,
    }
}

fn parse_level(value: &str) -> LevelFilter {
    match value.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}
