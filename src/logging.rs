use std::path::Path;
use std::sync::Once;

use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initializes tracing for an embedding tool: a per-run log file under
/// `log_dir` plus console output, filtered through `RUST_LOG`. Only the
/// first call installs the subscriber; later calls are no-ops.
pub fn init_logging(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let mut outcome = Ok(());
    INIT.call_once(|| outcome = install(log_dir, service_name));
    outcome
}

fn install(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    // Each run writes a fresh file; the previous run's log is kept aside.
    let _ = rotate_previous_log(log_dir, service_name);
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::never(log_dir, format!("{service_name}.log"));
    let (non_blocking_file, file_guard) = non_blocking(file_appender);

    let (non_blocking_stdout, stdout_guard) = non_blocking(std::io::stdout());

    // Full detail in the file, no colors.
    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    // RUST_LOG wins; default to info otherwise.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    // The writer guards must outlive every log call.
    std::mem::forget(file_guard);
    std::mem::forget(stdout_guard);

    info!("Logging to {log_dir}/{service_name}.log");

    Ok(())
}

/// Moves the previous run's log file to a timestamped backup.
pub fn rotate_previous_log(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let current = Path::new(log_dir).join(format!("{service_name}.log"));
    if !current.exists() {
        return Ok(());
    }

    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup = Path::new(log_dir).join(format!("{service_name}.{stamp}.log"));
    std::fs::rename(&current, &backup)?;
    info!("Previous log file backed up to: {}", backup.display());
    Ok(())
}
