use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global crash log directory, set during init.
static CRASH_LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize tracing with a stdout layer and a Sentry layer.
///
/// - Stdout: compact human format, or one JSON object per line when `json`
/// - Sentry: captures ERROR events as issues, WARN as breadcrumbs
/// - Default level: INFO, override via RUST_LOG env
pub fn init(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_lib=debug,assistant_core=debug"));

    let compact_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .compact()
    });
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
    });

    // No-op when Sentry DSN is not configured.
    let sentry_layer = sentry_tracing::layer().event_filter(|meta| match *meta.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    // A second init (tests, embedding hosts) keeps the existing subscriber.
    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(compact_layer)
        .with(json_layer)
        .with(sentry_layer)
        .try_init();

    if result.is_ok() {
        tracing::debug!(json, "Tracing initialized");
    }
}

/// Install a panic hook that writes crash details to a file, then defers to
/// the previous hook. Must be called after the data directory is known.
pub fn install_crash_hook(data_dir: &Path) {
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "full");
    }

    let crash_dir = data_dir.join("crash_logs");
    let _ = std::fs::create_dir_all(&crash_dir);
    CRASH_LOG_DIR.set(crash_dir).ok();

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(dir) = CRASH_LOG_DIR.get() {
            let now = chrono::Local::now();
            let path = dir.join(format!("crash_{}.log", now.format("%Y%m%d_%H%M%S")));

            let message = if let Some(msg) = info.payload().downcast_ref::<&str>() {
                (*msg).to_string()
            } else if let Some(msg) = info.payload().downcast_ref::<String>() {
                msg.clone()
            } else {
                "<unknown payload>".to_string()
            };
            let location = info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));

            let report = format_crash_report(
                &now.to_rfc3339(),
                &message,
                location.as_deref(),
                &std::backtrace::Backtrace::force_capture().to_string(),
            );
            let _ = std::fs::write(&path, &report);
            eprintln!("[CRASH] Report written to: {}", path.display());
        }

        prev_hook(info);
    }));

    tracing::info!("Crash hook installed");
}

fn format_crash_report(time: &str, message: &str, location: Option<&str>, backtrace: &str) -> String {
    let thread = std::thread::current();
    let mut report = format!(
        "=== ASSISTANT CRASH REPORT ===\n\
         Time: {}\n\
         Version: {}\n\n\
         Panic: {}\n",
        time,
        env!("CARGO_PKG_VERSION"),
        message,
    );
    if let Some(loc) = location {
        report.push_str(&format!("Location: {loc}\n"));
    }
    report.push_str(&format!("\nBacktrace:\n{backtrace}\n"));
    report.push_str(&format!("\nThread: {:?} (id: {:?})\n", thread.name(), thread.id()));
    report
}
