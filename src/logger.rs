//! Logging configuration

use crate::config::LogFormat;
use std::sync::LazyLock;
use tracing_subscriber::{
    fmt, fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log an event tagged with this host's name and current memory usage
#[macro_export]
macro_rules! log_with_context {
    ($level:ident, $($arg:tt)*) => {
        {
            let hostname = $crate::logger::get_hostname();
            let memory = $crate::logger::get_memory_usage();
            tracing::$level!(
                hostname = %hostname,
                memory = %memory,
                $($arg)*
            );
        }
    };
}

static HOSTNAME: LazyLock<String> = LazyLock::new(|| {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
});

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Resident memory of this process, e.g. `"12.4M"`
pub fn get_memory_usage() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok());
            if let Some(kb) = rss_kb {
                return format!("{:.1}M", kb / 1024.0);
            }
        }
    }

    let pid = sysinfo::Pid::from_u32(std::process::id());
    let mut system = sysinfo::System::new();
    system.refresh_process(pid);
    match system.process(pid) {
        Some(process) => format!("{:.1}M", process.memory() as f64 / (1024.0 * 1024.0)),
        None => "N/A".to_string(),
    }
}

pub fn get_hostname() -> &'static str {
    &HOSTNAME
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_logger(format: LogFormat) {
    match format {
        LogFormat::Compact => init_compact(),
        LogFormat::Detailed => init_detailed(),
        LogFormat::Json => init_json(),
    }
}

fn init_compact() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(
            fmt::layer()
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(false)
                .with_level(true)
                .with_ansi(true)
                .compact(),
        )
        .init();

    tracing::info!("Logger initialized");
}

fn init_detailed() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(
            fmt::layer()
                .with_timer(ChronoLocal::rfc_3339())
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .compact(),
        )
        .init();

    log_with_context!(info, "Logger initialized (detailed format)");
}

#[cfg(feature = "json")]
fn init_json() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(
            fmt::layer()
                .json()
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .init();

    tracing::info!("Logger initialized (JSON format)");
}

#[cfg(not(feature = "json"))]
fn init_json() {
    init_compact();
    tracing::warn!("JSON logging requires the `json` feature, using compact format");
}

#[cfg(test)]
pub fn init_test_logger() {
    use tracing_subscriber::fmt::TestWriter;

    let _ = tracing_subscriber::registry()
        .with(env_filter("error"))
        .with(
            fmt::layer()
                .with_writer(TestWriter::default())
                .with_target(false)
                .with_ansi(false)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_context() {
        assert!(!get_hostname().is_empty());
        let memory = get_memory_usage();
        assert!(memory.ends_with('M') || memory == "N/A");
    }
}
