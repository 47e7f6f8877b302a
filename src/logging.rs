//! Process-wide structured logging init.
//!
//! spec.md §1 calls the process-wide logger an external collaborator — that
//! refers to the multi-binary product's shared logging *installation*, not
//! to this crate's events. This module owns the one init step the core needs
//! and nothing beyond it: no log sinks, no rotation, no dashboard feed.

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber seeded from `log_level` (config.yaml),
/// with `RUST_LOG` taking precedence when set.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(log_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn normalize_level(level: &str) -> &str {
    match level.to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}
