//! Logging init for engine collaborators (CLI, headless containers).
//!
//! The engine itself only emits `tracing` events; whoever embeds it decides
//! where they go. This helper installs the stderr subscriber the CLI uses.

use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr with `RUST_LOG`-style filtering.
/// Defaults to `info` globally and `debug` for the engine crates.
pub fn init_stderr() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,arcgrab_core=debug,arcgrab_cli=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
