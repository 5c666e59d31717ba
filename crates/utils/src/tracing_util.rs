//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Set by kernel-install when it was invoked with `--verbose`.
const KERNEL_INSTALL_VERBOSE: &str = "KERNEL_INSTALL_VERBOSE";

fn default_level() -> LevelFilter {
    match std::env::var(KERNEL_INSTALL_VERBOSE).as_deref() {
        Ok("1") => LevelFilter::DEBUG,
        _ => LevelFilter::WARN,
    }
}

/// Initialize tracing with the default configuration.
///
/// Output goes to stderr, since stdout of a kernel-install plugin is
/// shown to the user verbatim. `RUST_LOG` takes precedence over the
/// default level.
pub fn initialize_tracing() {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = EnvFilter::builder()
        .with_default_directive(default_level().into())
        .from_env_lossy();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
