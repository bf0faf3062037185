use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `PACKFEED_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for reader threads:
/// - Always include `worker` on events emitted from a production loop.
/// - Include `queue` and `sequence` on publish/retry events.
/// - Include `epoch` on anything emitted around a manifest wrap.
pub fn init_tracing() {
    let filter = env_filter();
    // A second init (e.g. several binaries sharing a test process) is not an error.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("PACKFEED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
