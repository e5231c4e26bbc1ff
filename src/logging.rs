//! Structured logging setup: a `tracing-subscriber` `fmt` layer driven by
//! `RUST_LOG`, replacing the ad-hoc `LOG_I`/`LOG_D`/`LOG_W`/`LOG_E` call
//! sites scattered through `hev-thread-pool.c` and `hev-socks5-tunnel.c`
//! with levelled, structured events.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call once per process; a second
/// call is a silent no-op (`set_global_default` failing is not fatal here).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
