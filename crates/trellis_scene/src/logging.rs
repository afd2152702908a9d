//! Tracing subscriber setup for hosts
//!
//! Every subsystem logs under its module path (`trellis_scene::entity`,
//! `trellis_core::schema`, ...), so a filter like
//! `trellis_scene::mixin=debug,warn` isolates one channel.

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber
///
/// `filter` takes precedence, then `RUST_LOG`, then `info`. Calling this
/// again after a subscriber is installed does nothing.
pub fn init_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
