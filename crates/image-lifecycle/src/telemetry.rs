//! Log output for `imagectl`.
//!
//! Everything goes to stderr. Stdout carries the `list` table and the JSON
//! run report, so nothing from tracing may land there.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// HTTP plumbing that is only interesting when asked for by name.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Filter used when `RUST_LOG` is unset: `level` for our crates, `warn`
/// for the HTTP stack underneath the cloud client.
fn default_filter(level: Level) -> EnvFilter {
    QUIET_TARGETS
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.as_str()), EnvFilter::add_directive)
}

/// Install the process-wide subscriber.
///
/// `json` switches to one JSON object per line for CI log collectors.
/// Returns `false` if a subscriber was already installed, in which case
/// the existing one is left alone.
pub fn init_tracing(json: bool, level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    let json_layer = json.then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json()
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok()
}
