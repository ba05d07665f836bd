//! Tracing bootstrap shared by every binary.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` level. With `json` set, events are
/// emitted as one JSON object per line for log shipping.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // An already-installed global subscriber wins
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
