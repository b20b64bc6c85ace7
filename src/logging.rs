//! Tracing initialization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "warn,treebot=debug"
    } else {
        "warn,treebot=info"
    }
}

/// Build the env filter: `RUST_LOG` wins when set, otherwise the crate
/// logs at `info` (or `debug` in debug mode) and dependencies stay quiet.
fn build_env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

/// Install the global fmt subscriber. Call once at startup; embedders that
/// install their own subscriber can skip this.
pub fn init(debug: bool) {
    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(test)]
mod tests {
    use super::default_directive;

    #[test]
    fn debug_flag_raises_crate_verbosity() {
        assert!(default_directive(true).contains("treebot=debug"));
        assert!(default_directive(false).contains("treebot=info"));
    }
}
