// tracing subscriber setup

use std::sync::Once;

use tracing::debug;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

fn default_directives(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!(
        "youtube_converter_lib={level},youtube_converter={level},chromiumoxide=warn,tungstenite=warn",
        level = level
    )
}

/// Install the fmt subscriber on stderr. `RUST_LOG` wins over `verbosity`.
/// Later calls are no-ops, as is calling after another subscriber was set.
pub fn init(verbosity: u8) {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();

        debug!("tracing initialized");
    });
}
