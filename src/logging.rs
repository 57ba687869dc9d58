//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the output format; `json` switches to
/// one JSON object per line.
pub const LOG_FORMAT_ENV: &str = "RECOVERABILITY_LOG_FORMAT";

/// Install the global subscriber. The filter comes from `RUST_LOG` and
/// defaults to `info`. Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        tracing::debug!("logging already initialised: {err}");
    }
}
