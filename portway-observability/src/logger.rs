use tracing_subscriber::EnvFilter;

/// Initialise the process-wide tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. With
/// `json` enabled, log lines are emitted as JSON objects for shipping.
pub fn init(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
