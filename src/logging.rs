use tracing_subscriber::{EnvFilter, prelude::*};

/// Installs the stderr subscriber. `RUST_LOG` wins over `default_directive`.
/// Calling it twice is harmless, which keeps tests and binaries simple.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
