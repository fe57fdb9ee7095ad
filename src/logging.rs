//! Diagnostics for the CLI.
//!
//! Review results go to stdout. Everything logged through `tracing` goes to
//! stderr and is filtered by `RUST_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Defaults to `warn` if `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=latio=debug latio partial . --file app/api.py
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
