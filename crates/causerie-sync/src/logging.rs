//! Tracing setup for embedding applications.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default subscriber: `RUST_LOG` when set, otherwise engine
/// debug / store info.  Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("causerie_sync=debug,causerie_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
