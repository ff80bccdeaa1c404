//! Tracing setup, tailored to this driver.
//!
//! Hosts that already install a `tracing` subscriber need nothing from
//! here besides the [`prelude`]. Standalone tools and tests can call
//! [`init`] to get a stdout subscriber filtered by `RUST_LOG`.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Install a stdout subscriber, filtering according to `RUST_LOG` with a
/// default level of INFO.
///
/// Does nothing if a global subscriber is already set, so tests may call
/// it repeatedly.
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

/// Format a byte slice for TRACE-level wire dumps.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
