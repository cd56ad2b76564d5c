//! Multi-peer test harness: in-process databases wired together by
//! state-vector sync.

mod network;
mod peer;

pub use network::TestNetwork;
pub use peer::TestPeer;

use tracing_subscriber::EnvFilter;

/// Route `tracing` output to the test writer. Honours `RUST_LOG`; safe to
/// call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
