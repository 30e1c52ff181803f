use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::wal::{Wal, WalError, WalRecovery};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a WAL with a generous rotation threshold and fsync enabled.
pub fn open_wal(dir: &Path) -> Result<(Wal, WalRecovery), WalError> {
    init_tracing();
    Wal::open(dir, 64 * 1024 * 1024, true)
}

/// Open a WAL with a tiny rotation threshold to force frequent rotation.
pub fn open_small_wal(dir: &Path) -> Result<(Wal, WalRecovery), WalError> {
    init_tracing();
    Wal::open(dir, 256, true)
}
