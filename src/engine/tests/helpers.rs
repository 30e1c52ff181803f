use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::engine::{EngineConfig, HybridEngine};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with a memtable large enough that nothing rotates.
pub fn memtable_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        memtable_size_bytes: 64 * 1024,
        batch_interval: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

/// Tiny memtable and a one-deep immutable queue: rotations and level-0
/// flushes happen after a handful of writes.
pub fn small_buffer_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        memtable_size_bytes: 128,
        max_immutable_memtables: 1,
        batch_interval: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

pub fn open_engine(path: &Path, config: EngineConfig) -> HybridEngine {
    HybridEngine::open(path, config).expect("engine open")
}

/// Put `count` `prefix_<i>` keys with padded values.
pub fn fill(engine: &HybridEngine, count: usize, prefix: &str) {
    for i in 0..count {
        let key = format!("{prefix}_{i:04}").into_bytes();
        let value = format!("value_with_some_padding_{i:04}").into_bytes();
        engine.put(key, value).expect("put");
    }
}
