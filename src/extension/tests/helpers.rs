use tracing_subscriber::EnvFilter;

use crate::config::{DeletePolicy, ExtensionConfig, LayoutPolicy};
use crate::extension::DynamicExtension;
use crate::query::{RangeParams, RangeQuery};
use crate::record::KeyValue;
use crate::shard::SortedRunShard;

pub type Rec = KeyValue<u64, u64>;
pub type Run = SortedRunShard<u64, u64>;
pub type Index = DynamicExtension<Rec, Run>;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call multiple
/// times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn kv(k: u64, v: u64) -> Rec {
    KeyValue::new(k, v)
}

/// Serial scheduler: every reconstruction runs inline at the insert that
/// crosses the low watermark, making flush boundaries deterministic.
pub fn serial_config(lwm: usize, hwm: usize, scale_factor: usize) -> ExtensionConfig {
    init_tracing();
    ExtensionConfig {
        buffer_lwm: lwm,
        buffer_hwm: hwm,
        scale_factor,
        thread_count: 0,
        ..ExtensionConfig::default()
    }
}

pub fn serial_index(lwm: usize, hwm: usize, scale_factor: usize) -> Index {
    DynamicExtension::new(serial_config(lwm, hwm, scale_factor)).expect("valid config")
}

pub fn serial_index_with_layout(
    lwm: usize,
    hwm: usize,
    scale_factor: usize,
    layout: LayoutPolicy,
) -> Index {
    let config = ExtensionConfig {
        layout_policy: layout,
        ..serial_config(lwm, hwm, scale_factor)
    };
    DynamicExtension::new(config).expect("valid config")
}

pub fn tagging_index(lwm: usize, hwm: usize, scale_factor: usize) -> Index {
    let config = ExtensionConfig {
        delete_policy: DeletePolicy::Tagging,
        ..serial_config(lwm, hwm, scale_factor)
    };
    DynamicExtension::new(config).expect("valid config")
}

/// Inserts `(k, k)` for every key in the range.
pub fn fill(index: &Index, keys: impl IntoIterator<Item = u64>) {
    for k in keys {
        index.insert(kv(k, k)).expect("insert accepted");
    }
}

/// Runs an inclusive range query and returns the matching keys, sorted.
pub fn range_keys(index: &Index, lower: u64, upper: u64) -> Vec<u64> {
    index
        .query::<RangeQuery<u64, u64>>(RangeParams { lower, upper })
        .expect("query accepted")
        .wait()
        .expect("query resolved")
        .into_iter()
        .map(|r| r.key)
        .collect()
}
