//! Cache metric emission: read paths increment the hit/miss counters.

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use serde_json::json;

use tessera::config::EngineSettings;
use tessera::domain::schema::{SetColumn, TypeDescriptor};
use tessera::domain::value::ColumnKind;
use tessera::engine::params::{ReadParams, WriteParams};
use tessera::engine::Engine;
use tessera::infra::cache::MemoryCache;
use tessera::infra::memory::MemoryExecutor;
use tessera::registry::TypeRegistry;
use tessera::Row;

fn widget_engine() -> Engine {
    let mut desc = TypeDescriptor::new("widget", "widgets", vec!["ID".into()]);
    desc.cache_name = Some("widget".into());
    desc.set_columns
        .insert("Name".into(), SetColumn::new(ColumnKind::Str));
    let registry = TypeRegistry::builder()
        .register(desc)
        .build()
        .expect("valid registry");

    let executor = Arc::new(MemoryExecutor::new());
    executor.create_table("widgets", vec!["ID".into()]);
    Engine::new(
        registry,
        executor,
        Arc::new(MemoryCache::new()),
        EngineSettings::default(),
    )
}

type Snapshot = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

fn counter_value(snapshot: &Snapshot, name: &str) -> u64 {
    snapshot
        .iter()
        .find(|(key, _, _, _)| key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => *count,
            _ => 0,
        })
        .unwrap_or(0)
}

#[test]
fn read_paths_emit_hit_and_miss_counters() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let engine = widget_engine();
            let mut item = Row::new();
            item.insert("ID".into(), json!(1));
            item.insert("Name".into(), json!("A"));
            engine
                .set_items(vec![item], "widget", &WriteParams::default())
                .await
                .unwrap();

            let mut stub = Row::new();
            stub.insert("ID".into(), json!(1));

            // First read misses, second is served from the item entry.
            engine
                .get_items(&[stub.clone()], "widget", &ReadParams::default())
                .await
                .unwrap();
            engine
                .get_items(&[stub], "widget", &ReadParams::default())
                .await
                .unwrap();
        });
    });

    let snapshot = snapshotter.snapshot().into_vec();
    assert!(counter_value(&snapshot, "tessera_cache_miss_total") >= 1);
    assert!(counter_value(&snapshot, "tessera_cache_hit_total") >= 1);
}
