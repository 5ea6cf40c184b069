//! Advisory locking tests: mutual exclusion, staleness, token-scoped
//! unlock, and the write path's lock lifecycle.

use std::sync::Arc;

use serde_json::{Value, json};

use tessera::config::EngineSettings;
use tessera::domain::schema::{LockColumns, SetColumn, TypeDescriptor};
use tessera::domain::value::ColumnKind;
use tessera::engine::params::WriteParams;
use tessera::engine::{Engine, LockOutcome};
use tessera::infra::cache::MemoryCache;
use tessera::infra::executor::QueryExecutor;
use tessera::infra::memory::MemoryExecutor;
use tessera::registry::TypeRegistry;
use tessera::{EngineError, ResultCode, Row};

fn locked_descriptor(stale_secs: i64) -> TypeDescriptor {
    let mut desc = TypeDescriptor::new("widget", "widgets", vec!["ID".into()]);
    desc.set_columns
        .insert("Name".into(), SetColumn::new(ColumnKind::Str));
    let mut lock = LockColumns::new("LockToken", "LockTime");
    lock.stale_after_secs = Some(stale_secs);
    lock.attempts = Some(2);
    lock.delay_ms = Some(1);
    desc.lock = Some(lock);
    desc
}

async fn engine_with(desc: TypeDescriptor) -> (Engine, Arc<MemoryExecutor>) {
    let registry = TypeRegistry::builder()
        .register(desc)
        .build()
        .expect("valid registry");
    let executor = Arc::new(MemoryExecutor::new());
    executor.create_table("widgets", vec!["ID".into()]);
    let engine = Engine::new(
        registry,
        executor.clone(),
        Arc::new(MemoryCache::new()),
        EngineSettings::default(),
    );
    (engine, executor)
}

fn row(pairs: &[(&str, Value)]) -> Row {
    let mut row = Row::new();
    for (key, value) in pairs {
        row.insert((*key).to_string(), value.clone());
    }
    row
}

fn stub(id: i64) -> Row {
    row(&[("ID", json!(id))])
}

async fn seed(engine: &Engine) {
    engine
        .set_items(
            vec![row(&[("ID", json!(1)), ("Name", json!("A"))])],
            "widget",
            &WriteParams::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn at_most_one_lock_attempt_wins_within_the_window() {
    let (engine, _) = engine_with(locked_descriptor(60)).await;
    seed(&engine).await;

    let first = engine.lock_items(&[stub(1)], "widget", None).await.unwrap();
    let token = match &first["1"] {
        LockOutcome::Acquired(token) => token.clone(),
        other => panic!("expected Acquired, got {other:?}"),
    };

    // A second attempt with a different token sees the remaining TTL, not
    // a token.
    let second = engine
        .lock_items(&[stub(1)], "widget", Some("other-token".into()))
        .await
        .unwrap();
    match &second["1"] {
        LockOutcome::Held { retry_after_secs } => assert!(*retry_after_secs > 0),
        other => panic!("expected Held, got {other:?}"),
    }

    // The original holder still owns it.
    let again = engine
        .lock_items(&[stub(1)], "widget", Some(token))
        .await
        .unwrap();
    assert!(matches!(again["1"], LockOutcome::Acquired(_)));
}

#[tokio::test]
async fn locking_an_absent_row_reports_missing() {
    let (engine, _) = engine_with(locked_descriptor(60)).await;
    let outcomes = engine.lock_items(&[stub(9)], "widget", None).await.unwrap();
    assert_eq!(outcomes["9"], LockOutcome::Missing);
}

#[tokio::test]
async fn stale_locks_are_reclaimed() {
    let (engine, executor) = engine_with(locked_descriptor(60)).await;
    seed(&engine).await;

    // Plant an abandoned claim from well past the staleness window.
    let stale_time = time::OffsetDateTime::now_utc().unix_timestamp() - 3600;
    executor
        .update(
            &tessera::domain::query::TableExpr::Table("widgets".into()),
            &[
                tessera::domain::query::Assignment::new("LockToken", json!("dead")),
                tessera::domain::query::Assignment::new("LockTime", json!(stale_time)),
            ],
            &tessera::domain::query::Condition::All,
            &tessera::domain::query::WriteOptions::default(),
        )
        .await
        .unwrap();

    let outcomes = engine.lock_items(&[stub(1)], "widget", None).await.unwrap();
    assert!(matches!(outcomes["1"], LockOutcome::Acquired(_)));
}

#[tokio::test]
async fn unlock_is_scoped_to_the_holding_token() {
    let (engine, executor) = engine_with(locked_descriptor(60)).await;
    seed(&engine).await;

    let outcomes = engine.lock_items(&[stub(1)], "widget", None).await.unwrap();
    let token = match &outcomes["1"] {
        LockOutcome::Acquired(token) => token.clone(),
        other => panic!("expected Acquired, got {other:?}"),
    };

    // A stranger's token releases nothing.
    engine
        .unlock_items(&[stub(1)], "widget", Some("stranger"))
        .await
        .unwrap();
    assert_eq!(executor.rows("widgets")[0]["LockToken"], json!(token));

    // The holder's token does.
    engine
        .unlock_items(&[stub(1)], "widget", Some(&token))
        .await
        .unwrap();
    assert!(executor.rows("widgets")[0]["LockToken"].is_null());
}

#[tokio::test]
async fn unconditional_unlock_releases_any_holder() {
    let (engine, executor) = engine_with(locked_descriptor(60)).await;
    seed(&engine).await;

    engine.lock_items(&[stub(1)], "widget", None).await.unwrap();
    let code = engine.unlock_items(&[stub(1)], "widget", None).await.unwrap();
    assert_eq!(code, ResultCode::Ok);
    assert!(executor.rows("widgets")[0]["LockToken"].is_null());
}

#[tokio::test]
async fn locking_requires_configured_lock_columns() {
    let mut desc = TypeDescriptor::new("widget", "widgets", vec!["ID".into()]);
    desc.set_columns
        .insert("Name".into(), SetColumn::new(ColumnKind::Str));
    let (engine, _) = engine_with(desc).await;

    let err = engine.lock_items(&[stub(1)], "widget", None).await.unwrap_err();
    assert!(matches!(err, EngineError::LockNotConfigured(_)));
}

#[tokio::test]
async fn write_path_locks_and_always_releases() {
    let (engine, executor) = engine_with(locked_descriptor(60)).await;
    seed(&engine).await;

    let mut params = WriteParams::default();
    params.mode = tessera::WriteMode::Override;
    let outcomes = engine
        .set_items(
            vec![row(&[("ID", json!(1)), ("Name", json!("B"))])],
            "widget",
            &params,
        )
        .await
        .unwrap();
    assert_eq!(outcomes["1"], ResultCode::Ok);

    let stored = &executor.rows("widgets")[0];
    assert_eq!(stored["Name"], json!("B"));
    assert!(stored["LockToken"].is_null());
    assert!(stored["LockTime"].is_null());
}

#[tokio::test]
async fn write_path_gives_up_on_foreign_locks_within_budget() {
    let (engine, executor) = engine_with(locked_descriptor(60)).await;
    seed(&engine).await;

    // Someone else holds the row and their claim is fresh.
    engine
        .lock_items(&[stub(1)], "widget", Some("foreign-holder".into()))
        .await
        .unwrap();

    let mut params = WriteParams::default();
    params.mode = tessera::WriteMode::Override;
    params.quiet = true;
    let outcomes = engine
        .set_items(
            vec![row(&[("ID", json!(1)), ("Name", json!("B"))])],
            "widget",
            &params,
        )
        .await
        .unwrap();
    assert_eq!(outcomes["1"], ResultCode::Infrastructure);

    // The foreign lock survives, the row is untouched.
    let stored = &executor.rows("widgets")[0];
    assert_eq!(stored["Name"], json!("A"));
    assert_eq!(stored["LockToken"], json!("foreign-holder"));
}

#[tokio::test]
async fn caller_supplied_token_skips_internal_locking() {
    let (engine, executor) = engine_with(locked_descriptor(60)).await;
    seed(&engine).await;

    // Caller locked beforehand and passes its token through the write.
    let outcomes = engine
        .lock_items(&[stub(1)], "widget", Some("caller-token".into()))
        .await
        .unwrap();
    assert!(matches!(outcomes["1"], LockOutcome::Acquired(_)));

    let mut params = WriteParams::default();
    params.mode = tessera::WriteMode::Override;
    params.lock_token = Some("caller-token".into());
    engine
        .set_items(
            vec![row(&[("ID", json!(1)), ("Name", json!("B"))])],
            "widget",
            &params,
        )
        .await
        .unwrap();

    // The engine did not release the caller's lock.
    let stored = &executor.rows("widgets")[0];
    assert_eq!(stored["Name"], json!("B"));
    assert_eq!(stored["LockToken"], json!("caller-token"));

    engine
        .unlock_items(&[stub(1)], "widget", Some("caller-token"))
        .await
        .unwrap();
    assert!(executor.rows("widgets")[0]["LockToken"].is_null());
}
