//! Advisory row lock manager.
//!
//! Locking is cooperative: a lock is a token in the row's lock column plus
//! a claim timestamp, honoured only by callers that choose to lock. A
//! single conditional update claims every still-free (or stale) row in the
//! batch; confirmation is a re-read. There is no blocking — the write path
//! retries a bounded number of times with a deterministic millisecond
//! jitter between attempts.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::LockTuning;
use crate::domain::query::{Assignment, CmpOp, Condition, Row, SelectColumn, SelectOptions, TableExpr, WriteOptions};
use crate::domain::schema::{LockColumns, TypeDescriptor};
use crate::infra::executor::{ExecError, QueryExecutor};

use super::conditions::in_condition;
use super::identifier;

/// Per-row outcome of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The row is now held under this token.
    Acquired(String),
    /// Another holder owns the row; retry after this many seconds at the
    /// earliest (always positive).
    Held { retry_after_secs: i64 },
    /// The row does not exist.
    Missing,
}

/// Merge per-type lock tuning with the engine-wide defaults.
pub fn resolve_tuning(lock: &LockColumns, defaults: &LockTuning) -> LockTuning {
    LockTuning {
        attempts: lock.attempts.unwrap_or(defaults.attempts),
        delay_ms: lock.delay_ms.unwrap_or(defaults.delay_ms),
        stale_after_secs: lock.stale_after_secs.unwrap_or(defaults.stale_after_secs),
    }
}

/// Generate a fresh high-entropy lock token.
pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Deterministic 0..delay_ms jitter; spread is all that is needed here, so
/// the hash of (token, attempt) stands in for an RNG.
fn jitter_ms(token: &str, attempt: u32, delay_ms: u64) -> u64 {
    if delay_ms == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish() % delay_ms
}

/// One conditional claim over a batch of rows. Does not retry.
///
/// Claims every row whose lock column is null or whose claim timestamp has
/// gone stale, then re-reads the batch to report the per-row outcome.
pub async fn lock_rows(
    executor: &dyn QueryExecutor,
    desc: &TypeDescriptor,
    lock: &LockColumns,
    stubs: &[Row],
    token: Option<String>,
    tuning: &LockTuning,
) -> Result<(String, BTreeMap<String, LockOutcome>), ExecError> {
    let token = token.unwrap_or_else(generate_token);
    let now = now_secs();
    let cutoff = now - tuning.stale_after_secs;

    let claimable = Condition::and(vec![
        in_condition(desc, stubs),
        Condition::Or(vec![
            Condition::Cmp {
                column: lock.lock_column.clone(),
                op: CmpOp::IsNull,
                value: Value::Null,
            },
            Condition::Cmp {
                column: lock.time_column.clone(),
                op: CmpOp::Le,
                value: Value::from(cutoff),
            },
        ]),
    ]);
    executor
        .update(
            &TableExpr::Table(desc.table.clone()),
            &[
                Assignment::new(&lock.lock_column, Value::String(token.clone())),
                Assignment::new(&lock.time_column, Value::from(now)),
            ],
            &claimable,
            &WriteOptions::default(),
        )
        .await?;

    // Confirm which rows the conditional update actually claimed.
    let rows = executor
        .select(
            &TableExpr::Table(desc.table.clone()),
            &in_condition(desc, stubs),
            &[SelectColumn::All],
            &SelectOptions::default(),
        )
        .await?;

    let mut outcomes = BTreeMap::new();
    for stub in stubs {
        let Some(tuple) = identifier::key_tuple(desc, stub) else {
            continue;
        };
        let Some(id) = identifier::id_from_row(desc, stub) else {
            continue;
        };
        let row = rows
            .iter()
            .find(|row| identifier::key_tuple(desc, row).as_ref() == Some(&tuple));
        let outcome = match row {
            None => LockOutcome::Missing,
            Some(row) => {
                let holder = row.get(&lock.lock_column).and_then(Value::as_str);
                if holder == Some(token.as_str()) {
                    LockOutcome::Acquired(token.clone())
                } else {
                    counter!("tessera_lock_contended_total").increment(1);
                    let claimed_at = row
                        .get(&lock.time_column)
                        .and_then(Value::as_i64)
                        .unwrap_or(now);
                    let remaining = tuning.stale_after_secs - (now - claimed_at);
                    LockOutcome::Held {
                        retry_after_secs: remaining.max(1),
                    }
                }
            }
        };
        outcomes.insert(id, outcome);
    }
    Ok((token, outcomes))
}

/// Release rows, optionally only those held under `token` so a caller can
/// never release a lock it does not hold.
pub async fn unlock_rows(
    executor: &dyn QueryExecutor,
    desc: &TypeDescriptor,
    lock: &LockColumns,
    stubs: &[Row],
    token: Option<&str>,
) -> Result<u64, ExecError> {
    let mut parts = vec![in_condition(desc, stubs)];
    if let Some(token) = token {
        parts.push(Condition::Cmp {
            column: lock.lock_column.clone(),
            op: CmpOp::Eq,
            value: Value::String(token.to_string()),
        });
    }
    executor
        .update(
            &TableExpr::Table(desc.table.clone()),
            &[
                Assignment::new(&lock.lock_column, Value::Null),
                Assignment::new(&lock.time_column, Value::Null),
            ],
            &Condition::and(parts),
            &WriteOptions::default(),
        )
        .await
}

/// Bounded retry loop used by the write path: re-attempt the claim until
/// every row is held or the budget runs out, sleeping `delay + jitter`
/// between attempts. Returns the token and the final per-row outcomes.
pub async fn acquire_with_retries(
    executor: &dyn QueryExecutor,
    desc: &TypeDescriptor,
    lock: &LockColumns,
    stubs: &[Row],
    tuning: &LockTuning,
) -> Result<(String, BTreeMap<String, LockOutcome>), ExecError> {
    let token = generate_token();
    let mut outcomes = BTreeMap::new();
    for attempt in 0..tuning.attempts.max(1) {
        let (_, latest) =
            lock_rows(executor, desc, lock, stubs, Some(token.clone()), tuning).await?;
        let all_acquired = latest
            .values()
            .all(|outcome| matches!(outcome, LockOutcome::Acquired(_)));
        outcomes = latest;
        if all_acquired || attempt + 1 == tuning.attempts.max(1) {
            break;
        }
        let sleep_ms = tuning.delay_ms + jitter_ms(&token, attempt, tuning.delay_ms);
        tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
    }
    Ok((token, outcomes))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::infra::memory::MemoryExecutor;

    use super::*;

    fn desc() -> (TypeDescriptor, LockColumns) {
        let mut d = TypeDescriptor::new("widget", "widgets", vec!["ID".into()]);
        let lock = LockColumns::new("LockToken", "LockTime");
        d.lock = Some(lock.clone());
        (d, lock)
    }

    fn stub(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("ID".into(), json!(id));
        row
    }

    async fn seeded() -> MemoryExecutor {
        let exec = MemoryExecutor::new();
        exec.create_table("widgets", vec!["ID".into()]);
        exec.insert_or_upsert(
            "widgets",
            &["ID".into(), "Name".into()],
            vec![vec![json!(1), json!("A")]],
            &WriteOptions {
                upsert: true,
                returning_id: false,
            },
        )
        .await
        .unwrap();
        exec
    }

    #[tokio::test]
    async fn first_claim_wins_second_sees_ttl() {
        let exec = seeded().await;
        let (d, lock) = desc();
        let tuning = LockTuning::default();

        let (token, outcomes) = lock_rows(&exec, &d, &lock, &[stub(1)], None, &tuning)
            .await
            .unwrap();
        assert_eq!(outcomes["1"], LockOutcome::Acquired(token));

        let (_, outcomes) = lock_rows(&exec, &d, &lock, &[stub(1)], None, &tuning)
            .await
            .unwrap();
        match &outcomes["1"] {
            LockOutcome::Held { retry_after_secs } => assert!(*retry_after_secs > 0),
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimable() {
        let exec = seeded().await;
        let (d, lock) = desc();
        let mut tuning = LockTuning::default();
        tuning.stale_after_secs = 60;

        // Plant an abandoned lock from 2 minutes ago.
        exec.update(
            &TableExpr::Table("widgets".into()),
            &[
                Assignment::new("LockToken", json!("dead-holder")),
                Assignment::new("LockTime", json!(now_secs() - 120)),
            ],
            &Condition::All,
            &WriteOptions::default(),
        )
        .await
        .unwrap();

        let (token, outcomes) = lock_rows(&exec, &d, &lock, &[stub(1)], None, &tuning)
            .await
            .unwrap();
        assert_eq!(outcomes["1"], LockOutcome::Acquired(token));
    }

    #[tokio::test]
    async fn unlock_with_wrong_token_keeps_lock() {
        let exec = seeded().await;
        let (d, lock) = desc();
        let tuning = LockTuning::default();

        let (token, _) = lock_rows(&exec, &d, &lock, &[stub(1)], None, &tuning)
            .await
            .unwrap();

        let released = unlock_rows(&exec, &d, &lock, &[stub(1)], Some("intruder"))
            .await
            .unwrap();
        assert_eq!(released, 0);
        assert_eq!(exec.rows("widgets")[0]["LockToken"], json!(token));

        let released = unlock_rows(&exec, &d, &lock, &[stub(1)], Some(&token))
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(exec.rows("widgets")[0]["LockToken"].is_null());
    }

    #[tokio::test]
    async fn unconditional_unlock_clears_any_holder() {
        let exec = seeded().await;
        let (d, lock) = desc();
        let tuning = LockTuning::default();

        lock_rows(&exec, &d, &lock, &[stub(1)], None, &tuning)
            .await
            .unwrap();
        let released = unlock_rows(&exec, &d, &lock, &[stub(1)], None).await.unwrap();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn missing_row_is_reported() {
        let exec = seeded().await;
        let (d, lock) = desc();
        let (_, outcomes) =
            lock_rows(&exec, &d, &lock, &[stub(99)], None, &LockTuning::default())
                .await
                .unwrap();
        assert_eq!(outcomes["99"], LockOutcome::Missing);
    }

    #[tokio::test]
    async fn retries_give_up_within_budget() {
        let exec = seeded().await;
        let (d, lock) = desc();
        let mut tuning = LockTuning::default();
        tuning.attempts = 2;
        tuning.delay_ms = 1;

        // Foreign holder, not stale.
        lock_rows(&exec, &d, &lock, &[stub(1)], Some("holder".into()), &tuning)
            .await
            .unwrap();

        let (_, outcomes) = acquire_with_retries(&exec, &d, &lock, &[stub(1)], &tuning)
            .await
            .unwrap();
        assert!(matches!(outcomes["1"], LockOutcome::Held { .. }));
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let a = jitter_ms("token", 1, 50);
        let b = jitter_ms("token", 1, 50);
        assert_eq!(a, b);
        assert!(a < 50);
        assert_eq!(jitter_ms("token", 1, 0), 0);
    }
}
