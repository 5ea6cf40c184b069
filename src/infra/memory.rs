//! In-memory query executor.
//!
//! A [`QueryExecutor`] over dashmap-backed tables, honouring the condition
//! AST, upsert semantics, auto-increment ids, foreign-key simulation and
//! fault injection. It backs the integration suite and is good enough for
//! dry-run embedding; it is not a database.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::domain::query::{
    Assignment, CmpOp, Condition, OrderDir, Row, SelectColumn, SelectOptions, SubSelect,
    TableExpr, WriteOptions, WriteResult,
};

use super::executor::{ExecError, QueryExecutor};

struct TableState {
    key_columns: Vec<String>,
    next_id: i64,
    rows: Vec<Row>,
}

struct ForeignKey {
    table: String,
    column: String,
    ref_table: String,
    ref_column: String,
}

/// Registered-table, in-memory executor.
#[derive(Default)]
pub struct MemoryExecutor {
    tables: DashMap<String, TableState>,
    foreign_keys: std::sync::RwLock<Vec<ForeignKey>>,
    unreachable: AtomicBool,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with its composite key columns.
    pub fn create_table(&self, name: impl Into<String>, key_columns: Vec<String>) {
        self.tables.insert(
            name.into(),
            TableState {
                key_columns,
                next_id: 0,
                rows: Vec::new(),
            },
        );
    }

    /// Declare a simulated foreign key; inserts into `table.column` must
    /// reference an existing `ref_table.ref_column` value.
    pub fn add_foreign_key(
        &self,
        table: impl Into<String>,
        column: impl Into<String>,
        ref_table: impl Into<String>,
        ref_column: impl Into<String>,
    ) {
        if let Ok(mut fks) = self.foreign_keys.write() {
            fks.push(ForeignKey {
                table: table.into(),
                column: column.into(),
                ref_table: ref_table.into(),
                ref_column: ref_column.into(),
            });
        }
    }

    /// Simulate a connection outage; every call fails until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, AtomicOrdering::SeqCst);
    }

    /// Snapshot a table's rows (test helper).
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|state| state.rows.clone())
            .unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<(), ExecError> {
        if self.unreachable.load(AtomicOrdering::SeqCst) {
            Err(ExecError::unreachable("simulated outage"))
        } else {
            Ok(())
        }
    }

    fn check_foreign_keys(&self, table: &str, row: &Row) -> Result<(), ExecError> {
        let fks = self
            .foreign_keys
            .read()
            .map_err(|_| ExecError::other("fk registry poisoned"))?;
        for fk in fks.iter().filter(|fk| fk.table == table) {
            let Some(value) = row.get(&fk.column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let referenced = self
                .tables
                .get(&fk.ref_table)
                .map(|state| {
                    state
                        .rows
                        .iter()
                        .any(|r| r.get(&fk.ref_column) == Some(value))
                })
                .unwrap_or(false);
            if !referenced {
                return Err(ExecError::ForeignKeyMissing(format!(
                    "{}.{} -> {}.{}",
                    table, fk.column, fk.ref_table, fk.ref_column
                )));
            }
        }
        Ok(())
    }

    fn select_plain(
        &self,
        table: &str,
        condition: &Condition,
        columns: &[SelectColumn],
        options: &SelectOptions,
    ) -> Result<Vec<Row>, ExecError> {
        let state = self
            .tables
            .get(table)
            .ok_or_else(|| ExecError::other(format!("unknown table `{table}`")))?;
        let mut rows: Vec<Row> = state
            .rows
            .iter()
            .filter(|row| matches(row, condition))
            .cloned()
            .collect();
        drop(state);

        sort_rows(&mut rows, &options.order_by);
        let rows = paginate(rows, options);
        Ok(project(rows, columns))
    }

    fn select_union(&self, subs: &[SubSelect]) -> Result<Vec<Row>, ExecError> {
        let mut out = Vec::new();
        for sub in subs {
            let rows = self.select_plain(&sub.table, &sub.condition, &sub.columns, &sub.options)?;
            out.extend(rows);
        }
        Ok(out)
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn select(
        &self,
        table: &TableExpr,
        condition: &Condition,
        columns: &[SelectColumn],
        options: &SelectOptions,
    ) -> Result<Vec<Row>, ExecError> {
        self.check_reachable()?;
        match table {
            TableExpr::Table(name) => self.select_plain(name, condition, columns, options),
            TableExpr::Union(subs) => self.select_union(subs),
            TableExpr::Join(_) => Err(ExecError::other("select over a join is not supported")),
        }
    }

    async fn insert_or_upsert(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
        options: &WriteOptions,
    ) -> Result<WriteResult, ExecError> {
        self.check_reachable()?;

        let mut incoming: Vec<Row> = Vec::with_capacity(rows.len());
        for values in rows {
            if values.len() != columns.len() {
                return Err(ExecError::other("row arity does not match column list"));
            }
            let mut row = Row::new();
            for (column, value) in columns.iter().zip(values) {
                row.insert(column.clone(), value);
            }
            incoming.push(row);
        }
        for row in &incoming {
            self.check_foreign_keys(table, row)?;
        }

        let mut state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| ExecError::other(format!("unknown table `{table}`")))?;
        let key_columns = state.key_columns.clone();
        let mut result = WriteResult::default();

        for mut row in incoming {
            if options.returning_id {
                let id_column = key_columns
                    .first()
                    .ok_or_else(|| ExecError::other("auto-increment table has no key column"))?;
                if row.get(id_column).is_none_or(Value::is_null) {
                    state.next_id += 1;
                    let id = state.next_id;
                    row.insert(id_column.clone(), Value::from(id));
                }
                result.last_insert_id = row.get(id_column).and_then(Value::as_i64);
            }

            let key = key_tuple(&row, &key_columns);
            let position = state
                .rows
                .iter()
                .position(|r| key_tuple(r, &key_columns) == key);
            match position {
                Some(index) => {
                    if !options.upsert {
                        return Err(ExecError::other(format!(
                            "duplicate key in `{table}` without upsert"
                        )));
                    }
                    let stored = &mut state.rows[index];
                    for (column, value) in row {
                        stored.insert(column, value);
                    }
                }
                None => state.rows.push(row),
            }
            result.affected += 1;
        }
        Ok(result)
    }

    async fn update(
        &self,
        table: &TableExpr,
        assignments: &[Assignment],
        condition: &Condition,
        _options: &WriteOptions,
    ) -> Result<u64, ExecError> {
        self.check_reachable()?;
        match table {
            TableExpr::Table(name) => {
                let mut state = self
                    .tables
                    .get_mut(name)
                    .ok_or_else(|| ExecError::other(format!("unknown table `{name}`")))?;
                let mut affected = 0;
                for row in &mut state.rows {
                    if !matches(row, condition) {
                        continue;
                    }
                    for assign in assignments {
                        row.insert(assign.column.clone(), assign.value.clone());
                    }
                    affected += 1;
                }
                Ok(affected)
            }
            TableExpr::Join(join_tables) => {
                // Each joined table is touched with the condition tuples
                // truncated to its own leading key columns.
                let Condition::InTuples { tuples, .. } = condition else {
                    return Err(ExecError::other(
                        "join update requires an IN-tuple condition",
                    ));
                };
                let mut affected = 0;
                for join_table in join_tables {
                    let arity = join_table.key_columns.len();
                    let mut prefixes: Vec<Vec<Value>> = tuples
                        .iter()
                        .map(|tuple| tuple.iter().take(arity).cloned().collect())
                        .collect();
                    prefixes.dedup();

                    let cond = Condition::InTuples {
                        columns: join_table.key_columns.clone(),
                        tuples: prefixes,
                    };
                    let mut state = self.tables.get_mut(&join_table.table).ok_or_else(|| {
                        ExecError::other(format!("unknown table `{}`", join_table.table))
                    })?;
                    for row in &mut state.rows {
                        if !matches(row, &cond) {
                            continue;
                        }
                        for assign in assignments
                            .iter()
                            .filter(|a| a.table.as_deref().is_none_or(|t| t == join_table.table))
                        {
                            row.insert(assign.column.clone(), assign.value.clone());
                        }
                        affected += 1;
                    }
                }
                Ok(affected)
            }
            TableExpr::Union(_) => Err(ExecError::other("cannot update a union")),
        }
    }

    async fn delete(
        &self,
        table: &str,
        condition: &Condition,
        _options: &WriteOptions,
    ) -> Result<u64, ExecError> {
        self.check_reachable()?;
        let mut state = self
            .tables
            .get_mut(table)
            .ok_or_else(|| ExecError::other(format!("unknown table `{table}`")))?;
        let before = state.rows.len();
        state.rows.retain(|row| !matches(row, condition));
        Ok((before - state.rows.len()) as u64)
    }
}

// ============================================================================
// Condition evaluation
// ============================================================================

fn key_tuple(row: &Row, key_columns: &[String]) -> Vec<Value> {
    key_columns
        .iter()
        .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}

fn matches(row: &Row, condition: &Condition) -> bool {
    match condition {
        Condition::All => true,
        Condition::Cmp { column, op, value } => {
            let stored = row.get(column).unwrap_or(&Value::Null);
            cmp_values(stored, *op, value)
        }
        Condition::InTuples { columns, tuples } => {
            let actual: Vec<Value> = columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            tuples.iter().any(|tuple| tuple == &actual)
        }
        Condition::And(parts) => parts.iter().all(|part| matches(row, part)),
        Condition::Or(parts) => parts.iter().any(|part| matches(row, part)),
    }
}

fn cmp_values(stored: &Value, op: CmpOp, expected: &Value) -> bool {
    match op {
        CmpOp::IsNull => stored.is_null(),
        CmpOp::IsNotNull => !stored.is_null(),
        CmpOp::Eq => value_order(stored, expected) == Some(Ordering::Equal),
        CmpOp::Ne => value_order(stored, expected) != Some(Ordering::Equal),
        CmpOp::Gt => value_order(stored, expected) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(
            value_order(stored, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CmpOp::Lt => value_order(stored, expected) == Some(Ordering::Less),
        CmpOp::Le => matches!(
            value_order(stored, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CmpOp::Like => match (stored.as_str(), expected.as_str()) {
            (Some(text), Some(pattern)) => like_match(text, pattern),
            _ => false,
        },
    }
}

/// Total order over comparable scalar pairs; `None` for null or mixed kinds.
fn value_order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(l), Value::Number(r)) => l.as_f64().partial_cmp(&r.as_f64()),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// `%`-wildcard matching, anchored at both ends like SQL LIKE.
fn like_match(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if i == parts.len() - 1 && !pattern.ends_with('%') {
            return rest.ends_with(part);
        } else {
            let Some(found) = rest.find(part) else {
                return false;
            };
            rest = &rest[found + part.len()..];
        }
    }
    true
}

// ============================================================================
// Projection & aggregation
// ============================================================================

fn sort_rows(rows: &mut [Row], order_by: &[(String, OrderDir)]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for (column, dir) in order_by {
            let left = a.get(column).unwrap_or(&Value::Null);
            let right = b.get(column).unwrap_or(&Value::Null);
            let ord = value_order(left, right).unwrap_or(Ordering::Equal);
            let ord = match dir {
                OrderDir::Asc => ord,
                OrderDir::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn paginate(rows: Vec<Row>, options: &SelectOptions) -> Vec<Row> {
    let offset = options.offset.unwrap_or(0) as usize;
    let limit = options.limit.map_or(usize::MAX, |l| l as usize);
    rows.into_iter().skip(offset).take(limit).collect()
}

fn project(rows: Vec<Row>, columns: &[SelectColumn]) -> Vec<Row> {
    if columns.is_empty() || columns.iter().any(|c| matches!(c, SelectColumn::All)) {
        return rows;
    }

    let tag = columns.iter().find_map(|c| match c {
        SelectColumn::Tag(name) => Some(name.clone()),
        _ => None,
    });
    let with_tag = |mut row: Row| {
        if let Some(tag) = &tag {
            row.insert("@tag".to_string(), Value::String(tag.clone()));
        }
        row
    };

    for column in columns {
        match column {
            SelectColumn::Count => {
                let mut row = Row::new();
                row.insert("value".into(), Value::from(rows.len() as i64));
                return vec![with_tag(row)];
            }
            SelectColumn::CountDistinct(name) => {
                let mut seen: Vec<&Value> = Vec::new();
                for value in rows.iter().filter_map(|r| r.get(name)) {
                    if !seen.contains(&value) {
                        seen.push(value);
                    }
                }
                let mut row = Row::new();
                row.insert("value".into(), Value::from(seen.len() as i64));
                return vec![with_tag(row)];
            }
            SelectColumn::Min(name) | SelectColumn::Max(name) => {
                let want_max = matches!(column, SelectColumn::Max(_));
                let mut best: Option<&Value> = None;
                for value in rows.iter().filter_map(|r| r.get(name)) {
                    if value.is_null() {
                        continue;
                    }
                    best = match best {
                        None => Some(value),
                        Some(current) => {
                            let ord = value_order(value, current).unwrap_or(Ordering::Equal);
                            if (want_max && ord == Ordering::Greater)
                                || (!want_max && ord == Ordering::Less)
                            {
                                Some(value)
                            } else {
                                Some(current)
                            }
                        }
                    };
                }
                let mut row = Row::new();
                row.insert("value".into(), best.cloned().unwrap_or(Value::Null));
                return vec![with_tag(row)];
            }
            SelectColumn::Sum(name) => {
                let mut int_sum: i64 = 0;
                let mut float_sum = 0.0;
                let mut all_int = true;
                for value in rows.iter().filter_map(|r| r.get(name)) {
                    if let Some(i) = value.as_i64() {
                        int_sum += i;
                        float_sum += i as f64;
                    } else if let Some(f) = value.as_f64() {
                        all_int = false;
                        float_sum += f;
                    }
                }
                let mut row = Row::new();
                let sum = if all_int {
                    Value::from(int_sum)
                } else {
                    Value::from(float_sum)
                };
                row.insert("value".into(), sum);
                return vec![with_tag(row)];
            }
            SelectColumn::Distinct(names) => {
                let mut combos: Vec<Row> = Vec::new();
                for row in &rows {
                    let mut combo = Row::new();
                    for name in names {
                        combo.insert(name.clone(), row.get(name).cloned().unwrap_or(Value::Null));
                    }
                    if !combos.contains(&combo) {
                        combos.push(combo);
                    }
                }
                return combos.into_iter().map(with_tag).collect();
            }
            SelectColumn::IntervalBucket { column, width } => {
                let mut buckets: Vec<(i64, i64)> = Vec::new();
                for value in rows.iter().filter_map(|r| r.get(column)) {
                    let Some(number) = value.as_f64() else {
                        continue;
                    };
                    let start = (number / *width as f64).floor() as i64 * width;
                    match buckets.iter().position(|(s, _)| *s == start) {
                        Some(index) => buckets[index].1 += 1,
                        None => buckets.push((start, 1)),
                    }
                }
                buckets.sort_by_key(|(start, _)| *start);
                return buckets
                    .into_iter()
                    .map(|(start, count)| {
                        let mut row = Row::new();
                        row.insert("bucket".into(), Value::from(start));
                        row.insert("value".into(), Value::from(count));
                        with_tag(row)
                    })
                    .collect();
            }
            SelectColumn::All | SelectColumn::Col(_) | SelectColumn::Tag(_) => {}
        }
    }

    // Plain column projection.
    let names: Vec<&String> = columns
        .iter()
        .filter_map(|c| match c {
            SelectColumn::Col(name) => Some(name),
            _ => None,
        })
        .collect();
    rows.into_iter()
        .map(|row| {
            let mut projected = Row::new();
            for name in &names {
                projected.insert(
                    (*name).clone(),
                    row.get(*name).cloned().unwrap_or(Value::Null),
                );
            }
            with_tag(projected)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> MemoryExecutor {
        let exec = MemoryExecutor::new();
        exec.create_table("widgets", vec!["ID".into()]);
        exec
    }

    async fn insert(exec: &MemoryExecutor, rows: Vec<Vec<Value>>) {
        exec.insert_or_upsert(
            "widgets",
            &["ID".into(), "Name".into(), "Count".into()],
            rows,
            &WriteOptions {
                upsert: true,
                returning_id: false,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let exec = seeded();
        insert(&exec, vec![vec![json!(1), json!("A"), json!(0)]]).await;
        insert(&exec, vec![vec![json!(1), json!("B"), json!(2)]]).await;

        let rows = exec.rows("widgets");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Name"], json!("B"));
    }

    #[tokio::test]
    async fn in_tuples_condition_selects_exact_rows() {
        let exec = seeded();
        insert(
            &exec,
            vec![
                vec![json!(1), json!("A"), json!(0)],
                vec![json!(2), json!("B"), json!(5)],
            ],
        )
        .await;

        let rows = exec
            .select(
                &TableExpr::Table("widgets".into()),
                &Condition::InTuples {
                    columns: vec!["ID".into()],
                    tuples: vec![vec![json!(2)]],
                },
                &[SelectColumn::All],
                &SelectOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Name"], json!("B"));
    }

    #[tokio::test]
    async fn auto_increment_assigns_sequential_ids() {
        let exec = seeded();
        let result = exec
            .insert_or_upsert(
                "widgets",
                &["Name".into()],
                vec![vec![json!("first")]],
                &WriteOptions {
                    upsert: false,
                    returning_id: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.last_insert_id, Some(1));

        let result = exec
            .insert_or_upsert(
                "widgets",
                &["Name".into()],
                vec![vec![json!("second")]],
                &WriteOptions {
                    upsert: false,
                    returning_id: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.last_insert_id, Some(2));
    }

    #[tokio::test]
    async fn foreign_key_violation_is_distinguished() {
        let exec = seeded();
        exec.create_table("parts", vec!["ID".into()]);
        exec.add_foreign_key("parts", "WidgetID", "widgets", "ID");

        let err = exec
            .insert_or_upsert(
                "parts",
                &["ID".into(), "WidgetID".into()],
                vec![vec![json!(1), json!(99)]],
                &WriteOptions {
                    upsert: true,
                    returning_id: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::ForeignKeyMissing(_)));
    }

    #[tokio::test]
    async fn unreachable_fails_every_call() {
        let exec = seeded();
        exec.set_unreachable(true);
        let err = exec
            .select(
                &TableExpr::Table("widgets".into()),
                &Condition::All,
                &[SelectColumn::All],
                &SelectOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Unreachable(_)));
    }

    #[tokio::test]
    async fn union_aggregates_tag_their_rows() {
        let exec = seeded();
        insert(
            &exec,
            vec![
                vec![json!(1), json!("A"), json!(3)],
                vec![json!(2), json!("B"), json!(7)],
            ],
        )
        .await;

        let rows = exec
            .select(
                &TableExpr::Union(vec![
                    SubSelect {
                        table: "widgets".into(),
                        condition: Condition::All,
                        columns: vec![SelectColumn::Tag("total".into()), SelectColumn::Count],
                        options: SelectOptions::default(),
                    },
                    SubSelect {
                        table: "widgets".into(),
                        condition: Condition::All,
                        columns: vec![
                            SelectColumn::Tag("max_count".into()),
                            SelectColumn::Max("Count".into()),
                        ],
                        options: SelectOptions::default(),
                    },
                ]),
                &Condition::All,
                &[],
                &SelectOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["@tag"], json!("total"));
        assert_eq!(rows[0]["value"], json!(2));
        assert_eq!(rows[1]["@tag"], json!("max_count"));
        assert_eq!(rows[1]["value"], json!(7));
    }

    #[tokio::test]
    async fn join_update_touches_prefix_tables() {
        let exec = MemoryExecutor::new();
        exec.create_table("files", vec!["Volume".into(), "Path".into()]);
        exec.create_table("volumes", vec!["Volume".into()]);
        exec.insert_or_upsert(
            "volumes",
            &["Volume".into(), "Modified".into()],
            vec![vec![json!("v1"), json!(0)]],
            &WriteOptions {
                upsert: true,
                returning_id: false,
            },
        )
        .await
        .unwrap();

        let affected = exec
            .update(
                &TableExpr::Join(vec![crate::domain::query::JoinTable {
                    table: "volumes".into(),
                    key_columns: vec!["Volume".into()],
                }]),
                &[Assignment::qualified("volumes", "Modified", json!(42))],
                &Condition::InTuples {
                    columns: vec!["Volume".into(), "Path".into()],
                    tuples: vec![
                        vec![json!("v1"), json!("a")],
                        vec![json!("v1"), json!("b")],
                    ],
                },
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(affected, 1);
        assert_eq!(exec.rows("volumes")[0]["Modified"], json!(42));
    }

    #[test]
    fn like_matching_covers_wildcard_positions() {
        assert!(like_match("hello world", "hello%"));
        assert!(like_match("hello world", "%world"));
        assert!(like_match("hello world", "%lo wo%"));
        assert!(!like_match("hello world", "world%"));
        assert!(like_match("exact", "exact"));
        assert!(!like_match("exact", "exactly"));
    }

    #[test]
    fn interval_buckets_floor_to_width() {
        let rows: Vec<Row> = [3, 7, 12, 14, 29]
            .into_iter()
            .map(|n| {
                let mut row = Row::new();
                row.insert("Age".into(), json!(n));
                row
            })
            .collect();
        let projected = project(
            rows,
            &[SelectColumn::IntervalBucket {
                column: "Age".into(),
                width: 10,
            }],
        );
        assert_eq!(projected.len(), 3);
        assert_eq!(projected[0]["bucket"], json!(0));
        assert_eq!(projected[0]["value"], json!(2));
        assert_eq!(projected[1]["bucket"], json!(10));
        assert_eq!(projected[1]["value"], json!(2));
        assert_eq!(projected[2]["bucket"], json!(20));
        assert_eq!(projected[2]["value"], json!(1));
    }
}
