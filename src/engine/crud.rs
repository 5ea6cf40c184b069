//! CRUD orchestrator.
//!
//! [`Engine`] threads the identifier codec, condition translator,
//! aggregation compiler, cache orchestrator, lock manager and father
//! cascade together into one contract per type: `get_items`, `set_items`,
//! `delete_items`, `move_items`, plus the public locking surface. Callers
//! hand it identifier-bearing row stubs and a parameter bag; they get back
//! per-identifier outcome maps, never exceptions for individual rows — the
//! only hard error is an unknown type or missing configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::EngineSettings;
use crate::domain::error::EngineError;
use crate::domain::merge::deep_merge;
use crate::domain::outcome::{ItemValue, ReadOutcome, ResultCode, WriteOutcomeMap};
use crate::domain::query::{
    Assignment, Condition, Row, SelectColumn, SelectOptions, TableExpr, WriteOptions,
};
use crate::domain::schema::{SetColumn, TypeDescriptor};
use crate::domain::{safe, value as colvalue};
use crate::infra::cache::CacheBackend;
use crate::infra::executor::{ExecError, QueryExecutor};
use crate::infra::logger::{Severity, log_ctx};
use crate::registry::TypeRegistry;

use super::aggregate;
use super::cache::CacheOrchestrator;
use super::conditions::{self, FilterSet};
use super::fathers;
use super::identifier;
use super::lock::{self, LockOutcome};
use super::params::{DeleteParams, MoveParams, ReadParams, WriteMode, WriteParams};

pub struct Engine {
    registry: TypeRegistry,
    executor: Arc<dyn QueryExecutor>,
    cache: CacheOrchestrator,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        registry: TypeRegistry,
        executor: Arc<dyn QueryExecutor>,
        cache_backend: Arc<dyn CacheBackend>,
        settings: EngineSettings,
    ) -> Self {
        let cache = CacheOrchestrator::new(cache_backend, &settings);
        Self {
            registry,
            executor,
            cache,
            settings,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn descriptor(
        &self,
        type_name: &str,
        schema_override: Option<&crate::domain::schema::SchemaOverride>,
    ) -> Result<TypeDescriptor, EngineError> {
        let base = self.registry.get(type_name)?;
        Ok(match schema_override {
            Some(ov) => base.with_override(ov),
            None => base.clone(),
        })
    }

    fn dry_run(&self, call_flag: bool) -> bool {
        call_flag || self.settings.dry_run
    }

    fn log(&self, desc: &TypeDescriptor, quiet: bool, severity: Severity, message: &str, op: &str) {
        if quiet {
            return;
        }
        let logger = self.registry.logger_for(desc);
        logger.log(
            severity,
            message,
            &log_ctx([("type", Value::from(desc.name.clone())), ("op", Value::from(op))]),
        );
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// Read rows by identifier stubs, or everything when `items` is empty.
    pub async fn get_items(
        &self,
        items: &[Row],
        type_name: &str,
        params: &ReadParams,
    ) -> Result<ReadOutcome, EngineError> {
        let desc = self.descriptor(type_name, params.schema_override.as_ref())?;
        let stubs: Vec<Row> = items.iter().map(|item| encode_keys(&desc, item)).collect();

        let filters = conditions::build_filters(
            &desc,
            &params.filters,
            params.newer_than,
            params.older_than,
        );
        let full_cacheable = conditions::is_full_result_cacheable(&desc, params, &filters);
        // Any filter, ordering, limit or offset disables caching for the
        // whole call, item lookups included.
        let call_cache_enabled = !filters.caller_filtered
            && !params.has_pagination()
            && desc.group_by_first_n_keys == 0
            && desc.cache_name.is_some();

        let mut outcome = if stubs.is_empty() {
            self.get_all(&desc, params, &filters, full_cacheable && call_cache_enabled)
                .await
        } else {
            self.get_by_ids(&desc, &stubs, params, &filters, call_cache_enabled)
                .await
        };

        if !desc.extra_to_get.is_empty() && !params.skip_meta {
            let meta = self
                .get_meta(&desc, params, &filters, call_cache_enabled)
                .await;
            if let Some(meta) = meta {
                outcome.insert(aggregate::META_KEY.to_string(), ItemValue::Row(meta));
            }
        }
        Ok(outcome)
    }

    async fn get_by_ids(
        &self,
        desc: &TypeDescriptor,
        stubs: &[Row],
        params: &ReadParams,
        filters: &FilterSet,
        cache_enabled: bool,
    ) -> ReadOutcome {
        let grouped = desc.group_by_first_n_keys;
        let mut outcome = ReadOutcome::new();
        let mut misses: Vec<&Row> = Vec::new();

        for stub in stubs {
            let Some(id) = stub_id(desc, stub) else {
                continue;
            };
            if grouped == 0 && cache_enabled && has_full_id(desc, stub) {
                if let Some(cached) = self.cache.get_row(desc, &id).await {
                    outcome.insert(id, ItemValue::Row(decode_value(desc, cached)));
                    continue;
                }
            }
            misses.push(stub);
        }

        if !misses.is_empty() {
            let condition = if grouped > 0 {
                prefix_in_condition(desc, &misses, grouped)
            } else {
                let owned: Vec<Row> = misses.iter().map(|stub| (*stub).clone()).collect();
                conditions::in_condition(desc, &owned)
            };
            let condition = Condition::and(vec![condition, filters.condition.clone()]);

            match self
                .executor
                .select(
                    &TableExpr::Table(desc.table.clone()),
                    &condition,
                    &[SelectColumn::All],
                    &conditions::select_options(params),
                )
                .await
            {
                Ok(rows) => {
                    // Track which primary-key tuples produced rows: a stub
                    // without extra key parts still counts as found when any
                    // discriminated row shares its primary keys.
                    let mut matched: Vec<Vec<Value>> = Vec::new();
                    if grouped > 0 {
                        group_rows(desc, rows, grouped, &mut outcome);
                    } else {
                        for row in rows {
                            let Some(id) = identifier::id_from_row(desc, &row) else {
                                continue;
                            };
                            if let Some(tuple) = identifier::key_tuple(desc, &row) {
                                if !matched.contains(&tuple) {
                                    matched.push(tuple);
                                }
                            }
                            if cache_enabled {
                                self.cache.put_row(desc, &id, &Value::Object(row.clone())).await;
                            }
                            outcome.insert(
                                id,
                                ItemValue::Row(decode_value(desc, Value::Object(row))),
                            );
                        }
                    }
                    // Anything still unresolved was not found.
                    for stub in &misses {
                        let Some(id) = stub_id(desc, stub) else {
                            continue;
                        };
                        let found = if grouped > 0 {
                            outcome.contains_key(&id)
                        } else {
                            identifier::key_tuple(desc, stub)
                                .is_some_and(|tuple| matched.contains(&tuple))
                        };
                        if !found {
                            outcome
                                .entry(id)
                                .or_insert(ItemValue::Code(ResultCode::NotFound));
                        }
                    }
                }
                Err(err) => {
                    let severity = match err {
                        ExecError::Unreachable(_) => Severity::Error,
                        _ => Severity::Warning,
                    };
                    self.log(desc, params.quiet, severity, &err.to_string(), "get_items");
                    for stub in &misses {
                        if let Some(id) = stub_id(desc, stub) {
                            outcome.insert(id, ItemValue::Code(ResultCode::Infrastructure));
                        }
                    }
                }
            }
        }
        outcome
    }

    async fn get_all(
        &self,
        desc: &TypeDescriptor,
        params: &ReadParams,
        filters: &FilterSet,
        cacheable: bool,
    ) -> ReadOutcome {
        if cacheable {
            if let Some(Value::Object(cached)) = self.cache.get_all(desc).await {
                let mut outcome = ReadOutcome::new();
                for (id, row) in cached {
                    outcome.insert(id, ItemValue::Row(decode_value(desc, row)));
                }
                return outcome;
            }
        }

        let rows = match self
            .executor
            .select(
                &TableExpr::Table(desc.table.clone()),
                &filters.condition,
                &[SelectColumn::All],
                &conditions::select_options(params),
            )
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                // A failed search returns an empty map, not an error.
                self.log(desc, params.quiet, Severity::Error, &err.to_string(), "get_items");
                return ReadOutcome::new();
            }
        };

        let grouped = desc.group_by_first_n_keys;
        let mut outcome = ReadOutcome::new();
        if grouped > 0 {
            group_rows(desc, rows, grouped, &mut outcome);
            return outcome;
        }

        let mut raw = Map::new();
        for row in rows {
            let Some(id) = identifier::id_from_row(desc, &row) else {
                continue;
            };
            raw.insert(id, Value::Object(row));
        }
        if cacheable {
            self.cache.put_all(desc, &Value::Object(raw.clone())).await;
        }
        for (id, row) in raw {
            outcome.insert(id, ItemValue::Row(decode_value(desc, row)));
        }
        outcome
    }

    async fn get_meta(
        &self,
        desc: &TypeDescriptor,
        params: &ReadParams,
        filters: &FilterSet,
        cache_enabled: bool,
    ) -> Option<Value> {
        if cache_enabled {
            if let Some(meta) = self.cache.get_meta(desc).await {
                return Some(meta);
            }
        }
        let union = aggregate::compile(desc, &filters.condition);
        match self
            .executor
            .select(&union, &Condition::All, &[], &SelectOptions::default())
            .await
        {
            Ok(rows) => {
                let meta = aggregate::reassemble(desc, rows);
                if cache_enabled {
                    self.cache.put_meta(desc, &meta).await;
                }
                Some(meta)
            }
            Err(err) => {
                self.log(desc, params.quiet, Severity::Warning, &err.to_string(), "get_meta");
                None
            }
        }
    }

    // ========================================================================
    // Write / upsert
    // ========================================================================

    /// Create or update rows; one result code per input identifier.
    pub async fn set_items(
        &self,
        items: Vec<Row>,
        type_name: &str,
        params: &WriteParams,
    ) -> Result<WriteOutcomeMap, EngineError> {
        let desc = self.descriptor(type_name, params.schema_override.as_ref())?;
        if items.is_empty() {
            return Ok(WriteOutcomeMap::new());
        }
        if desc.auto_increment {
            return Ok(self.set_auto_increment(&desc, items, params).await);
        }
        Ok(self.set_keyed(&desc, items, params).await)
    }

    async fn set_auto_increment(
        &self,
        desc: &TypeDescriptor,
        items: Vec<Row>,
        params: &WriteParams,
    ) -> WriteOutcomeMap {
        let dry_run = self.dry_run(params.dry_run);
        let mut outcomes = WriteOutcomeMap::new();
        let mut written: Vec<Row> = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            let fallback_key = index.to_string();
            let Some(resolved) = resolve_create(desc, &item, true) else {
                outcomes.insert(fallback_key, ResultCode::MissingInputs);
                continue;
            };
            if dry_run {
                outcomes.insert(fallback_key, ResultCode::Ok);
                continue;
            }

            let (columns, values) = row_to_batch(&resolved);
            let result = self
                .executor
                .insert_or_upsert(
                    &desc.table,
                    &columns,
                    vec![values],
                    &WriteOptions {
                        upsert: false,
                        returning_id: true,
                    },
                )
                .await;
            match result {
                Ok(write) => {
                    let id = write
                        .last_insert_id
                        .map_or(fallback_key, |id| id.to_string());
                    let mut row = resolved;
                    if let Some(key_column) = desc.key_columns.first() {
                        if let Some(new_id) = write.last_insert_id {
                            row.insert(key_column.clone(), Value::from(new_id));
                        }
                    }
                    written.push(row);
                    outcomes.insert(id, ResultCode::Ok);
                }
                Err(ExecError::ForeignKeyMissing(_)) => {
                    outcomes.insert(fallback_key, ResultCode::ForeignKeyMissing);
                }
                Err(err) => {
                    self.log(desc, params.quiet, Severity::Error, &err.to_string(), "set_items");
                    outcomes.insert(fallback_key, ResultCode::Infrastructure);
                }
            }
        }

        if !written.is_empty() {
            self.after_mutation(desc, &written, params.quiet, dry_run).await;
        }
        outcomes
    }

    async fn set_keyed(
        &self,
        desc: &TypeDescriptor,
        items: Vec<Row>,
        params: &WriteParams,
    ) -> WriteOutcomeMap {
        let dry_run = self.dry_run(params.dry_run);
        let mut outcomes = WriteOutcomeMap::new();

        // Items that carry a full primary key proceed; the rest are
        // rejected without affecting their siblings.
        let mut pending: Vec<(String, Row)> = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let stub = encode_keys(desc, &item);
            match identifier::id_from_row(desc, &stub) {
                Some(id) => pending.push((id, stub)),
                None => {
                    outcomes.insert(index.to_string(), ResultCode::MissingInputs);
                }
            }
        }
        if pending.is_empty() {
            return outcomes;
        }

        // Advisory locking around the read-modify-write, unless the caller
        // pre-locked or this is a dry run.
        let lock_internally =
            desc.lock.is_some() && params.lock_token.is_none() && !dry_run;
        let mut held_token: Option<String> = None;
        if lock_internally {
            let lock_cfg = desc.lock.as_ref().expect("lock checked above");
            let tuning = lock::resolve_tuning(lock_cfg, &self.settings.lock);
            let stubs: Vec<Row> = pending.iter().map(|(_, stub)| stub.clone()).collect();
            match lock::acquire_with_retries(
                self.executor.as_ref(),
                desc,
                lock_cfg,
                &stubs,
                &tuning,
            )
            .await
            {
                Ok((token, lock_outcomes)) => {
                    held_token = Some(token);
                    pending.retain(|(id, _)| match lock_outcomes.get(id) {
                        // Absent rows cannot be locked; they proceed as creates.
                        Some(LockOutcome::Acquired(_)) | Some(LockOutcome::Missing) | None => true,
                        Some(LockOutcome::Held { .. }) => {
                            outcomes.insert(id.clone(), ResultCode::Infrastructure);
                            false
                        }
                    });
                }
                Err(err) => {
                    self.log(desc, params.quiet, Severity::Error, &err.to_string(), "set_items");
                    for (id, _) in pending {
                        outcomes.insert(id, ResultCode::Infrastructure);
                    }
                    return outcomes;
                }
            }
        }

        let result = self
            .write_pending(desc, &pending, params, dry_run, &mut outcomes)
            .await;

        if let Some(token) = held_token {
            let lock_cfg = desc.lock.as_ref().expect("lock checked above");
            let stubs: Vec<Row> = pending.iter().map(|(_, stub)| stub.clone()).collect();
            if let Err(err) = lock::unlock_rows(
                self.executor.as_ref(),
                desc,
                lock_cfg,
                &stubs,
                Some(&token),
            )
            .await
            {
                self.log(desc, params.quiet, Severity::Warning, &err.to_string(), "unlock_items");
            }
        }

        if let Some(written) = result {
            if !written.is_empty() {
                self.after_mutation(desc, &written, params.quiet, dry_run).await;
            }
        }
        outcomes
    }

    /// Classify, resolve and upsert the pending items. Returns the rows
    /// actually written, or `None` when the batch failed as a whole.
    async fn write_pending(
        &self,
        desc: &TypeDescriptor,
        pending: &[(String, Row)],
        params: &WriteParams,
        dry_run: bool,
        outcomes: &mut WriteOutcomeMap,
    ) -> Option<Vec<Row>> {
        let stubs: Vec<Row> = pending.iter().map(|(_, stub)| stub.clone()).collect();
        let existing = match self
            .executor
            .select(
                &TableExpr::Table(desc.table.clone()),
                &conditions::in_condition(desc, &stubs),
                &[SelectColumn::All],
                &SelectOptions::default(),
            )
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                self.log(desc, params.quiet, Severity::Error, &err.to_string(), "set_items");
                for (id, _) in pending {
                    outcomes.insert(id.clone(), ResultCode::Infrastructure);
                }
                return None;
            }
        };
        let existing_by_id: BTreeMap<String, &Row> = existing
            .iter()
            .filter_map(|row| identifier::id_from_row(desc, row).map(|id| (id, row)))
            .collect();

        let mut resolved: Vec<(String, Row)> = Vec::new();
        for (id, item) in pending {
            match existing_by_id.get(id) {
                Some(current) => match params.mode {
                    WriteMode::Insert => {
                        outcomes.insert(id.clone(), ResultCode::AlreadyExists);
                    }
                    WriteMode::Update | WriteMode::Override => {
                        resolved.push((id.clone(), resolve_update(desc, current, item)));
                    }
                },
                None => match params.mode {
                    WriteMode::Update => {
                        outcomes.insert(id.clone(), ResultCode::UpdateOnlyMissing);
                    }
                    WriteMode::Insert | WriteMode::Override => {
                        match resolve_create(desc, item, false) {
                            Some(row) => resolved.push((id.clone(), row)),
                            None => {
                                outcomes.insert(id.clone(), ResultCode::MissingInputs);
                            }
                        }
                    }
                },
            }
        }
        if resolved.is_empty() {
            return Some(Vec::new());
        }
        if dry_run {
            for (id, _) in &resolved {
                outcomes.insert(id.clone(), ResultCode::Ok);
            }
            return Some(Vec::new());
        }

        let columns = batch_columns(&resolved);
        let rows: Vec<Vec<Value>> = resolved
            .iter()
            .map(|(_, row)| {
                columns
                    .iter()
                    .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        match self
            .executor
            .insert_or_upsert(
                &desc.table,
                &columns,
                rows,
                &WriteOptions {
                    upsert: true,
                    returning_id: false,
                },
            )
            .await
        {
            Ok(_) => {
                for (id, _) in &resolved {
                    outcomes.insert(id.clone(), ResultCode::Ok);
                }
                Some(resolved.into_iter().map(|(_, row)| row).collect())
            }
            Err(ExecError::ForeignKeyMissing(detail)) => {
                debug!(detail, "foreign key missing during batch write");
                for (id, _) in &resolved {
                    outcomes.insert(id.clone(), ResultCode::ForeignKeyMissing);
                }
                Some(Vec::new())
            }
            Err(err) => {
                self.log(desc, params.quiet, Severity::Error, &err.to_string(), "set_items");
                for (id, _) in &resolved {
                    outcomes.insert(id.clone(), ResultCode::Infrastructure);
                }
                None
            }
        }
    }

    /// Cascades and cache invalidation after a confirmed mutation.
    async fn after_mutation(
        &self,
        desc: &TypeDescriptor,
        written: &[Row],
        quiet: bool,
        dry_run: bool,
    ) {
        if dry_run {
            return;
        }
        if let Err(err) =
            fathers::cascade(self.executor.as_ref(), &self.cache, desc, written, dry_run).await
        {
            // The row-level change is already committed; ancestors catch up
            // on the next mutation.
            self.log(desc, quiet, Severity::Warning, &err.to_string(), "update_fathers");
        }
        let ids = written
            .iter()
            .filter_map(|row| identifier::id_from_row(desc, row));
        self.cache.invalidate_items(desc, ids).await;
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Delete rows by identifier stubs; one code for the whole batch.
    /// Absent targets are not reported — deleting them is idempotent.
    pub async fn delete_items(
        &self,
        items: &[Row],
        type_name: &str,
        params: &DeleteParams,
    ) -> Result<ResultCode, EngineError> {
        let desc = self.descriptor(type_name, params.schema_override.as_ref())?;
        let stubs: Vec<Row> = items.iter().map(|item| encode_keys(&desc, item)).collect();
        if stubs.is_empty() {
            return Ok(ResultCode::Ok);
        }
        let filters = conditions::build_filters(&desc, &params.filters, None, None);
        let condition =
            Condition::and(vec![conditions::in_condition(&desc, &stubs), filters.condition]);

        if self.dry_run(params.dry_run) {
            return Ok(ResultCode::Ok);
        }
        match self
            .executor
            .delete(&desc.table, &condition, &WriteOptions::default())
            .await
        {
            Ok(_) => {
                self.after_mutation(&desc, &stubs, params.quiet, false).await;
                self.cache.invalidate_children(&desc).await;
                Ok(ResultCode::Ok)
            }
            Err(err) => {
                self.log(&desc, params.quiet, Severity::Error, &err.to_string(), "delete_items");
                Ok(ResultCode::Infrastructure)
            }
        }
    }

    // ========================================================================
    // Move / rename
    // ========================================================================

    /// Update the declared move columns of the given rows; one code for the
    /// whole batch. A type without move columns is a no-op with a distinct
    /// code.
    pub async fn move_items(
        &self,
        items: &[Row],
        new_values: &Row,
        type_name: &str,
        params: &MoveParams,
    ) -> Result<ResultCode, EngineError> {
        let desc = self.descriptor(type_name, params.schema_override.as_ref())?;
        let mut assignments: Vec<Assignment> = Vec::new();
        for column in &desc.move_columns {
            let Some(value) = new_values.get(column) else {
                continue;
            };
            let value = match desc.set_columns.get(column) {
                Some(set) => colvalue::coerce(set.kind, value),
                None => value.clone(),
            };
            let value = if desc.is_safe_str(column) {
                safe::encode_value(&value)
            } else {
                value
            };
            assignments.push(Assignment::new(column, value));
        }
        if assignments.is_empty() {
            return Ok(ResultCode::NoMoveColumns);
        }
        if let Some(modified) = &desc.modified_column {
            assignments.push(Assignment::new(
                modified,
                Value::from(OffsetDateTime::now_utc().unix_timestamp()),
            ));
        }

        let stubs: Vec<Row> = items.iter().map(|item| encode_keys(&desc, item)).collect();
        if stubs.is_empty() {
            return Ok(ResultCode::Ok);
        }
        if self.dry_run(params.dry_run) {
            return Ok(ResultCode::Ok);
        }
        match self
            .executor
            .update(
                &TableExpr::Table(desc.table.clone()),
                &assignments,
                &conditions::in_condition(&desc, &stubs),
                &WriteOptions::default(),
            )
            .await
        {
            Ok(_) => {
                self.after_mutation(&desc, &stubs, params.quiet, false).await;
                self.cache.invalidate_children(&desc).await;
                Ok(ResultCode::Ok)
            }
            Err(err) => {
                self.log(&desc, params.quiet, Severity::Error, &err.to_string(), "move_items");
                Ok(ResultCode::Infrastructure)
            }
        }
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Attempt to lock rows; one conditional claim, no internal retry.
    pub async fn lock_items(
        &self,
        items: &[Row],
        type_name: &str,
        token: Option<String>,
    ) -> Result<BTreeMap<String, LockOutcome>, EngineError> {
        let desc = self.descriptor(type_name, None)?;
        let lock_cfg = desc
            .lock
            .as_ref()
            .ok_or_else(|| EngineError::LockNotConfigured(desc.name.clone()))?;
        let stubs: Vec<Row> = items.iter().map(|item| encode_keys(&desc, item)).collect();

        if self.dry_run(false) {
            let token = token.unwrap_or_else(lock::generate_token);
            let mut outcomes = BTreeMap::new();
            for stub in &stubs {
                if let Some(id) = identifier::id_from_row(&desc, stub) {
                    outcomes.insert(id, LockOutcome::Acquired(token.clone()));
                }
            }
            return Ok(outcomes);
        }

        let tuning = lock::resolve_tuning(lock_cfg, &self.settings.lock);
        match lock::lock_rows(
            self.executor.as_ref(),
            &desc,
            lock_cfg,
            &stubs,
            token,
            &tuning,
        )
        .await
        {
            Ok((_, outcomes)) => Ok(outcomes),
            Err(err) => {
                // Infrastructure failure: nothing was claimed; the caller
                // retries at a higher layer.
                self.log(&desc, false, Severity::Error, &err.to_string(), "lock_items");
                Ok(BTreeMap::new())
            }
        }
    }

    /// Release rows, optionally only those held under `token`.
    pub async fn unlock_items(
        &self,
        items: &[Row],
        type_name: &str,
        token: Option<&str>,
    ) -> Result<ResultCode, EngineError> {
        let desc = self.descriptor(type_name, None)?;
        let lock_cfg = desc
            .lock
            .as_ref()
            .ok_or_else(|| EngineError::LockNotConfigured(desc.name.clone()))?;
        let stubs: Vec<Row> = items.iter().map(|item| encode_keys(&desc, item)).collect();
        if self.dry_run(false) {
            return Ok(ResultCode::Ok);
        }
        match lock::unlock_rows(self.executor.as_ref(), &desc, lock_cfg, &stubs, token).await {
            Ok(_) => Ok(ResultCode::Ok),
            Err(err) => {
                self.log(&desc, false, Severity::Error, &err.to_string(), "unlock_items");
                Ok(ResultCode::Infrastructure)
            }
        }
    }

    /// Public cascade entry point for callers that mutate children outside
    /// the engine.
    pub async fn update_fathers(
        &self,
        rows: &[Row],
        type_name: &str,
    ) -> Result<ResultCode, EngineError> {
        let desc = self.descriptor(type_name, None)?;
        let rows: Vec<Row> = rows.iter().map(|row| encode_keys(&desc, row)).collect();
        match fathers::cascade(
            self.executor.as_ref(),
            &self.cache,
            &desc,
            &rows,
            self.dry_run(false),
        )
        .await
        {
            Ok(()) => Ok(ResultCode::Ok),
            Err(err) => {
                self.log(&desc, false, Severity::Warning, &err.to_string(), "update_fathers");
                Ok(ResultCode::Infrastructure)
            }
        }
    }
}

// ============================================================================
// Row resolution helpers
// ============================================================================

/// Encode safe-string key values of a caller-supplied stub so identifiers
/// and conditions match what storage holds.
fn encode_keys(desc: &TypeDescriptor, row: &Row) -> Row {
    let mut encoded = row.clone();
    for column in desc.all_key_columns() {
        if desc.is_safe_str(column) {
            if let Some(value) = row.get(column) {
                encoded.insert(column.clone(), safe::encode_value(value));
            }
        }
    }
    encoded
}

/// Decode safe-string columns of a fetched row before it reaches the
/// caller.
fn decode_value(desc: &TypeDescriptor, row: Value) -> Value {
    let Value::Object(mut object) = row else {
        return row;
    };
    for column in &desc.safe_str_columns {
        if let Some(value) = object.get(column) {
            let decoded = safe::decode_value(value);
            object.insert(column.clone(), decoded);
        }
    }
    Value::Object(object)
}

/// Identifier of a read stub: its group prefix for grouped types, its full
/// identifier otherwise.
fn stub_id(desc: &TypeDescriptor, stub: &Row) -> Option<String> {
    if desc.group_by_first_n_keys > 0 {
        identifier::group_prefix(desc, stub, desc.group_by_first_n_keys)
    } else {
        identifier::id_from_row(desc, stub)
    }
}

fn has_full_id(desc: &TypeDescriptor, stub: &Row) -> bool {
    desc.all_key_columns().all(|column| stub.contains_key(column))
}

fn prefix_in_condition(desc: &TypeDescriptor, stubs: &[&Row], n: usize) -> Condition {
    let columns: Vec<String> = desc.key_columns.iter().take(n).cloned().collect();
    let mut tuples: Vec<Vec<Value>> = Vec::new();
    for stub in stubs {
        let tuple: Option<Vec<Value>> = columns
            .iter()
            .map(|column| stub.get(column).cloned())
            .collect();
        if let Some(tuple) = tuple {
            if !tuples.contains(&tuple) {
                tuples.push(tuple);
            }
        }
    }
    Condition::InTuples { columns, tuples }
}

/// Partition rows by their leading `n` key values into an outer map of
/// inner maps.
fn group_rows(desc: &TypeDescriptor, rows: Vec<Row>, n: usize, outcome: &mut ReadOutcome) {
    let mut groups: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for row in rows {
        let Some(prefix) = identifier::group_prefix(desc, &row, n) else {
            continue;
        };
        let Some(remainder) = identifier::group_remainder(desc, &row, n) else {
            continue;
        };
        groups
            .entry(prefix)
            .or_default()
            .insert(remainder, decode_value(desc, Value::Object(row)));
    }
    for (prefix, inner) in groups {
        outcome.insert(prefix, ItemValue::Row(Value::Object(inner)));
    }
}

/// Resolve every declared settable column for a create:
/// forced value → derivation → caller input → default. Any gap aborts the
/// item. Returns the full storage row including key columns.
fn resolve_create(desc: &TypeDescriptor, item: &Row, auto_increment: bool) -> Option<Row> {
    let mut row = Row::new();
    for (index, column) in desc.key_columns.iter().enumerate() {
        match item.get(column) {
            Some(value) => {
                row.insert(column.clone(), value.clone());
            }
            // The sole auto-increment key is assigned by the executor.
            None if auto_increment && index == 0 => {}
            None => return None,
        }
    }
    for column in &desc.extra_key_columns {
        if let Some(value) = item.get(column) {
            row.insert(column.clone(), value.clone());
        }
    }
    for (name, set) in &desc.set_columns {
        let value = resolve_set_value(set, item, name, None)?;
        let value = if desc.is_safe_str(name) {
            safe::encode_value(&value)
        } else {
            value
        };
        row.insert(name.clone(), value);
    }
    touch_modified(desc, &mut row);
    Some(row)
}

/// Resolve an update against the existing row: forced value → derivation →
/// caller input (JSON columns deep-merged, sentinel clears to null) →
/// existing value.
fn resolve_update(desc: &TypeDescriptor, existing: &Row, item: &Row) -> Row {
    let mut row = existing.clone();
    for (name, set) in &desc.set_columns {
        let current = existing.get(name);
        let value = match resolve_set_value(set, item, name, current) {
            // A newly resolved value gets the safe-string treatment; the
            // existing fallback is already stored encoded.
            Some(value) if desc.is_safe_str(name) => safe::encode_value(&value),
            Some(value) => value,
            None => match current {
                Some(value) => value.clone(),
                None => continue,
            },
        };
        row.insert(name.clone(), value);
    }
    touch_modified(desc, &mut row);
    row
}

/// Shared per-column resolution. `existing` is `Some` on update, enabling
/// the JSON deep-merge; `None` on create, enabling the declared default.
fn resolve_set_value(
    set: &SetColumn,
    item: &Row,
    name: &str,
    existing: Option<&Value>,
) -> Option<Value> {
    if let Some(forced) = &set.forced {
        return Some(forced.clone());
    }
    if let Some(derive) = &set.derive {
        if let Some(value) = derive(item) {
            return Some(value);
        }
    }
    if let Some(input) = item.get(name) {
        if let Some(sentinel) = &set.null_sentinel {
            if input == sentinel {
                return Some(Value::Null);
            }
        }
        if set.is_json {
            let base = existing.cloned().unwrap_or(Value::Null);
            return Some(deep_merge(&base, input));
        }
        return Some(colvalue::coerce(set.kind, input));
    }
    match existing {
        // Update: fall back to the existing value (handled by the caller).
        Some(_) => None,
        // Create: the declared default is the last resort.
        None => set.default.clone(),
    }
}

fn touch_modified(desc: &TypeDescriptor, row: &mut Row) {
    if let Some(modified) = &desc.modified_column {
        if !desc.set_columns.contains_key(modified) && !row.contains_key(modified) {
            row.insert(
                modified.clone(),
                Value::from(OffsetDateTime::now_utc().unix_timestamp()),
            );
        }
    }
}

/// Union of all resolved rows' columns, key columns first.
fn batch_columns(resolved: &[(String, Row)]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for (_, row) in resolved {
        for column in row.keys() {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
    }
    columns
}

fn row_to_batch(row: &Row) -> (Vec<String>, Vec<Value>) {
    let columns: Vec<String> = row.keys().cloned().collect();
    let values: Vec<Value> = row.values().cloned().collect();
    (columns, values)
}
