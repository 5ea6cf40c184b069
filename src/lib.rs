//! tessera — a schema-driven, cache-aware generic record engine.
//!
//! One set of algorithms implements CRUD, advisory row locking and cache
//! invalidation for many logical object types. Each type is described by a
//! declarative [`TypeDescriptor`](domain::schema::TypeDescriptor) — table,
//! composite keys, settable columns, filters, aggregations, lock columns,
//! ancestor cascades, cache naming — validated once into a
//! [`TypeRegistry`](registry::TypeRegistry) and consumed generically by the
//! [`Engine`](engine::Engine).
//!
//! Storage and caching stay behind two ports:
//! [`QueryExecutor`](infra::executor::QueryExecutor) consumes a
//! serializable condition AST (no SQL text in this crate), and
//! [`CacheBackend`](infra::cache::CacheBackend) is a plain byte store with
//! TTLs. In-memory implementations of both ship in [`infra`] and power the
//! test suite.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera::config::EngineSettings;
//! use tessera::domain::schema::TypeDescriptor;
//! use tessera::engine::{Engine, ReadParams};
//! use tessera::infra::cache::MemoryCache;
//! use tessera::infra::memory::MemoryExecutor;
//! use tessera::registry::TypeRegistry;
//!
//! # async fn demo() -> Result<(), tessera::domain::error::EngineError> {
//! let registry = TypeRegistry::builder()
//!     .register(TypeDescriptor::new("widget", "widgets", vec!["ID".into()]))
//!     .build()?;
//! let executor = Arc::new(MemoryExecutor::new());
//! executor.create_table("widgets", vec!["ID".into()]);
//!
//! let engine = Engine::new(
//!     registry,
//!     executor,
//!     Arc::new(MemoryCache::new()),
//!     EngineSettings::default(),
//! );
//! let all = engine.get_items(&[], "widget", &ReadParams::default()).await?;
//! # let _ = all;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod registry;

pub use domain::error::EngineError;
pub use domain::outcome::{ItemValue, ReadOutcome, ResultCode, WriteOutcomeMap};
pub use domain::query::Row;
pub use engine::{Engine, LockOutcome, ReadParams, WriteMode, WriteParams};
pub use registry::TypeRegistry;
