//! The record engine: CRUD orchestration over the schema registry, query
//! executor, cache backend and lock manager.

pub mod aggregate;
pub mod cache;
pub mod conditions;
pub mod crud;
pub mod fathers;
pub mod identifier;
pub mod lock;
pub mod params;

pub use crud::Engine;
pub use lock::LockOutcome;
pub use params::{DeleteParams, MoveParams, ReadParams, WriteMode, WriteParams};
