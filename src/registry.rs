//! Type schema registry.
//!
//! Holds every validated [`TypeDescriptor`] plus the per-type logger table.
//! Built once at startup, read-only afterwards; per-call overrides are
//! merged into private descriptor copies and never written back.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::error::EngineError;
use crate::domain::schema::TypeDescriptor;
use crate::infra::logger::{Logger, shared_logger};

pub struct TypeRegistry {
    types: BTreeMap<String, TypeDescriptor>,
    loggers: BTreeMap<String, Arc<dyn Logger>>,
    default_logger: Arc<dyn Logger>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder {
            types: BTreeMap::new(),
            loggers: BTreeMap::new(),
            default_logger: None,
        }
    }

    pub fn get(&self, type_name: &str) -> Result<&TypeDescriptor, EngineError> {
        self.types
            .get(type_name)
            .ok_or_else(|| EngineError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &String> {
        self.types.keys()
    }

    /// Logger for a type: its named selection when declared, else the
    /// registry default.
    pub fn logger_for(&self, descriptor: &TypeDescriptor) -> Arc<dyn Logger> {
        descriptor
            .logger
            .as_ref()
            .and_then(|name| self.loggers.get(name))
            .cloned()
            .unwrap_or_else(|| self.default_logger.clone())
    }
}

pub struct TypeRegistryBuilder {
    types: BTreeMap<String, TypeDescriptor>,
    loggers: BTreeMap<String, Arc<dyn Logger>>,
    default_logger: Option<Arc<dyn Logger>>,
}

impl TypeRegistryBuilder {
    pub fn register(mut self, descriptor: TypeDescriptor) -> Self {
        self.types.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Register a named logger selectable via `TypeDescriptor::logger`.
    pub fn logger(mut self, name: impl Into<String>, logger: Arc<dyn Logger>) -> Self {
        self.loggers.insert(name.into(), logger);
        self
    }

    pub fn default_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.default_logger = Some(logger);
        self
    }

    /// Validate every descriptor and freeze the registry.
    pub fn build(self) -> Result<TypeRegistry, EngineError> {
        for descriptor in self.types.values() {
            descriptor.validate()?;
            if let Some(logger_name) = &descriptor.logger {
                if !self.loggers.contains_key(logger_name) {
                    return Err(EngineError::invalid_descriptor(
                        &descriptor.name,
                        format!("unknown logger `{logger_name}`"),
                    ));
                }
            }
        }
        Ok(TypeRegistry {
            types: self.types,
            loggers: self.loggers,
            default_logger: self.default_logger.unwrap_or_else(shared_logger),
        })
    }
}
