//! Registry mapping operation names to declared endpoints.

use std::collections::HashMap;

use serde_json::Value;

use super::EndpointSpec;
use crate::error::{ApiError, Result};

/// Endpoints declared for one API, populated at startup and read at call time.
pub struct EndpointRegistry<T = Value> {
    endpoints: HashMap<String, EndpointSpec<T>>,
}

impl<T> EndpointRegistry<T> {
    pub fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
        }
    }

    /// Registers an endpoint under its name, replacing any previous declaration.
    pub fn register(&mut self, spec: EndpointSpec<T>) -> &mut Self {
        self.endpoints.insert(spec.name().to_string(), spec);
        self
    }

    /// Chained form of [`EndpointRegistry::register`].
    pub fn with(mut self, spec: EndpointSpec<T>) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EndpointSpec<T>> {
        self.endpoints.get(name)
    }

    /// Like [`EndpointRegistry::get`], but an unknown name is a configuration error.
    pub fn resolve(&self, name: &str) -> Result<&EndpointSpec<T>> {
        self.endpoints
            .get(name)
            .ok_or_else(|| ApiError::configuration(format!("No endpoint registered: {}", name)))
    }

    pub fn has(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.endpoints.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl<T> Default for EndpointRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EndpointRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.names())
            .finish()
    }
}
