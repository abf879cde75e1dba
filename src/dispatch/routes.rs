use std::{collections::HashMap, fmt, sync::Arc};

use axum::http::{Method, StatusCode};

use super::handler::Handler;
use crate::errors::RouteError;

/// Exact-match key of a route. Methods are stored upper-cased so lookups
/// ignore the case the client used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    method: String,
    path: String,
}

impl RouteKey {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Immutable `(method, path) -> handler` map with a fallback for misses.
///
/// Built once before serving starts and shared read-only by every request.
#[derive(Clone)]
pub struct RouteTable {
    routes: HashMap<RouteKey, Arc<Handler>>,
    fallback: Arc<Handler>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    /// Handler registered for exactly this method and path.
    pub fn find(&self, method: &str, path: &str) -> Option<&Arc<Handler>> {
        self.routes.get(&RouteKey::new(method, path))
    }

    /// Handler for this method and path, or the fallback. The flag is `true`
    /// when a registered route matched.
    pub fn lookup(&self, method: &str, path: &str) -> (&Arc<Handler>, bool) {
        match self.find(method, path) {
            Some(handler) => (handler, true),
            None => (&self.fallback, false),
        }
    }

    pub fn fallback(&self) -> &Arc<Handler> {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RouteKey> {
        self.routes.keys()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        RouteTableBuilder::default().build()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.routes.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("RouteTable")
            .field("routes", &keys)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

pub struct RouteTableBuilder {
    routes: HashMap<RouteKey, Arc<Handler>>,
    fallback: Handler,
}

impl Default for RouteTableBuilder {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: Handler::status("not_found", StatusCode::NOT_FOUND),
        }
    }
}

impl RouteTableBuilder {
    /// Adds a route. Registering the same method and path again replaces
    /// the earlier handler.
    pub fn register(mut self, method: &str, path: &str, handler: Handler) -> Result<Self, RouteError> {
        Method::from_bytes(method.as_bytes())
            .map_err(|_| RouteError::InvalidMethod(method.to_string()))?;
        if !path.starts_with('/') {
            return Err(RouteError::InvalidPath(path.to_string()));
        }

        let key = RouteKey::new(method, path);
        if self.routes.insert(key.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(route = %key, "replacing previously registered route");
        }
        Ok(self)
    }

    pub fn get(self, path: &str, handler: Handler) -> Result<Self, RouteError> {
        self.register("GET", path, handler)
    }

    pub fn head(self, path: &str, handler: Handler) -> Result<Self, RouteError> {
        self.register("HEAD", path, handler)
    }

    pub fn post(self, path: &str, handler: Handler) -> Result<Self, RouteError> {
        self.register("POST", path, handler)
    }

    pub fn put(self, path: &str, handler: Handler) -> Result<Self, RouteError> {
        self.register("PUT", path, handler)
    }

    pub fn delete(self, path: &str, handler: Handler) -> Result<Self, RouteError> {
        self.register("DELETE", path, handler)
    }

    pub fn patch(self, path: &str, handler: Handler) -> Result<Self, RouteError> {
        self.register("PATCH", path, handler)
    }

    pub fn options(self, path: &str, handler: Handler) -> Result<Self, RouteError> {
        self.register("OPTIONS", path, handler)
    }

    /// Replaces the default 404 fallback. The fallback is bound and invoked
    /// like any other handler.
    pub fn set_fallback(mut self, handler: Handler) -> Self {
        self.fallback = handler;
        self
    }

    pub fn build(self) -> RouteTable {
        RouteTable {
            routes: self.routes,
            fallback: Arc::new(self.fallback),
        }
    }
}
