//! Dependency resolution for handler parameters that carry no binding
//! annotation and are not special parameters.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

pub type Instance = Arc<dyn Any + Send + Sync>;

/// Last-resort source of handler arguments.
///
/// Shared by every in-flight request, so implementations must tolerate
/// concurrent calls.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, type_id: TypeId) -> Option<Instance>;
}

/// A fixed set of shared instances keyed by type, built once at startup.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Instance>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service`, replacing any earlier instance of the same type.
    pub fn register<T: Send + Sync + 'static>(&mut self, service: T) -> &mut Self {
        self.register_arc(Arc::new(service))
    }

    pub fn register_arc<T: Send + Sync + 'static>(&mut self, service: Arc<T>) -> &mut Self {
        self.services.insert(TypeId::of::<T>(), service);
        self
    }

    pub fn with<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.register(service);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|instance| instance.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl DependencyResolver for ServiceRegistry {
    fn resolve(&self, type_id: TypeId) -> Option<Instance> {
        self.services.get(&type_id).cloned()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}
