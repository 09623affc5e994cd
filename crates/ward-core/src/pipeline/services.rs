use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use super::ProtectError;

/// Named capabilities that protections publish for each other.
///
/// The registry is an ordinary value owned by the [`super::Driver`]; nothing
/// about it is process-global. Services are stored as `Arc<S>` where `S` is
/// usually a trait object, e.g. `Arc<dyn AntiTamperService>`.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `service` under `id`. Each id may be registered once.
    pub fn register<S>(&mut self, id: &str, service: Arc<S>) -> Result<(), ProtectError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        if self.services.contains_key(id) {
            return Err(ProtectError::DuplicateService(id.to_string()));
        }
        self.services.insert(id.to_string(), Box::new(service));
        Ok(())
    }

    pub fn resolve<S>(&self, id: &str) -> Result<Arc<S>, ProtectError>
    where
        S: ?Sized + Send + Sync + 'static,
    {
        let entry = self
            .services
            .get(id)
            .ok_or_else(|| ProtectError::ServiceNotFound(id.to_string()))?;
        entry
            .downcast_ref::<Arc<S>>()
            .cloned()
            .ok_or_else(|| ProtectError::ServiceType(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.services.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;

    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    #[test]
    fn register_and_resolve_trait_object() {
        let mut registry = ServiceRegistry::new();
        let service: Arc<dyn Greeter> = Arc::new(Hello);
        registry.register("greeter", service).unwrap();
        let resolved = registry.resolve::<dyn Greeter>("greeter").unwrap();
        assert_eq!(resolved.greet(), "hello");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ServiceRegistry::new();
        registry.register("x", Arc::new(1u32)).unwrap();
        assert!(matches!(
            registry.register("x", Arc::new(2u32)),
            Err(ProtectError::DuplicateService(id)) if id == "x"
        ));
    }

    #[test]
    fn wrong_type_and_missing() {
        let mut registry = ServiceRegistry::new();
        registry.register("x", Arc::new(1u32)).unwrap();
        assert!(matches!(registry.resolve::<u64>("x"), Err(ProtectError::ServiceType(_))));
        assert!(matches!(registry.resolve::<u32>("y"), Err(ProtectError::ServiceNotFound(_))));
    }
}
