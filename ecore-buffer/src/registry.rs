//! Name-keyed table of registered backends

use crate::backend::Backend;
use crate::{Error, Result};

/// Backends in registration order
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a backend; on a name clash the existing one is kept
    pub fn register(&mut self, backend: Box<dyn Backend>) -> Result<()> {
        if self.contains(backend.name()) {
            return Err(Error::BackendExists(backend.name().to_string()));
        }
        self.backends.push(backend);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn Backend>> {
        let pos = self.backends.iter().position(|b| b.name() == name)?;
        Some(self.backends.remove(pos))
    }

    pub fn lookup(&mut self, name: &str) -> Option<&mut (dyn Backend + 'static)> {
        self.backends
            .iter_mut()
            .find(|b| b.name() == name)
            .map(|b| b.as_mut())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.iter().any(|b| b.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Remove every backend, last registered first
    pub fn drain(&mut self) -> Vec<Box<dyn Backend>> {
        let mut all: Vec<_> = self.backends.drain(..).collect();
        all.reverse();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shm::ShmBackend;

    #[test]
    fn test_duplicate_name_refused() {
        let mut registry = BackendRegistry::new();
        registry.register(Box::new(ShmBackend::new())).unwrap();
        assert!(matches!(
            registry.register(Box::new(ShmBackend::new())),
            Err(Error::BackendExists(name)) if name == "shm"
        ));
        assert_eq!(registry.names(), vec!["shm"]);
    }

    #[test]
    fn test_unregister_then_lookup() {
        let mut registry = BackendRegistry::new();
        registry.register(Box::new(ShmBackend::new())).unwrap();
        assert!(registry.lookup("shm").is_some());
        assert!(registry.unregister("shm").is_some());
        assert!(registry.lookup("shm").is_none());
        assert!(registry.unregister("shm").is_none());
    }
}
