//! Reference-counted library context
//!
//! Replaces a process-wide singleton: every constructor takes a
//! `SharedContext`, which is a cheap `Rc` clone. The first `init` registers
//! the built-in backends; nested `init`/`shutdown` pairs only move the count,
//! and the context is torn down when it returns to zero.

use crate::arena::Arena;
use crate::backend::{self, Backend, BackendOptions};
use crate::broker::Broker;
use crate::buffer::Buffer;
use crate::registry::BackendRegistry;
use crate::server::DisplayServer;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{info, warn};

struct Inner {
    init_count: Cell<u32>,
    registry: RefCell<BackendRegistry>,
    buffers: RefCell<Arena<Buffer>>,
    options: RefCell<HashMap<String, BackendOptions>>,
    broker: Broker,
    server: DisplayServer,
}

/// Handle to one process's view of the buffer subsystem
#[derive(Clone)]
pub struct SharedContext {
    inner: Rc<Inner>,
}

impl SharedContext {
    /// `broker` is the queue connection service, `server` the display-server
    /// connection that ID exports are resolved against
    pub fn new(broker: Broker, server: DisplayServer) -> Self {
        Self {
            inner: Rc::new(Inner {
                init_count: Cell::new(0),
                registry: RefCell::new(BackendRegistry::new()),
                buffers: RefCell::new(Arena::new()),
                options: RefCell::new(HashMap::new()),
                broker,
                server,
            }),
        }
    }

    /// Options passed to the named backend on its next `init`
    pub fn set_backend_options(&self, name: &str, options: BackendOptions) {
        self.inner.options.borrow_mut().insert(name.to_string(), options);
    }

    /// Bump the init count; the first call registers the built-in backends
    pub fn init(&self) -> u32 {
        let count = self.inner.init_count.get() + 1;
        self.inner.init_count.set(count);
        if count == 1 {
            for backend in backend::builtin() {
                self.register_backend(backend);
            }
            info!(
                "Buffer context initialized, backends: {:?}",
                self.inner.registry.borrow().names()
            );
        }
        count
    }

    /// Drop one init reference; tears everything down at zero
    pub fn shutdown(&self) -> u32 {
        let count = self.inner.init_count.get();
        if count == 0 {
            warn!("shutdown called on an uninitialized context");
            return 0;
        }
        let count = count - 1;
        self.inner.init_count.set(count);
        if count == 0 {
            self.buffers_drain();
            let backends = self.inner.registry.borrow_mut().drain();
            for mut backend in backends {
                backend.shutdown();
            }
            info!("Buffer context shut down");
        }
        count
    }

    pub fn init_count(&self) -> u32 {
        self.inner.init_count.get()
    }

    /// Initialise and register a backend; `false` if the name is taken or init fails
    pub fn register_backend(&self, mut backend: Box<dyn Backend>) -> bool {
        let name = backend.name();
        if self.inner.registry.borrow().contains(name) {
            warn!("Backend {} already registered", name);
            return false;
        }
        let options = self
            .inner
            .options
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_default();
        if let Err(e) = backend.init(&self.inner.server, &options) {
            warn!("Backend {} failed to initialize: {}", name, e);
            return false;
        }
        match self.inner.registry.borrow_mut().register(backend) {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Remove a backend; buffers it still owns are leaked to it
    pub fn unregister_backend(&self, name: &str) -> bool {
        let removed = self.inner.registry.borrow_mut().unregister(name);
        match removed {
            Some(mut backend) => {
                backend.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.inner.registry.borrow().contains(name)
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn server(&self) -> &DisplayServer {
        &self.inner.server
    }

    /// Set when the connection service was lost; the application decides
    /// whether to shut down
    pub fn exit_requested(&self) -> bool {
        self.inner.broker.exit_requested()
    }

    pub(crate) fn registry(&self) -> &RefCell<BackendRegistry> {
        &self.inner.registry
    }

    pub(crate) fn buffers(&self) -> &RefCell<Arena<Buffer>> {
        &self.inner.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shm::ShmBackend;
    use crate::format::Format;

    #[test]
    fn test_nested_init_shutdown() {
        let ctx = SharedContext::new(Broker::new(), DisplayServer::new());
        assert_eq!(ctx.init(), 1);
        assert_eq!(ctx.init(), 2);
        assert!(ctx.has_backend("shm"));

        let buffer = ctx.buffer_create("shm", 4, 4, Format::Argb8888, 0).unwrap();
        assert_eq!(ctx.shutdown(), 1);
        assert!(ctx.buffer_alive(buffer));
        assert!(ctx.has_backend("shm"));

        assert_eq!(ctx.shutdown(), 0);
        assert!(!ctx.buffer_alive(buffer));
        assert!(!ctx.has_backend("shm"));
        assert_eq!(ctx.shutdown(), 0);
    }

    #[test]
    fn test_register_duplicate_backend() {
        let ctx = SharedContext::new(Broker::new(), DisplayServer::new());
        ctx.init();
        assert!(!ctx.register_backend(Box::new(ShmBackend::new())));
        assert!(ctx.unregister_backend("shm"));
        assert!(ctx.register_backend(Box::new(ShmBackend::new())));
    }

    #[test]
    fn test_backend_options_applied() {
        let ctx = SharedContext::new(Broker::new(), DisplayServer::new());
        let mut options = BackendOptions::default();
        options.0.insert("max_size".into(), "16".into());
        ctx.set_backend_options("shm", options);
        ctx.init();

        assert!(ctx.buffer_create("shm", 16, 16, Format::Argb8888, 0).is_ok());
        assert!(ctx.buffer_create("shm", 17, 16, Format::Argb8888, 0).is_err());
    }
}
