//! Graphics buffers and their lifetime
//!
//! A buffer is one allocation (or wrapped native surface) owned by exactly
//! one backend. Buffers live in the context's arena; callers hold
//! [`BufferHandle`]s. A buffer marked *pending* (submitted for scanout) is
//! never freed: destroying it is deferred until the pending bit is cleared.

use crate::arena::Index;
use crate::backend::{BufferData, Export, Native};
use crate::context::SharedContext;
use crate::format::Format;
use crate::{Error, Result};
use tracing::{debug, error, warn};

/// Handle to a buffer living in a [`SharedContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) Index);

/// Identifier of a registered free callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u32);

/// What `buffer_destroy` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Freed,
    /// Buffer is pending a display commit; it is freed when the bit clears
    Deferred,
}

/// Read-only snapshot of a buffer's immutable attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub flags: u32,
    pub backend: &'static str,
    pub pending: bool,
}

type FreeCallback = Box<dyn FnOnce(BufferHandle)>;

pub(crate) struct Buffer {
    width: u32,
    height: u32,
    format: Format,
    flags: u32,
    backend: &'static str,
    data: BufferData,
    pending: bool,
    doomed: bool,
    free_callbacks: Vec<(CallbackId, FreeCallback)>,
    next_callback: u32,
}

impl Buffer {
    fn new(
        backend: &'static str,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
        data: BufferData,
    ) -> Self {
        Self {
            width,
            height,
            format,
            flags,
            backend,
            data,
            pending: false,
            doomed: false,
            free_callbacks: Vec::new(),
            next_callback: 0,
        }
    }

    fn info(&self) -> BufferInfo {
        BufferInfo {
            width: self.width,
            height: self.height,
            format: self.format,
            flags: self.flags,
            backend: self.backend,
            pending: self.pending,
        }
    }
}

impl SharedContext {
    /// Allocate a new buffer with the named backend
    pub fn buffer_create(
        &self,
        backend: &str,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
    ) -> Result<BufferHandle> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidSize(width, height));
        }
        let mut registry = self.registry().borrow_mut();
        let backend = registry
            .lookup(backend)
            .ok_or_else(|| Error::BackendUnavailable(backend.to_string()))?;

        let data = backend.alloc(width, height, format, flags).map_err(|e| {
            error!("{}: failed to allocate {}x{} {}: {}", backend.name(), width, height, format, e);
            match e {
                Error::InvalidSize(..) | Error::BackendUnavailable(_) => e,
                other => Error::AllocationFailed(other.to_string()),
            }
        })?;

        let buffer = Buffer::new(backend.name(), width, height, format, flags, data);
        let handle = BufferHandle(self.buffers().borrow_mut().insert(buffer));
        debug!("Created buffer {:?}: {}x{} {}", handle, width, height, format);
        Ok(handle)
    }

    /// Wrap an existing native surface; geometry comes from the backend
    pub fn buffer_create_from_native(
        &self,
        backend: &str,
        native: &Native,
        flags: u32,
    ) -> Result<BufferHandle> {
        let mut registry = self.registry().borrow_mut();
        let backend = registry
            .lookup(backend)
            .ok_or_else(|| Error::BackendUnavailable(backend.to_string()))?;

        let (data, width, height, format) =
            backend.alloc_from_native(native, flags).map_err(|e| {
                error!("{}: failed to wrap native surface: {}", backend.name(), e);
                Error::ImportFailed(e.to_string())
            })?;

        let buffer = Buffer::new(backend.name(), width, height, format, flags, data);
        Ok(BufferHandle(self.buffers().borrow_mut().insert(buffer)))
    }

    /// Produce a cross-process identity for the buffer
    pub fn buffer_export(&self, handle: BufferHandle) -> Result<Export> {
        let mut buffers = self.buffers().borrow_mut();
        let buffer = buffers.get_mut(handle.0).ok_or(Error::InvalidBuffer)?;
        let mut registry = self.registry().borrow_mut();
        let backend = registry
            .lookup(buffer.backend)
            .ok_or_else(|| Error::BackendUnavailable(buffer.backend.to_string()))?;

        backend.export(&mut buffer.data).map_err(|e| {
            error!("{}: export of {:?} failed: {}", buffer.backend, handle, e);
            e
        })
    }

    /// Build a buffer from another process's export
    ///
    /// The backend must report exactly the declared geometry.
    pub fn buffer_import(
        &self,
        backend: &str,
        width: u32,
        height: u32,
        format: Format,
        export: Export,
        flags: u32,
    ) -> Result<BufferHandle> {
        let mut registry = self.registry().borrow_mut();
        let backend = registry
            .lookup(backend)
            .ok_or_else(|| Error::BackendUnavailable(backend.to_string()))?;

        let data = backend
            .import(width, height, format, export, flags)
            .map_err(|e| {
                error!("{}: import of {}x{} {} failed: {}", backend.name(), width, height, format, e);
                match e {
                    Error::GeometryMismatch(_) => e,
                    other => Error::ImportFailed(other.to_string()),
                }
            })?;

        let buffer = Buffer::new(backend.name(), width, height, format, flags, data);
        Ok(BufferHandle(self.buffers().borrow_mut().insert(buffer)))
    }

    /// Destroy a buffer, or defer it while a display commit is outstanding
    pub fn buffer_destroy(&self, handle: BufferHandle) -> Result<Teardown> {
        {
            let mut buffers = self.buffers().borrow_mut();
            let buffer = buffers.get_mut(handle.0).ok_or(Error::InvalidBuffer)?;
            if buffer.pending {
                debug!("Buffer {:?} is pending, deferring destroy", handle);
                buffer.doomed = true;
                return Ok(Teardown::Deferred);
            }
        }
        self.buffer_finalize(handle);
        Ok(Teardown::Freed)
    }

    /// Mark or clear the pending-commit bit
    ///
    /// Clearing it finalizes a deferred destroy; returns true in that case.
    pub fn buffer_pending_set(&self, handle: BufferHandle, pending: bool) -> Result<bool> {
        let doomed = {
            let mut buffers = self.buffers().borrow_mut();
            let buffer = buffers.get_mut(handle.0).ok_or(Error::InvalidBuffer)?;
            buffer.pending = pending;
            !pending && buffer.doomed
        };
        if doomed {
            self.buffer_finalize(handle);
        }
        Ok(doomed)
    }

    fn buffer_finalize(&self, handle: BufferHandle) {
        // Observers run while the buffer is still queryable
        let callbacks = match self.buffers().borrow_mut().get_mut(handle.0) {
            Some(buffer) => std::mem::take(&mut buffer.free_callbacks),
            None => return,
        };
        for (_, callback) in callbacks {
            callback(handle);
        }

        let Some(buffer) = self.buffers().borrow_mut().remove(handle.0) else {
            return;
        };
        match self.registry().borrow_mut().lookup(buffer.backend) {
            Some(backend) => backend.free(buffer.data),
            None => warn!("Backend {} gone, dropping buffer {:?}", buffer.backend, handle),
        }
        debug!("Freed buffer {:?}", handle);
    }

    /// Observe destruction of a buffer
    pub fn free_callback_add(
        &self,
        handle: BufferHandle,
        callback: impl FnOnce(BufferHandle) + 'static,
    ) -> Result<CallbackId> {
        let mut buffers = self.buffers().borrow_mut();
        let buffer = buffers.get_mut(handle.0).ok_or(Error::InvalidBuffer)?;
        let id = CallbackId(buffer.next_callback);
        buffer.next_callback += 1;
        buffer.free_callbacks.push((id, Box::new(callback)));
        Ok(id)
    }

    pub fn free_callback_remove(&self, handle: BufferHandle, id: CallbackId) -> bool {
        let mut buffers = self.buffers().borrow_mut();
        let Some(buffer) = buffers.get_mut(handle.0) else {
            return false;
        };
        let before = buffer.free_callbacks.len();
        buffer.free_callbacks.retain(|(cb_id, _)| *cb_id != id);
        buffer.free_callbacks.len() != before
    }

    pub fn buffer_info(&self, handle: BufferHandle) -> Option<BufferInfo> {
        self.buffers().borrow().get(handle.0).map(Buffer::info)
    }

    pub fn buffer_size(&self, handle: BufferHandle) -> Option<(u32, u32)> {
        self.buffer_info(handle).map(|i| (i.width, i.height))
    }

    pub fn buffer_format(&self, handle: BufferHandle) -> Option<Format> {
        self.buffer_info(handle).map(|i| i.format)
    }

    pub fn buffer_flags(&self, handle: BufferHandle) -> Option<u32> {
        self.buffer_info(handle).map(|i| i.flags)
    }

    pub fn buffer_native_handle(&self, handle: BufferHandle) -> Option<Native> {
        let buffers = self.buffers().borrow();
        let buffer = buffers.get(handle.0)?;
        let mut registry = self.registry().borrow_mut();
        registry.lookup(buffer.backend)?.native_handle(&buffer.data)
    }

    pub fn buffer_alive(&self, handle: BufferHandle) -> bool {
        self.buffers().borrow().contains(handle.0)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers().borrow().len()
    }

    /// Free every buffer regardless of pending state (context teardown)
    pub(crate) fn buffers_drain(&self) {
        let handles: Vec<_> = self.buffers().borrow().indices();
        for index in handles {
            let handle = BufferHandle(index);
            if self.buffer_info(handle).is_some_and(|i| i.pending) {
                warn!("Freeing buffer {:?} with a display commit outstanding", handle);
            }
            self.buffer_finalize(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::server::DisplayServer;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn context() -> SharedContext {
        let ctx = SharedContext::new(Broker::new(), DisplayServer::new());
        ctx.init();
        ctx
    }

    #[test]
    fn test_create_and_getters() {
        let ctx = context();
        let buffer = ctx.buffer_create("shm", 64, 32, Format::Argb8888, 0x4).unwrap();
        assert_eq!(ctx.buffer_size(buffer), Some((64, 32)));
        assert_eq!(ctx.buffer_format(buffer), Some(Format::Argb8888));
        assert_eq!(ctx.buffer_flags(buffer), Some(0x4));
        assert!(matches!(ctx.buffer_native_handle(buffer), Some(Native::Memory { .. })));
    }

    #[test]
    fn test_import_with_huge_geometry_fails() {
        let ctx = context();
        let buffer = ctx.buffer_create("shm", 64, 32, Format::Argb8888, 0).unwrap();
        for backend in ["shm", "dri3"] {
            let export = Export::Fd(match ctx.buffer_native_handle(buffer) {
                Some(Native::Memory { fd, .. }) => fd,
                _ => panic!("shm buffer without memory"),
            });
            assert!(matches!(
                ctx.buffer_import(backend, 0x4000_0001, 1, Format::Argb8888, export, 0),
                Err(Error::ImportFailed(_))
            ));
        }
        assert_eq!(ctx.buffer_count(), 1);
    }

    #[test]
    fn test_unknown_backend() {
        let ctx = context();
        assert!(matches!(
            ctx.buffer_create("tbm", 64, 64, Format::Argb8888, 0),
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let ctx = context();
        assert!(matches!(
            ctx.buffer_create("shm", 0, 64, Format::Argb8888, 0),
            Err(Error::InvalidSize(0, 64))
        ));
    }

    #[test]
    fn test_free_callbacks_run_before_free() {
        let ctx = context();
        let buffer = ctx.buffer_create("shm", 8, 8, Format::Xrgb8888, 0).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let ctx_cb = ctx.clone();
        let seen_cb = seen.clone();
        ctx.free_callback_add(buffer, move |h| {
            // Still queryable inside the callback
            seen_cb.borrow_mut().push(ctx_cb.buffer_size(h));
        })
        .unwrap();
        let seen_removed = seen.clone();
        let id = ctx
            .free_callback_add(buffer, move |_| seen_removed.borrow_mut().push(None))
            .unwrap();
        assert!(ctx.free_callback_remove(buffer, id));

        assert_eq!(ctx.buffer_destroy(buffer).unwrap(), Teardown::Freed);
        assert_eq!(*seen.borrow(), vec![Some((8, 8))]);
        assert!(!ctx.buffer_alive(buffer));
    }

    #[test]
    fn test_pending_destroy_is_deferred() {
        let ctx = context();
        let buffer = ctx.buffer_create("shm", 8, 8, Format::Xrgb8888, 0).unwrap();
        ctx.buffer_pending_set(buffer, true).unwrap();

        assert_eq!(ctx.buffer_destroy(buffer).unwrap(), Teardown::Deferred);
        assert!(ctx.buffer_alive(buffer));

        assert!(ctx.buffer_pending_set(buffer, false).unwrap());
        assert!(!ctx.buffer_alive(buffer));
        assert!(matches!(ctx.buffer_destroy(buffer), Err(Error::InvalidBuffer)));
    }

    #[test]
    fn test_export_import_preserves_geometry() {
        let server = DisplayServer::new();
        let producer = SharedContext::new(Broker::new(), server.clone());
        let consumer = SharedContext::new(Broker::new(), server);
        producer.init();
        consumer.init();

        for backend in ["dri2", "dri3", "shm"] {
            let original = producer
                .buffer_create(backend, 96, 40, Format::Xrgb8888, 0)
                .unwrap();
            let export = producer.buffer_export(original).unwrap();
            let imported = consumer
                .buffer_import(backend, 96, 40, Format::Xrgb8888, export, 0)
                .unwrap();

            let a = producer.buffer_info(original).unwrap();
            let b = consumer.buffer_info(imported).unwrap();
            assert_eq!((a.width, a.height, a.format), (b.width, b.height, b.format));
        }
    }

    #[test]
    fn test_import_wrong_geometry_fails() {
        let ctx = context();
        let original = ctx.buffer_create("dri3", 96, 40, Format::Xrgb8888, 0).unwrap();
        let export = ctx.buffer_export(original).unwrap();
        assert!(matches!(
            ctx.buffer_import("dri3", 96, 41, Format::Xrgb8888, export, 0),
            Err(Error::GeometryMismatch(_))
        ));
    }

    #[test]
    fn test_multiplanar_export_by_backend() {
        let ctx = context();
        let dri2 = ctx.buffer_create("dri2", 64, 64, Format::Nv12, 0).unwrap();
        assert!(matches!(ctx.buffer_export(dri2), Err(Error::ExportUnsupported(_))));
        let shm = ctx.buffer_create("shm", 64, 64, Format::Nv12, 0).unwrap();
        assert!(ctx.buffer_export(shm).is_ok());
    }

    #[test]
    fn test_wrap_native_dri2_pixmap() {
        let ctx = context();
        let bo = ctx.server().bo_alloc(20, 10, Format::Argb8888).unwrap();
        let pixmap = ctx.server().pixmap_from_bo(bo).unwrap();

        let buffer = ctx
            .buffer_create_from_native("dri2", &Native::Pixmap(pixmap), 0)
            .unwrap();
        assert_eq!(ctx.buffer_size(buffer), Some((20, 10)));
        ctx.buffer_destroy(buffer).unwrap();
        assert!(ctx.server().pixmap_info(pixmap).is_some());

        assert!(matches!(
            ctx.buffer_create_from_native("dri2", &Native::Pixmap(0xdead), 0),
            Err(Error::ImportFailed(_))
        ));
    }
}
