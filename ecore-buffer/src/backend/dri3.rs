//! DRI3-style backend: memfd memory exported as file descriptors

use super::memfd::MemBuffer;
use super::{check_size, downcast, downcast_mut, Backend, BackendOptions, BufferData, Export, Native};
use crate::format::Format;
use crate::server::DisplayServer;
use crate::{Error, Result};
use std::os::fd::AsFd;
use tracing::{debug, info};

const NAME: &str = "dri3";

struct Dri3Buffer {
    mem: MemBuffer,
    /// Server-side pixmap bound to the same memory, made on first export
    pixmap: Option<u32>,
}

pub struct Dri3Backend {
    server: Option<DisplayServer>,
    max_size: u32,
}

impl Dri3Backend {
    pub fn new() -> Self {
        Self {
            server: None,
            max_size: 8192,
        }
    }

    fn server(&self) -> Result<&DisplayServer> {
        self.server
            .as_ref()
            .ok_or_else(|| Error::BackendUnavailable(NAME.to_string()))
    }
}

impl Default for Dri3Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for Dri3Backend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, server: &DisplayServer, options: &BackendOptions) -> Result<()> {
        self.max_size = options.get_u32("max_size", 8192)?;
        self.server = Some(server.clone());
        info!("dri3 backend initialized (max size {})", self.max_size);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.server = None;
    }

    fn alloc(&mut self, width: u32, height: u32, format: Format, _flags: u32) -> Result<BufferData> {
        self.server()?;
        check_size(width, height, self.max_size)?;
        let mem = MemBuffer::alloc("ecore-buffer-dri3", width, height, format)?;
        Ok(Box::new(Dri3Buffer { mem, pixmap: None }))
    }

    fn alloc_from_native(
        &mut self,
        native: &Native,
        _flags: u32,
    ) -> Result<(BufferData, u32, u32, Format)> {
        let Native::Memory { fd, width, height, format } = native else {
            return Err(Error::ImportFailed("dri3 can only wrap fd memory".into()));
        };
        let mem = MemBuffer::adopt(fd.try_clone()?, *width, *height, *format)
            .map_err(|e| Error::ImportFailed(e.to_string()))?;
        Ok((Box::new(Dri3Buffer { mem, pixmap: None }), *width, *height, *format))
    }

    fn free(&mut self, data: BufferData) {
        let Ok(buffer) = data.downcast::<Dri3Buffer>() else {
            return;
        };
        if let (Some(pixmap), Some(server)) = (buffer.pixmap, self.server.as_ref()) {
            server.pixmap_destroy(pixmap);
        }
    }

    fn export(&mut self, data: &mut BufferData) -> Result<Export> {
        let server = self.server()?.clone();
        let buffer = downcast_mut::<Dri3Buffer>(data, NAME)?;
        let mem = &buffer.mem;
        if mem.format.plane_count() > 1 {
            return Err(Error::ExportUnsupported(format!(
                "dri3 exports single-plane formats only, got {}",
                mem.format
            )));
        }

        if buffer.pixmap.is_none() {
            let pixmap =
                server.pixmap_from_fd(mem.dup()?, mem.width, mem.height, mem.stride, mem.format);
            debug!("dri3: bound pixmap 0x{:x} ({} bytes)", pixmap, mem.size);
            buffer.pixmap = Some(pixmap);
        }
        Ok(Export::Fd(buffer.mem.dup()?))
    }

    fn import(
        &mut self,
        width: u32,
        height: u32,
        format: Format,
        export: Export,
        _flags: u32,
    ) -> Result<BufferData> {
        let Export::Fd(fd) = export else {
            return Err(Error::ImportFailed("dri3 imports file descriptors only".into()));
        };
        check_size(width, height, self.max_size)?;
        // The exporter bound a pixmap on export; hold the import to its geometry
        if let Some((pixmap, info)) = self.server()?.pixmap_for_fd(fd.as_fd()) {
            if info.width != width || info.height != height || info.format != format {
                return Err(Error::GeometryMismatch(format!(
                    "declared {}x{} {}, pixmap 0x{:x} is {}x{} {}",
                    width, height, format, pixmap, info.width, info.height, info.format
                )));
            }
        }
        let mem = MemBuffer::adopt(fd, width, height, format)?;
        Ok(Box::new(Dri3Buffer { mem, pixmap: None }))
    }

    fn native_handle(&self, data: &BufferData) -> Option<Native> {
        let buffer = downcast::<Dri3Buffer>(data, NAME).ok()?;
        let mem = &buffer.mem;
        Some(Native::Memory {
            fd: mem.dup().ok()?,
            width: mem.width,
            height: mem.height,
            format: mem.format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_binds_one_pixmap() {
        let server = DisplayServer::new();
        let mut b = Dri3Backend::new();
        b.init(&server, &BackendOptions::default()).unwrap();

        let mut data = b.alloc(32, 32, Format::Argb8888, 0).unwrap();
        let fd = b.export(&mut data).unwrap();
        assert!(matches!(fd, Export::Fd(_)));
        b.export(&mut data).unwrap();
        assert_eq!(server.pixmap_count(), 1);

        let imported = b.import(32, 32, Format::Argb8888, fd, 0).unwrap();
        b.free(imported);
        assert_eq!(server.pixmap_count(), 1);

        b.free(data);
        assert_eq!(server.pixmap_count(), 0);
    }

    #[test]
    fn test_import_checks_pixmap_geometry() {
        let server = DisplayServer::new();
        let mut b = Dri3Backend::new();
        b.init(&server, &BackendOptions::default()).unwrap();

        // Same byte count, transposed geometry
        let mut data = b.alloc(32, 16, Format::Argb8888, 0).unwrap();
        let fd = b.export(&mut data).unwrap();
        assert!(matches!(
            b.import(16, 32, Format::Argb8888, fd, 0),
            Err(Error::GeometryMismatch(_))
        ));
        let fd = b.export(&mut data).unwrap();
        assert!(matches!(
            b.import(32, 16, Format::Xrgb8888, fd, 0),
            Err(Error::GeometryMismatch(_))
        ));
        let fd = b.export(&mut data).unwrap();
        let imported = b.import(32, 16, Format::Argb8888, fd, 0).unwrap();
        b.free(imported);
        b.free(data);
    }

    #[test]
    fn test_import_rejects_oversized_geometry() {
        let server = DisplayServer::new();
        let mut b = Dri3Backend::new();
        b.init(&server, &BackendOptions::default()).unwrap();
        let mut data = b.alloc(32, 16, Format::Argb8888, 0).unwrap();
        let fd = b.export(&mut data).unwrap();
        assert!(matches!(
            b.import(0x4000_0001, 1, Format::Argb8888, fd, 0),
            Err(Error::InvalidSize(0x4000_0001, 1))
        ));
        b.free(data);
    }

    #[test]
    fn test_uninitialized_backend_refuses_alloc() {
        let mut b = Dri3Backend::new();
        assert!(matches!(
            b.alloc(32, 32, Format::Argb8888, 0),
            Err(Error::BackendUnavailable(_))
        ));
    }
}
