//! Software shared-memory backend
//!
//! Every plane lives in a single memfd, so multi-planar YUV buffers can be
//! exported as one descriptor.

use super::memfd::MemBuffer;
use super::{check_size, downcast, Backend, BackendOptions, BufferData, Export, Native};
use crate::format::Format;
use crate::server::DisplayServer;
use crate::{Error, Result};
use tracing::info;

const NAME: &str = "shm";

pub struct ShmBackend {
    max_size: u32,
}

impl ShmBackend {
    pub fn new() -> Self {
        Self { max_size: 16384 }
    }
}

impl Default for ShmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for ShmBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, _server: &DisplayServer, options: &BackendOptions) -> Result<()> {
        self.max_size = options.get_u32("max_size", 16384)?;
        info!("shm backend initialized (max size {})", self.max_size);
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn alloc(&mut self, width: u32, height: u32, format: Format, _flags: u32) -> Result<BufferData> {
        check_size(width, height, self.max_size)?;
        Ok(Box::new(MemBuffer::alloc("ecore-buffer-shm", width, height, format)?))
    }

    fn alloc_from_native(
        &mut self,
        native: &Native,
        _flags: u32,
    ) -> Result<(BufferData, u32, u32, Format)> {
        let Native::Memory { fd, width, height, format } = native else {
            return Err(Error::ImportFailed("shm can only wrap fd memory".into()));
        };
        let mem = MemBuffer::adopt(fd.try_clone()?, *width, *height, *format)
            .map_err(|e| Error::ImportFailed(e.to_string()))?;
        Ok((Box::new(mem), *width, *height, *format))
    }

    fn free(&mut self, data: BufferData) {
        // Closing our descriptor is all there is to do
        drop(data);
    }

    fn export(&mut self, data: &mut BufferData) -> Result<Export> {
        let mem = downcast::<MemBuffer>(data, NAME)?;
        Ok(Export::Fd(mem.dup()?))
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
            return Err(Error::ImportFailed("shm imports file descriptors only".into()));
        };
        check_size(width, height, self.max_size)?;
        Ok(Box::new(MemBuffer::adopt(fd, width, height, format)?))
    }

    fn native_handle(&self, data: &BufferData) -> Option<Native> {
        let mem = downcast::<MemBuffer>(data, NAME).ok()?;
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
    fn test_multiplanar_roundtrip() {
        let server = DisplayServer::new();
        let mut b = ShmBackend::new();
        b.init(&server, &BackendOptions::default()).unwrap();

        let mut data = b.alloc(64, 48, Format::Yuv420, 0).unwrap();
        let export = b.export(&mut data).unwrap();
        assert!(b.import(64, 48, Format::Yuv420, export, 0).is_ok());
    }

    #[test]
    fn test_max_size_option() {
        let server = DisplayServer::new();
        let mut b = ShmBackend::new();
        let mut options = BackendOptions::default();
        options.0.insert("max_size".into(), "128".into());
        b.init(&server, &options).unwrap();

        assert!(matches!(
            b.alloc(256, 16, Format::Argb8888, 0),
            Err(Error::InvalidSize(256, 16))
        ));
    }
}
