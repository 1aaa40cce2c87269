//! DRI2-style backend: server buffer objects exported by pixmap ID

use super::{check_size, downcast, downcast_mut, Backend, BackendOptions, BufferData, Export, Native};
use crate::format::Format;
use crate::server::DisplayServer;
use crate::{Error, Result};
use tracing::{debug, info};

const NAME: &str = "dri2";

struct Dri2Buffer {
    bo: u32,
    width: u32,
    height: u32,
    format: Format,
    pixmap: Option<u32>,
    /// Whether `pixmap` was created by us and must be destroyed on free
    owns_pixmap: bool,
}

pub struct Dri2Backend {
    server: Option<DisplayServer>,
    max_size: u32,
}

impl Dri2Backend {
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

impl Default for Dri2Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for Dri2Backend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn init(&mut self, server: &DisplayServer, options: &BackendOptions) -> Result<()> {
        self.max_size = options.get_u32("max_size", 8192)?;
        self.server = Some(server.clone());
        info!("dri2 backend initialized (max size {})", self.max_size);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.server = None;
    }

    fn alloc(&mut self, width: u32, height: u32, format: Format, _flags: u32) -> Result<BufferData> {
        check_size(width, height, self.max_size)?;
        let bo = self.server()?.bo_alloc(width, height, format)?;
        Ok(Box::new(Dri2Buffer {
            bo,
            width,
            height,
            format,
            pixmap: None,
            owns_pixmap: true,
        }))
    }

    fn alloc_from_native(
        &mut self,
        native: &Native,
        _flags: u32,
    ) -> Result<(BufferData, u32, u32, Format)> {
        let Native::Pixmap(pixmap) = native else {
            return Err(Error::ImportFailed("dri2 can only wrap pixmaps".into()));
        };
        let server = self.server()?;
        let info = server
            .pixmap_info(*pixmap)
            .ok_or_else(|| Error::ImportFailed(format!("pixmap 0x{:x} not found", pixmap)))?;
        let bo = info
            .bo
            .ok_or_else(|| Error::ImportFailed(format!("pixmap 0x{:x} has no buffer object", pixmap)))?;
        server.bo_ref(bo)?;

        let data = Dri2Buffer {
            bo,
            width: info.width,
            height: info.height,
            format: info.format,
            pixmap: Some(*pixmap),
            owns_pixmap: false,
        };
        Ok((Box::new(data), info.width, info.height, info.format))
    }

    fn free(&mut self, data: BufferData) {
        let Ok(buffer) = data.downcast::<Dri2Buffer>() else {
            return;
        };
        let Some(server) = self.server.as_ref() else {
            return;
        };
        if let (true, Some(pixmap)) = (buffer.owns_pixmap, buffer.pixmap) {
            server.pixmap_destroy(pixmap);
        }
        server.bo_unref(buffer.bo);
    }

    fn export(&mut self, data: &mut BufferData) -> Result<Export> {
        let server = self.server()?.clone();
        let buffer = downcast_mut::<Dri2Buffer>(data, NAME)?;
        if buffer.format.plane_count() > 1 {
            return Err(Error::ExportUnsupported(format!(
                "dri2 exports single-plane formats only, got {}",
                buffer.format
            )));
        }

        // First export binds a pixmap to the bo; later exports reuse it
        let pixmap = match buffer.pixmap {
            Some(p) => p,
            None => {
                let p = server.pixmap_from_bo(buffer.bo)?;
                debug!("dri2: created pixmap 0x{:x} for bo {}", p, buffer.bo);
                buffer.pixmap = Some(p);
                buffer.owns_pixmap = true;
                p
            }
        };
        Ok(Export::Id(pixmap))
    }

    fn import(
        &mut self,
        width: u32,
        height: u32,
        format: Format,
        export: Export,
        _flags: u32,
    ) -> Result<BufferData> {
        let Export::Id(pixmap) = export else {
            return Err(Error::ImportFailed("dri2 imports pixmap IDs only".into()));
        };
        check_size(width, height, self.max_size)?;
        let server = self.server()?;
        let info = server
            .pixmap_info(pixmap)
            .ok_or_else(|| Error::ImportFailed(format!("pixmap 0x{:x} not found", pixmap)))?;
        if info.width != width || info.height != height {
            return Err(Error::GeometryMismatch(format!(
                "declared {}x{}, pixmap 0x{:x} is {}x{}",
                width, height, pixmap, info.width, info.height
            )));
        }
        if info.format != format {
            return Err(Error::ImportFailed(format!(
                "declared format {}, pixmap is {}",
                format, info.format
            )));
        }
        let bo = info
            .bo
            .ok_or_else(|| Error::ImportFailed(format!("pixmap 0x{:x} has no buffer object", pixmap)))?;
        server.bo_ref(bo)?;

        Ok(Box::new(Dri2Buffer {
            bo,
            width,
            height,
            format,
            pixmap: Some(pixmap),
            owns_pixmap: false,
        }))
    }

    fn native_handle(&self, data: &BufferData) -> Option<Native> {
        let buffer = downcast::<Dri2Buffer>(data, NAME).ok()?;
        buffer.pixmap.map(Native::Pixmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(server: &DisplayServer) -> Dri2Backend {
        let mut b = Dri2Backend::new();
        b.init(server, &BackendOptions::default()).unwrap();
        b
    }

    #[test]
    fn test_export_creates_pixmap_once() {
        let server = DisplayServer::new();
        let mut b = backend(&server);
        let mut data = b.alloc(64, 64, Format::Xrgb8888, 0).unwrap();

        let first = b.export(&mut data).unwrap();
        let second = b.export(&mut data).unwrap();
        match (first, second) {
            (Export::Id(a), Export::Id(b)) => assert_eq!(a, b),
            other => panic!("unexpected exports {:?}", other),
        }
        assert_eq!(server.pixmap_count(), 1);

        b.free(data);
        assert_eq!(server.pixmap_count(), 0);
        assert_eq!(server.bo_count(), 0);
    }

    #[test]
    fn test_multiplanar_export_rejected() {
        let server = DisplayServer::new();
        let mut b = backend(&server);
        let mut data = b.alloc(64, 64, Format::Nv12, 0).unwrap();
        assert!(matches!(b.export(&mut data), Err(Error::ExportUnsupported(_))));
    }

    #[test]
    fn test_import_checks_geometry() {
        let server = DisplayServer::new();
        let mut b = backend(&server);
        let mut data = b.alloc(64, 32, Format::Xrgb8888, 0).unwrap();
        let Export::Id(id) = b.export(&mut data).unwrap() else {
            panic!("dri2 must export an id");
        };

        let err = b.import(64, 64, Format::Xrgb8888, Export::Id(id), 0);
        assert!(matches!(err, Err(Error::GeometryMismatch(_))));

        let imported = b.import(64, 32, Format::Xrgb8888, Export::Id(id), 0).unwrap();
        // Freeing the importer must not destroy the exporter's pixmap
        b.free(imported);
        assert_eq!(server.pixmap_count(), 1);
    }

    #[test]
    fn test_wrapped_pixmap_not_destroyed() {
        let server = DisplayServer::new();
        let mut b = backend(&server);
        let bo = server.bo_alloc(10, 10, Format::Argb8888).unwrap();
        let pixmap = server.pixmap_from_bo(bo).unwrap();

        let (data, w, h, format) = b.alloc_from_native(&Native::Pixmap(pixmap), 0).unwrap();
        assert_eq!((w, h, format), (10, 10, Format::Argb8888));
        b.free(data);
        assert!(server.pixmap_info(pixmap).is_some());
    }
}
