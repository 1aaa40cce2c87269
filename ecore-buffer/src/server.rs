//! Display-server connection used by ID-exporting backends
//!
//! ID exports (pixmap names) are only meaningful to processes sharing the
//! same display-server connection. This module keeps that server-side state
//! in process: buffer objects, and pixmaps bound either to a buffer object
//! or to fd-backed memory. Every `SharedContext` created from the same
//! `DisplayServer` handle sees the same names.

use crate::format::Format;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;
use tracing::debug;

/// Object IDs
const BO_ID_BASE: u32 = 1;
const PIXMAP_ID_BASE: u32 = 0x0020_0001;

/// Geometry of a server-side buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: Format,
}

/// Geometry of a pixmap plus the buffer object backing it (if any)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixmapInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: Format,
    pub bo: Option<u32>,
}

struct Bo {
    info: BoInfo,
    refs: u32,
}

enum Storage {
    Bo(u32),
    // Kept open so the memory outlives the exporting client
    Fd(#[allow(dead_code)] OwnedFd),
}

struct Pixmap {
    width: u32,
    height: u32,
    stride: u32,
    format: Format,
    storage: Storage,
}

#[derive(Default)]
struct ServerState {
    bos: HashMap<u32, Bo>,
    pixmaps: HashMap<u32, Pixmap>,
    next_bo: u32,
    next_pixmap: u32,
}

/// Cloneable handle to the display-server connection
#[derive(Clone, Default)]
pub struct DisplayServer {
    state: Rc<RefCell<ServerState>>,
}

impl DisplayServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a buffer object; the caller holds the first reference
    pub fn bo_alloc(&self, width: u32, height: u32, format: Format) -> Result<u32> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidSize(width, height));
        }
        let stride = format.layout(width, height)?.planes[0].stride;
        let mut state = self.state.borrow_mut();
        let id = BO_ID_BASE + state.next_bo;
        state.next_bo += 1;
        state.bos.insert(
            id,
            Bo {
                info: BoInfo { width, height, stride, format },
                refs: 1,
            },
        );
        debug!("Server bo {} allocated: {}x{} {}", id, width, height, format);
        Ok(id)
    }

    pub fn bo_info(&self, bo: u32) -> Option<BoInfo> {
        self.state.borrow().bos.get(&bo).map(|b| b.info)
    }

    pub fn bo_ref(&self, bo: u32) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let entry = state
            .bos
            .get_mut(&bo)
            .ok_or_else(|| Error::Drm(format!("buffer object {} not found", bo)))?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop one reference; the object is destroyed at zero
    pub fn bo_unref(&self, bo: u32) {
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.bos.get_mut(&bo) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            state.bos.remove(&bo);
            debug!("Server bo {} destroyed", bo);
        }
    }

    /// Create a pixmap sharing the memory of `bo`
    pub fn pixmap_from_bo(&self, bo: u32) -> Result<u32> {
        let info = self
            .bo_info(bo)
            .ok_or_else(|| Error::Drm(format!("buffer object {} not found", bo)))?;
        self.bo_ref(bo)?;
        Ok(self.insert_pixmap(Pixmap {
            width: info.width,
            height: info.height,
            stride: info.stride,
            format: info.format,
            storage: Storage::Bo(bo),
        }))
    }

    /// Create a pixmap from fd-backed memory (the server keeps its own fd)
    pub fn pixmap_from_fd(
        &self,
        fd: OwnedFd,
        width: u32,
        height: u32,
        stride: u32,
        format: Format,
    ) -> u32 {
        self.insert_pixmap(Pixmap {
            width,
            height,
            stride,
            format,
            storage: Storage::Fd(fd),
        })
    }

    fn insert_pixmap(&self, pixmap: Pixmap) -> u32 {
        let mut state = self.state.borrow_mut();
        let id = PIXMAP_ID_BASE + state.next_pixmap;
        state.next_pixmap += 1;
        debug!("Server pixmap 0x{:x}: {}x{}", id, pixmap.width, pixmap.height);
        state.pixmaps.insert(id, pixmap);
        id
    }

    pub fn pixmap_info(&self, pixmap: u32) -> Option<PixmapInfo> {
        self.state.borrow().pixmaps.get(&pixmap).map(|p| PixmapInfo {
            width: p.width,
            height: p.height,
            stride: p.stride,
            format: p.format,
            bo: match p.storage {
                Storage::Bo(bo) => Some(bo),
                Storage::Fd(_) => None,
            },
        })
    }

    /// Find the pixmap whose memory is the file behind `fd`
    pub fn pixmap_for_fd(&self, fd: BorrowedFd<'_>) -> Option<(u32, PixmapInfo)> {
        let wanted = file_identity(fd)?;
        let id = self
            .state
            .borrow()
            .pixmaps
            .iter()
            .find(|(_, p)| match &p.storage {
                Storage::Fd(own) => file_identity(own.as_fd()) == Some(wanted),
                Storage::Bo(_) => false,
            })
            .map(|(id, _)| *id)?;
        Some((id, self.pixmap_info(id)?))
    }

    pub fn pixmap_destroy(&self, pixmap: u32) {
        let removed = self.state.borrow_mut().pixmaps.remove(&pixmap);
        if let Some(Pixmap { storage: Storage::Bo(bo), .. }) = removed {
            self.bo_unref(bo);
        }
        debug!("Server pixmap 0x{:x} destroyed", pixmap);
    }

    pub fn pixmap_count(&self) -> usize {
        self.state.borrow().pixmaps.len()
    }

    pub fn bo_count(&self) -> usize {
        self.state.borrow().bos.len()
    }
}

/// Device and inode of the file behind `fd`; dups share it
fn file_identity(fd: BorrowedFd<'_>) -> Option<(u64, u64)> {
    // SAFETY: stat is plain old data, zeroed is a valid initial value
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is a live descriptor borrowed for this call, st is writable
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } < 0 {
        return None;
    }
    Some((st.st_dev as u64, st.st_ino as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixmap_keeps_bo_alive() {
        let server = DisplayServer::new();
        let bo = server.bo_alloc(32, 16, Format::Argb8888).unwrap();
        let pixmap = server.pixmap_from_bo(bo).unwrap();

        server.bo_unref(bo);
        assert_eq!(server.bo_count(), 1);
        assert_eq!(server.pixmap_info(pixmap).unwrap().bo, Some(bo));

        server.pixmap_destroy(pixmap);
        assert_eq!(server.bo_count(), 0);
        assert_eq!(server.pixmap_count(), 0);
    }

    #[test]
    fn test_zero_size_bo_rejected() {
        let server = DisplayServer::new();
        assert!(matches!(
            server.bo_alloc(0, 16, Format::Argb8888),
            Err(Error::InvalidSize(0, 16))
        ));
    }
}
