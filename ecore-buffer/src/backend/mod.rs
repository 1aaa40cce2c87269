//! Pluggable buffer allocators
//!
//! A backend is the capability table a buffer delegates to: allocation,
//! wrapping of native surfaces, cross-process export/import and teardown.
//! The registry picks one by name when a buffer is created.
//!
//! Built-in backends:
//! - `dri2`: display-server buffer objects, exported as pixmap IDs
//! - `dri3`: memfd-backed memory, exported as file descriptors
//! - `shm`: software memfd backend, exported as file descriptors, multi-planar

#[cfg(feature = "dri2")]
pub mod dri2;
#[cfg(feature = "dri3")]
pub mod dri3;
mod memfd;
pub mod shm;

use crate::format::Format;
use crate::server::DisplayServer;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::os::fd::OwnedFd;

/// Backend-private per-buffer state
pub type BufferData = Box<dyn Any>;

/// How a buffer is identified across process boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Invalid,
    Id,
    Fd,
}

/// A cross-process buffer identity produced by `Backend::export`
#[derive(Debug)]
pub enum Export {
    /// Opaque handle meaningful on the same display-server connection
    Id(u32),
    /// Duplicated file descriptor referencing the buffer memory
    Fd(OwnedFd),
}

impl Export {
    pub fn kind(&self) -> ExportKind {
        match self {
            Export::Id(_) => ExportKind::Id,
            Export::Fd(_) => ExportKind::Fd,
        }
    }
}

/// A platform surface that already exists outside this crate
#[derive(Debug)]
pub enum Native {
    /// Display-server pixmap
    Pixmap(u32),
    /// Shareable memory with its geometry
    Memory {
        fd: OwnedFd,
        width: u32,
        height: u32,
        format: Format,
    },
}

/// Free-form `key = value` options handed to `Backend::init`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendOptions(pub HashMap<String, String>);

impl BackendOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse a numeric option, falling back to `default` when absent
    pub fn get_u32(&self, key: &str, default: u32) -> Result<u32> {
        match self.get(key) {
            Some(v) => v
                .parse()
                .map_err(|_| Error::BackendUnavailable(format!("bad option {}={}", key, v))),
            None => Ok(default),
        }
    }
}

/// Capability table every backend implements
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Called once when the owning context initialises
    fn init(&mut self, server: &DisplayServer, options: &BackendOptions) -> Result<()>;

    fn shutdown(&mut self);

    fn alloc(&mut self, width: u32, height: u32, format: Format, flags: u32) -> Result<BufferData>;

    /// Wrap an existing native surface; returns its data and geometry
    fn alloc_from_native(
        &mut self,
        native: &Native,
        flags: u32,
    ) -> Result<(BufferData, u32, u32, Format)>;

    fn free(&mut self, data: BufferData);

    fn export(&mut self, data: &mut BufferData) -> Result<Export>;

    fn import(
        &mut self,
        width: u32,
        height: u32,
        format: Format,
        export: Export,
        flags: u32,
    ) -> Result<BufferData>;

    fn native_handle(&self, data: &BufferData) -> Option<Native>;
}

/// Instances of every backend compiled into this crate
pub fn builtin() -> Vec<Box<dyn Backend>> {
    let mut backends: Vec<Box<dyn Backend>> = Vec::new();
    #[cfg(feature = "dri2")]
    backends.push(Box::new(dri2::Dri2Backend::new()));
    #[cfg(feature = "dri3")]
    backends.push(Box::new(dri3::Dri3Backend::new()));
    backends.push(Box::new(shm::ShmBackend::new()));
    backends
}

pub(crate) fn downcast<'a, T: 'static>(data: &'a BufferData, backend: &str) -> Result<&'a T> {
    data.downcast_ref::<T>()
        .ok_or_else(|| Error::Protocol(format!("buffer does not belong to backend {}", backend)))
}

pub(crate) fn downcast_mut<'a, T: 'static>(
    data: &'a mut BufferData,
    backend: &str,
) -> Result<&'a mut T> {
    data.downcast_mut::<T>()
        .ok_or_else(|| Error::Protocol(format!("buffer does not belong to backend {}", backend)))
}

/// Reject zero sizes and anything above the backend's limit
pub(crate) fn check_size(width: u32, height: u32, max: u32) -> Result<()> {
    if width == 0 || height == 0 || width > max || height > max {
        return Err(Error::InvalidSize(width, height));
    }
    Ok(())
}
