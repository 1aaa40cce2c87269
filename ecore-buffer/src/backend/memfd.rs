//! memfd-backed buffer memory shared by the fd-exporting backends

use crate::format::Format;
use crate::{Error, Result};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Buffer memory living in an anonymous memfd
#[derive(Debug)]
pub(crate) struct MemBuffer {
    pub fd: OwnedFd,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub stride: u32,
    pub size: u64,
}

impl MemBuffer {
    pub fn alloc(name: &str, width: u32, height: u32, format: Format) -> Result<Self> {
        let layout = format.layout(width, height)?;
        let fd = memfd_create(name, layout.size)
            .map_err(|e| Error::AllocationFailed(format!("memfd: {}", e)))?;
        Ok(Self {
            fd,
            width,
            height,
            format,
            stride: layout.planes[0].stride,
            size: layout.size,
        })
    }

    /// Adopt memory from another process; its length must match the layout exactly
    pub fn adopt(fd: OwnedFd, width: u32, height: u32, format: Format) -> Result<Self> {
        let layout = format.layout(width, height)?;
        let actual = fd_size(fd.as_fd())?;
        if actual != layout.size {
            return Err(Error::GeometryMismatch(format!(
                "{}x{} {} needs {} bytes, fd holds {}",
                width, height, format, layout.size, actual
            )));
        }
        Ok(Self {
            fd,
            width,
            height,
            format,
            stride: layout.planes[0].stride,
            size: layout.size,
        })
    }

    pub fn dup(&self) -> Result<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }
}

fn memfd_create(name: &str, size: u64) -> Result<OwnedFd> {
    let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
    // SAFETY: cname is a valid NUL-terminated string for the duration of the call
    let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: memfd_create just returned this fd and nothing else owns it
    let file = unsafe { File::from_raw_fd(raw) };
    file.set_len(size)?;
    Ok(OwnedFd::from(file))
}

pub(crate) fn fd_size(fd: BorrowedFd<'_>) -> Result<u64> {
    // SAFETY: stat is plain old data, zeroed is a valid initial value
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is a live descriptor borrowed for this call, st is writable
    let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(st.st_size as u64)
}
