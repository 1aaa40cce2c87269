//! DRM fourcc pixel formats and their plane layout table
//!
//! Codes are bit-exact with the kernel's `drm_fourcc.h` so they can be handed
//! straight to a KMS driver.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Build a fourcc code from four ASCII bytes (little-endian packing)
pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// Pixel format identified by its fourcc code
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Format {
    C8 = fourcc(b'C', b'8', b' ', b' '),
    Rgb565 = fourcc(b'R', b'G', b'1', b'6'),
    Bgr565 = fourcc(b'B', b'G', b'1', b'6'),
    Xrgb8888 = fourcc(b'X', b'R', b'2', b'4'),
    Xbgr8888 = fourcc(b'X', b'B', b'2', b'4'),
    Argb8888 = fourcc(b'A', b'R', b'2', b'4'),
    Abgr8888 = fourcc(b'A', b'B', b'2', b'4'),
    Rgbx8888 = fourcc(b'R', b'X', b'2', b'4'),
    Rgba8888 = fourcc(b'R', b'A', b'2', b'4'),
    Xrgb2101010 = fourcc(b'X', b'R', b'3', b'0'),
    Argb2101010 = fourcc(b'A', b'R', b'3', b'0'),
    Yuyv = fourcc(b'Y', b'U', b'Y', b'V'),
    Uyvy = fourcc(b'U', b'Y', b'V', b'Y'),
    Nv12 = fourcc(b'N', b'V', b'1', b'2'),
    Nv21 = fourcc(b'N', b'V', b'2', b'1'),
    Nv16 = fourcc(b'N', b'V', b'1', b'6'),
    Yuv420 = fourcc(b'Y', b'U', b'1', b'2'),
    Yvu420 = fourcc(b'Y', b'V', b'1', b'2'),
    Yuv422 = fourcc(b'Y', b'U', b'1', b'6'),
}

/// Lookup-table entry describing how a format is laid out in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Number of memory planes
    pub planes: usize,
    /// Bytes per pixel for each plane (unused entries are 0)
    pub cpp: [u32; 3],
    /// Horizontal chroma subsampling factor
    pub hsub: u32,
    /// Vertical chroma subsampling factor
    pub vsub: u32,
    /// Color depth as reported to KMS (0 for YUV)
    pub depth: u32,
}

const fn packed(cpp: u32, depth: u32) -> FormatInfo {
    FormatInfo { planes: 1, cpp: [cpp, 0, 0], hsub: 1, vsub: 1, depth }
}

/// One plane of a computed layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u64,
    pub stride: u32,
    pub size: u64,
}

/// Memory layout of a `width x height` image in a given format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub planes: Vec<PlaneLayout>,
    pub size: u64,
}

impl Format {
    pub const ALL: [Format; 19] = [
        Format::C8,
        Format::Rgb565,
        Format::Bgr565,
        Format::Xrgb8888,
        Format::Xbgr8888,
        Format::Argb8888,
        Format::Abgr8888,
        Format::Rgbx8888,
        Format::Rgba8888,
        Format::Xrgb2101010,
        Format::Argb2101010,
        Format::Yuyv,
        Format::Uyvy,
        Format::Nv12,
        Format::Nv21,
        Format::Nv16,
        Format::Yuv420,
        Format::Yvu420,
        Format::Yuv422,
    ];

    /// Raw fourcc code
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_fourcc(code: u32) -> Option<Format> {
        Self::ALL.iter().copied().find(|f| f.code() == code)
    }

    pub fn info(self) -> FormatInfo {
        match self {
            Format::C8 => packed(1, 8),
            Format::Rgb565 | Format::Bgr565 => packed(2, 16),
            Format::Xrgb8888 | Format::Xbgr8888 | Format::Rgbx8888 => packed(4, 24),
            Format::Argb8888 | Format::Abgr8888 | Format::Rgba8888 => packed(4, 32),
            Format::Xrgb2101010 | Format::Argb2101010 => packed(4, 30),
            Format::Yuyv | Format::Uyvy => FormatInfo {
                planes: 1,
                cpp: [2, 0, 0],
                hsub: 2,
                vsub: 1,
                depth: 0,
            },
            Format::Nv12 | Format::Nv21 => FormatInfo {
                planes: 2,
                cpp: [1, 2, 0],
                hsub: 2,
                vsub: 2,
                depth: 0,
            },
            Format::Nv16 => FormatInfo {
                planes: 2,
                cpp: [1, 2, 0],
                hsub: 2,
                vsub: 1,
                depth: 0,
            },
            Format::Yuv420 | Format::Yvu420 => FormatInfo {
                planes: 3,
                cpp: [1, 1, 1],
                hsub: 2,
                vsub: 2,
                depth: 0,
            },
            Format::Yuv422 => FormatInfo {
                planes: 3,
                cpp: [1, 1, 1],
                hsub: 2,
                vsub: 1,
                depth: 0,
            },
        }
    }

    pub fn plane_count(self) -> usize {
        self.info().planes
    }

    /// Bits per pixel of the first plane
    pub fn bpp(self) -> u32 {
        self.info().cpp[0] * 8
    }

    /// Per-plane offsets and strides; rows are padded to 4 bytes
    ///
    /// Fails with `InvalidSize` when a stride or the total size overflows.
    pub fn layout(self, width: u32, height: u32) -> crate::Result<Layout> {
        let info = self.info();
        let mut planes = Vec::with_capacity(info.planes);
        let mut offset = 0u64;

        for (i, cpp) in info.cpp.iter().take(info.planes).enumerate() {
            let (w, h) = if i == 0 {
                (width, height)
            } else {
                (width.div_ceil(info.hsub), height.div_ceil(info.vsub))
            };
            let stride = w
                .checked_mul(*cpp)
                .and_then(|row| row.checked_next_multiple_of(4))
                .ok_or(Error::InvalidSize(width, height))?;
            let size = stride as u64 * h as u64;
            planes.push(PlaneLayout { offset, stride, size });
            offset = offset
                .checked_add(size)
                .ok_or(Error::InvalidSize(width, height))?;
        }

        Ok(Layout { planes, size: offset })
    }

    fn name(self) -> &'static str {
        match self {
            Format::C8 => "C8",
            Format::Rgb565 => "RGB565",
            Format::Bgr565 => "BGR565",
            Format::Xrgb8888 => "XRGB8888",
            Format::Xbgr8888 => "XBGR8888",
            Format::Argb8888 => "ARGB8888",
            Format::Abgr8888 => "ABGR8888",
            Format::Rgbx8888 => "RGBX8888",
            Format::Rgba8888 => "RGBA8888",
            Format::Xrgb2101010 => "XRGB2101010",
            Format::Argb2101010 => "ARGB2101010",
            Format::Yuyv => "YUYV",
            Format::Uyvy => "UYVY",
            Format::Nv12 => "NV12",
            Format::Nv21 => "NV21",
            Format::Nv16 => "NV16",
            Format::Yuv420 => "YUV420",
            Format::Yvu420 => "YVU420",
            Format::Yuv422 => "YUV422",
        }
    }

    /// The four-character code as a string, trailing spaces trimmed
    pub fn code_str(self) -> String {
        let bytes = self.code().to_le_bytes();
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = Error;

    /// Accepts either the long name ("XRGB8888") or the fourcc ("XR24")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if let Some(f) = Self::ALL.iter().copied().find(|f| f.name() == upper) {
            return Ok(f);
        }
        let bytes = upper.as_bytes();
        if !bytes.is_empty() && bytes.len() <= 4 {
            let mut code = [b' '; 4];
            code[..bytes.len()].copy_from_slice(bytes);
            if let Some(f) = Self::from_fourcc(u32::from_le_bytes(code)) {
                return Ok(f);
            }
        }
        Err(Error::UnknownFormat(s.to_string()))
    }
}

impl TryFrom<String> for Format {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Format> for String {
    fn from(format: Format) -> String {
        format.code_str()
    }
}
