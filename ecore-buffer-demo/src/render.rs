//! Test pattern renderer
//!
//! Draws scrolling color bars straight into fd-backed buffer memory.
//! Pixmap-backed buffers live in the display server and are left alone.

use std::fs::File;
use std::os::unix::fs::FileExt;

use anyhow::Result;
use ecore_buffer::{BufferHandle, Native, SharedContext};
use tracing::debug;

const BARS: [u32; 8] = [
    0xFFFFFFFF, 0xFFFFFF00, 0xFF00FFFF, 0xFF00FF00, 0xFFFF00FF, 0xFFFF0000, 0xFF0000FF, 0xFF000000,
];

/// One row of the pattern, shifted left by `frame` pixels
fn pattern_row(width: u32, stride: u32, frame: u64) -> Vec<u8> {
    let mut row = vec![0u8; stride as usize];
    let bar_width = (width / BARS.len() as u32).max(1) as u64;
    for x in 0..width as u64 {
        let bar = ((x + frame) / bar_width) as usize % BARS.len();
        let offset = x as usize * 4;
        row[offset..offset + 4].copy_from_slice(&BARS[bar].to_le_bytes());
    }
    row
}

/// Fill `buffer` with frame `frame` of the pattern
///
/// Returns `false` when the buffer's memory is not reachable from here.
pub fn draw(ctx: &SharedContext, buffer: BufferHandle, frame: u64) -> Result<bool> {
    let Some(Native::Memory { fd, width, height, format }) = ctx.buffer_native_handle(buffer) else {
        return Ok(false);
    };
    if format.plane_count() != 1 || format.bpp() != 32 {
        debug!("Not drawing into {} buffer", format);
        return Ok(false);
    }
    let layout = format.layout(width, height)?;
    let stride = layout.planes[0].stride;
    let row = pattern_row(width, stride, frame);

    let file = File::from(fd);
    for y in 0..height as u64 {
        file.write_all_at(&row, y * stride as u64)?;
    }
    Ok(true)
}
