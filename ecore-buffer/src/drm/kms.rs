//! Kernel mode-setting driver interface
//!
//! The subset of DRM/KMS the output sink needs: connector enumeration,
//! framebuffer objects, CRTC mode-set and page flips with a completion
//! event carrying caller data.
//!
//! # Object IDs
//! - Connectors: 1+
//! - CRTCs: 10+
//! - Framebuffers: 100+

use crate::Result;
use std::time::Duration;

/// Display timing (matching the kernel's drm_mode_modeinfo)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub preferred: bool,
    pub name: String,
}

impl ModeInfo {
    /// Build a mode with synthetic blanking intervals
    pub fn new(width: u32, height: u32, refresh: u32) -> Self {
        let hdisplay = width as u16;
        let vdisplay = height as u16;
        let htotal = hdisplay.saturating_add(200);
        let vtotal = vdisplay.saturating_add(50);
        let clock = (htotal as u32 * vtotal as u32 * refresh) / 1000;

        ModeInfo {
            clock,
            hdisplay,
            hsync_start: hdisplay.saturating_add(50),
            hsync_end: hdisplay.saturating_add(100),
            htotal,
            vdisplay,
            vsync_start: vdisplay.saturating_add(10),
            vsync_end: vdisplay.saturating_add(20),
            vtotal,
            vrefresh: refresh,
            flags: 0,
            preferred: false,
            name: format!("{}x{}@{}", hdisplay, vdisplay, refresh),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.hdisplay as u32, self.vdisplay as u32)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: u32,
    pub name: String,
    pub connected: bool,
    pub width_mm: u32,
    pub height_mm: u32,
    pub modes: Vec<ModeInfo>,
    /// CRTCs this connector can be driven by
    pub crtcs: Vec<u32>,
}

impl ConnectorInfo {
    /// Preferred mode, else the first one listed
    pub fn preferred_mode(&self) -> Option<&ModeInfo> {
        self.modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| self.modes.first())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub format: u32,
    pub handle: u32,
}

/// Page-flip completion reported by `handle_events`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc: u32,
    pub sequence: u32,
    /// Value passed to `page_flip`
    pub user_data: u64,
}

pub trait KmsDriver {
    fn connectors(&mut self) -> Result<Vec<ConnectorInfo>>;

    fn add_framebuffer(&mut self, info: &FramebufferInfo) -> Result<u32>;

    fn remove_framebuffer(&mut self, fb_id: u32) -> Result<()>;

    /// Mode-set a CRTC; `None` turns it off
    fn set_crtc(
        &mut self,
        crtc_id: u32,
        fb_id: Option<u32>,
        connector_id: u32,
        mode: &ModeInfo,
    ) -> Result<()>;

    /// Queue a flip to `fb_id` at the next vblank
    fn page_flip(&mut self, crtc_id: u32, fb_id: u32, user_data: u64) -> Result<()>;

    /// Wait up to `timeout` (forever when `None`) and return completed flips
    fn handle_events(&mut self, timeout: Option<Duration>) -> Result<Vec<FlipEvent>>;
}
