//! Display outputs
//!
//! One output per connected connector. Outputs found at startup are laid
//! out left to right; hotplugged ones are appended to the right of the last
//! known output and marked cloned, since nobody chose where they go.

use super::device::FbHandle;
use super::kms::{ConnectorInfo, ModeInfo};

/// Connector id of the output; 0 is the fabricated fallback output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

impl OutputId {
    pub const FAKE: OutputId = OutputId(0);
}

/// Resolution used when no display is found
pub const FAKE_OUTPUT_SIZE: (u32, u32) = (1920, 1080);

#[derive(Debug, Clone)]
pub struct Output {
    pub(crate) id: OutputId,
    pub(crate) name: String,
    /// `None` for the fake output, which has no hardware behind it
    pub(crate) crtc: Option<u32>,
    pub(crate) mode: ModeInfo,
    pub(crate) x: i32,
    pub(crate) y: i32,
    pub(crate) width_mm: u32,
    pub(crate) height_mm: u32,
    pub(crate) enabled: bool,
    pub(crate) cloned: bool,
    /// Framebuffer this output is scanning out
    pub(crate) current: Option<FbHandle>,
    /// A flip on this output has not completed yet
    pub(crate) pending_flip: bool,
    pub(crate) destroy_requested: bool,
}

impl Output {
    pub(crate) fn from_connector(
        connector: &ConnectorInfo,
        crtc: u32,
        x: i32,
        cloned: bool,
    ) -> Option<Output> {
        let mode = connector.preferred_mode()?.clone();
        Some(Output {
            id: OutputId(connector.id),
            name: connector.name.clone(),
            crtc: Some(crtc),
            mode,
            x,
            y: 0,
            width_mm: connector.width_mm,
            height_mm: connector.height_mm,
            enabled: true,
            cloned,
            current: None,
            pending_flip: false,
            destroy_requested: false,
        })
    }

    pub(crate) fn fake() -> Output {
        let (width, height) = FAKE_OUTPUT_SIZE;
        Output {
            id: OutputId::FAKE,
            name: "Fake-1".to_string(),
            crtc: None,
            mode: ModeInfo::new(width, height, 60),
            x: 0,
            y: 0,
            width_mm: 0,
            height_mm: 0,
            enabled: true,
            cloned: false,
            current: None,
            pending_flip: false,
            destroy_requested: false,
        }
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crtc(&self) -> Option<u32> {
        self.crtc
    }

    pub fn mode(&self) -> &ModeInfo {
        &self.mode
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn size(&self) -> (u32, u32) {
        self.mode.size()
    }

    pub fn physical_size(&self) -> (u32, u32) {
        (self.width_mm, self.height_mm)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_cloned(&self) -> bool {
        self.cloned
    }

    pub fn is_fake(&self) -> bool {
        self.crtc.is_none()
    }

    pub fn current(&self) -> Option<FbHandle> {
        self.current
    }

    pub fn pending_flip(&self) -> bool {
        self.pending_flip
    }

    /// X coordinate just past this output's right edge
    pub(crate) fn right_edge(&self) -> i32 {
        self.x + self.mode.size().0 as i32
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (w, h) = self.size();
        x >= self.x && x < self.x + w as i32 && y >= self.y && y < self.y + h as i32
    }
}
