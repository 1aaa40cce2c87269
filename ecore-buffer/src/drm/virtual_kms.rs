//! In-memory KMS device
//!
//! Behaves like a DRM card with hot-pluggable connectors, one CRTC per
//! connector and vblank-completed page flips. Flip completions queue up
//! until `handle_events` is called. Hooks let callers inject per-CRTC flip
//! failures, withhold completions, or deliver them a few at a time.

use super::kms::{ConnectorInfo, FlipEvent, FramebufferInfo, KmsDriver, ModeInfo};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECTOR_ID_BASE: u32 = 1;
const CRTC_ID_BASE: u32 = 10;
const FB_ID_BASE: u32 = 100;

/// Longest a `handle_events` call sleeps when nothing is ready
const IDLE_POLL: Duration = Duration::from_millis(1);

struct Connector {
    info: ConnectorInfo,
}

#[derive(Default)]
struct Crtc {
    id: u32,
    fb: Option<u32>,
    connector: Option<u32>,
    mode: Option<ModeInfo>,
    /// Framebuffer latched at the next vblank
    flip_target: Option<u32>,
    fail_flips: bool,
}

pub struct VirtualKms {
    connectors: Vec<Connector>,
    crtcs: Vec<Crtc>,
    framebuffers: HashMap<u32, FramebufferInfo>,
    fb_counter: u32,
    events: VecDeque<FlipEvent>,
    hold_events: bool,
    /// 0 delivers everything queued
    events_per_dispatch: usize,
    sequence: u32,
}

impl Default for VirtualKms {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualKms {
    /// A device with no connectors
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
            crtcs: Vec::new(),
            framebuffers: HashMap::new(),
            fb_counter: FB_ID_BASE,
            events: VecDeque::new(),
            hold_events: false,
            events_per_dispatch: 0,
            sequence: 0,
        }
    }

    /// A device with `count` connected displays of the same mode
    pub fn with_outputs(count: usize, width: u32, height: u32, refresh: u32) -> Self {
        let mut kms = Self::new();
        for _ in 0..count {
            kms.add_connector(width, height, refresh);
        }
        kms
    }

    /// Plug in a new display; returns its connector id
    pub fn add_connector(&mut self, width: u32, height: u32, refresh: u32) -> u32 {
        let index = self.connectors.len() as u32;
        let id = CONNECTOR_ID_BASE + index;
        let crtc = CRTC_ID_BASE + index;

        let mut mode = ModeInfo::new(width, height, refresh);
        mode.preferred = true;
        // Approximate physical size at ~96 DPI
        let width_mm = (width as f32 * 25.4 / 96.0) as u32;
        let height_mm = (height as f32 * 25.4 / 96.0) as u32;

        self.connectors.push(Connector {
            info: ConnectorInfo {
                id,
                name: format!("Virtual-{}", index + 1),
                connected: true,
                width_mm,
                height_mm,
                modes: vec![mode],
                crtcs: vec![crtc],
            },
        });
        self.crtcs.push(Crtc {
            id: crtc,
            ..Default::default()
        });
        info!("Virtual connector {} ({}x{}@{}) on CRTC {}", id, width, height, refresh, crtc);
        id
    }

    pub fn set_connected(&mut self, connector: u32, connected: bool) -> Result<()> {
        let conn = self
            .connectors
            .iter_mut()
            .find(|c| c.info.id == connector)
            .ok_or_else(|| Error::Drm(format!("Connector {} not found", connector)))?;
        conn.info.connected = connected;
        debug!("Connector {} connected={}", connector, connected);
        Ok(())
    }

    /// Make every page flip on `crtc` fail until cleared
    pub fn fail_flips(&mut self, crtc: u32, fail: bool) -> Result<()> {
        self.crtc_mut(crtc)?.fail_flips = fail;
        Ok(())
    }

    /// Stop delivering completions (a stuck driver)
    pub fn hold_events(&mut self, hold: bool) {
        self.hold_events = hold;
    }

    pub fn set_events_per_dispatch(&mut self, count: usize) {
        self.events_per_dispatch = count;
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Framebuffer the CRTC is scanning out
    pub fn scanout(&self, crtc: u32) -> Option<u32> {
        self.crtcs.iter().find(|c| c.id == crtc).and_then(|c| c.fb)
    }

    pub fn crtc_for(&self, connector: u32) -> Option<u32> {
        self.crtcs
            .iter()
            .find(|c| c.connector == Some(connector))
            .map(|c| c.id)
    }

    pub fn get_framebuffer(&self, fb_id: u32) -> Option<FramebufferInfo> {
        self.framebuffers.get(&fb_id).cloned()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    fn crtc_mut(&mut self, crtc: u32) -> Result<&mut Crtc> {
        self.crtcs
            .iter_mut()
            .find(|c| c.id == crtc)
            .ok_or_else(|| Error::Drm(format!("CRTC {} not found", crtc)))
    }
}

impl KmsDriver for VirtualKms {
    fn connectors(&mut self) -> Result<Vec<ConnectorInfo>> {
        Ok(self.connectors.iter().map(|c| c.info.clone()).collect())
    }

    fn add_framebuffer(&mut self, info: &FramebufferInfo) -> Result<u32> {
        if info.width == 0 || info.height == 0 || info.pitch < info.width * info.bpp / 8 {
            return Err(Error::Drm(format!(
                "Bad framebuffer {}x{} pitch {}",
                info.width, info.height, info.pitch
            )));
        }
        let fb_id = self.fb_counter;
        self.fb_counter += 1;
        let fb_info = FramebufferInfo {
            id: fb_id,
            ..info.clone()
        };

        debug!(
            "Created framebuffer {}: {}x{} format=0x{:08x}",
            fb_id, info.width, info.height, info.format
        );
        self.framebuffers.insert(fb_id, fb_info);
        Ok(fb_id)
    }

    fn remove_framebuffer(&mut self, fb_id: u32) -> Result<()> {
        if self.framebuffers.remove(&fb_id).is_none() {
            return Err(Error::Drm(format!("Framebuffer {} not found", fb_id)));
        }
        for crtc in self.crtcs.iter_mut().filter(|c| c.fb == Some(fb_id)) {
            warn!("Framebuffer {} removed while scanned out on CRTC {}", fb_id, crtc.id);
            crtc.fb = None;
        }
        debug!("Removed framebuffer {}", fb_id);
        Ok(())
    }

    fn set_crtc(
        &mut self,
        crtc_id: u32,
        fb_id: Option<u32>,
        connector_id: u32,
        mode: &ModeInfo,
    ) -> Result<()> {
        if let Some(fb) = fb_id {
            if !self.framebuffers.contains_key(&fb) {
                return Err(Error::Drm(format!("Framebuffer {} not found", fb)));
            }
        }
        let crtc = self.crtc_mut(crtc_id)?;
        crtc.fb = fb_id;
        match fb_id {
            Some(_) => {
                crtc.connector = Some(connector_id);
                crtc.mode = Some(mode.clone());
            }
            None => {
                crtc.connector = None;
                crtc.mode = None;
            }
        }
        debug!("Set CRTC {} -> FB {:?} ({})", crtc_id, fb_id, mode.name);
        Ok(())
    }

    fn page_flip(&mut self, crtc_id: u32, fb_id: u32, user_data: u64) -> Result<()> {
        if !self.framebuffers.contains_key(&fb_id) {
            return Err(Error::Drm(format!("Framebuffer {} not found", fb_id)));
        }
        let crtc = self.crtc_mut(crtc_id)?;
        if crtc.mode.is_none() {
            return Err(Error::Drm(format!("CRTC {} is not active", crtc_id)));
        }
        if crtc.fail_flips {
            return Err(Error::Drm(format!("Page flip on CRTC {} failed", crtc_id)));
        }
        if crtc.flip_target.is_some() {
            return Err(Error::FbBusy);
        }
        crtc.flip_target = Some(fb_id);
        self.events.push_back(FlipEvent {
            crtc: crtc_id,
            sequence: 0,
            user_data,
        });
        debug!("Page flip to FB {} on CRTC {}", fb_id, crtc_id);
        Ok(())
    }

    fn handle_events(&mut self, timeout: Option<Duration>) -> Result<Vec<FlipEvent>> {
        if self.hold_events || self.events.is_empty() {
            let nap = timeout.map_or(IDLE_POLL, |t| t.min(IDLE_POLL));
            std::thread::sleep(nap);
            return Ok(Vec::new());
        }
        let count = match self.events_per_dispatch {
            0 => self.events.len(),
            n => n.min(self.events.len()),
        };

        let mut delivered = Vec::with_capacity(count);
        let ready: Vec<FlipEvent> = self.events.drain(..count).collect();
        for mut event in ready {
            self.sequence += 1;
            event.sequence = self.sequence;
            if let Ok(crtc) = self.crtc_mut(event.crtc) {
                if let Some(fb) = crtc.flip_target.take() {
                    crtc.fb = Some(fb);
                }
            }
            delivered.push(event);
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    fn fb_info(width: u32, height: u32) -> FramebufferInfo {
        FramebufferInfo {
            id: 0,
            width,
            height,
            pitch: width * 4,
            bpp: 32,
            depth: 24,
            format: Format::Xrgb8888.code(),
            handle: 1,
        }
    }

    #[test]
    fn test_object_ids() {
        let mut kms = VirtualKms::with_outputs(2, 640, 480, 60);
        let connectors = kms.connectors().unwrap();
        assert_eq!(connectors.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(connectors[1].crtcs, vec![11]);
        assert_eq!(kms.add_framebuffer(&fb_info(640, 480)).unwrap(), 100);
        assert_eq!(kms.add_framebuffer(&fb_info(640, 480)).unwrap(), 101);
    }

    #[test]
    fn test_flip_completes_on_dispatch() {
        let mut kms = VirtualKms::with_outputs(1, 640, 480, 60);
        let a = kms.add_framebuffer(&fb_info(640, 480)).unwrap();
        let b = kms.add_framebuffer(&fb_info(640, 480)).unwrap();
        let mode = ModeInfo::new(640, 480, 60);

        assert!(kms.page_flip(10, a, 1).is_err());
        kms.set_crtc(10, Some(a), 1, &mode).unwrap();
        kms.page_flip(10, b, 7).unwrap();
        assert!(matches!(kms.page_flip(10, b, 8), Err(Error::FbBusy)));
        assert_eq!(kms.scanout(10), Some(a));

        let events = kms.handle_events(Some(Duration::ZERO)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_data, 7);
        assert_eq!(kms.scanout(10), Some(b));
    }

    #[test]
    fn test_held_and_failed_flips() {
        let mut kms = VirtualKms::with_outputs(2, 640, 480, 60);
        let fb = kms.add_framebuffer(&fb_info(640, 480)).unwrap();
        let mode = ModeInfo::new(640, 480, 60);
        kms.set_crtc(10, Some(fb), 1, &mode).unwrap();
        kms.set_crtc(11, Some(fb), 2, &mode).unwrap();

        kms.fail_flips(11, true).unwrap();
        assert!(kms.page_flip(11, fb, 1).is_err());

        kms.hold_events(true);
        kms.page_flip(10, fb, 1).unwrap();
        assert!(kms.handle_events(Some(Duration::ZERO)).unwrap().is_empty());
        kms.hold_events(false);
        assert_eq!(kms.handle_events(None).unwrap().len(), 1);
    }

    #[test]
    fn test_events_per_dispatch() {
        let mut kms = VirtualKms::with_outputs(3, 320, 240, 60);
        let fb = kms.add_framebuffer(&fb_info(320, 240)).unwrap();
        let mode = ModeInfo::new(320, 240, 60);
        for (i, crtc) in [10, 11, 12].into_iter().enumerate() {
            kms.set_crtc(crtc, Some(fb), i as u32 + 1, &mode).unwrap();
            kms.page_flip(crtc, fb, 3).unwrap();
        }
        kms.set_events_per_dispatch(2);
        assert_eq!(kms.handle_events(None).unwrap().len(), 2);
        assert_eq!(kms.pending_events(), 1);
        assert_eq!(kms.handle_events(None).unwrap().len(), 1);
    }

    #[test]
    fn test_hotplug_toggle() {
        let mut kms = VirtualKms::new();
        assert!(kms.connectors().unwrap().is_empty());
        let id = kms.add_connector(1280, 720, 60);
        kms.set_connected(id, false).unwrap();
        assert!(!kms.connectors().unwrap()[0].connected);
        assert!(kms.set_connected(99, true).is_err());
    }
}
