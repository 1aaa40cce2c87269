//! Display device: outputs, framebuffers and page flips
//!
//! `Device` keeps a device-wide `current`/`next` framebuffer pair. A flip is
//! issued to every enabled, non-cloned output at once and counts down as
//! each CRTC reports completion; only the last completion promotes `next`
//! to `current` and runs the caller's callback. Framebuffers and outputs
//! with a flip outstanding are never freed on the spot: destruction is
//! recorded and carried out by the sweep that follows each completion.

use super::kms::{FlipEvent, FramebufferInfo, KmsDriver};
use super::output::{Output, OutputId};
use crate::arena::{Arena, Index};
use crate::buffer::Teardown;
use crate::format::Format;
use crate::{Error, Result};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Handle to a framebuffer owned by a [`Device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FbHandle(Index);

#[derive(Debug, Clone)]
pub struct Fb {
    id: u32,
    width: u32,
    height: u32,
    stride: u32,
    format: Format,
    handle: u32,
    pending_flip: bool,
    destroy_requested: bool,
}

impl Fb {
    /// KMS framebuffer object id
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn pending_flip(&self) -> bool {
        self.pending_flip
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
    /// Upper bound on the `fb_send` wait; `None` waits forever
    pub flip_timeout: Option<Duration>,
    /// Fabricate a 1920x1080 output when no display is connected
    pub fake_output: bool,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            flip_timeout: Some(Duration::from_millis(1000)),
            fake_output: true,
        }
    }
}

/// Outputs created and freed by one `outputs_update`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputChanges {
    pub added: Vec<OutputId>,
    pub removed: Vec<OutputId>,
}

impl OutputChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

type FlipCallback = Box<dyn FnOnce()>;

struct Flip {
    fb: FbHandle,
    serial: u64,
    /// Outputs that have not confirmed yet
    waiting: Vec<OutputId>,
    callback: Option<FlipCallback>,
}

pub struct Device<D: KmsDriver> {
    driver: D,
    outputs: Vec<Output>,
    fbs: Arena<Fb>,
    current: Option<FbHandle>,
    next: Option<FbHandle>,
    flip: Option<Flip>,
    flip_serial: u64,
    options: DisplayOptions,
}

impl<D: KmsDriver> Device<D> {
    /// Scan connectors and build the initial output list
    pub fn new(mut driver: D, options: DisplayOptions) -> Result<Self> {
        let connectors = driver.connectors()?;
        let mut outputs: Vec<Output> = Vec::new();
        let mut x = 0;

        for connector in connectors.iter().filter(|c| c.connected) {
            let used: Vec<u32> = outputs.iter().filter_map(|o| o.crtc).collect();
            let Some(crtc) = connector.crtcs.iter().copied().find(|c| !used.contains(c)) else {
                warn!("No free CRTC for connector {}", connector.name);
                continue;
            };
            let Some(output) = Output::from_connector(connector, crtc, x, false) else {
                warn!("Connector {} has no modes", connector.name);
                continue;
            };
            info!(
                "Output {} on CRTC {}: {} at x={}",
                output.name, crtc, output.mode.name, x
            );
            x = output.right_edge();
            outputs.push(output);
        }

        if outputs.is_empty() && options.fake_output {
            warn!("No connected displays, creating fake 1920x1080 output");
            outputs.push(Output::fake());
        }

        Ok(Self {
            driver,
            outputs,
            fbs: Arena::new(),
            current: None,
            next: None,
            flip: None,
            flip_serial: 0,
            options,
        })
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn options(&self) -> &DisplayOptions {
        &self.options
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn output(&self, id: OutputId) -> Option<&Output> {
        self.outputs.iter().find(|o| o.id == id)
    }

    /// Framebuffer confirmed on screen
    pub fn current(&self) -> Option<FbHandle> {
        self.current
    }

    /// Framebuffer staged or awaiting flip completion
    pub fn next(&self) -> Option<FbHandle> {
        self.next
    }

    pub fn fb(&self, fb: FbHandle) -> Option<&Fb> {
        self.fbs.get(fb.0)
    }

    pub fn fb_count(&self) -> usize {
        self.fbs.len()
    }

    pub fn flip_pending(&self) -> bool {
        self.flip.is_some()
    }

    /// Register a buffer with the display as a framebuffer object
    pub fn fb_create(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        format: Format,
        handle: u32,
    ) -> Result<FbHandle> {
        let info = FramebufferInfo {
            id: 0,
            width,
            height,
            pitch: stride,
            bpp: format.bpp(),
            depth: format.info().depth,
            format: format.code(),
            handle,
        };
        let id = self.driver.add_framebuffer(&info).map_err(|e| {
            error!("Failed to add {}x{} framebuffer: {}", width, height, e);
            e
        })?;
        let fb = FbHandle(self.fbs.insert(Fb {
            id,
            width,
            height,
            stride,
            format,
            handle,
            pending_flip: false,
            destroy_requested: false,
        }));
        debug!("Framebuffer {:?} -> KMS fb {}", fb, id);
        Ok(fb)
    }

    /// Free a framebuffer, or defer while it is on screen or in flight
    pub fn fb_destroy(&mut self, fb: FbHandle) -> Result<Teardown> {
        if !self.fb_in_use(fb)? {
            self.fb_finalize(fb);
            return Ok(Teardown::Freed);
        }
        if let Some(entry) = self.fbs.get_mut(fb.0) {
            entry.destroy_requested = true;
        }
        debug!("Framebuffer {:?} busy, destroy deferred", fb);
        Ok(Teardown::Deferred)
    }

    fn fb_in_use(&self, fb: FbHandle) -> Result<bool> {
        let entry = self.fbs.get(fb.0).ok_or(Error::InvalidBuffer)?;
        Ok(entry.pending_flip
            || self.current == Some(fb)
            || self.next == Some(fb)
            || self.outputs.iter().any(|o| o.current == Some(fb)))
    }

    fn fb_finalize(&mut self, fb: FbHandle) {
        let Some(entry) = self.fbs.remove(fb.0) else {
            return;
        };
        if let Err(e) = self.driver.remove_framebuffer(entry.id) {
            error!("Failed to remove KMS fb {}: {}", entry.id, e);
        }
        debug!("Freed framebuffer {:?}", fb);
    }

    /// Stage `fb` as the next frame, mode-setting outputs that need it
    ///
    /// Outputs with nothing on screen, or showing a framebuffer with a
    /// different stride, are mode-set to `fb` right away. Cloned outputs get
    /// no page flips, so they are mode-set to every new `fb`. Everything else
    /// waits for `fb_send`.
    pub fn fb_set(&mut self, fb: FbHandle) -> Result<()> {
        if self.flip.is_some() {
            return Err(Error::FbBusy);
        }
        let (fb_id, stride) = {
            let entry = self.fbs.get(fb.0).ok_or(Error::InvalidBuffer)?;
            (entry.id, entry.stride)
        };
        self.next = Some(fb);

        for i in 0..self.outputs.len() {
            let output = &self.outputs[i];
            if !output.enabled || output.destroy_requested {
                continue;
            }
            let needs_modeset = match output.current {
                None => true,
                Some(shown) if output.cloned => shown != fb,
                Some(shown) => self.fbs.get(shown.0).map_or(true, |s| s.stride != stride),
            };
            if !needs_modeset {
                continue;
            }
            let Some(crtc) = output.crtc else {
                self.outputs[i].current = Some(fb);
                continue;
            };
            match self
                .driver
                .set_crtc(crtc, Some(fb_id), output.id.0, &output.mode)
            {
                Ok(()) => {
                    debug!("Mode-set {} to fb {}", output.name, fb_id);
                    self.outputs[i].current = Some(fb);
                }
                Err(e) => error!("Mode-set on {} failed: {}", output.name, e),
            }
        }
        self.sweep();
        Ok(())
    }

    /// Issue a flip to `fb` on every enabled, non-cloned output
    ///
    /// Returns how many outputs accepted it. `callback` runs once all of
    /// them have confirmed. With only the fake output there is nothing to
    /// wait for and the flip completes before this returns.
    pub fn fb_flip(&mut self, fb: FbHandle, callback: impl FnOnce() + 'static) -> Result<usize> {
        if self.flip.is_some() {
            return Err(Error::FbBusy);
        }
        let fb_id = self.fbs.get(fb.0).ok_or(Error::InvalidBuffer)?.id;
        self.flip_serial += 1;
        let serial = self.flip_serial;

        let mut waiting = Vec::new();
        let mut hardware = false;
        for output in self.outputs.iter_mut() {
            if !output.enabled || output.cloned || output.destroy_requested {
                continue;
            }
            let Some(crtc) = output.crtc else {
                continue;
            };
            hardware = true;
            match self.driver.page_flip(crtc, fb_id, serial) {
                Ok(()) => {
                    output.pending_flip = true;
                    waiting.push(output.id);
                }
                Err(e) => warn!("Page flip on {} failed, continuing: {}", output.name, e),
            }
        }

        if waiting.is_empty() {
            let fake = self.outputs.iter().any(|o| o.enabled && o.is_fake());
            if !hardware && fake {
                self.next = Some(fb);
                for output in self.outputs.iter_mut().filter(|o| o.is_fake()) {
                    output.current = Some(fb);
                }
                self.complete(Flip {
                    fb,
                    serial,
                    waiting,
                    callback: Some(Box::new(callback)),
                });
                return Ok(0);
            }
            if self.next == Some(fb) {
                self.next = None;
            }
            error!("Page flip to fb {} failed on every output", fb_id);
            return Err(Error::NoOutputsFlipped);
        }

        let count = waiting.len();
        if let Some(entry) = self.fbs.get_mut(fb.0) {
            entry.pending_flip = true;
        }
        self.next = Some(fb);
        self.flip = Some(Flip {
            fb,
            serial,
            waiting,
            callback: Some(Box::new(callback)),
        });
        debug!("Flip {} to fb {} issued on {} outputs", serial, fb_id, count);
        Ok(count)
    }

    /// Flip and block until every output has confirmed
    ///
    /// The wait is bounded by the configured flip timeout. On expiry the flip
    /// stays outstanding and a later `dispatch` can still complete it.
    pub fn fb_send(&mut self, fb: FbHandle, callback: impl FnOnce() + 'static) -> Result<()> {
        if self.fb_flip(fb, callback)? == 0 {
            return Ok(());
        }
        let serial = self.flip_serial;
        let deadline = self.options.flip_timeout.map(|t| Instant::now() + t);

        while self.flip.as_ref().is_some_and(|f| f.serial == serial) {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!("Timed out waiting for flip {}", serial);
                        return Err(Error::FlipTimeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            for event in self.driver.handle_events(remaining)? {
                self.flip_event(event);
            }
        }
        Ok(())
    }

    /// Read driver events once; returns how many were handled
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let events = self.driver.handle_events(timeout)?;
        let count = events.len();
        for event in events {
            self.flip_event(event);
        }
        Ok(count)
    }

    fn flip_event(&mut self, event: FlipEvent) {
        let Some(flip) = self.flip.as_mut() else {
            debug!("Flip event on CRTC {} with nothing in flight", event.crtc);
            return;
        };
        if event.user_data != flip.serial {
            debug!("Stale flip event {} on CRTC {}", event.user_data, event.crtc);
            return;
        }
        let Some(output) = self
            .outputs
            .iter_mut()
            .find(|o| o.crtc == Some(event.crtc))
        else {
            warn!("Flip event for unknown CRTC {}", event.crtc);
            return;
        };
        let Some(pos) = flip.waiting.iter().position(|id| *id == output.id) else {
            return;
        };
        flip.waiting.remove(pos);
        output.pending_flip = false;
        output.current = Some(flip.fb);
        debug!(
            "Flip {} landed on {} ({} outstanding)",
            flip.serial,
            output.name,
            flip.waiting.len()
        );

        if flip.waiting.is_empty() {
            if let Some(flip) = self.flip.take() {
                self.complete(flip);
            }
        }
    }

    fn complete(&mut self, mut flip: Flip) {
        if let Some(entry) = self.fbs.get_mut(flip.fb.0) {
            entry.pending_flip = false;
        }
        self.current = self.next.take().or(Some(flip.fb));
        if let Some(callback) = flip.callback.take() {
            callback();
        }
        self.sweep();
    }

    /// Carry out destroys that were waiting for a flip to land
    fn sweep(&mut self) {
        let doomed: Vec<OutputId> = self
            .outputs
            .iter()
            .filter(|o| o.destroy_requested && !o.pending_flip)
            .map(|o| o.id)
            .collect();
        for id in doomed {
            self.output_remove(id);
        }

        let fbs: Vec<FbHandle> = self
            .fbs
            .iter()
            .filter(|(_, fb)| fb.destroy_requested)
            .map(|(index, _)| FbHandle(index))
            .collect();
        for fb in fbs {
            if !self.fb_in_use(fb).unwrap_or(true) {
                self.fb_finalize(fb);
            }
        }
    }

    /// Reconcile the output list with the connectors the driver reports
    ///
    /// New displays are appended to the right and marked cloned; vanished
    /// ones are destroyed (deferred if a flip is outstanding on them).
    pub fn outputs_update(&mut self) -> Result<OutputChanges> {
        let connectors = self.driver.connectors()?;
        let mut changes = OutputChanges::default();

        let gone: Vec<OutputId> = self
            .outputs
            .iter()
            .filter(|o| !o.is_fake() && !o.destroy_requested)
            .filter(|o| !connectors.iter().any(|c| c.connected && c.id == o.id.0))
            .map(|o| o.id)
            .collect();
        for id in gone {
            info!("Output {:?} disconnected", id);
            self.output_destroy(id)?;
            changes.removed.push(id);
        }

        for connector in connectors.iter().filter(|c| c.connected) {
            if self.outputs.iter().any(|o| o.id.0 == connector.id) {
                continue;
            }
            let used: Vec<u32> = self.outputs.iter().filter_map(|o| o.crtc).collect();
            let Some(crtc) = connector.crtcs.iter().copied().find(|c| !used.contains(c)) else {
                warn!("No free CRTC for hotplugged {}", connector.name);
                continue;
            };
            let x = self
                .outputs
                .iter()
                .filter(|o| !o.is_fake())
                .map(Output::right_edge)
                .max()
                .unwrap_or(0);
            let Some(mut output) = Output::from_connector(connector, crtc, x, true) else {
                warn!("Hotplugged {} has no modes", connector.name);
                continue;
            };

            if let Some(fb) = self.current.and_then(|fb| self.fbs.get(fb.0).map(|e| (fb, e.id))) {
                match self.driver.set_crtc(crtc, Some(fb.1), connector.id, &output.mode) {
                    Ok(()) => output.current = Some(fb.0),
                    Err(e) => warn!("Mode-set on new output {} failed: {}", output.name, e),
                }
            }
            info!("Output {} connected at x={} (cloned)", output.name, x);
            changes.added.push(output.id);
            self.outputs.push(output);
        }

        if !changes.added.is_empty() {
            if let Some(pos) = self.outputs.iter().position(Output::is_fake) {
                info!("Real display found, dropping fake output");
                self.outputs.remove(pos);
                changes.removed.push(OutputId::FAKE);
            }
        }
        if !changes.is_empty() {
            self.sweep();
        }
        Ok(changes)
    }

    /// Free an output, or defer while a flip on it is outstanding
    pub fn output_destroy(&mut self, id: OutputId) -> Result<Teardown> {
        let output = self
            .outputs
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| Error::Drm(format!("Output {:?} not found", id)))?;
        if output.pending_flip {
            debug!("Output {} has a flip pending, destroy deferred", output.name);
            output.destroy_requested = true;
            return Ok(Teardown::Deferred);
        }
        self.output_remove(id);
        self.sweep();
        Ok(Teardown::Freed)
    }

    fn output_remove(&mut self, id: OutputId) {
        let Some(pos) = self.outputs.iter().position(|o| o.id == id) else {
            return;
        };
        let output = self.outputs.remove(pos);
        if let Some(crtc) = output.crtc {
            if let Err(e) = self.driver.set_crtc(crtc, None, id.0, &output.mode) {
                debug!("Turning off CRTC {} failed: {}", crtc, e);
            }
        }
        info!("Output {} destroyed", output.name);
    }

    /// Turn an output on (showing the current frame) or off
    pub fn output_enable(&mut self, id: OutputId, enable: bool) -> Result<()> {
        let current = self.current.and_then(|fb| self.fbs.get(fb.0).map(|e| (fb, e.id)));
        let output = self
            .outputs
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| Error::Drm(format!("Output {:?} not found", id)))?;
        if output.enabled == enable {
            return Ok(());
        }

        if let Some(crtc) = output.crtc {
            let fb = if enable { current } else { None };
            self.driver
                .set_crtc(crtc, fb.map(|f| f.1), id.0, &output.mode)?;
            output.current = fb.map(|f| f.0);
        }
        output.enabled = enable;
        info!("Output {} {}", output.name, if enable { "enabled" } else { "disabled" });
        self.sweep();
        Ok(())
    }

    /// Enabled output covering the point in global coordinates
    pub fn output_find(&self, x: i32, y: i32) -> Option<OutputId> {
        self.outputs
            .iter()
            .filter(|o| o.enabled && !o.destroy_requested)
            .find(|o| o.contains(x, y))
            .map(|o| o.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::VirtualKms;
    use std::cell::Cell;
    use std::rc::Rc;

    fn device(outputs: usize) -> Device<VirtualKms> {
        Device::new(
            VirtualKms::with_outputs(outputs, 640, 480, 60),
            DisplayOptions::default(),
        )
        .unwrap()
    }

    fn fb(dev: &mut Device<VirtualKms>) -> FbHandle {
        dev.fb_create(640, 480, 640 * 4, Format::Xrgb8888, 1).unwrap()
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnOnce() + 'static) {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        (count, move || c.set(c.get() + 1))
    }

    #[test]
    fn test_flip_waits_for_every_output() {
        let mut dev = device(2);
        dev.driver_mut().set_events_per_dispatch(1);
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();

        let (fired, cb) = counter();
        dev.fb_send(fb1, cb).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(dev.current(), Some(fb1));
        assert_eq!(dev.next(), None);

        let fb2 = fb(&mut dev);
        let (fired, cb) = counter();
        assert_eq!(dev.fb_flip(fb2, cb).unwrap(), 2);
        assert_eq!(dev.next(), Some(fb2));

        assert_eq!(dev.dispatch(None).unwrap(), 1);
        assert_eq!(fired.get(), 0);
        assert_eq!(dev.current(), Some(fb1));
        assert!(dev.fb(fb2).unwrap().pending_flip());

        assert_eq!(dev.dispatch(None).unwrap(), 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(dev.current(), Some(fb2));
        assert_eq!(dev.next(), None);
        assert_eq!(dev.driver().scanout(10), Some(dev.fb(fb2).unwrap().id()));
        assert_eq!(dev.driver().scanout(11), Some(dev.fb(fb2).unwrap().id()));
    }

    #[test]
    fn test_second_flip_while_busy() {
        let mut dev = device(1);
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.fb_flip(fb1, || {}).unwrap();
        assert!(matches!(dev.fb_flip(fb1, || {}), Err(Error::FbBusy)));
        assert!(matches!(dev.fb_set(fb1), Err(Error::FbBusy)));
    }

    #[test]
    fn test_partial_flip_failure_tolerated() {
        let mut dev = device(2);
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.driver_mut().fail_flips(11, true).unwrap();

        let (fired, cb) = counter();
        dev.fb_send(fb1, cb).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(dev.current(), Some(fb1));

        dev.driver_mut().fail_flips(10, true).unwrap();
        let fb2 = fb(&mut dev);
        let (fired, cb) = counter();
        assert!(matches!(dev.fb_send(fb2, cb), Err(Error::NoOutputsFlipped)));
        assert_eq!(fired.get(), 0);
        assert!(!dev.fb(fb2).unwrap().pending_flip());
        assert!(!dev.flip_pending());
        assert_eq!(dev.current(), Some(fb1));
    }

    #[test]
    fn test_flip_timeout_then_dispatch() {
        let options = DisplayOptions {
            flip_timeout: Some(Duration::from_millis(10)),
            fake_output: false,
        };
        let mut dev = Device::new(VirtualKms::with_outputs(1, 640, 480, 60), options).unwrap();
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.driver_mut().hold_events(true);

        let (fired, cb) = counter();
        assert!(matches!(dev.fb_send(fb1, cb), Err(Error::FlipTimeout)));
        assert!(dev.flip_pending());
        assert_eq!(fired.get(), 0);

        dev.driver_mut().hold_events(false);
        dev.dispatch(None).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(dev.current(), Some(fb1));
    }

    #[test]
    fn test_outputs_update_idempotent() {
        let mut dev = device(2);
        assert!(dev.outputs_update().unwrap().is_empty());
        assert!(dev.outputs_update().unwrap().is_empty());
        assert_eq!(dev.outputs().len(), 2);

        let id = dev.driver_mut().add_connector(800, 600, 60);
        let changes = dev.outputs_update().unwrap();
        assert_eq!(changes.added, vec![OutputId(id)]);
        let output = dev.output(OutputId(id)).unwrap();
        assert!(output.is_cloned());
        assert_eq!(output.position(), (1280, 0));
        assert!(dev.outputs_update().unwrap().is_empty());

        dev.driver_mut().set_connected(id, false).unwrap();
        assert_eq!(dev.outputs_update().unwrap().removed, vec![OutputId(id)]);
        assert!(dev.outputs_update().unwrap().is_empty());
        assert_eq!(dev.outputs().len(), 2);
    }

    #[test]
    fn test_output_destroy_deferred_during_flip() {
        let mut dev = device(2);
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.driver_mut().hold_events(true);
        dev.fb_flip(fb1, || {}).unwrap();

        assert_eq!(dev.output_destroy(OutputId(1)).unwrap(), Teardown::Deferred);
        assert!(dev.output(OutputId(1)).is_some());

        dev.driver_mut().hold_events(false);
        dev.dispatch(None).unwrap();
        assert!(dev.output(OutputId(1)).is_none());
        assert_eq!(dev.output_destroy(OutputId(2)).unwrap(), Teardown::Freed);
    }

    #[test]
    fn test_fb_destroy_waits_until_replaced() {
        let mut dev = device(1);
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.fb_send(fb1, || {}).unwrap();
        assert_eq!(dev.driver().framebuffer_count(), 1);

        assert_eq!(dev.fb_destroy(fb1).unwrap(), Teardown::Deferred);
        let fb2 = fb(&mut dev);
        dev.fb_set(fb2).unwrap();
        dev.fb_send(fb2, || {}).unwrap();

        assert!(dev.fb(fb1).is_none());
        assert_eq!(dev.driver().framebuffer_count(), 1);
        assert!(matches!(dev.fb_destroy(fb1), Err(Error::InvalidBuffer)));
    }

    #[test]
    fn test_cloned_output_follows_new_frames() {
        let mut dev = device(1);
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.fb_send(fb1, || {}).unwrap();

        let connector = dev.driver_mut().add_connector(640, 480, 60);
        dev.outputs_update().unwrap();
        assert!(dev.output(OutputId(connector)).unwrap().is_cloned());
        let crtc = dev.driver().crtc_for(connector).unwrap();
        assert_eq!(dev.driver().scanout(crtc), Some(dev.fb(fb1).unwrap().id()));

        let mut last = fb1;
        for _ in 0..3 {
            last = fb(&mut dev);
            dev.fb_set(last).unwrap();
            dev.fb_send(last, || {}).unwrap();
            assert_eq!(dev.driver().scanout(crtc), Some(dev.fb(last).unwrap().id()));
        }
        assert_eq!(dev.current(), Some(last));
        assert_eq!(dev.fb_destroy(fb1).unwrap(), Teardown::Freed);
        assert!(dev.fb(fb1).is_none());
    }

    #[test]
    fn test_stride_change_forces_modeset() {
        let mut dev = device(1);
        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.fb_send(fb1, || {}).unwrap();

        let wide = dev.fb_create(640, 480, 640 * 4 + 256, Format::Xrgb8888, 2).unwrap();
        dev.fb_set(wide).unwrap();
        assert_eq!(dev.driver().scanout(10), Some(dev.fb(wide).unwrap().id()));

        let same = dev.fb_create(640, 480, 640 * 4 + 256, Format::Xrgb8888, 3).unwrap();
        dev.fb_set(same).unwrap();
        assert_eq!(dev.driver().scanout(10), Some(dev.fb(wide).unwrap().id()));
        assert_eq!(dev.next(), Some(same));
    }

    #[test]
    fn test_fake_output_fallback() {
        let mut dev = Device::new(VirtualKms::new(), DisplayOptions::default()).unwrap();
        assert_eq!(dev.outputs().len(), 1);
        assert!(dev.outputs()[0].is_fake());
        assert_eq!(dev.outputs()[0].size(), (1920, 1080));

        let fb1 = dev.fb_create(1920, 1080, 1920 * 4, Format::Xrgb8888, 1).unwrap();
        dev.fb_set(fb1).unwrap();
        let (fired, cb) = counter();
        dev.fb_send(fb1, cb).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(dev.current(), Some(fb1));

        let id = dev.driver_mut().add_connector(1280, 720, 60);
        let changes = dev.outputs_update().unwrap();
        assert_eq!(changes.added, vec![OutputId(id)]);
        assert_eq!(changes.removed, vec![OutputId::FAKE]);
        assert_eq!(dev.outputs()[0].position(), (0, 0));

        let empty = Device::new(
            VirtualKms::new(),
            DisplayOptions {
                fake_output: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(empty.outputs().is_empty());
    }

    #[test]
    fn test_output_find_and_enable() {
        let mut dev = device(2);
        assert_eq!(dev.output_find(10, 10), Some(OutputId(1)));
        assert_eq!(dev.output_find(700, 10), Some(OutputId(2)));
        assert_eq!(dev.output_find(1280, 10), None);

        let fb1 = fb(&mut dev);
        dev.fb_set(fb1).unwrap();
        dev.fb_send(fb1, || {}).unwrap();

        dev.output_enable(OutputId(2), false).unwrap();
        assert_eq!(dev.output_find(700, 10), None);
        assert_eq!(dev.driver().scanout(11), None);
        assert_eq!(dev.fb_flip(fb1, || {}).unwrap(), 1);
        dev.dispatch(None).unwrap();

        dev.output_enable(OutputId(2), true).unwrap();
        assert_eq!(dev.driver().scanout(11), Some(dev.fb(fb1).unwrap().id()));
        assert!(dev.output_enable(OutputId(9), true).is_err());
    }
}
