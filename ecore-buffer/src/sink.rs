//! Queue consumer that scans buffers out on a display
//!
//! Each dequeued buffer is wrapped in a framebuffer (cached per buffer),
//! marked pending and flipped onto every output. When the flip lands the
//! buffer that was on screen before is released back to the provider.

use crate::backend::Native;
use crate::buffer::{BufferHandle, CallbackId};
use crate::consumer::Consumer;
use crate::context::SharedContext;
use crate::drm::{Device, FbHandle, KmsDriver};
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, warn};

struct Scanout {
    fb: FbHandle,
    free_callback: CallbackId,
    /// Keeps fd-backed memory alive while the framebuffer exists
    _memory: Option<OwnedFd>,
}

pub struct DisplaySink<D: KmsDriver> {
    ctx: SharedContext,
    device: Device<D>,
    scanouts: HashMap<BufferHandle, Scanout>,
    /// Buffers destroyed while they still had a framebuffer
    dropped: Rc<RefCell<Vec<BufferHandle>>>,
    /// Buffers whose flip completed
    completed: Rc<RefCell<Vec<BufferHandle>>>,
    showing: Option<BufferHandle>,
    in_flight: Option<BufferHandle>,
    frames: u64,
}

impl<D: KmsDriver> DisplaySink<D> {
    pub fn new(ctx: &SharedContext, device: Device<D>) -> Self {
        Self {
            ctx: ctx.clone(),
            device,
            scanouts: HashMap::new(),
            dropped: Rc::new(RefCell::new(Vec::new())),
            completed: Rc::new(RefCell::new(Vec::new())),
            showing: None,
            in_flight: None,
            frames: 0,
        }
    }

    pub fn device(&self) -> &Device<D> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<D> {
        &mut self.device
    }

    /// Frames confirmed on screen so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Buffer currently on screen
    pub fn showing(&self) -> Option<BufferHandle> {
        self.showing
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Put the next queued buffer on screen
    ///
    /// Returns `Ok(false)` when nothing is queued or the previous frame is
    /// still in flight.
    pub fn present(&mut self, consumer: &mut Consumer) -> Result<bool> {
        self.collect(consumer);
        if self.in_flight.is_some() {
            self.device.dispatch(Some(Duration::ZERO))?;
            self.collect(consumer);
            if self.in_flight.is_some() {
                debug!("Previous frame still in flight");
                return Ok(false);
            }
        }

        let Some(buffer) = consumer.dequeue()? else {
            return Ok(false);
        };
        let fb = match self.scanout_for(buffer) {
            Ok(fb) => fb,
            Err(e) => {
                consumer.release(buffer)?;
                return Err(e);
            }
        };

        self.ctx.buffer_pending_set(buffer, true)?;
        self.in_flight = Some(buffer);
        let completed = self.completed.clone();
        let sent = self
            .device
            .fb_set(fb)
            .and_then(|()| self.device.fb_send(fb, move || completed.borrow_mut().push(buffer)));

        match sent {
            Ok(()) => {
                self.collect(consumer);
                Ok(true)
            }
            Err(Error::FlipTimeout) => {
                warn!("Flip of {:?} still outstanding", buffer);
                Err(Error::FlipTimeout)
            }
            Err(e) => {
                error!("Failed to present {:?}: {}", buffer, e);
                self.in_flight = None;
                self.ctx.buffer_pending_set(buffer, false)?;
                consumer.release(buffer)?;
                Err(e)
            }
        }
    }

    /// Handle display events without presenting anything
    pub fn dispatch(&mut self, consumer: &mut Consumer, timeout: Option<Duration>) -> Result<usize> {
        let handled = self.device.dispatch(timeout)?;
        self.collect(consumer);
        Ok(handled)
    }

    fn scanout_for(&mut self, buffer: BufferHandle) -> Result<FbHandle> {
        if let Some(scanout) = self.scanouts.get(&buffer) {
            return Ok(scanout.fb);
        }
        let info = self.ctx.buffer_info(buffer).ok_or(Error::InvalidBuffer)?;
        let (handle, memory) = match self.ctx.buffer_native_handle(buffer) {
            Some(Native::Pixmap(id)) => (id, None),
            Some(Native::Memory { fd, .. }) => (fd.as_raw_fd() as u32, Some(fd)),
            None => {
                return Err(Error::Drm(format!("{:?} has no native handle", buffer)));
            }
        };
        let layout = info.format.layout(info.width, info.height)?;
        let stride = layout
            .planes
            .first()
            .map(|p| p.stride)
            .ok_or_else(|| Error::UnknownFormat(info.format.to_string()))?;

        let fb = self
            .device
            .fb_create(info.width, info.height, stride, info.format, handle)?;
        let dropped = self.dropped.clone();
        let free_callback = self
            .ctx
            .free_callback_add(buffer, move |h| dropped.borrow_mut().push(h))?;
        self.scanouts.insert(
            buffer,
            Scanout {
                fb,
                free_callback,
                _memory: memory,
            },
        );
        Ok(fb)
    }

    fn collect(&mut self, consumer: &mut Consumer) {
        let completed: Vec<_> = self.completed.borrow_mut().drain(..).collect();
        for buffer in completed {
            self.frames += 1;
            if self.in_flight == Some(buffer) {
                self.in_flight = None;
            }
            if let Err(e) = self.ctx.buffer_pending_set(buffer, false) {
                warn!("Completed {:?} is gone: {}", buffer, e);
            }
            if let Some(previous) = self.showing.replace(buffer) {
                if previous != buffer {
                    if let Err(e) = consumer.release(previous) {
                        warn!("Failed to release {:?}: {}", previous, e);
                    }
                }
            }
            debug!("Frame {} on screen: {:?}", self.frames, buffer);
        }

        let dropped: Vec<_> = self.dropped.borrow_mut().drain(..).collect();
        for buffer in dropped {
            if self.showing == Some(buffer) {
                self.showing = None;
            }
            if let Some(scanout) = self.scanouts.remove(&buffer) {
                if let Err(e) = self.device.fb_destroy(scanout.fb) {
                    warn!("Failed to destroy framebuffer for {:?}: {}", buffer, e);
                }
            }
        }
    }
}

impl<D: KmsDriver> Drop for DisplaySink<D> {
    fn drop(&mut self) {
        if let Some(buffer) = self.in_flight.take() {
            // The flip will never be collected
            let _ = self.ctx.buffer_pending_set(buffer, false);
        }
        for (buffer, scanout) in self.scanouts.drain() {
            self.ctx.free_callback_remove(buffer, scanout.free_callback);
        }
    }
}
