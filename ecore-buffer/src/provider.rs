//! Producing end of a buffer queue
//!
//! The provider renders into buffers and submits them. Buffers it has never
//! shared with the current consumer are exported on first enqueue; after
//! that only serials go over the wire.

use crate::backend::Export;
use crate::broker::Endpoint;
use crate::buffer::{BufferHandle, CallbackId};
use crate::context::SharedContext;
use crate::protocol::{Message, WireExport};
use crate::queue::{Acquirable, Acquire, BufferQueue, BufferSerial};
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Result of [`Provider::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// A released buffer to draw into again
    Buffer(BufferHandle),
    /// Allocate a new buffer and enqueue it
    NeedAlloc,
    /// Nothing available; wait for a release
    Empty,
}

type ConsumerAddCb = Box<dyn FnMut(&mut Provider, u32, u32, u32)>;
type ConsumerDelCb = Box<dyn FnMut(&mut Provider)>;
type BufferReleasedCb = Box<dyn FnMut(&mut Provider)>;

#[derive(Default)]
struct Callbacks {
    consumer_add: Option<ConsumerAddCb>,
    consumer_del: Option<ConsumerDelCb>,
    buffer_released: Option<BufferReleasedCb>,
}

struct Tracked {
    handle: BufferHandle,
    free_callback: CallbackId,
}

pub struct Provider {
    ctx: SharedContext,
    endpoint: Endpoint,
    queue: Option<BufferQueue>,
    connected: bool,
    /// Consumer's preferred size
    size: (u32, u32),
    buffers: HashMap<BufferSerial, Tracked>,
    serials: HashMap<BufferHandle, BufferSerial>,
    /// Serials the current consumer has imported
    attached: HashSet<BufferSerial>,
    /// Filled by free callbacks when the application destroys a tracked buffer
    freed: Rc<RefCell<Vec<BufferHandle>>>,
    next_serial: u32,
    callbacks: Callbacks,
}

impl Provider {
    /// Attach as the provider of queue `name`
    pub fn new(ctx: &SharedContext, name: &str) -> Result<Self> {
        let endpoint = ctx.broker().attach_provider(name)?;
        let mut provider = Self {
            ctx: ctx.clone(),
            endpoint,
            queue: None,
            connected: false,
            size: (0, 0),
            buffers: HashMap::new(),
            serials: HashMap::new(),
            attached: HashSet::new(),
            freed: Rc::new(RefCell::new(Vec::new())),
            next_serial: 1,
            callbacks: Callbacks::default(),
        };
        provider.pump();
        Ok(provider)
    }

    pub fn name(&self) -> &str {
        self.endpoint.name()
    }

    pub fn consumer_connected(&self) -> bool {
        self.connected
    }

    /// Take a buffer to render into
    pub fn acquire(&mut self) -> Result<Acquired> {
        self.pump();
        let queue = self.live_queue()?;
        let acquired = match queue.acquire() {
            Acquire::Success(serial) => match self.buffers.get(&serial) {
                Some(tracked) => Acquired::Buffer(tracked.handle),
                None => {
                    error!("Slot holds unknown buffer {}", serial);
                    return Err(Error::InvalidBuffer);
                }
            },
            Acquire::NeedAlloc => Acquired::NeedAlloc,
            Acquire::Empty => Acquired::Empty,
        };
        debug!("'{}': acquire -> {:?}", self.name(), acquired);
        Ok(acquired)
    }

    /// Peek at what `acquire` would return
    pub fn acquirable_check(&mut self) -> Result<Acquirable> {
        self.pump();
        Ok(self.live_queue()?.acquirable_check())
    }

    /// Submit a rendered buffer
    pub fn enqueue(&mut self, handle: BufferHandle) -> Result<()> {
        self.pump();
        if !self.ctx.buffer_alive(handle) {
            return Err(Error::InvalidBuffer);
        }
        let known = self.serials.get(&handle).copied();
        let serial = known.unwrap_or(BufferSerial(self.next_serial));
        self.live_queue()?.can_enqueue(serial)?;

        if !self.attached.contains(&serial) {
            self.attach(handle, serial)?;
        }
        if known.is_none() {
            self.track(handle, serial)?;
        }
        self.live_queue()?.enqueue(serial)?;
        self.endpoint
            .send(&Message::BufferEnqueued { serial }, Vec::new())?;
        debug!("'{}': enqueued {}", self.name(), serial);
        Ok(())
    }

    /// Slot count announced by the consumer, 0 without one
    pub fn queue_size(&self) -> u32 {
        self.queue.as_ref().map_or(0, |q| q.capacity() as u32)
    }

    /// Preferred buffer size announced by the consumer
    pub fn buffer_size(&self) -> (u32, u32) {
        self.size
    }

    pub fn on_consumer_add(&mut self, cb: impl FnMut(&mut Provider, u32, u32, u32) + 'static) {
        self.callbacks.consumer_add = Some(Box::new(cb));
    }

    pub fn on_consumer_del(&mut self, cb: impl FnMut(&mut Provider) + 'static) {
        self.callbacks.consumer_del = Some(Box::new(cb));
    }

    pub fn on_buffer_released(&mut self, cb: impl FnMut(&mut Provider) + 'static) {
        self.callbacks.buffer_released = Some(Box::new(cb));
    }

    /// Process everything the consumer and broker sent; returns the count
    pub fn dispatch(&mut self) -> usize {
        self.pump()
    }

    fn live_queue(&mut self) -> Result<&mut BufferQueue> {
        if !self.connected {
            return Err(Error::Disconnected);
        }
        self.queue.as_mut().ok_or(Error::Disconnected)
    }

    fn attach(&mut self, handle: BufferHandle, serial: BufferSerial) -> Result<()> {
        let info = self.ctx.buffer_info(handle).ok_or(Error::InvalidBuffer)?;
        let export: Export = self.ctx.buffer_export(handle)?;
        let mut fds = Vec::new();
        let export = WireExport::pack(export, &mut fds);
        let message = Message::BufferAttached {
            serial,
            backend: info.backend.to_string(),
            width: info.width,
            height: info.height,
            format: info.format,
            flags: info.flags,
            export,
        };
        self.endpoint.send(&message, fds)?;
        self.attached.insert(serial);
        Ok(())
    }

    fn track(&mut self, handle: BufferHandle, serial: BufferSerial) -> Result<()> {
        let freed = self.freed.clone();
        let free_callback = self
            .ctx
            .free_callback_add(handle, move |h| freed.borrow_mut().push(h))?;
        self.buffers.insert(
            serial,
            Tracked {
                handle,
                free_callback,
            },
        );
        self.serials.insert(handle, serial);
        self.next_serial += 1;
        Ok(())
    }

    fn forget(&mut self, serial: BufferSerial) -> Option<BufferHandle> {
        let tracked = self.buffers.remove(&serial)?;
        self.serials.remove(&tracked.handle);
        self.attached.remove(&serial);
        if let Some(queue) = self.queue.as_mut() {
            queue.detach(serial);
        }
        Some(tracked.handle)
    }

    fn pump(&mut self) -> usize {
        self.reap_freed();

        if !self.endpoint.is_connected() {
            if self.connected {
                self.consumer_gone();
            }
            return 0;
        }

        let mut handled = 0;
        while let Some(frame) = self.endpoint.recv() {
            handled += 1;
            match frame {
                Ok((message, _fds)) => self.handle(message),
                Err(e) => warn!("'{}': dropping malformed message: {}", self.name(), e),
            }
        }
        handled
    }

    /// Forget buffers the application destroyed behind our back
    fn reap_freed(&mut self) {
        let freed: Vec<_> = self.freed.borrow_mut().drain(..).collect();
        for handle in freed {
            let Some(serial) = self.serials.get(&handle).copied() else {
                continue;
            };
            let was_attached = self.attached.contains(&serial);
            self.forget(serial);
            debug!("'{}': buffer {} destroyed, detaching", self.name(), serial);
            if was_attached && self.connected {
                if let Err(e) = self
                    .endpoint
                    .send(&Message::BufferDetached { serial }, Vec::new())
                {
                    warn!("'{}': failed to send detach: {}", self.name(), e);
                }
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::ConsumerConnected {
                queue_size,
                width,
                height,
            } => self.consumer_arrived(queue_size, width, height),
            Message::ConsumerDisconnected => self.consumer_gone(),
            Message::BufferReleased { serial } => {
                let released = self
                    .queue
                    .as_mut()
                    .map(|q| q.mark_released(serial))
                    .unwrap_or(Err(Error::Disconnected));
                match released {
                    Ok(()) => {
                        debug!("'{}': {} released", self.name(), serial);
                        if let Some(mut cb) = self.callbacks.buffer_released.take() {
                            cb(self);
                            if self.callbacks.buffer_released.is_none() {
                                self.callbacks.buffer_released = Some(cb);
                            }
                        }
                    }
                    Err(e) => warn!("'{}': bad release: {}", self.name(), e),
                }
            }
            Message::BufferSize { width, height } => {
                debug!("'{}': consumer prefers {}x{}", self.name(), width, height);
                self.size = (width, height);
            }
            other => warn!("'{}': unexpected {} from consumer", self.name(), other.name()),
        }
    }

    fn consumer_arrived(&mut self, queue_size: u32, width: u32, height: u32) {
        info!(
            "'{}': consumer connected (queue {}, {}x{})",
            self.name(),
            queue_size,
            width,
            height
        );
        self.connected = true;
        self.size = (width, height);
        match self.queue.as_mut() {
            None => self.queue = Some(BufferQueue::new(queue_size as usize)),
            Some(queue) => {
                let evicted = queue.resize(queue_size as usize);
                for serial in evicted {
                    if let Some(handle) = self.forget(serial) {
                        self.drop_buffer(handle);
                    }
                }
            }
        }

        if let Some(mut cb) = self.callbacks.consumer_add.take() {
            cb(self, queue_size, width, height);
            if self.callbacks.consumer_add.is_none() {
                self.callbacks.consumer_add = Some(cb);
            }
        }
    }

    fn consumer_gone(&mut self) {
        if !self.connected {
            return;
        }
        info!("'{}': consumer disconnected", self.name());
        self.connected = false;
        self.attached.clear();
        if let Some(queue) = self.queue.as_mut() {
            let reclaimed = queue.reclaim_all();
            debug!("'{}': reclaimed {} buffers", self.name(), reclaimed.len());
        }

        if let Some(mut cb) = self.callbacks.consumer_del.take() {
            cb(self);
            if self.callbacks.consumer_del.is_none() {
                self.callbacks.consumer_del = Some(cb);
            }
        }
    }

    fn drop_buffer(&mut self, handle: BufferHandle) {
        if let Err(e) = self.ctx.buffer_destroy(handle) {
            warn!("'{}': failed to free {:?}: {}", self.name(), handle, e);
        }
        self.freed.borrow_mut().retain(|h| *h != handle);
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        for tracked in self.buffers.values() {
            self.ctx
                .free_callback_remove(tracked.handle, tracked.free_callback);
        }
        debug!("'{}': provider closed", self.endpoint.name());
    }
}
