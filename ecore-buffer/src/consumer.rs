//! Consuming end of a buffer queue
//!
//! The consumer creates the queue (its size and preferred buffer size are
//! announced to whichever provider attaches), imports every buffer the
//! provider shares and hands them out in submission order.

use crate::broker::{ConsumerInfo, Endpoint};
use crate::buffer::BufferHandle;
use crate::context::SharedContext;
use crate::format::Format;
use crate::protocol::{Message, WireExport};
use crate::queue::{BufferQueue, BufferSerial, SlotState, DEFAULT_QUEUE_SIZE};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use tracing::{debug, info, warn};

type ProviderAddCb = Box<dyn FnMut(&mut Consumer)>;
type ProviderDelCb = Box<dyn FnMut(&mut Consumer)>;
type BufferEnqueuedCb = Box<dyn FnMut(&mut Consumer)>;

#[derive(Default)]
struct Callbacks {
    provider_add: Option<ProviderAddCb>,
    provider_del: Option<ProviderDelCb>,
    buffer_enqueued: Option<BufferEnqueuedCb>,
}

/// Attributes of a buffer announced by the provider
struct Attachment {
    serial: BufferSerial,
    backend: String,
    width: u32,
    height: u32,
    format: Format,
    flags: u32,
    export: WireExport,
}

pub struct Consumer {
    ctx: SharedContext,
    endpoint: Endpoint,
    queue: BufferQueue,
    size: (u32, u32),
    imports: HashMap<BufferSerial, BufferHandle>,
    serials: HashMap<BufferHandle, BufferSerial>,
    /// Buffers still held after their provider went away
    orphans: HashSet<BufferHandle>,
    provider_connected: bool,
    callbacks: Callbacks,
}

impl Consumer {
    /// Create queue `name` with `queue_size` slots (0 picks the default)
    pub fn new(
        ctx: &SharedContext,
        name: &str,
        queue_size: u32,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let queue_size = match queue_size {
            0 => DEFAULT_QUEUE_SIZE as u32,
            n => n,
        };
        let info = ConsumerInfo {
            queue_size,
            width,
            height,
        };
        let endpoint = ctx.broker().attach_consumer(name, info)?;
        let mut consumer = Self {
            ctx: ctx.clone(),
            endpoint,
            queue: BufferQueue::new(queue_size as usize),
            size: (width, height),
            imports: HashMap::new(),
            serials: HashMap::new(),
            orphans: HashSet::new(),
            provider_connected: false,
            callbacks: Callbacks::default(),
        };
        consumer.pump();
        Ok(consumer)
    }

    pub fn name(&self) -> &str {
        self.endpoint.name()
    }

    pub fn provider_connected(&self) -> bool {
        self.provider_connected
    }

    /// Oldest submitted buffer, or `None` if nothing is queued
    pub fn dequeue(&mut self) -> Result<Option<BufferHandle>> {
        self.pump();
        if !self.endpoint.is_connected() {
            return Err(Error::Disconnected);
        }
        let Some(serial) = self.queue.dequeue() else {
            return Ok(None);
        };
        match self.imports.get(&serial) {
            Some(handle) => {
                debug!("'{}': dequeued {}", self.name(), serial);
                Ok(Some(*handle))
            }
            None => {
                warn!("'{}': queued {} was never imported", self.name(), serial);
                self.queue.detach(serial);
                Err(Error::InvalidBuffer)
            }
        }
    }

    /// Hand a dequeued buffer back to the provider
    pub fn release(&mut self, handle: BufferHandle) -> Result<()> {
        self.pump();
        if self.orphans.remove(&handle) {
            debug!("'{}': freeing orphaned {:?}", self.name(), handle);
            self.ctx.buffer_destroy(handle)?;
            return Ok(());
        }
        let serial = *self.serials.get(&handle).ok_or(Error::NotOwnedByConsumer)?;
        self.queue.release(serial)?;
        self.endpoint
            .send(&Message::BufferReleased { serial }, Vec::new())?;
        debug!("'{}': released {}", self.name(), serial);
        Ok(())
    }

    /// True when a `dequeue` would return nothing; does not read new messages
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Announce a new preferred buffer size to the provider
    pub fn buffer_size_set(&mut self, width: u32, height: u32) -> Result<()> {
        self.size = (width, height);
        self.endpoint.update_consumer_size(width, height)
    }

    pub fn buffer_size(&self) -> (u32, u32) {
        self.size
    }

    pub fn queue_size(&self) -> u32 {
        self.queue.capacity() as u32
    }

    pub fn on_provider_add(&mut self, cb: impl FnMut(&mut Consumer) + 'static) {
        self.callbacks.provider_add = Some(Box::new(cb));
    }

    pub fn on_provider_del(&mut self, cb: impl FnMut(&mut Consumer) + 'static) {
        self.callbacks.provider_del = Some(Box::new(cb));
    }

    pub fn on_buffer_enqueued(&mut self, cb: impl FnMut(&mut Consumer) + 'static) {
        self.callbacks.buffer_enqueued = Some(Box::new(cb));
    }

    /// Process pending messages; returns how many were handled
    pub fn dispatch(&mut self) -> usize {
        self.pump()
    }

    fn pump(&mut self) -> usize {
        if !self.endpoint.is_connected() {
            if self.provider_connected {
                self.provider_gone();
            }
            return 0;
        }
        let mut handled = 0;
        while let Some(frame) = self.endpoint.recv() {
            handled += 1;
            match frame {
                Ok((message, fds)) => self.handle(message, fds),
                Err(e) => warn!("'{}': dropping malformed message: {}", self.name(), e),
            }
        }
        handled
    }

    fn handle(&mut self, message: Message, fds: Vec<OwnedFd>) {
        match message {
            Message::ProviderConnected => {
                info!("'{}': provider connected", self.name());
                self.provider_connected = true;
                if let Some(mut cb) = self.callbacks.provider_add.take() {
                    cb(self);
                    if self.callbacks.provider_add.is_none() {
                        self.callbacks.provider_add = Some(cb);
                    }
                }
            }
            Message::ProviderDisconnected => self.provider_gone(),
            Message::BufferAttached {
                serial,
                backend,
                width,
                height,
                format,
                flags,
                export,
            } => {
                let attachment = Attachment {
                    serial,
                    backend,
                    width,
                    height,
                    format,
                    flags,
                    export,
                };
                if let Err(e) = self.import(attachment, fds) {
                    warn!("'{}': could not import {}: {}", self.name(), serial, e);
                }
            }
            Message::BufferDetached { serial } => self.drop_import(serial),
            Message::BufferEnqueued { serial } => self.remote_enqueue(serial),
            other => warn!("'{}': unexpected {} from provider", self.name(), other.name()),
        }
    }

    fn import(&mut self, attachment: Attachment, fds: Vec<OwnedFd>) -> Result<()> {
        let serial = attachment.serial;
        if self.imports.contains_key(&serial) {
            return Err(Error::Protocol(format!("{} attached twice", serial)));
        }
        let mut fds: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        let export = attachment.export.unpack(&mut fds)?;
        self.queue.attach(serial)?;
        let handle = match self.ctx.buffer_import(
            &attachment.backend,
            attachment.width,
            attachment.height,
            attachment.format,
            export,
            attachment.flags,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.queue.detach(serial);
                return Err(e);
            }
        };
        self.imports.insert(serial, handle);
        self.serials.insert(handle, serial);
        debug!(
            "'{}': imported {} ({} {}x{} {})",
            self.name(),
            serial,
            attachment.backend,
            attachment.width,
            attachment.height,
            attachment.format
        );
        Ok(())
    }

    fn remote_enqueue(&mut self, serial: BufferSerial) {
        let result = if self.imports.contains_key(&serial) {
            self.queue.enqueue_remote(serial)
        } else {
            Err(Error::InvalidBuffer)
        };
        match result {
            Ok(()) => {
                if let Some(mut cb) = self.callbacks.buffer_enqueued.take() {
                    cb(self);
                    if self.callbacks.buffer_enqueued.is_none() {
                        self.callbacks.buffer_enqueued = Some(cb);
                    }
                }
            }
            Err(e) => {
                // Hand it straight back so the provider's slot does not leak
                warn!("'{}': rejecting {}: {}", self.name(), serial, e);
                if let Err(e) = self
                    .endpoint
                    .send(&Message::BufferReleased { serial }, Vec::new())
                {
                    warn!("'{}': failed to return {}: {}", self.name(), serial, e);
                }
            }
        }
    }

    fn drop_import(&mut self, serial: BufferSerial) {
        let state = self.queue.detach(serial);
        let Some(handle) = self.imports.remove(&serial) else {
            return;
        };
        self.serials.remove(&handle);
        if state == Some(SlotState::ConsumerOwned) {
            self.orphans.insert(handle);
        } else if let Err(e) = self.ctx.buffer_destroy(handle) {
            warn!("'{}': failed to free import {}: {}", self.name(), serial, e);
        }
    }

    fn provider_gone(&mut self) {
        if !self.provider_connected {
            return;
        }
        info!("'{}': provider disconnected", self.name());
        self.provider_connected = false;
        let serials: Vec<_> = self.imports.keys().copied().collect();
        for serial in serials {
            self.drop_import(serial);
        }
        if !self.orphans.is_empty() {
            debug!("'{}': {} buffers orphaned", self.name(), self.orphans.len());
        }

        if let Some(mut cb) = self.callbacks.provider_del.take() {
            cb(self);
            if self.callbacks.provider_del.is_none() {
                self.callbacks.provider_del = Some(cb);
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let handles: Vec<_> = self
            .imports
            .values()
            .chain(self.orphans.iter())
            .copied()
            .collect();
        for handle in handles {
            if let Err(e) = self.ctx.buffer_destroy(handle) {
                debug!("'{}': import {:?} already gone: {}", self.endpoint.name(), handle, e);
            }
        }
        debug!("'{}': consumer closed", self.endpoint.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::provider::{Acquired, Provider};
    use crate::queue::Acquirable;
    use crate::server::DisplayServer;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Two contexts on one broker and display server, like two processes
    fn pair() -> (SharedContext, SharedContext) {
        let broker = Broker::new();
        let server = DisplayServer::new();
        let a = SharedContext::new(broker.clone(), server.clone());
        let b = SharedContext::new(broker, server);
        a.init();
        b.init();
        (a, b)
    }

    fn new_buffer(ctx: &SharedContext) -> BufferHandle {
        ctx.buffer_create("shm", 64, 64, Format::Xrgb8888, 0).unwrap()
    }

    #[test]
    fn test_demo_queue_scenario() {
        let (pctx, cctx) = pair();
        let mut consumer = Consumer::new(&cctx, "demo", 2, 64, 64).unwrap();
        let mut provider = Provider::new(&pctx, "demo").unwrap();

        assert_eq!(provider.acquire().unwrap(), Acquired::NeedAlloc);
        let a = new_buffer(&pctx);
        provider.enqueue(a).unwrap();
        assert_eq!(provider.acquire().unwrap(), Acquired::NeedAlloc);
        let b = new_buffer(&pctx);
        provider.enqueue(b).unwrap();
        assert_eq!(provider.acquire().unwrap(), Acquired::Empty);

        let first = consumer.dequeue().unwrap().unwrap();
        let second = consumer.dequeue().unwrap().unwrap();
        assert!(consumer.dequeue().unwrap().is_none());
        assert_ne!(first, second);
        assert_eq!(cctx.buffer_size(first), Some((64, 64)));
        assert_eq!(cctx.buffer_format(second), Some(Format::Xrgb8888));

        consumer.release(first).unwrap();
        assert_eq!(provider.acquire().unwrap(), Acquired::Buffer(a));
    }

    #[test]
    fn test_fifo_across_endpoints() {
        let (pctx, cctx) = pair();
        let mut consumer = Consumer::new(&cctx, "fifo", 4, 32, 32).unwrap();
        let mut provider = Provider::new(&pctx, "fifo").unwrap();

        let mut sent = Vec::new();
        for width in [10, 20, 30, 40] {
            assert_eq!(provider.acquire().unwrap(), Acquired::NeedAlloc);
            let buffer = pctx.buffer_create("dri3", width, 8, Format::Argb8888, 0).unwrap();
            provider.enqueue(buffer).unwrap();
            sent.push(width);
        }
        let mut received = Vec::new();
        while let Some(buffer) = consumer.dequeue().unwrap() {
            received.push(cctx.buffer_size(buffer).unwrap().0);
        }
        assert_eq!(received, sent);
    }

    #[test]
    fn test_double_release_fails() {
        let (pctx, cctx) = pair();
        let mut consumer = Consumer::new(&cctx, "q", 2, 64, 64).unwrap();
        let mut provider = Provider::new(&pctx, "q").unwrap();
        provider.acquire().unwrap();
        provider.enqueue(new_buffer(&pctx)).unwrap();

        let buffer = consumer.dequeue().unwrap().unwrap();
        assert!(consumer.dequeue().unwrap().is_none());
        consumer.release(buffer).unwrap();
        assert!(matches!(consumer.release(buffer), Err(Error::NotOwnedByConsumer)));
    }

    #[test]
    fn test_enqueue_without_acquire_rejected() {
        let (pctx, cctx) = pair();
        let _consumer = Consumer::new(&cctx, "q", 2, 64, 64).unwrap();
        let mut provider = Provider::new(&pctx, "q").unwrap();
        assert!(matches!(
            provider.enqueue(new_buffer(&pctx)),
            Err(Error::NotAcquiredByThisProvider)
        ));
    }

    #[test]
    fn test_acquire_without_consumer() {
        let (pctx, _) = pair();
        let mut provider = Provider::new(&pctx, "lonely").unwrap();
        assert!(matches!(provider.acquire(), Err(Error::Disconnected)));
        assert_eq!(provider.queue_size(), 0);
    }

    #[test]
    fn test_callbacks_fire() {
        let (pctx, cctx) = pair();
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut consumer = Consumer::new(&cctx, "q", 3, 320, 240).unwrap();
        let l = log.clone();
        consumer.on_provider_add(move |_| l.borrow_mut().push("provider_add"));
        let l = log.clone();
        consumer.on_buffer_enqueued(move |c| {
            assert!(!c.is_empty());
            l.borrow_mut().push("enqueued");
        });

        let mut provider = Provider::new(&pctx, "q").unwrap();
        let l = log.clone();
        provider.on_buffer_released(move |_| l.borrow_mut().push("released"));

        // Announcements were queued before the provider could register
        assert!(provider.consumer_connected());
        assert_eq!(provider.queue_size(), 3);
        assert_eq!(provider.buffer_size(), (320, 240));

        consumer.dispatch();
        provider.acquire().unwrap();
        provider.enqueue(new_buffer(&pctx)).unwrap();
        consumer.dispatch();
        let buffer = consumer.dequeue().unwrap().unwrap();
        consumer.release(buffer).unwrap();
        provider.dispatch();

        assert_eq!(*log.borrow(), vec!["provider_add", "enqueued", "released"]);
    }

    #[test]
    fn test_consumer_add_reports_geometry() {
        let (pctx, cctx) = pair();
        let seen = Rc::new(Cell::new((0, 0, 0)));
        let mut provider = Provider::new(&pctx, "q").unwrap();
        let s = seen.clone();
        provider.on_consumer_add(move |p, size, w, h| {
            assert_eq!(p.acquirable_check().unwrap(), Acquirable::NeedAlloc);
            s.set((size, w, h));
        });

        let _consumer = Consumer::new(&cctx, "q", 2, 128, 64).unwrap();
        provider.dispatch();
        assert_eq!(seen.get(), (2, 128, 64));
    }

    #[test]
    fn test_buffer_size_set_reaches_provider() {
        let (pctx, cctx) = pair();
        let mut consumer = Consumer::new(&cctx, "q", 2, 64, 64).unwrap();
        let mut provider = Provider::new(&pctx, "q").unwrap();
        consumer.buffer_size_set(800, 600).unwrap();
        provider.dispatch();
        assert_eq!(provider.buffer_size(), (800, 600));
        assert_eq!(consumer.buffer_size(), (800, 600));
    }

    #[test]
    fn test_consumer_reconnect_reuses_buffers() {
        let (pctx, cctx) = pair();
        let deleted = Rc::new(Cell::new(false));
        let mut provider = Provider::new(&pctx, "q").unwrap();
        let d = deleted.clone();
        provider.on_consumer_del(move |_| d.set(true));

        let mut consumer = Consumer::new(&cctx, "q", 2, 64, 64).unwrap();
        provider.acquire().unwrap();
        let a = new_buffer(&pctx);
        provider.enqueue(a).unwrap();
        let held = consumer.dequeue().unwrap().unwrap();
        assert!(cctx.buffer_alive(held));

        drop(consumer);
        provider.dispatch();
        assert!(deleted.get());
        assert!(!cctx.buffer_alive(held));

        let mut consumer = Consumer::new(&cctx, "q", 2, 64, 64).unwrap();
        assert_eq!(provider.acquire().unwrap(), Acquired::Buffer(a));
        provider.enqueue(a).unwrap();
        let again = consumer.dequeue().unwrap().unwrap();
        assert_eq!(cctx.buffer_size(again), Some((64, 64)));
    }

    #[test]
    fn test_provider_leaves_orphans_held_buffers() {
        let (pctx, cctx) = pair();
        let mut consumer = Consumer::new(&cctx, "q", 2, 64, 64).unwrap();
        let mut provider = Provider::new(&pctx, "q").unwrap();
        for _ in 0..2 {
            provider.acquire().unwrap();
            provider.enqueue(new_buffer(&pctx)).unwrap();
        }
        let held = consumer.dequeue().unwrap().unwrap();
        let before = cctx.buffer_count();
        assert_eq!(before, 2);

        drop(provider);
        consumer.dispatch();
        assert!(!consumer.provider_connected());
        // The queued import is gone, the dequeued one stays usable
        assert_eq!(cctx.buffer_count(), 1);
        assert!(cctx.buffer_alive(held));
        assert!(consumer.is_empty());

        consumer.release(held).unwrap();
        assert!(!cctx.buffer_alive(held));
    }

    #[test]
    fn test_destroyed_buffer_detached() {
        let (pctx, cctx) = pair();
        let mut consumer = Consumer::new(&cctx, "q", 1, 64, 64).unwrap();
        let mut provider = Provider::new(&pctx, "q").unwrap();
        provider.acquire().unwrap();
        let a = new_buffer(&pctx);
        provider.enqueue(a).unwrap();
        let held = consumer.dequeue().unwrap().unwrap();
        consumer.release(held).unwrap();
        assert_eq!(provider.acquire().unwrap(), Acquired::Buffer(a));

        pctx.buffer_destroy(a).unwrap();
        assert_eq!(provider.acquire().unwrap(), Acquired::NeedAlloc);
        consumer.dispatch();
        assert!(!cctx.buffer_alive(held));
    }

    #[test]
    fn test_connection_loss_requests_exit() {
        let (pctx, cctx) = pair();
        let removed = Rc::new(Cell::new(false));
        let mut consumer = Consumer::new(&cctx, "q", 2, 64, 64).unwrap();
        let r = removed.clone();
        consumer.on_provider_del(move |_| r.set(true));
        let mut provider = Provider::new(&pctx, "q").unwrap();
        consumer.dispatch();

        pctx.broker().connection_lost();
        assert!(pctx.exit_requested());
        assert!(cctx.exit_requested());
        assert!(matches!(provider.acquire(), Err(Error::Disconnected)));
        assert!(matches!(consumer.dequeue(), Err(Error::Disconnected)));
        assert!(removed.get());
    }
}
