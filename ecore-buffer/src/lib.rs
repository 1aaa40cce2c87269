//! Producer/consumer graphics buffer queue with DRM/KMS output
//!
//! A provider renders into buffers and hands them to a consumer through a
//! named, bounded queue. Buffers cross the process boundary by export
//! (pixmap ID or file descriptor) and are imported on the other side. A
//! consumer can feed a [`DisplaySink`], which scans buffers out on every
//! connected output and returns them once the next frame has landed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                    ┌──────────────────────┐
//! │      Provider        │                    │      Consumer        │
//! │  acquire / enqueue   │                    │  dequeue / release   │
//! │  ┌────────────────┐  │                    │  ┌────────────────┐  │
//! │  │  BufferQueue   │  │                    │  │  BufferQueue   │  │
//! │  │ (local mirror) │  │                    │  │ (local mirror) │  │
//! │  └────────────────┘  │                    │  └────────────────┘  │
//! └──────────┬───────────┘                    └──────────┬───────────┘
//!            │        Message frames + fds (Broker)      │
//!            └───────────────────┬───────────────────────┘
//!                                │
//! ┌──────────────────────────────┴──────────────────────────────┐
//! │                      SharedContext                          │
//! │  ┌────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//! │  │  Backends  │  │ Buffer arena │  │   DisplayServer     │  │
//! │  │ dri2/3,shm │  │  (handles)   │  │ (bo + pixmap ids)   │  │
//! │  └────────────┘  └──────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                                │
//!                          DisplaySink
//!                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │     drm::Device  (outputs, framebuffers, page flips)        │
//! │                 over a KmsDriver (VirtualKms)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ecore_buffer::{Acquired, Broker, Consumer, DisplayServer, Format, Provider, SharedContext};
//!
//! let ctx = SharedContext::new(Broker::new(), DisplayServer::new());
//! ctx.init();
//! let mut consumer = Consumer::new(&ctx, "frames", 2, 640, 480)?;
//! let mut provider = Provider::new(&ctx, "frames")?;
//!
//! if let Acquired::NeedAlloc = provider.acquire()? {
//!     let buffer = ctx.buffer_create("shm", 640, 480, Format::Xrgb8888, 0)?;
//!     provider.enqueue(buffer)?;
//! }
//! if let Some(buffer) = consumer.dequeue()? {
//!     consumer.release(buffer)?;
//! }
//! ```

mod arena;
pub mod backend;
pub mod broker;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod context;
pub mod drm;
pub mod error;
pub mod format;
pub mod protocol;
pub mod provider;
pub mod queue;
mod registry;
pub mod server;
pub mod sink;

pub use backend::{Backend, BackendOptions, Export, ExportKind, Native};
pub use broker::{Broker, Endpoint, Role};
pub use buffer::{BufferHandle, BufferInfo, CallbackId, Teardown};
pub use config::Config;
pub use consumer::Consumer;
pub use context::SharedContext;
pub use error::Error;
pub use format::Format;
pub use provider::{Acquired, Provider};
pub use queue::{Acquirable, BufferSerial, ReturnCode, DEFAULT_QUEUE_SIZE};
pub use server::DisplayServer;
pub use sink::DisplaySink;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
