//! Demo state and frame loop

use std::time::Duration;

use anyhow::{anyhow, Result};
use calloop::timer::{TimeoutAction, Timer};
use calloop::EventLoop;
use ecore_buffer::drm::{Device, VirtualKms};
use ecore_buffer::{
    Acquired, Broker, Config, Consumer, DisplayServer, DisplaySink, Error, Provider,
    SharedContext,
};
use tracing::{debug, error, info, warn};

use crate::render;

const FRAME_INTERVAL: Duration = Duration::from_millis(16);

struct Demo {
    sink: DisplaySink<VirtualKms>,
    provider: Provider,
    consumer: Consumer,
    provider_ctx: SharedContext,
    consumer_ctx: SharedContext,
    config: Config,
    rendered: u64,
    target: u64,
    hotplugged: bool,
}

impl Demo {
    fn new(config: Config, target: u64, outputs: usize) -> Result<Self> {
        let broker = Broker::new();
        let server = DisplayServer::new();
        let provider_ctx = SharedContext::new(broker.clone(), server.clone());
        let consumer_ctx = SharedContext::new(broker, server);
        for ctx in [&provider_ctx, &consumer_ctx] {
            for (name, options) in &config.backends {
                ctx.set_backend_options(name, options.clone());
            }
            ctx.init();
        }
        if !provider_ctx.has_backend(&config.queue.backend) {
            return Err(anyhow!("Backend '{}' is not available", config.queue.backend));
        }

        let queue = &config.queue;
        let consumer = Consumer::new(&consumer_ctx, &queue.name, queue.size, queue.width, queue.height)?;
        let provider = Provider::new(&provider_ctx, &queue.name)?;
        info!(
            "Queue '{}' connected: {} buffers of {}x{} {} from {}",
            queue.name,
            provider.queue_size(),
            queue.width,
            queue.height,
            queue.format,
            queue.backend
        );

        let driver = VirtualKms::with_outputs(outputs, 1280, 720, 60);
        let device = Device::new(driver, config.display.options())?;
        for output in device.outputs() {
            info!(
                "Output {} at {:?}: {}x{}@{}",
                output.name(),
                output.position(),
                output.size().0,
                output.size().1,
                output.mode().vrefresh
            );
        }
        let sink = DisplaySink::new(&consumer_ctx, device);

        Ok(Self {
            sink,
            provider,
            consumer,
            provider_ctx,
            consumer_ctx,
            config,
            rendered: 0,
            target,
            hotplugged: false,
        })
    }

    /// Render, hand over and present one frame; `false` once done
    fn tick(&mut self) -> bool {
        self.provider.dispatch();
        self.consumer.dispatch();
        if self.provider_ctx.exit_requested() || self.consumer_ctx.exit_requested() {
            warn!("Connection lost, stopping");
            return false;
        }

        if !self.hotplugged && self.rendered >= self.target / 2 {
            self.hotplug();
        }

        if let Err(e) = self.produce() {
            error!("Provider error: {:?}", e);
        }

        match self.sink.present(&mut self.consumer) {
            Ok(true) => debug!("Presented, {} frames on screen", self.sink.frames()),
            Ok(false) => {}
            Err(Error::FlipTimeout) => warn!("Display is slow, frame still in flight"),
            Err(e) => error!("Present failed: {}", e),
        }

        self.sink.frames() < self.target
    }

    fn produce(&mut self) -> Result<()> {
        let buffer = match self.provider.acquire()? {
            Acquired::Buffer(buffer) => buffer,
            Acquired::NeedAlloc => {
                let (width, height) = self.provider.buffer_size();
                let queue = &self.config.queue;
                let buffer = self.provider_ctx.buffer_create(
                    &queue.backend,
                    width,
                    height,
                    queue.format,
                    0,
                )?;
                debug!("Allocated {:?} ({}x{})", buffer, width, height);
                buffer
            }
            Acquired::Empty => return Ok(()),
        };
        render::draw(&self.provider_ctx, buffer, self.rendered)?;
        self.provider.enqueue(buffer)?;
        self.rendered += 1;
        Ok(())
    }

    /// Plug in one more display halfway through
    fn hotplug(&mut self) {
        self.hotplugged = true;
        let device = self.sink.device_mut();
        device.driver_mut().add_connector(1920, 1080, 60);
        match device.outputs_update() {
            Ok(changes) => {
                for id in &changes.added {
                    if let Some(output) = device.output(*id) {
                        info!(
                            "Hotplugged {} at {:?} (cloned: {})",
                            output.name(),
                            output.position(),
                            output.is_cloned()
                        );
                    }
                }
            }
            Err(e) => error!("Output update failed: {}", e),
        }
    }
}

pub fn run(config: Config, frames: u64, outputs: usize) -> Result<()> {
    let mut demo = Demo::new(config, frames, outputs)?;

    let mut event_loop: EventLoop<'static, Demo> =
        EventLoop::try_new().map_err(|e| anyhow!("Failed to create event loop: {:?}", e))?;
    let signal = event_loop.get_signal();

    event_loop
        .handle()
        .insert_source(Timer::immediate(), move |_, _, demo| {
            if demo.tick() {
                TimeoutAction::ToDuration(FRAME_INTERVAL)
            } else {
                signal.stop();
                TimeoutAction::Drop
            }
        })
        .map_err(|e| anyhow!("Failed to insert frame timer: {:?}", e))?;

    info!("Entering event loop");
    event_loop
        .run(None, &mut demo, |_| {})
        .map_err(|e| anyhow!("Event loop error: {:?}", e))?;

    info!(
        "Done: {} frames rendered, {} presented",
        demo.rendered,
        demo.sink.frames()
    );
    Ok(())
}
