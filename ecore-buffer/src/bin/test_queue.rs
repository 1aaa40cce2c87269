//! Smoke test for the buffer queue and display sink
//!
//! Runs a provider and a consumer over an in-process broker, then scans a
//! few frames out on a virtual display. No hardware needed.

use ecore_buffer::drm::{Device, DisplayOptions, VirtualKms};
use ecore_buffer::{
    Acquired, Broker, Consumer, DisplayServer, DisplaySink, Format, Provider, SharedContext,
};

const QUEUE: &str = "smoke";

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("=== Buffer Queue Smoke Test ===\n");

    let broker = Broker::new();
    let server = DisplayServer::new();
    let provider_ctx = SharedContext::new(broker.clone(), server.clone());
    let consumer_ctx = SharedContext::new(broker, server);
    provider_ctx.init();
    consumer_ctx.init();

    println!("Connecting endpoints on '{}'...", QUEUE);
    let mut consumer = match Consumer::new(&consumer_ctx, QUEUE, 3, 320, 240) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to create consumer: {}", e);
            return;
        }
    };
    let mut provider = match Provider::new(&provider_ctx, QUEUE) {
        Ok(p) => p,
        Err(e) => {
            println!("Failed to create provider: {}", e);
            return;
        }
    };
    println!(
        "  Connected, queue size {}, buffer size {:?}",
        provider.queue_size(),
        provider.buffer_size()
    );

    // Test 1: one buffer per backend
    println!("\n--- Test 1: Hand over one buffer per backend ---");
    for backend in ["dri2", "dri3", "shm"] {
        let buffer = match provider.acquire() {
            Ok(Acquired::NeedAlloc) => {
                match provider_ctx.buffer_create(backend, 320, 240, Format::Argb8888, 0) {
                    Ok(b) => b,
                    Err(e) => {
                        println!("  {}: allocation failed: {}", backend, e);
                        continue;
                    }
                }
            }
            Ok(Acquired::Buffer(b)) => b,
            Ok(Acquired::Empty) => {
                println!("  {}: queue full", backend);
                continue;
            }
            Err(e) => {
                println!("  {}: acquire failed: {}", backend, e);
                continue;
            }
        };
        if let Err(e) = provider.enqueue(buffer) {
            println!("  {}: enqueue failed: {}", backend, e);
            continue;
        }
        match consumer.dequeue() {
            Ok(Some(imported)) => {
                if let Some(info) = consumer_ctx.buffer_info(imported) {
                    println!(
                        "  {}: received {}x{} {} via {}",
                        backend, info.width, info.height, info.format, info.backend
                    );
                }
                if let Err(e) = consumer.release(imported) {
                    println!("  {}: release failed: {}", backend, e);
                }
            }
            Ok(None) => println!("  {}: nothing queued", backend),
            Err(e) => println!("  {}: dequeue failed: {}", backend, e),
        }
    }

    // Test 2: scan frames out
    println!("\n--- Test 2: Present frames on a virtual display ---");
    let device = match Device::new(VirtualKms::with_outputs(2, 320, 240, 60), DisplayOptions::default()) {
        Ok(d) => d,
        Err(e) => {
            println!("Failed to open display: {}", e);
            return;
        }
    };
    for output in device.outputs() {
        println!(
            "  Output {} at {:?}, {}x{}",
            output.name(),
            output.position(),
            output.size().0,
            output.size().1
        );
    }
    let mut sink = DisplaySink::new(&consumer_ctx, device);
    for frame in 0..6 {
        if let Ok(Acquired::Buffer(buffer)) = provider.acquire() {
            if let Err(e) = provider.enqueue(buffer) {
                println!("  Frame {}: enqueue failed: {}", frame, e);
            }
        }
        match sink.present(&mut consumer) {
            Ok(true) => println!("  Frame {} presented", frame),
            Ok(false) => println!("  Frame {} skipped", frame),
            Err(e) => println!("  Frame {} failed: {}", frame, e),
        }
    }
    println!("  {} frames on screen", sink.frames());

    drop(sink);
    drop(provider);
    drop(consumer);
    provider_ctx.shutdown();
    consumer_ctx.shutdown();

    println!("\n=== Smoke test complete ===");
}
