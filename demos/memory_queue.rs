//! Work-queue example using the in-memory router.
//!
//! Demonstrates a producer and two consumers in a single process: one
//! consumer pulls with blocking receives and client acknowledgment, the
//! other is driven by a message listener. Halfway through, the connection is
//! dropped and restored to show transparent resubmission and duplicate
//! suppression.
//!
//! Run with: cargo run --example memory_queue

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

use mom_queue::{AckMode, ConnectionBuilder, ListenerError, MemoryRouter, Message, MessageListener, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let router = MemoryRouter::new();

    let worker_link = router.connect("worker");
    let worker = ConnectionBuilder::new(worker_link.clone())
        .request_timeout(Duration::from_secs(5))
        .prefetch_messages(4)
        .build()?;

    let audit = ConnectionBuilder::new(router.connect("audit"))
        .prefetch_messages(16)
        .build()?;

    // Listener-driven consumer on its own connection.
    let audited = Arc::new(AtomicUsize::new(0));
    let audit_session = audit.create_session(AckMode::Auto)?;
    let audit_consumer = audit_session.create_consumer("audit")?;
    let counter = audited.clone();
    let listener: Arc<dyn MessageListener> =
        Arc::new(move |message: Message| -> std::result::Result<(), ListenerError> {
            counter.fetch_add(1, Ordering::Relaxed);
            println!("audit  <- {}", String::from_utf8_lossy(message.payload()));
            Ok(())
        });
    audit_consumer.set_message_listener(Some(listener))?;

    // Producer and pulling consumer share the worker connection.
    let session = worker.create_session(AckMode::Client)?;
    let jobs = session.create_producer("jobs")?;
    let log = session.create_producer("audit")?.with_flow_hint(Arc::new(Duration::from_millis(5)));
    let consumer = session.create_consumer("jobs")?;

    for i in 0..8 {
        jobs.send(format!("job-{i}"))?;
    }

    let mut handled = 0;
    while let Some(message) = consumer.receive_timeout(Duration::from_millis(300))? {
        let text = String::from_utf8_lossy(message.payload()).into_owned();
        println!("worker <- {text} (index {})", message.index());
        consumer.acknowledge(message.ack_target())?;
        log.send(format!("done {text}"))?;
        handled += 1;

        if handled == 3 {
            println!("-- dropping the worker connection --");
            worker_link.simulate_loss("demo link reset");
            worker_link.simulate_reconnect();
            while worker.retry_signal().is_none() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    let stats = consumer.stats();
    println!(
        "worker handled {handled} jobs: {} delivered, {} duplicates suppressed, {} refills",
        stats.delivered, stats.suppressed, stats.refills
    );
    if let Some(signal) = worker.retry_signal() {
        signal.wait_timeout(Duration::from_secs(1));
    }

    std::thread::sleep(Duration::from_millis(100));
    println!("audit saw {} entries", audited.load(Ordering::Relaxed));

    worker.close()?;
    audit.close()?;
    Ok(())
}
