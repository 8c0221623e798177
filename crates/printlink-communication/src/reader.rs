//! Serial reader worker
//!
//! A dedicated thread reads lines from the transport and routes them. While
//! the transport is closed it keeps trying to reopen it.

use printlink_core::{ConnectionEvent, EventBus, LinkEvent};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::router::LineRouter;
use crate::transport::Transport;

/// Handle of the running reader thread
pub struct LineReader {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LineReader {
    /// Start reading from `transport` on a new thread
    pub fn spawn(
        transport: Arc<dyn Transport>,
        router: Arc<LineRouter>,
        bus: Arc<EventBus>,
        reopen_interval: Duration,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("printlink-reader".to_string())
            .spawn(move || read_loop(&*transport, &router, &bus, &flag, reopen_interval))?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Whether the thread is still supposed to run
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the thread and wait for it
    ///
    /// Returns within one read timeout of the transport.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Reader thread panicked");
            }
        }
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(
    transport: &dyn Transport,
    router: &LineRouter,
    bus: &EventBus,
    running: &AtomicBool,
    reopen_interval: Duration,
) {
    tracing::debug!("Reader started on {}", transport.name());
    while running.load(Ordering::SeqCst) {
        if !transport.is_open() {
            match transport.open() {
                Ok(()) => {
                    bus.publish(LinkEvent::Connection(ConnectionEvent::Opened {
                        port: transport.name(),
                    }))
                    .ok();
                }
                Err(e) => {
                    tracing::debug!("Cannot open {}: {}", transport.name(), e);
                    thread::sleep(reopen_interval);
                    continue;
                }
            }
        }

        match transport.read_line() {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::trace!("Received {:?}", line);
                router.route(line);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Reading from {} failed: {}", transport.name(), e);
                transport.close();
                bus.publish(LinkEvent::Connection(ConnectionEvent::Lost {
                    port: transport.name(),
                    reason: e.to_string(),
                }))
                .ok();
            }
        }
    }
    tracing::debug!("Reader stopped on {}", transport.name());
}
