//! Stall watchdog
//!
//! A tokio task that periodically checks how long the serial queue has been
//! waiting on the firmware. Past the timeout the in-flight instruction is
//! assumed lost and re-sent. When that keeps happening the transport is
//! closed, so the reader reopens it, and the communication is declared
//! failed.

use parking_lot::Mutex;
use printlink_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::queue::SerialQueue;
use crate::transport::Transport;

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Silence after which the in-flight instruction is assumed lost
    pub timeout: Duration,
    /// How often the queue is checked
    pub check_interval: Duration,
    /// Consecutive stalls tolerated before giving up
    pub max_stalls: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            check_interval: Duration::from_secs(1),
            max_stalls: 2,
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// The firmware answered recently or nothing is pending
    Healthy,
    /// Timed out, the in-flight instruction was re-sent
    Stalled(u32),
    /// Gave up on the conversation
    Failed,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Periodic staleness check of a [`SerialQueue`]
pub struct StallWatchdog {
    config: WatchdogConfig,
    queue: Arc<SerialQueue>,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<WatchdogState>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl StallWatchdog {
    /// Create a stopped watchdog
    pub fn new(
        config: WatchdogConfig,
        queue: Arc<SerialQueue>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            queue,
            transport,
            state: Arc::new(Mutex::new(WatchdogState::Healthy)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// State reported by the last check
    pub fn state(&self) -> WatchdogState {
        *self.state.lock()
    }

    /// Check the queue once
    pub fn check(&self) -> WatchdogState {
        let state = check_queue(&self.config, &self.queue, &*self.transport);
        *self.state.lock() = state;
        state
    }

    /// Start the periodic check on the current tokio runtime
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::other("Watchdog is already running"));
        }

        let (shutdown, mut stopped) = oneshot::channel();
        let config = self.config.clone();
        let queue = self.queue.clone();
        let transport = self.transport.clone();
        let state = self.state.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        // Closing the transport may block
                        let (config, queue, transport) =
                            (config.clone(), queue.clone(), transport.clone());
                        match tokio::task::spawn_blocking(move || {
                            check_queue(&config, &queue, &*transport)
                        })
                        .await
                        {
                            Ok(checked) => *state.lock() = checked,
                            Err(e) => tracing::warn!("Watchdog check failed: {}", e),
                        }
                    }
                }
            }
        });

        *running = Some(Running { shutdown, task });
        tracing::debug!("Stall watchdog started");
        Ok(())
    }

    /// Stop the periodic check
    pub async fn stop(&self) {
        if let Some(Running { shutdown, task }) = self.running.lock().await.take() {
            shutdown.send(()).ok();
            if let Err(e) = task.await {
                tracing::warn!("Watchdog task ended abnormally: {}", e);
            }
            tracing::debug!("Stall watchdog stopped");
        }
    }
}

fn check_queue(
    config: &WatchdogConfig,
    queue: &SerialQueue,
    transport: &dyn Transport,
) -> WatchdogState {
    let delay = queue.current_delay();
    if delay <= config.timeout {
        // Stays failed until a reconnect clears the failure
        if queue.has_failed() {
            return WatchdogState::Failed;
        }
        return WatchdogState::Healthy;
    }

    tracing::info!(
        "Timed out waiting for confirmation of {:?} after {:?}",
        queue.in_flight(),
        delay
    );
    let stalls = queue.record_stall();
    if stalls > config.max_stalls {
        tracing::warn!("Closing {}, the communication is stuck", transport.name());
        transport.close();
        queue.declare_failure(format!("{} consecutive stalls", stalls));
        return WatchdogState::Failed;
    }
    WatchdogState::Stalled(stalls)
}
