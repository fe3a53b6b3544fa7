//! Supervisor - restarts a long-running task with exponential backoff
//!
//! The client core never reconnects by itself: a lost connection stops the
//! idle monitor and is reported once. This module is the layer above that
//! decides to try again. All retry logic lives here.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::MpdClient;

/// Retry configuration for the supervised task
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retry attempts
    pub initial_delay: Duration,
    /// Maximum delay (backoff caps at this value)
    pub max_delay: Duration,
    /// If the task runs for at least this long before failing,
    /// the backoff delay resets to initial_delay
    pub stable_run_threshold: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            stable_run_threshold: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }
}

/// Context passed to the task on every attempt
pub struct SupervisorContext {
    /// Cancelled when the supervisor is asked to stop
    pub shutdown: CancellationToken,
}

/// A task the supervisor can (re)start.
#[async_trait]
pub trait Supervised: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run until shutdown (`Ok`) or failure (`Err`, retried after a backoff).
    async fn run(&self, ctx: SupervisorContext) -> Result<()>;
}

/// Runs a [`Supervised`] task until shutdown, retrying on error.
pub struct Supervisor<T: Supervised> {
    task: Arc<T>,
    shutdown: CancellationToken,
}

impl<T: Supervised> Supervisor<T> {
    pub fn new(task: T, shutdown: CancellationToken) -> Self {
        Self {
            task: Arc::new(task),
            shutdown,
        }
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    /// When `run()` returns `Err`, waits with exponential backoff and retries.
    /// When `run()` returns `Ok`, exits cleanly.
    pub async fn run_with_retry(self, config: RetryConfig) -> Result<()> {
        let name = self.task.name();
        let mut delay = config.initial_delay;

        loop {
            if self.shutdown.is_cancelled() {
                info!("{}: shutdown before attempt", name);
                break;
            }

            info!("{}: starting (retry delay: {:?})", name, delay);

            let start = Instant::now();
            let ctx = SupervisorContext {
                shutdown: self.shutdown.clone(),
            };
            match self.task.run(ctx).await {
                Ok(()) => {
                    info!("{}: clean exit", name);
                    break;
                }
                Err(e) => {
                    let run_duration = start.elapsed();

                    if run_duration >= config.stable_run_threshold {
                        info!(
                            "{}: ran for {:?} before failure, resetting backoff",
                            name, run_duration
                        );
                        delay = config.initial_delay;
                    }

                    warn!("{}: error ({}), retrying in {:?}", name, e, delay);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            info!("{}: shutdown during backoff", name);
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {
                            delay = (delay * 2).min(config.max_delay);
                        }
                    }
                }
            }
        }

        info!("{}: stopped", name);
        Ok(())
    }
}

/// Keeps a client connected with its idle monitor running.
///
/// One attempt is: connect, start the monitor, wait until the monitor stops
/// (connection lost) or shutdown is requested.
pub struct MonitorTask {
    client: Arc<MpdClient>,
}

impl MonitorTask {
    pub fn new(client: Arc<MpdClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Supervised for MonitorTask {
    fn name(&self) -> &'static str {
        "mpd-monitor"
    }

    async fn run(&self, ctx: SupervisorContext) -> Result<()> {
        tokio::select! {
            result = self.client.ensure_connected() => {
                if let Err(e) = result {
                    if e.ack().is_some() {
                        error!("MPD rejected the connection: {}", e);
                    }
                    return Err(e.into());
                }
            }
            _ = ctx.shutdown.cancelled() => return Ok(()),
        }

        self.client.start_idle_monitor()?;
        if let Err(e) = self.client.refresh_statistics().await {
            warn!("Could not read database statistics: {}", e);
        }

        tokio::select! {
            _ = self.client.wait_idle_monitor_stopped() => {
                Err(anyhow::anyhow!("idle monitor stopped, connection lost"))
            }
            _ = ctx.shutdown.cancelled() => {
                self.client.disconnect().await;
                Ok(())
            }
        }
    }
}
