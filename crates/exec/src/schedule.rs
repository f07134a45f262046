//! Scheduled tasks on the tokio clock.
//!
//! All timing goes through `tokio::time`, so tests can pause and advance the
//! clock (`#[tokio::test(start_paused = true)]`) and observe ticks
//! deterministically.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// A background task invoked every `period`, starting one period after spawn.
///
/// The task stops when [`stop`](Self::stop) is called or the handle drops.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut count = 0u64;
            loop {
                ticker.tick().await;
                count += 1;
                debug!(task = %task_name, tick = count, "periodic task tick");
                tick(count).await;
            }
        });
        Self { name, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(self) {}
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run `tick` immediately and then every `period` until `shutdown` fires.
///
/// Unlike [`PeriodicTask`] this runs in the caller's task; a tick is never
/// interrupted by shutdown, the loop exits before the next one.
pub async fn run_every<F, Fut>(period: Duration, shutdown: Arc<Notify>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => tick().await,
            _ = shutdown.notified() => break,
        }
    }
}

/// Periodic "still running" signal for a long step.
#[derive(Debug)]
pub struct Heartbeat {
    _task: PeriodicTask,
}

impl Heartbeat {
    /// Call `beat(elapsed)` every `period` until the heartbeat drops.
    pub fn start<F, Fut>(label: impl Into<String>, period: Duration, mut beat: F) -> Self
    where
        F: FnMut(Duration) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let label = format!("heartbeat:{}", label.into());
        let task = PeriodicTask::spawn(label, period, move |n| beat(period * n as u32));
        Self { _task: task }
    }
}
