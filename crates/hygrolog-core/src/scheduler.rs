//! Poll and retention loops.
//!
//! The [`Scheduler`] owns two long-lived tasks:
//!
//! - the poll loop runs one [`Collector::collect`] cycle, sleeps for the
//!   poll interval and repeats. Cycles are awaited in turn, so they never
//!   overlap.
//! - the retention loop deletes readings older than the retention window,
//!   once at start-up and then every retention period.
//!
//! The loops share nothing but the sink. Errors inside a cycle or a sweep
//! are logged and never end a loop. A loop that ends anyway (a panic) stops
//! the scheduler with [`HygrologError::SchedulerStopped`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::acquisition::Acquirer;
use crate::collector::{Collector, CycleReport};
use crate::config::{HygrologConfig, ScheduleConfig};
use crate::error::{HygrologError, Result};
use crate::shutdown::Shutdown;
use crate::storage::{run_blocking, ReadingSink};
use crate::transport::Transport;

/// Drives the poll and retention loops until shutdown.
#[derive(Debug)]
pub struct Scheduler<T, S> {
    collector: Arc<Collector<T, S>>,
    schedule: ScheduleConfig,
}

impl<T: Transport, S: ReadingSink> Scheduler<T, S> {
    /// Create a scheduler around `collector`.
    pub fn new(collector: Collector<T, S>, schedule: ScheduleConfig) -> Self {
        Self {
            collector: Arc::new(collector),
            schedule,
        }
    }

    /// Run both loops until `shutdown` fires, then drain.
    ///
    /// The poll loop gets up to the drain timeout to finish in-flight
    /// teardown before it is aborted.
    ///
    /// # Errors
    ///
    /// Returns [`HygrologError::SchedulerStopped`] if either loop ends before
    /// shutdown. The other loop is stopped first.
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        info!(
            poll_interval_secs = self.schedule.poll_interval_secs,
            retention_days = self.schedule.retention_days,
            "Scheduler started"
        );

        let mut poll = tokio::spawn(poll_loop(
            Arc::clone(&self.collector),
            self.schedule.poll_interval(),
            shutdown.clone(),
        ));
        let mut retention = tokio::spawn(retention_loop(
            Arc::clone(self.collector.sink()),
            self.schedule.retention_window(),
            self.schedule.retention_period(),
            shutdown.clone(),
        ));

        tokio::select! {
            () = shutdown.cancelled() => {}
            result = &mut poll => {
                stop(retention, "Retention loop").await;
                return Err(stopped_early("Poll loop", result));
            }
            result = &mut retention => {
                stop(poll, "Poll loop").await;
                return Err(stopped_early("Retention loop", result));
            }
        }
        info!("Shutdown requested, draining poll loop");

        let drain = self.schedule.drain_timeout();
        match timeout(drain, &mut poll).await {
            Ok(Ok(())) => debug!("Poll loop stopped"),
            Ok(Err(e)) => error!(error = %e, "Poll loop terminated abnormally"),
            Err(_) => {
                warn!(
                    drain_timeout_secs = drain.as_secs(),
                    "Poll loop did not stop in time; aborting"
                );
                poll.abort();
            }
        }

        stop(retention, "Retention loop").await;
        info!("Scheduler stopped");
        Ok(())
    }
}

async fn stop(task: JoinHandle<()>, name: &'static str) {
    task.abort();
    match task.await {
        Err(e) if e.is_panic() => error!(task = name, error = %e, "Task panicked"),
        _ => debug!(task = name, "Task stopped"),
    }
}

fn stopped_early(
    name: &'static str,
    result: std::result::Result<(), JoinError>,
) -> HygrologError {
    let reason = match result {
        Ok(()) => "exited before shutdown".to_string(),
        Err(e) => e.to_string(),
    };
    error!(task = name, %reason, "Loop stopped before shutdown; stopping scheduler");
    HygrologError::SchedulerStopped(format!("{name} {reason}"))
}

async fn poll_loop<T: Transport, S: ReadingSink>(
    collector: Arc<Collector<T, S>>,
    interval: Duration,
    shutdown: Shutdown,
) {
    loop {
        let report = collector.collect(&shutdown).await;
        if matches!(report, CycleReport::Cancelled { .. }) {
            break;
        }

        info!(next_poll_secs = interval.as_secs(), "Waiting for next poll");
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

async fn retention_loop<S: ReadingSink>(
    sink: Arc<S>,
    window: chrono::Duration,
    period: Duration,
    shutdown: Shutdown,
) {
    // The first tick completes immediately.
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(cutoff) = Utc::now().checked_sub_signed(window) else {
            error!(
                retention_days = window.num_days(),
                "Retention window reaches past the earliest representable time; skipping sweep"
            );
            continue;
        };

        let sweeper = Arc::clone(&sink);
        let sweep = run_blocking(move || sweeper.delete_older_than(cutoff));
        match sweep.await {
            Ok(deleted) => info!(deleted, %cutoff, "Retention sweep complete"),
            Err(e) => error!(error = %e, "Retention sweep failed"),
        }
    }
}

/// Run the logger until `shutdown` fires.
///
/// Validates `config`, wires the acquirer, collector and scheduler together
/// and blocks until both loops have stopped.
///
/// # Errors
///
/// Returns [`HygrologError::ConfigurationInvalid`] if the configuration is
/// unusable. No loop is started in that case. Returns
/// [`HygrologError::SchedulerStopped`] if a loop dies before shutdown.
pub async fn run<T: Transport, S: ReadingSink>(
    config: &HygrologConfig,
    transport: T,
    sink: Arc<S>,
    shutdown: Shutdown,
) -> Result<()> {
    config.validate()?;
    let target = config.sensor_target()?;
    info!(
        address = %target.address,
        characteristic = %target.characteristic,
        "Polling sensor"
    );

    let acquirer = Acquirer::new(transport, target, config.acquisition.timeouts());
    let collector = Collector::new(acquirer, sink, config.acquisition.retry_policy());
    Scheduler::new(collector, config.schedule.clone())
        .run(shutdown)
        .await
}
