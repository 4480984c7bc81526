//! Tick loop driver.
//!
//! Each daemon hands the driver a [`Balancer`] and an interval. The driver
//! runs one tick at a time, tracks the consecutive-failure budget, sleeps
//! the interval between ticks, and watches the shutdown flag only between
//! ticks, never mid-tick.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use virtbal_gateway::GatewayError;

use crate::telemetry::{record, Severity};

/// Consecutive tick failures tolerated before the process aborts.
pub const MAX_FAILURES: u32 = 3;

/// Why a tick was abandoned.
#[derive(Debug, Error)]
pub enum TickError {
    /// A gateway call invalidated the tick.
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    /// A pipeline stage received an empty input it cannot schedule over.
    #[error("{0} is empty")]
    EmptyInput(&'static str),

    /// A data-corruption indicator; the tick aborts immediately.
    #[error("corrupted state: {0}")]
    Corrupt(String),
}

/// What a successful tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// First snapshot stored; there is no previous state to compare against.
    Warmup,

    /// Snapshots were not comparable; nothing was scheduled.
    Skipped,

    /// The scheduler ran but held back every commit.
    Held,

    /// Commits were applied.
    Balanced { commits: usize },
}

/// One daemon's per-tick pipeline.
pub trait Balancer {
    fn name(&self) -> &'static str;

    fn tick(&mut self) -> Result<TickReport, TickError>;
}

/// Loop-terminating failure.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("{failures} consecutive tick failures after {ticks} ticks")]
    FailureBudget { failures: u32, ticks: u64 },
}

/// Spawn the interrupt listener and return the flag it sets.
///
/// The flag flips once on the first Ctrl-C; the loop finishes its current
/// tick and exits cleanly.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(true);
            }
            Err(err) => {
                record(Severity::Error, format!("unable to listen for interrupt: {err}"));
            }
        }
        // Hold the sender so waiters never observe a closed channel.
        std::future::pending::<()>().await;
    });
    rx
}

/// Run `balancer` every `interval` until shutdown or budget exhaustion.
pub async fn run<B: Balancer>(
    balancer: &mut B,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LoopError> {
    record(
        Severity::Start,
        format!(
            "{} running every {} ms",
            balancer.name(),
            interval.as_millis()
        ),
    );

    let mut ticks: u64 = 0;
    let mut consecutive_failures: u32 = 0;

    while !*shutdown.borrow() {
        match balancer.tick() {
            Ok(report) => {
                consecutive_failures = 0;
                report_status(report);
            }
            Err(err) => {
                consecutive_failures += 1;
                record(
                    Severity::Error,
                    format!("tick {} abandoned: {err}", ticks + 1),
                );
                if consecutive_failures >= MAX_FAILURES {
                    record(
                        Severity::Abort,
                        "reached maximum consecutive failures; aborting",
                    );
                    return Err(LoopError::FailureBudget {
                        failures: consecutive_failures,
                        ticks: ticks + 1,
                    });
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        ticks += 1;
    }

    record(
        Severity::Stop,
        format!("{} interrupted; shutting down", balancer.name()),
    );
    Ok(())
}

fn report_status(report: TickReport) {
    match report {
        TickReport::Warmup => record(
            Severity::Status,
            "snapshot stored; scheduling deferred one interval",
        ),
        TickReport::Skipped => record(
            Severity::Status,
            "tick skipped: domain state not comparable across intervals",
        ),
        TickReport::Held => record(
            Severity::Status,
            "redistribution estimated unfavorable; nothing committed",
        ),
        TickReport::Balanced { commits } => {
            record(Severity::Status, format!("{commits} commits applied"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        outcomes: Vec<Result<TickReport, TickError>>,
        ticks_seen: usize,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<TickReport, TickError>>) -> Self {
            Self {
                outcomes,
                ticks_seen: 0,
            }
        }
    }

    impl Balancer for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn tick(&mut self) -> Result<TickReport, TickError> {
            let outcome = self.outcomes.remove(0);
            self.ticks_seen += 1;
            outcome
        }
    }

    fn corrupt() -> TickError {
        TickError::Corrupt("test".into())
    }

    #[tokio::test(start_paused = true)]
    async fn three_consecutive_failures_exhaust_the_budget() {
        let (_tx, rx) = watch::channel(false);
        let mut balancer = Scripted::new(vec![Err(corrupt()), Err(corrupt()), Err(corrupt())]);

        let result = run(&mut balancer, Duration::from_millis(10), rx).await;
        assert!(matches!(
            result,
            Err(LoopError::FailureBudget { failures: 3, .. })
        ));
        assert_eq!(balancer.ticks_seen, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_budget() {
        let (tx, rx) = watch::channel(false);
        let mut balancer = Scripted::new(vec![
            Err(corrupt()),
            Err(corrupt()),
            Ok(TickReport::Warmup),
            Err(corrupt()),
            Err(corrupt()),
            Err(corrupt()),
        ]);

        let result = run(&mut balancer, Duration::from_millis(10), rx).await;
        drop(tx);
        assert!(matches!(
            result,
            Err(LoopError::FailureBudget { failures: 3, .. })
        ));
        assert_eq!(balancer.ticks_seen, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_observed_between_ticks() {
        let (tx, rx) = watch::channel(false);
        let mut balancer = Scripted::new(vec![Ok(TickReport::Balanced { commits: 1 })]);

        tx.send(true).unwrap();
        let handle = run(&mut balancer, Duration::from_millis(10), rx);
        // Flag was raised before the first tick; the loop must exit without
        // ticking at all.
        assert!(handle.await.is_ok());
        assert_eq!(balancer.ticks_seen, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_after_a_tick_exits_cleanly() {
        let (tx, rx) = watch::channel(false);
        let balancer = Scripted::new(vec![Ok(TickReport::Held)]);

        let driver = tokio::spawn(async move {
            let mut balancer = balancer;
            let result = run(&mut balancer, Duration::from_secs(3600), rx).await;
            (result, balancer.ticks_seen)
        });

        // Give the first tick a chance to run, then interrupt the sleep.
        tokio::time::sleep(Duration::from_millis(1)).await;
        tx.send(true).unwrap();

        let (result, ticks_seen) = driver.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(ticks_seen, 1);
    }
}
