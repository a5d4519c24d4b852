//! Software exposure timer.
//!
//! While the server integrates, the driver holds the shutter open for the exposure
//! time and reports the remaining time. The countdown races the stop signal: it wakes
//! every tick to publish progress and ends early the moment a stop arrives. It never
//! talks to the server; closing the shutter after an early stop is the caller's job.

use std::time::Duration;

use tokio::time::Instant;

use super::stop::StopSignal;

/// How an exposure ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExposureOutcome {
    /// Full exposure time elapsed
    Completed,
    /// Stopped early
    Aborted {
        /// Exposure time that was left
        remaining: Duration,
    },
}

/// Count down `duration`, calling `on_tick` with the remaining time after every wake.
///
/// `tick` bounds the latency of both progress updates and stop handling.
pub async fn run_exposure<F>(
    duration: Duration,
    tick: Duration,
    stop: &StopSignal,
    mut on_tick: F,
) -> ExposureOutcome
where
    F: FnMut(Duration) + Send,
{
    let deadline = Instant::now() + duration;
    loop {
        let wait = tick.min(deadline.saturating_duration_since(Instant::now()));
        if stop.wait_timeout(wait).await {
            return ExposureOutcome::Aborted {
                remaining: deadline.saturating_duration_since(Instant::now()),
            };
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        on_tick(remaining);
        if remaining.is_zero() {
            return ExposureOutcome::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_full_exposure_reports_countdown() {
        let stop = StopSignal::new();
        let mut ticks = Vec::new();
        let start = Instant::now();

        let outcome = run_exposure(
            Duration::from_millis(100),
            Duration::from_millis(25),
            &stop,
            |remaining| ticks.push(remaining),
        )
        .await;

        assert_eq!(outcome, ExposureOutcome::Completed);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(ticks.len(), 4);
        assert!(ticks.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(ticks.last(), Some(&Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_length_exposure_completes_immediately() {
        let stop = StopSignal::new();
        let mut ticks = 0;
        let outcome =
            run_exposure(Duration::ZERO, Duration::from_millis(10), &stop, |_| ticks += 1).await;
        assert_eq!(outcome, ExposureOutcome::Completed);
        assert_eq!(ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cuts_exposure_short() {
        let stop = Arc::new(StopSignal::new());
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.trigger();
        });

        let start = Instant::now();
        let outcome = run_exposure(
            Duration::from_secs(10),
            Duration::from_millis(10),
            &stop,
            |_| {},
        )
        .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed <= Duration::from_secs(3) + Duration::from_millis(10));
        match outcome {
            ExposureOutcome::Aborted { remaining } => {
                assert!(remaining >= Duration::from_millis(6990));
                assert!(remaining <= Duration::from_secs(7));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
