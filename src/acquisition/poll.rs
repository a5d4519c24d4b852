//! Status polling primitive.
//!
//! Every "wait until task X has finished" step in the sequencer is the same loop:
//! fetch the status word, test a predicate, otherwise sleep one poll interval unless a
//! stop arrives first. There is no overall timeout here; a caller that
//! needs one wraps the call in `tokio::time::timeout`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::AppResult;
use crate::hardware::marccd::status::{StatusWord, TaskKind};

use super::stop::StopSignal;

/// Anything that can produce a fresh status word.
#[async_trait]
pub trait StatusSource: Send {
    /// Fetch and decode the current status.
    async fn fetch_status(&mut self) -> AppResult<StatusWord>;
}

/// How a poll loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held; carries the status that satisfied it
    Satisfied(StatusWord),
    /// A stop was observed before the predicate held
    Cancelled,
}

/// Poll `source` until `predicate` holds or `stop` fires.
///
/// The first fetch happens immediately; a predicate that already holds returns
/// without sleeping. Once a stop is observed no further fetch is made.
pub async fn poll_until<S, P>(
    source: &mut S,
    mut predicate: P,
    interval: Duration,
    stop: &StopSignal,
) -> AppResult<PollOutcome>
where
    S: StatusSource + ?Sized,
    P: FnMut(&StatusWord) -> bool + Send,
{
    loop {
        let status = source.fetch_status().await?;
        if predicate(&status) {
            return Ok(PollOutcome::Satisfied(status));
        }
        trace!("Polled {}, not ready", status);
        if stop.wait_timeout(interval).await {
            return Ok(PollOutcome::Cancelled);
        }
    }
}

/// Predicate: `task` is neither queued nor executing and the server is not busy.
pub fn task_settled(task: TaskKind) -> impl FnMut(&StatusWord) -> bool + Send {
    move |status| status.is_settled(task)
}

/// Predicate: `task` is executing and the server is not busy.
pub fn task_executing(task: TaskKind) -> impl FnMut(&StatusWord) -> bool + Send {
    move |status| status.is_executing(task) && !status.is_busy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Replays a fixed list of status words, repeating the last one.
    struct Scripted {
        words: VecDeque<u32>,
        last: u32,
        fetches: usize,
    }

    impl Scripted {
        fn new(words: &[u32]) -> Self {
            Self {
                words: words.iter().copied().collect(),
                last: 0,
                fetches: 0,
            }
        }
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn fetch_status(&mut self) -> AppResult<StatusWord> {
            self.fetches += 1;
            if let Some(word) = self.words.pop_front() {
                self.last = word;
            }
            Ok(StatusWord::decode(self.last))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_true_returns_on_first_fetch_without_sleeping() {
        let mut source = Scripted::new(&[0x20]);
        let stop = StopSignal::new();
        let start = Instant::now();

        let outcome = poll_until(&mut source, |_| true, Duration::from_secs(5), &stop)
            .await
            .unwrap();

        assert!(matches!(outcome, PollOutcome::Satisfied(_)));
        assert_eq!(source.fetches, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_readout_to_clear() {
        // readout queued, executing, then idle
        let mut source = Scripted::new(&[0x102, 0x202, 0x0]);
        let stop = StopSignal::new();

        let outcome = poll_until(
            &mut source,
            task_settled(TaskKind::Readout),
            Duration::from_millis(10),
            &stop,
        )
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Satisfied(StatusWord::decode(0)));
        assert_eq!(source.fetches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_state_is_not_settled() {
        let mut source = Scripted::new(&[0x8, 0x9, 0x0]);
        let stop = StopSignal::new();

        poll_until(
            &mut source,
            task_settled(TaskKind::Acquire),
            Duration::from_millis(10),
            &stop,
        )
        .await
        .unwrap();
        assert_eq!(source.fetches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_poll_without_further_fetches() {
        let mut source = Scripted::new(&[0x20]);
        let stop = Arc::new(StopSignal::new());
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            trigger.trigger();
        });

        let outcome = poll_until(&mut source, |_| false, Duration::from_millis(10), &stop)
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
        let fetches = source.fetches;
        assert!(fetches >= 3 && fetches <= 5, "fetches = {}", fetches);
        assert!(!stop.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_stop_cancels_after_single_fetch() {
        let mut source = Scripted::new(&[0x20]);
        let stop = StopSignal::new();
        stop.trigger();

        let outcome = poll_until(&mut source, |_| false, Duration::from_secs(1), &stop)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(source.fetches, 1);
    }

    #[test]
    fn test_task_executing_predicate() {
        let mut executing = task_executing(TaskKind::Acquire);
        assert!(executing(&StatusWord::decode(0x21)));
        assert!(!executing(&StatusWord::decode(0x10)));
        assert!(!executing(&StatusWord::decode(0x28)));
    }
}
