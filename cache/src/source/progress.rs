//! Rate-limited transfer progress.

use std::num::NonZeroU32;
use std::time::Duration;

use a3s_build_core::{ProgressEmitter, VertexStatus};
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Emits transfer progress for one stream id.
///
/// A started status is emitted on creation. Updates are dropped while the
/// limiter has no capacity; the final update is always emitted and carries
/// the completion time.
pub struct ProgressHandler {
    emitter: ProgressEmitter,
    limiter: DefaultDirectRateLimiter,
    status: VertexStatus,
    done: bool,
}

impl ProgressHandler {
    pub fn new(emitter: ProgressEmitter, id: impl Into<String>, interval: Duration) -> Self {
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));
        let status = VertexStatus::started(id, "transferring");
        emitter.emit(status.clone());
        Self {
            emitter,
            limiter: RateLimiter::direct(quota),
            status,
            done: false,
        }
    }

    /// Report `current` bytes transferred so far.
    pub fn update(&mut self, current: u64, last: bool) {
        if self.done {
            return;
        }
        if !last && self.limiter.check().is_err() {
            return;
        }

        let now = Utc::now();
        self.status.current = current;
        self.status.timestamp = now;
        if last {
            self.status.completed = Some(now);
            self.done = true;
        }
        self.emitter.emit(self.status.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn test_bursts_are_rate_limited() {
        let emitter = ProgressEmitter::new(1024);
        let mut rx = emitter.subscribe();
        let mut handler =
            ProgressHandler::new(emitter.clone(), "transferring ctx:", Duration::from_secs(60));

        for n in 1..=100 {
            handler.update(n * 10, false);
        }
        handler.update(1000, true);

        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(status) => events.push(status),
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("unexpected receive error: {e}"),
            }
        }

        // started, one update through the limiter, final
        assert_eq!(events.len(), 3);
        assert!(events[0].started.is_some());
        assert_eq!(events[0].current, 0);
        assert_eq!(events[1].current, 10);
        let last = events.last().unwrap();
        assert_eq!(last.current, 1000);
        assert!(last.is_completed());
        assert_eq!(last.action, "transferring");
    }

    #[tokio::test]
    async fn test_nothing_after_final() {
        let emitter = ProgressEmitter::new(16);
        let mut rx = emitter.subscribe();
        let mut handler = ProgressHandler::new(emitter.clone(), "x", Duration::from_millis(1));
        handler.update(5, true);
        handler.update(6, true);
        handler.update(7, false);

        rx.try_recv().unwrap();
        assert_eq!(rx.try_recv().unwrap().current, 5);
        assert!(rx.try_recv().is_err());
    }
}
