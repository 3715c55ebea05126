//! Two-stage inactivity timer: nudge after a first delay, close the session
//! after a second one. Any inbound message cancels the whole chain.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, sleep};

/// Handle to a running idle chain. Dropping it does NOT cancel the chain;
/// call [`IdleChain::cancel`], or replace it via a session's timer slot.
pub struct IdleChain {
    cancel: Arc<Notify>,
}

impl IdleChain {
    /// Start a chain: after `nudge_after` of silence run `on_nudge`, then
    /// after a further `close_after` run `on_close`. Cancellation at any
    /// point stops the remaining stages.
    pub fn start<N, NF, C, CF>(
        nudge_after: Duration,
        close_after: Duration,
        on_nudge: N,
        on_close: C,
    ) -> Self
    where
        N: FnOnce() -> NF + Send + 'static,
        NF: Future<Output = ()> + Send,
        C: FnOnce() -> CF + Send + 'static,
        CF: Future<Output = ()> + Send,
    {
        let cancel = Arc::new(Notify::new());
        let cancel_task = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_task.notified() => return,
                _ = sleep(nudge_after) => {}
            }

            on_nudge().await;

            tokio::select! {
                biased;
                _ = cancel_task.notified() => return,
                _ = sleep(close_after) => {}
            }

            on_close().await;
        });

        Self { cancel }
    }

    /// Cancel whichever stage is still pending. A permit is stored, so a
    /// cancel that races the nudge still stops the close stage.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    fn start(
        nudge_ms: u64,
        close_ms: u64,
        nudges: &Arc<AtomicUsize>,
        closes: &Arc<AtomicUsize>,
    ) -> IdleChain {
        let n = nudges.clone();
        let c = closes.clone();
        IdleChain::start(
            Duration::from_millis(nudge_ms),
            Duration::from_millis(close_ms),
            move || async move {
                n.fetch_add(1, Ordering::SeqCst);
            },
            move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[tokio::test]
    async fn test_fires_nudge_then_close() {
        let (nudges, closes) = counters();
        let _chain = start(30, 30, &nudges, &closes);

        sleep(Duration::from_millis(45)).await;
        assert_eq!(nudges.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(45)).await;
        assert_eq!(nudges.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_nudge_stops_everything() {
        let (nudges, closes) = counters();
        let chain = start(40, 40, &nudges, &closes);

        sleep(Duration::from_millis(10)).await;
        chain.cancel();

        sleep(Duration::from_millis(120)).await;
        assert_eq!(nudges.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_between_stages_stops_close() {
        let (nudges, closes) = counters();
        let chain = start(30, 60, &nudges, &closes);

        sleep(Duration::from_millis(45)).await;
        assert_eq!(nudges.load(Ordering::SeqCst), 1);

        chain.cancel();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_chain_supersedes_old() {
        let (nudges, closes) = counters();

        // Arm, then "a new message arrives": cancel and re-arm, the way a
        // session replaces its timer slot.
        let first = start(40, 40, &nudges, &closes);
        sleep(Duration::from_millis(20)).await;
        first.cancel();
        let _second = start(40, 40, &nudges, &closes);

        sleep(Duration::from_millis(30)).await;
        // Old chain would have fired by now; only the new one is pending.
        assert_eq!(nudges.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(30)).await;
        assert_eq!(nudges.load(Ordering::SeqCst), 1);
    }
}
