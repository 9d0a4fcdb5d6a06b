//! Heartbeat loop — sweep stale peers and announce ourselves.
//!
//! Each tick runs the supplied closure (sweep, then broadcast keepalive)
//! and sleeps for a random delay drawn from `[min, max)`, so siblings
//! started together do not tick in lockstep.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::debug;

/// Random delay in `[min, max)`. Falls back to `min` on an empty window.
pub fn next_delay(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
    if lo >= hi {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..hi))
}

/// Run ticks until `shutdown` flips or its sender goes away.
///
/// Returning `false` from `tick` also stops the loop. The first tick runs
/// on the loop's first poll, never inside the caller that spawned it.
pub async fn run_heartbeat<F>(
    window: (Duration, Duration),
    mut tick: F,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut() -> bool,
{
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !tick() {
            break;
        }

        let delay = next_delay(window.0, window.1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_within_window() {
        let (min, max) = (Duration::from_millis(4000), Duration::from_millis(6000));
        for _ in 0..1000 {
            let d = next_delay(min, max);
            assert!(d >= min && d < max, "delay out of range: {d:?}");
        }
    }

    #[test]
    fn empty_window_uses_min() {
        let d = Duration::from_millis(50);
        assert_eq!(next_delay(d, d), d);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);
        let counter = ticks.clone();
        let handle = tokio::spawn(run_heartbeat(
            (Duration::from_millis(4000), Duration::from_millis(6000)),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            },
            rx,
        ));

        // Spawning does not tick synchronously.
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // At most 6s between ticks: 3 more within 18s.
        tokio::time::sleep(Duration::from_millis(18_000)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!((4..=5).contains(&seen), "ticks: {seen}");

        tx.send(true).unwrap();
        handle.await.unwrap();
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60_000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn tick_returning_false_stops_loop() {
        let (_tx, rx) = watch::channel(false);
        run_heartbeat(
            (Duration::from_millis(1), Duration::from_millis(2)),
            || false,
            rx,
        )
        .await;
    }
}
