//! Debounced execution of the update function.
//!
//! `signal()` may be called as often as events arrive; the update function
//! runs at most once at a time and only after a full second without new
//! signals. The orderings here are load-bearing: the needed flag is set
//! before the burst send, and cleared before the function is invoked, so a
//! signal racing with a running update always produces another cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How long the signal stream has to stay quiet before an update runs.
const QUIESCENCE: Duration = Duration::from_secs(1);

/// The function invoked on each update cycle. The token it receives is
/// cancelled when the update timeout elapses.
pub type UpdateFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle used by event producers to request an update.
#[derive(Clone)]
pub struct Updater {
    update_needed: Arc<AtomicBool>,
    burst_tx: mpsc::Sender<()>,
}

impl Updater {
    /// Request an update. Completes once the anti-burst task has been handed
    /// the request; the actual update runs after quiescence.
    pub async fn signal(&self) {
        self.update_needed.store(true, Ordering::SeqCst);
        let _ = self.burst_tx.send(()).await;
    }
}

/// The background half of the updater; run it on a task.
pub struct UpdaterTask {
    update_needed: Arc<AtomicBool>,
    burst_rx: mpsc::Receiver<()>,
    f: UpdateFn,
    update_timeout: Duration,
}

/// Build a connected signal handle and runner pair.
pub fn updater(f: UpdateFn, update_timeout: Duration) -> (Updater, UpdaterTask) {
    let update_needed = Arc::new(AtomicBool::new(false));
    let (burst_tx, burst_rx) = mpsc::channel(1);
    (
        Updater {
            update_needed: update_needed.clone(),
            burst_tx,
        },
        UpdaterTask {
            update_needed,
            burst_rx,
            f,
            update_timeout,
        },
    )
}

async fn anti_burst(
    mut burst_rx: mpsc::Receiver<()>,
    signal_tx: mpsc::Sender<()>,
    update_needed: Arc<AtomicBool>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            received = burst_rx.recv() => {
                // A burst restarts the quiescence timer.
                if received.is_none() {
                    return;
                }
            }
            () = sleep(QUIESCENCE) => {
                if update_needed.load(Ordering::SeqCst) {
                    if signal_tx.send(()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl UpdaterTask {
    pub async fn run(self, token: CancellationToken) {
        let (signal_tx, mut signal_rx) = mpsc::channel(1);
        tokio::spawn(anti_burst(
            self.burst_rx,
            signal_tx,
            self.update_needed.clone(),
            token.clone(),
        ));

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                received = signal_rx.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
            }

            // Clear before running so signals arriving during the update
            // schedule another cycle.
            self.update_needed.store(false, Ordering::SeqCst);

            let update_token = token.child_token();
            let update = (self.f)(update_token.clone());
            tokio::pin!(update);
            let timeout = sleep(self.update_timeout);
            tokio::pin!(timeout);
            let mut timed_out = false;
            loop {
                tokio::select! {
                    () = &mut update => break,
                    () = &mut timeout, if !timed_out => {
                        update_token.cancel();
                        timed_out = true;
                    }
                }
            }
            update_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{advance, Instant};

    struct Recorder {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn update_fn(self: &Arc<Self>, delay: Duration) -> UpdateFn {
            let recorder = self.clone();
            Arc::new(move |_token| {
                let recorder = recorder.clone();
                async move {
                    let in_flight = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    recorder.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
                    recorder.runs.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_signals_runs_once() {
        let recorder = Recorder::new();
        let (handle, task) = updater(recorder.update_fn(Duration::ZERO), Duration::from_secs(10));
        let token = CancellationToken::new();
        tokio::spawn(task.run(token.clone()));

        for _ in 0..20 {
            handle.signal().await;
            advance(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_secs(3)).await;

        assert_eq!(recorder.runs(), 1);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_precedes_the_run() {
        let recorder = Recorder::new();
        let (handle, task) = updater(recorder.update_fn(Duration::ZERO), Duration::from_secs(10));
        let token = CancellationToken::new();
        tokio::spawn(task.run(token.clone()));

        let start = Instant::now();
        handle.signal().await;
        while recorder.runs() == 0 {
            sleep(Duration::from_millis(50)).await;
        }
        assert!(start.elapsed() >= QUIESCENCE);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_run_schedules_another_cycle() {
        let recorder = Recorder::new();
        let (handle, task) = updater(
            recorder.update_fn(Duration::from_secs(3)),
            Duration::from_secs(10),
        );
        let token = CancellationToken::new();
        tokio::spawn(task.run(token.clone()));

        handle.signal().await;
        // Wait for the first run to start, then signal while it's in flight.
        sleep(Duration::from_millis(1500)).await;
        handle.signal().await;
        sleep(Duration::from_secs(10)).await;

        assert_eq!(recorder.runs(), 2);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn update_token_cancelled_on_timeout() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let observed = cancelled.clone();
        let f: UpdateFn = Arc::new(move |token| {
            let observed = observed.clone();
            async move {
                tokio::select! {
                    () = token.cancelled() => observed.store(true, Ordering::SeqCst),
                    () = sleep(Duration::from_secs(60)) => {}
                }
            }
            .boxed()
        });
        let (handle, task) = updater(f, Duration::from_secs(2));
        let token = CancellationToken::new();
        tokio::spawn(task.run(token.clone()));

        handle.signal().await;
        sleep(Duration::from_secs(5)).await;
        assert!(cancelled.load(Ordering::SeqCst));
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_updater() {
        let recorder = Recorder::new();
        let (handle, task) = updater(recorder.update_fn(Duration::ZERO), Duration::from_secs(10));
        let token = CancellationToken::new();
        let runner = tokio::spawn(task.run(token.clone()));

        token.cancel();
        runner.await.unwrap();
        handle.signal().await;
        sleep(Duration::from_secs(3)).await;
        assert_eq!(recorder.runs(), 0);
    }
}
