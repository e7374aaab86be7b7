//! Worker pool plumbing shared by every stage.
//!
//! Stages are connected by bounded `mpsc` channels. Several workers pull
//! from one [`SharedReceiver`]; several workers push into one sender whose
//! last clone is dropped by [`WorkerStage::wait_and_close`] once every
//! worker has finished, so the downstream stream closes exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A receiver several workers can pull from. Once the channel is closed and
/// drained, `recv` keeps returning `None`.
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> SharedReceiver<T> {
    pub fn new(receiver: mpsc::Receiver<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(receiver)),
        }
    }

    pub async fn recv(&self) -> Option<T> {
        let mut receiver = self.inner.lock().await;
        receiver.recv().await
    }

    /// Waits for the next item unless the token fires first.
    pub async fn recv_or_cancel(&self, token: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            item = self.recv() => item,
        }
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Creates a bounded channel whose receiving side can be shared.
pub fn shared_channel<T>(capacity: usize) -> (mpsc::Sender<T>, SharedReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, SharedReceiver::new(rx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Cancelled,
    Closed,
}

/// Pushes `item` downstream, giving up as soon as the token fires instead of
/// waiting on a full channel.
pub async fn send_or_cancel<T>(
    sender: &mpsc::Sender<T>,
    item: T,
    token: &CancellationToken,
) -> SendOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => SendOutcome::Cancelled,
        result = sender.send(item) => match result {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::Closed,
        },
    }
}

/// A pool of workers running the same loop, with a completion barrier.
pub struct WorkerStage<T> {
    name: &'static str,
    workers: JoinSet<T>,
    active: Arc<AtomicUsize>,
}

impl<T: Send + 'static> WorkerStage<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            workers: JoinSet::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Launches `count` workers; each receives its 1-based id.
    pub fn spawn<F, Fut>(&mut self, count: usize, worker: F)
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        for id in 1..=count {
            let guard = ActiveGuard::enter(self.active.clone());
            let task = worker(id);
            self.workers.spawn(async move {
                let _guard = guard;
                task.await
            });
        }
        debug!("{} stage: {} workers started", self.name, count);
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn active_counter(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    /// Blocks until every worker has returned and collects their outputs.
    /// A panicking worker is logged and contributes nothing.
    pub async fn wait(mut self) -> Vec<T> {
        let mut outputs = Vec::new();
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(output) => outputs.push(output),
                Err(e) => error!("{} stage: worker failed: {}", self.name, e),
            }
        }
        debug!("{} stage: all workers finished", self.name);
        outputs
    }

    /// Waits for every worker, then drops the stage's own sender so the
    /// downstream channel closes once the workers' clones are gone too.
    pub async fn wait_and_close<S>(self, downstream: mpsc::Sender<S>) -> Vec<T> {
        let outputs = self.wait().await;
        drop(downstream);
        outputs
    }
}

/// Decrements the active-worker count when a worker finishes, even by panic.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shared_receiver_exhausts_after_close() {
        let (tx, rx) = shared_channel::<i32>(4);
        tx.send(1).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.clone().recv().await, None);
    }

    #[tokio::test]
    async fn test_send_or_cancel_does_not_block_on_full_channel() {
        let (tx, _rx) = shared_channel::<i32>(1);
        let token = CancellationToken::new();
        assert_eq!(send_or_cancel(&tx, 1, &token).await, SendOutcome::Sent);

        token.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), send_or_cancel(&tx, 2, &token))
            .await
            .expect("send must not block after cancellation");
        assert_eq!(outcome, SendOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_send_or_cancel_reports_closed() {
        let (tx, rx) = shared_channel::<i32>(1);
        drop(rx);
        let token = CancellationToken::new();
        assert_eq!(send_or_cancel(&tx, 1, &token).await, SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_stage_fan_in_closes_downstream_once() {
        let (input_tx, input) = shared_channel::<u32>(8);
        let (output_tx, output) = shared_channel::<u32>(8);

        let mut stage = WorkerStage::new("double");
        stage.spawn(3, |_id| {
            let input = input.clone();
            let output_tx = output_tx.clone();
            async move {
                let mut handled = 0;
                while let Some(n) = input.recv().await {
                    output_tx.send(n * 2).await.unwrap();
                    handled += 1;
                }
                handled
            }
        });

        for n in 0..10 {
            input_tx.send(n).await.unwrap();
        }
        drop(input_tx);

        let closer = tokio::spawn(stage.wait_and_close(output_tx));

        let mut results = Vec::new();
        while let Some(n) = output.recv().await {
            results.push(n);
        }
        results.sort_unstable();
        assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<_>>());

        let handled: usize = closer.await.unwrap().into_iter().sum();
        assert_eq!(handled, 10);
    }

    #[tokio::test]
    async fn test_active_workers_drop_to_zero() {
        let mut stage = WorkerStage::new("sleepers");
        stage.spawn(2, |id| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            id
        });
        let counter = stage.active_counter();
        assert_eq!(stage.active_workers(), 2);

        let mut ids = stage.wait().await;
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
