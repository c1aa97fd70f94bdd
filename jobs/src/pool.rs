//! Bounded worker pool (§5): a fixed-size set of async tasks drains a
//! channel of work items, so concurrency is a configuration parameter rather
//! than one task per item. Ported in meaning from the teacher's channel-based
//! `ChannelJobQueue`/`Worker` pair, generalized from a single `Job` enum to
//! any item type and handler.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// Runs `handler` over every item sent through the pool's channel using
/// `concurrency` worker tasks. Backpressure comes from the channel's bounded
/// capacity: `submit` blocks once all workers are busy and the channel is full.
pub struct WorkerPool<T> {
    sender: mpsc::Sender<T>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn spawn<H, Fut>(concurrency: usize, channel_capacity: usize, handler: H) -> Self
    where
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = mpsc::channel::<T>(channel_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handler = Arc::new(handler);

        let handles = (0..concurrency)
            .map(|_| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let item = {
                            let mut guard = receiver.lock().await;
                            guard.recv().await
                        };
                        match item {
                            Some(item) => handler(item).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self { sender, handles }
    }

    pub async fn submit(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.sender.send(item).await
    }

    /// Closes the submission channel and waits for in-flight items to drain.
    /// Workers exit once the channel is both closed and empty.
    pub async fn join(self) {
        drop(self.sender);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn processes_every_submitted_item_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let pool = WorkerPool::spawn(4, 16, move |_item: u32| {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for i in 0..50u32 {
            pool.submit(i).await.unwrap();
        }
        pool.join().await;

        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn bounds_concurrency_to_the_configured_worker_count() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let in_flight_clone = in_flight.clone();
        let max_observed_clone = max_observed.clone();

        let pool = WorkerPool::spawn(2, 16, move |_item: u32| {
            let in_flight = in_flight_clone.clone();
            let max_observed = max_observed_clone.clone();
            async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });

        for i in 0..10u32 {
            pool.submit(i).await.unwrap();
        }
        pool.join().await;

        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }
}
