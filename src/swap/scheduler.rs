//! Bounded-concurrency priority dispatch of profitable orders

use super::order::OrderHash;
use crate::metrics;

use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tracing::{debug, info};

/// Drives one order's state machine to its next resting point
#[async_trait]
pub trait OrderRunner: Send + Sync {
    async fn run_order(&self, order_hash: OrderHash);
}

#[derive(Debug, Clone)]
struct QueuedOrder {
    priority: f64,
    seq: u64,
    order_hash: OrderHash,
}

impl PartialEq for QueuedOrder {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedOrder {}

impl PartialOrd for QueuedOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedOrder {
    // max-heap: higher priority first, then earlier enqueue
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct ExecutionScheduler {
    queue: Mutex<BinaryHeap<QueuedOrder>>,
    /// Orders waiting in the queue
    queued: DashMap<OrderHash, ()>,
    /// Orders holding an execution slot
    active: Arc<DashMap<OrderHash, ()>>,
    slots: Arc<Semaphore>,
    notify: Notify,
    seq: AtomicU64,
    max_concurrent: usize,
}

impl ExecutionScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            queued: DashMap::new(),
            active: Arc::new(DashMap::new()),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            max_concurrent,
        }
    }

    /// Queue an order; false if it is already queued or running
    pub async fn enqueue(&self, order_hash: OrderHash, priority: f64) -> bool {
        if self.active.contains_key(&order_hash) || self.queued.contains_key(&order_hash) {
            return false;
        }
        let mut queue = self.queue.lock().await;
        if self.queued.insert(order_hash, ()).is_some() {
            return false;
        }
        queue.push(QueuedOrder {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            order_hash,
        });
        metrics::set_queue_depth(queue.len());
        drop(queue);

        debug!("Queued order {} with priority {:.2}", order_hash, priority);
        self.notify.notify_one();
        true
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, order_hash: &OrderHash) -> bool {
        self.active.contains_key(order_hash)
    }

    async fn pop(&self) -> Option<OrderHash> {
        let mut queue = self.queue.lock().await;
        let next = queue.pop()?;
        self.queued.remove(&next.order_hash);
        metrics::set_queue_depth(queue.len());
        Some(next.order_hash)
    }

    /// Dispatch queued orders to `runner` until shutdown
    pub async fn run(&self, runner: Arc<dyn OrderRunner>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Execution scheduler started with {} slots",
            self.max_concurrent
        );

        loop {
            // a slot first, so the highest priority order is chosen when it frees
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let order_hash = loop {
                let notified = self.notify.notified();
                if let Some(order_hash) = self.pop().await {
                    break Some(order_hash);
                }
                tokio::select! {
                    _ = notified => {}
                    _ = shutdown.changed() => break None,
                }
            };
            let Some(order_hash) = order_hash else {
                break;
            };

            self.active.insert(order_hash, ());
            metrics::set_active_executions(self.active.len());
            debug!("Starting execution of order {}", order_hash);

            let runner = runner.clone();
            let active = self.active.clone();
            tokio::spawn(async move {
                runner.run_order(order_hash).await;
                active.remove(&order_hash);
                metrics::set_active_executions(active.len());
                drop(permit);
            });
        }

        info!("Execution scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Semaphore as Gate;

    /// Records start order and blocks each run until released
    struct GatedRunner {
        started: StdMutex<Vec<OrderHash>>,
        running: AtomicU64,
        peak: AtomicU64,
        gate: Gate,
    }

    #[async_trait]
    impl OrderRunner for GatedRunner {
        async fn run_order(&self, order_hash: OrderHash) {
            self.started.lock().unwrap().push(order_hash);
            let now = self.running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(now, AtomicOrdering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.running.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }

    fn hash(n: u8) -> OrderHash {
        OrderHash([n; 32])
    }

    async fn wait_for_starts(runner: &GatedRunner, count: usize) {
        for _ in 0..200 {
            if runner.started.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} starts", count);
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_priority_order() {
        let scheduler = Arc::new(ExecutionScheduler::new(3));
        for (n, priority) in [(1, 10.0), (2, 50.0), (3, 30.0), (4, 40.0), (5, 20.0)] {
            assert!(scheduler.enqueue(hash(n), priority).await);
        }

        let runner = Arc::new(GatedRunner {
            started: StdMutex::new(Vec::new()),
            running: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            gate: Gate::new(0),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = {
            let scheduler = scheduler.clone();
            let runner: Arc<dyn OrderRunner> = runner.clone();
            tokio::spawn(async move { scheduler.run(runner, stop_rx).await })
        };

        wait_for_starts(&runner, 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runner.started.lock().unwrap().len(), 3);
        assert_eq!(scheduler.active_count(), 3);
        assert!(scheduler.is_active(&hash(2)));
        assert!(!scheduler.is_active(&hash(1)));
        assert_eq!(scheduler.queue_depth().await, 2);

        // free one slot at a time; the remaining two start highest first
        runner.gate.add_permits(1);
        wait_for_starts(&runner, 4).await;
        runner.gate.add_permits(1);
        wait_for_starts(&runner, 5).await;
        runner.gate.add_permits(3);

        let started = runner.started.lock().unwrap().clone();
        let mut first = started[..3].to_vec();
        first.sort();
        assert_eq!(first, vec![hash(2), hash(3), hash(4)]);
        assert_eq!(&started[3..], &[hash(5), hash(1)]);
        assert_eq!(runner.peak.load(AtomicOrdering::SeqCst), 3);

        stop_tx.send(true).unwrap();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_queued_orders() {
        let scheduler = ExecutionScheduler::new(1);
        assert!(scheduler.enqueue(hash(1), 1.0).await);
        assert!(!scheduler.enqueue(hash(1), 5.0).await);
        assert_eq!(scheduler.queue_depth().await, 1);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let mut heap = BinaryHeap::new();
        for seq in 0..3u64 {
            heap.push(QueuedOrder {
                priority: 7.0,
                seq,
                order_hash: hash(seq as u8),
            });
        }
        assert_eq!(heap.pop().unwrap().seq, 0);
        assert_eq!(heap.pop().unwrap().seq, 1);
    }
}
