//! Bounded worker pool for asynchronous dispatch.
//!
//! A fixed number of workers pull events from one shared bounded queue and
//! run a processor function on each. Admission never waits: a full queue is
//! reported as [`BrokerError::QueueFull`] so request paths never stall on
//! dispatch capacity.

use crate::error::{BrokerError, BrokerResult};
use crate::types::Event;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Function run by workers for each dequeued event.
pub type Processor = Arc<dyn Fn(Event) -> BoxFuture<'static, BrokerResult<()>> + Send + Sync>;

/// Mutable pool state guarded by a single lock.
#[derive(Default)]
struct PoolState {
    sender: Option<mpsc::Sender<Event>>,
    workers: Vec<JoinHandle<()>>,
}

/// Bounded-queue concurrent executor.
pub struct WorkerPool {
    worker_count: usize,
    buffer_size: usize,
    processor: Processor,
    state: Mutex<PoolState>,
    running: AtomicBool,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("buffer_size", &self.buffer_size)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerPool {
    /// Create a stopped pool.
    ///
    /// `worker_count` and `buffer_size` are raised to at least 1.
    pub fn new(worker_count: usize, buffer_size: usize, processor: Processor) -> Self {
        Self {
            worker_count: worker_count.max(1),
            buffer_size: buffer_size.max(1),
            processor,
            state: Mutex::new(PoolState::default()),
            running: AtomicBool::new(false),
            queued: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the workers. Does nothing if already running.
    pub fn start(&self) {
        let mut state = self.lock_state();
        if self.running.load(Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        state.workers = (0..self.worker_count)
            .map(|id| {
                let rx = rx.clone();
                let processor = self.processor.clone();
                let queued = self.queued.clone();
                let active = self.active.clone();
                tokio::spawn(worker_loop(id, rx, processor, queued, active))
            })
            .collect();
        state.sender = Some(tx);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            workers = self.worker_count,
            buffer_size = self.buffer_size,
            "Worker pool started"
        );
    }

    /// Enqueue an event without waiting.
    pub fn submit(&self, event: Event) -> BrokerResult<()> {
        let state = self.lock_state();
        let sender = match (&state.sender, self.running.load(Ordering::SeqCst)) {
            (Some(sender), true) => sender,
            _ => return Err(BrokerError::PoolStopped),
        };

        // Count before sending so a fast worker never decrements below zero.
        self.queued.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(e) => {
                decrement(&self.queued);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(BrokerError::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(BrokerError::PoolStopped),
                }
            }
        }
    }

    /// Stop admission and wait up to `deadline` for queued and in-flight
    /// work to finish.
    ///
    /// On timeout the remaining workers are aborted, their work is lost and
    /// the queue and activity counters are reset to zero.
    pub async fn stop(&self, deadline: Duration) -> BrokerResult<()> {
        let workers = {
            let mut state = self.lock_state();
            if !self.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            // Dropping the sender lets workers drain the queue and exit.
            state.sender = None;
            std::mem::take(&mut state.workers)
        };

        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();

        match tokio::time::timeout(deadline, futures::future::join_all(workers)).await {
            Ok(_) => {
                tracing::info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                for handle in aborts {
                    handle.abort();
                }
                // Aborted workers never reach their decrements.
                let active = self.active.swap(0, Ordering::SeqCst);
                let queued = self.queued.swap(0, Ordering::SeqCst);
                tracing::error!(
                    deadline_ms = deadline.as_millis() as u64,
                    active = active,
                    dropped = queued,
                    "Worker pool did not drain before deadline"
                );
                Err(BrokerError::ShutdownTimeout(deadline))
            }
        }
    }

    /// Events waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Workers currently running the processor.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Configured worker count.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decrement without wrapping below zero.
fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    processor: Processor,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
) {
    tracing::debug!(worker = id, "Worker started");

    loop {
        // Hold the receiver lock only while waiting for the next event.
        let next = { rx.lock().await.recv().await };
        let Some(event) = next else {
            break;
        };

        decrement(&queued);
        active.fetch_add(1, Ordering::SeqCst);

        let event_id = event.id.clone();
        if let Err(e) = processor(event).await {
            tracing::debug!(worker = id, event_id = %event_id, error = %e, "Event processing failed");
        }

        decrement(&active);
    }

    tracing::debug!(worker = id, "Worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventSource;
    use futures::FutureExt;
    use std::sync::atomic::AtomicU32;

    fn event(n: usize) -> Event {
        Event::new("test.pool.run", EventSource::Internal, "node-1", Vec::new()).with_id(format!("e{n}"))
    }

    fn counting_processor(counter: Arc<AtomicU32>, delay: Duration) -> Processor {
        Arc::new(move |_event| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(delay).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_submit_before_start_fails() {
        let pool = WorkerPool::new(2, 10, counting_processor(Arc::default(), Duration::ZERO));
        assert!(matches!(pool.submit(event(0)), Err(BrokerError::PoolStopped)));
    }

    #[tokio::test]
    async fn test_processes_all_submitted_events() {
        let counter = Arc::new(AtomicU32::new(0));
        let pool = WorkerPool::new(4, 100, counting_processor(counter.clone(), Duration::from_millis(1)));
        pool.start();
        pool.start(); // idempotent

        for n in 0..20 {
            pool.submit(event(n)).unwrap();
        }

        pool.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(pool.queue_size(), 0);
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_queue_full_does_not_block() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_clone = gate.clone();
        let processor: Processor = Arc::new(move |_event| {
            let gate = gate_clone.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
            .boxed()
        });

        let pool = WorkerPool::new(1, 2, processor);
        pool.start();

        // First event occupies the only worker.
        pool.submit(event(0)).unwrap();
        while pool.active_workers() == 0 {
            tokio::task::yield_now().await;
        }

        pool.submit(event(1)).unwrap();
        pool.submit(event(2)).unwrap();
        assert_eq!(pool.queue_size(), 2);

        let start = std::time::Instant::now();
        assert!(matches!(pool.submit(event(3)), Err(BrokerError::QueueFull)));
        assert!(start.elapsed() < Duration::from_millis(50));

        gate.notify_waiters();
        pool.stop(Duration::ZERO).await.ok();
    }

    #[tokio::test]
    async fn test_stop_timeout() {
        let pool = WorkerPool::new(
            1,
            10,
            counting_processor(Arc::default(), Duration::from_secs(30)),
        );
        pool.start();
        pool.submit(event(0)).unwrap();
        while pool.active_workers() == 0 {
            tokio::task::yield_now().await;
        }
        pool.submit(event(1)).unwrap();
        pool.submit(event(2)).unwrap();
        assert_eq!(pool.active_workers(), 1);
        assert_eq!(pool.queue_size(), 2);

        let result = pool.stop(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BrokerError::ShutdownTimeout(_))));
        assert!(!pool.is_running());
        assert_eq!(pool.active_workers(), 0);
        assert_eq!(pool.queue_size(), 0);
        assert!(matches!(pool.submit(event(3)), Err(BrokerError::PoolStopped)));
    }

    #[test]
    fn test_decrement_saturates() {
        let counter = AtomicUsize::new(1);
        decrement(&counter);
        decrement(&counter);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pool = WorkerPool::new(2, 10, counting_processor(Arc::default(), Duration::ZERO));
        pool.start();
        pool.stop(Duration::from_secs(1)).await.unwrap();
        pool.stop(Duration::from_secs(1)).await.unwrap();
    }
}
