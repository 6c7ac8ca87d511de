//! Per-service admission control: a FIFO wait for one of `max_concurrency`
//! slots, bounded by a timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lmrelay_protocol::Service;
use lmrelay_provider_core::ProxyError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    service: Service,
    capacity: usize,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
}

/// An admitted request. Dropping it frees the slot for the next waiter.
#[derive(Debug)]
pub struct QueueSlot {
    _permit: OwnedSemaphorePermit,
    outstanding: Arc<AtomicUsize>,
    waited: Duration,
}

impl QueueSlot {
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps `waiting` accurate when an acquire future is cancelled.
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionQueue {
    pub fn new(service: Service, capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            service,
            capacity,
            timeout,
            semaphore: Arc::new(Semaphore::new(capacity)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Requests currently waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Waits in arrival order for a slot, failing with `QueueTimeout` after
    /// the configured timeout.
    pub async fn acquire(&self) -> Result<QueueSlot, ProxyError> {
        let started = Instant::now();
        self.waiting.fetch_add(1, Ordering::AcqRel);
        let guard = WaitGuard(&self.waiting);
        let acquired =
            tokio::time::timeout(self.timeout, Arc::clone(&self.semaphore).acquire_owned()).await;
        drop(guard);
        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ProxyError::internal("admission queue closed")),
            Err(_) => {
                tracing::warn!(
                    event = "queue_timeout",
                    service = %self.service,
                    waited_ms = started.elapsed().as_millis() as u64,
                    waiting = self.waiting(),
                );
                return Err(ProxyError::QueueTimeout {
                    service: self.service,
                });
            }
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(QueueSlot {
            _permit: permit,
            outstanding: Arc::clone(&self.outstanding),
            waited: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_arrival_order() {
        let queue = AdmissionQueue::new(Service::OpenAI, 1, Duration::from_secs(60));
        let first = queue.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..3 {
            let queue = queue.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let slot = queue.acquire().await.unwrap();
                order.lock().unwrap().push(n);
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(slot);
            }));
            // Let each waiter enqueue before the next one starts.
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.waiting(), 3);
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let queue = AdmissionQueue::new(Service::Anthropic, 1, Duration::from_secs(5));
        let _held = queue.acquire().await.unwrap();
        let err = queue.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::QueueTimeout { service: Service::Anthropic }));
        assert_eq!(queue.waiting(), 0);
        assert_eq!(queue.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_releases_nothing_and_leaks_nothing() {
        let queue = AdmissionQueue::new(Service::OpenAI, 1, Duration::from_secs(60));
        let held = queue.acquire().await.unwrap();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.waiting(), 1);
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(queue.waiting(), 0);
        drop(held);
        assert_eq!(queue.outstanding(), 0);
        let again = queue.acquire().await.unwrap();
        assert!(again.waited() < Duration::from_secs(1));
    }
}
