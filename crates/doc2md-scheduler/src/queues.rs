//! Queue fabric: the bounded in-memory channels connecting the workers.
//!
//! Queues carry task ids only, never task bodies; durability lives in the
//! store. Bounded capacity gives natural backpressure: a stalled consumer
//! blocks its producer at the send.

use async_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use serde::Serialize;

/// One bounded id queue. Senders and receivers are cheap clones; the
/// dispatch queue is consumed by the whole worker pool.
#[derive(Debug, Clone)]
pub struct Queue {
    tx: Sender<i64>,
    rx: Receiver<i64>,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    pub async fn send(&self, id: i64) -> Result<(), async_channel::SendError<i64>> {
        self.tx.send(id).await
    }

    /// Non-blocking send for wake-up nudges; a full queue is fine because
    /// the fetcher polls anyway.
    pub fn try_send(&self, id: i64) -> Result<(), TrySendError<i64>> {
        self.tx.try_send(id)
    }

    pub async fn recv(&self) -> Result<i64, async_channel::RecvError> {
        self.rx.recv().await
    }

    pub fn try_recv(&self) -> Result<i64, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// The six logical queues of the pipeline plus the three priority lanes.
#[derive(Debug, Clone)]
pub struct QueueFabric {
    /// API -> Fetcher wake-up nudges and retry re-entries.
    pub intake: Queue,
    /// Fetcher -> PriorityMerger lanes.
    pub high: Queue,
    pub normal: Queue,
    pub low: Queue,
    /// PriorityMerger -> conversion worker pool.
    pub dispatch: Queue,
    /// Worker -> Updater -> Cleaner -> Callback chain.
    pub update: Queue,
    pub cleanup: Queue,
    pub callback: Queue,
}

/// Snapshot of queue lengths for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub intake: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub dispatch: usize,
    pub update: usize,
    pub cleanup: usize,
    pub callback: usize,
}

impl QueueFabric {
    pub fn new(capacity: usize) -> Self {
        Self {
            intake: Queue::new(capacity),
            high: Queue::new(capacity),
            normal: Queue::new(capacity),
            low: Queue::new(capacity),
            dispatch: Queue::new(capacity),
            update: Queue::new(capacity),
            cleanup: Queue::new(capacity),
            callback: Queue::new(capacity),
        }
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            intake: self.intake.len(),
            high: self.high.len(),
            normal: self.normal.len(),
            low: self.low.len(),
            dispatch: self.dispatch.len(),
            update: self.update.len(),
            cleanup: self.cleanup.len(),
            callback: self.callback.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_depths_track_sends() {
        let fabric = QueueFabric::new(8);
        fabric.high.send(1).await.unwrap();
        fabric.high.send(2).await.unwrap();
        fabric.normal.send(3).await.unwrap();

        let depths = fabric.depths();
        assert_eq!(depths.high, 2);
        assert_eq!(depths.normal, 1);
        assert_eq!(depths.low, 0);

        assert_eq!(fabric.high.recv().await.unwrap(), 1);
        assert_eq!(fabric.high.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_try_send_on_full_queue() {
        let fabric = QueueFabric::new(1);
        fabric.intake.try_send(1).unwrap();
        assert!(fabric.intake.try_send(2).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_is_multi_consumer() {
        let fabric = QueueFabric::new(8);
        let a = fabric.dispatch.clone();
        let b = fabric.dispatch.clone();
        fabric.dispatch.send(1).await.unwrap();
        fabric.dispatch.send(2).await.unwrap();

        let first = a.recv().await.unwrap();
        let second = b.recv().await.unwrap();
        let mut got = vec![first, second];
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }
}
