//! Bounded hand-off between the connection task and the persistence worker.
//!
//! A [`ChunkChannel`] is two independent FIFO queues: `inbound` carries body
//! chunks (and the end/error sentinels) toward the worker, `outbound` carries
//! the single result back. A full queue makes `put` wait, which is the only
//! backpressure in the pipeline: a slow disk stalls the socket reads, and the
//! transport's own flow control stalls the peer.

use crate::error::{IngestResult, UploadError};
use crate::storage::UploadResult;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

/// Element of the inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    EndOfStream,
    /// Terminal. Consumers stop at the first one they see.
    Error(Option<String>),
}

/// Element of the outbound queue.
#[derive(Debug)]
pub enum Outcome {
    Stored(UploadResult),
    Failed(UploadError),
}

/// A bounded FIFO whose both ends live in the same object, so it can be
/// shared behind an `Arc` and used from whichever task needs it.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> BoundedQueue<T> {
    /// `capacity` must be non-zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Append an item, waiting while the queue is full.
    pub async fn put(&self, item: T) -> IngestResult<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| UploadError::Internal("queue receiver closed".into()))
    }

    /// Remove the oldest item, waiting while the queue is empty.
    pub async fn get(&self) -> IngestResult<T> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| UploadError::Internal("queue sender closed".into()))
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// The pair of queues owned by one upload session.
#[derive(Debug)]
pub struct ChunkChannel {
    pub inbound: BoundedQueue<Chunk>,
    pub outbound: BoundedQueue<Outcome>,
}

impl ChunkChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: BoundedQueue::new(capacity),
            outbound: BoundedQueue::new(capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let q = BoundedQueue::new(4);
        q.put(Chunk::Data(Bytes::from_static(b"a"))).await.unwrap();
        q.put(Chunk::Data(Bytes::from_static(b"b"))).await.unwrap();
        q.put(Chunk::EndOfStream).await.unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.get().await.unwrap(), Chunk::Data(Bytes::from_static(b"a")));
        assert_eq!(q.get().await.unwrap(), Chunk::Data(Bytes::from_static(b"b")));
        assert_eq!(q.get().await.unwrap(), Chunk::EndOfStream);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn full_queue_blocks_producer_until_drained() {
        let q = Arc::new(BoundedQueue::new(1));
        q.put(1u32).await.unwrap();

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.put(2u32).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(q.get().await.unwrap(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(q.get().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn get_waits_for_item() {
        let q = Arc::new(BoundedQueue::<Chunk>::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());
        q.put(Chunk::Error(Some("peer reset".into()))).await.unwrap();
        assert_eq!(
            consumer.await.unwrap().unwrap(),
            Chunk::Error(Some("peer reset".into()))
        );
    }

    #[test]
    fn channel_queues_share_capacity_setting() {
        let ch = ChunkChannel::new(100);
        assert_eq!(ch.inbound.capacity(), 100);
        assert_eq!(ch.outbound.capacity(), 100);
    }
}
