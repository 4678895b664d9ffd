//! Expiry records and the queue that carries them to the worker.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::handle::{ConnectionRef, PacketRef};
use crate::timer::{Action, Binding, SlotId};

/// Snapshot taken when a timer fires.
///
/// The record is a value copy of the slot's binding at fire time, so freeing
/// or reconfiguring the slot afterwards does not change it. The references
/// inside are non-owning and may be stale by the time the record is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryRecord {
    slot: SlotId,
    binding: Binding,
}

impl ExpiryRecord {
    pub(crate) fn new(slot: SlotId, binding: Binding) -> Self {
        ExpiryRecord { slot, binding }
    }

    /// The allocation that fired. Pass it back to `TimerPool::free`.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn action(&self) -> Action {
        self.binding.action()
    }

    pub fn packet(&self) -> Option<PacketRef> {
        self.binding.packet()
    }

    pub fn connection(&self) -> Option<ConnectionRef> {
        self.binding.connection()
    }
}

pub(crate) type ExpirySender = mpsc::UnboundedSender<ExpiryRecord>;

pub(crate) fn channel() -> (ExpirySender, ExpiryQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ExpiryQueue { rx })
}

/// Receiving end of the pool's expiry records.
///
/// Producers are the pool's countdowns; they never block. The queue closes
/// when the pool is shut down or dropped along with its outstanding
/// countdowns. `dequeue` then returns `None` once the remaining records have
/// been drained.
pub struct ExpiryQueue {
    rx: mpsc::UnboundedReceiver<ExpiryRecord>,
}

impl ExpiryQueue {
    /// Wait for the next expiry record.
    pub async fn dequeue(&mut self) -> Option<ExpiryRecord> {
        self.rx.recv().await
    }

    /// Take the next expiry record without waiting.
    pub fn try_dequeue(&mut self) -> Result<ExpiryRecord, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Number of records waiting to be consumed.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Stream for ExpiryQueue {
    type Item = ExpiryRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_test::{assert_pending, assert_ready, task};

    fn record(index: usize) -> ExpiryRecord {
        let binding = Binding::new(
            Action::Retransmit,
            Some(crate::handle::test_packet(index as u64)),
            None,
        )
        .unwrap();
        ExpiryRecord::new(SlotId::new(index, 0), binding)
    }

    #[test]
    fn test_dequeue_waits_for_record() {
        let (tx, mut queue) = channel();
        let mut next = task::spawn(queue.dequeue());
        assert_pending!(next.poll());

        tx.send(record(0)).unwrap();
        assert!(next.is_woken());
        let got = assert_ready!(next.poll());
        assert_eq!(got, Some(record(0)));
    }

    #[tokio::test]
    async fn test_every_record_delivered_once() {
        let (tx, queue) = channel();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        tx.send(record(p * 25 + i)).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);
        for producer in producers {
            producer.await.unwrap();
        }

        let mut seen: Vec<usize> = queue.map(|r| r.slot().index()).collect().await;
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_closed_queue_returns_none() {
        let (tx, mut queue) = channel();
        tx.send(record(1)).unwrap();
        drop(tx);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await, Some(record(1)));
        assert_eq!(queue.dequeue().await, None);
        assert!(queue.try_dequeue().is_err());
    }
}
