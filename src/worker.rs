//! Consumer loop for expiry records.

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::pool::TimerPool;
use crate::queue::{ExpiryQueue, ExpiryRecord};

/// What happens to a slot once its expiry record has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The worker frees the slot.
    Release,
    /// The handler keeps the slot and frees it itself later.
    Retain,
}

/// Executes the action carried by an expiry record.
///
/// The references in the record are non-owning. Implementations must check
/// that the packet and connection still exist, e.g. through the
/// [`PacketTable`](crate::PacketTable) that owns them, before acting.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn on_expiry(&self, record: ExpiryRecord) -> Disposition;
}

/// Drains an [`ExpiryQueue`] into an [`ExpiryHandler`].
pub struct ExpiryWorker<H> {
    /// Instance name for logging
    name: String,

    pool: TimerPool,

    queue: ExpiryQueue,

    handler: H,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

impl<H: ExpiryHandler> ExpiryWorker<H> {
    pub fn new(
        name: String,
        pool: TimerPool,
        queue: ExpiryQueue,
        handler: H,
        cancel_token: CancellationToken,
    ) -> Self {
        ExpiryWorker {
            name,
            pool,
            queue,
            handler,
            cancel_token,
        }
    }

    /// Run the worker until cancelled or until the queue closes.
    ///
    /// Returns the number of records handled.
    pub async fn run(mut self) -> usize {
        let mut handled = 0;

        log::info!(
            "Expiry worker '{}' started on timer pool '{}'",
            self.name,
            self.pool.name()
        );

        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    log::info!("Expiry worker '{}' cancelled via token", self.name);
                    break;
                },

                record = self.queue.next() => {
                    let Some(record) = record else {
                        log::info!("Expiry worker '{}' shutting down - expiry queue closed", self.name);
                        break;
                    };
                    self.handle(record).await;
                    handled += 1;
                },
            }
        }

        log::info!(
            "Expiry worker '{}' stopped after {} record(s)",
            self.name,
            handled
        );
        handled
    }

    async fn handle(&self, record: ExpiryRecord) {
        let slot = record.slot();
        match self.handler.on_expiry(record).await {
            Disposition::Release => {
                if let Err(e) = self.pool.free(slot) {
                    log::warn!(
                        "Expiry worker '{}' could not free slot {}: {}",
                        self.name,
                        slot,
                        e
                    );
                }
            }
            Disposition::Retain => {
                log::debug!(
                    "Expiry worker '{}' left slot {} to its handler",
                    self.name,
                    slot
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{test_connection, PacketRef, PacketTable};
    use crate::pool::PoolConfig;
    use crate::timer::{Action, TimerState};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records which packets it retransmitted, skipping stale ones.
    struct Retransmitter {
        packets: Arc<Mutex<PacketTable<&'static str>>>,
        sent: Arc<Mutex<Vec<&'static str>>>,
        disposition: Disposition,
    }

    #[async_trait]
    impl ExpiryHandler for Retransmitter {
        async fn on_expiry(&self, record: ExpiryRecord) -> Disposition {
            let payload = record
                .packet()
                .and_then(|p| self.packets.lock().unwrap().get(p.0).copied());
            if let (Action::Retransmit, Some(payload)) = (record.action(), payload) {
                self.sent.lock().unwrap().push(payload);
            }
            self.disposition
        }
    }

    fn setup(
        disposition: Disposition,
    ) -> (
        TimerPool,
        ExpiryQueue,
        Retransmitter,
        Arc<Mutex<PacketTable<&'static str>>>,
        Arc<Mutex<Vec<&'static str>>>,
    ) {
        let config = PoolConfig::default().with_name("worker").with_capacity(4);
        let (pool, queue) = TimerPool::new(config, CancellationToken::new()).unwrap();
        let packets = Arc::new(Mutex::new(PacketTable::with_key()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let handler = Retransmitter {
            packets: packets.clone(),
            sent: sent.clone(),
            disposition,
        };
        (pool, queue, handler, packets, sent)
    }

    fn arm(pool: &TimerPool, packet: PacketRef) {
        let slot = pool.find_free_slot().unwrap();
        pool.set_interval(slot, Duration::from_millis(50)).unwrap();
        pool.set_action(
            slot,
            Action::Retransmit,
            Some(packet),
            Some(test_connection(1)),
        )
        .unwrap();
        pool.start(slot).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_handles_and_releases() {
        let (pool, queue, handler, packets, sent) = setup(Disposition::Release);
        let live = PacketRef(packets.lock().unwrap().insert("seg-1"));
        let gone = PacketRef(packets.lock().unwrap().insert("seg-2"));
        arm(&pool, live);
        arm(&pool, gone);
        // Acknowledged and discarded before its timer fired.
        packets.lock().unwrap().remove(gone.0);

        let cancel_token = CancellationToken::new();
        let worker = ExpiryWorker::new(
            "test".to_string(),
            pool.clone(),
            queue,
            handler,
            cancel_token.clone(),
        );
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*sent.lock().unwrap(), vec!["seg-1"]);
        assert_eq!(pool.free_slots(), 4);

        cancel_token.cancel();
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retains_slot() {
        let (pool, queue, handler, packets, _sent) = setup(Disposition::Retain);
        let packet = PacketRef(packets.lock().unwrap().insert("seg-1"));
        arm(&pool, packet);

        let cancel_token = CancellationToken::new();
        let worker = ExpiryWorker::new(
            "test".to_string(),
            pool.clone(),
            queue,
            handler,
            cancel_token.clone(),
        );
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.state(0).unwrap(), TimerState::Stopped);
        assert_eq!(pool.free_slots(), 3);

        let slot = pool.lookup(packet).unwrap();
        pool.free(slot).unwrap();
        assert_eq!(pool.free_slots(), 4);

        cancel_token.cancel();
        assert_eq!(task.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_drains_queue_after_shutdown() {
        let (pool, queue, handler, packets, sent) = setup(Disposition::Release);
        let packet = PacketRef(packets.lock().unwrap().insert("seg-1"));
        arm(&pool, packet);
        tokio::time::sleep(Duration::from_millis(100)).await;

        pool.shutdown();
        let worker = ExpiryWorker::new(
            "test".to_string(),
            pool.clone(),
            queue,
            handler,
            CancellationToken::new(),
        );

        // The record queued before shutdown is still handled.
        assert_eq!(worker.run().await, 1);
        assert_eq!(*sent.lock().unwrap(), vec!["seg-1"]);
        assert_eq!(pool.free_slots(), 4);
    }
}
