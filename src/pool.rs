use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::countdown;
use crate::error::{Result, TimerError};
use crate::handle::{ConnectionRef, PacketRef};
use crate::queue::{self, ExpiryQueue, ExpiryRecord, ExpirySender};
use crate::timer::{Action, Binding, SlotId, TimerControlBlock, TimerState};

/// Timer pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Instance name for logging
    pub name: String,

    /// Maximum number of concurrently outstanding timers
    pub capacity: usize,
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: "timer_pool".to_string(),
            capacity: 64,
        }
    }
}

struct Shared {
    /// Instance name for logging
    name: String,

    /// One mutex per slot; a slot's transitions never contend with another's
    slots: Box<[Mutex<TimerControlBlock>]>,

    /// Indices of `Free` slots
    free_list: Mutex<Vec<usize>>,

    /// Packet -> slot bound to it, maintained under the slot's lock
    by_packet: Mutex<HashMap<PacketRef, SlotId>>,

    /// Producer side of the expiry queue, dropped on shutdown
    expiry_tx: Mutex<Option<ExpirySender>>,

    /// Runtime the countdowns run on
    runtime: Handle,

    /// Child of the caller's token and parent of every countdown's token
    cancel_token: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Lets the cancellation watcher exit.
        self.cancel_token.cancel();
    }
}

/// Fixed-capacity pool of retransmission timers.
///
/// Cloning the pool yields another handle to the same slots.
#[derive(Clone)]
pub struct TimerPool {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section leaves its data consistent before it can panic.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TimerPool {
    /// Create a new pool and the queue its expiry records are published on.
    ///
    /// Must be called from within a tokio runtime; countdowns are spawned
    /// onto that runtime. Cancelling `cancel_token` shuts the pool down
    /// exactly like [`Self::shutdown`].
    ///
    /// Returns (TimerPool, ExpiryQueue)
    pub fn new(config: PoolConfig, cancel_token: CancellationToken) -> Result<(Self, ExpiryQueue)> {
        if config.capacity == 0 {
            return Err(TimerError::InvalidConfiguration(
                "pool capacity must be greater than zero",
            ));
        }
        let runtime = Handle::try_current().map_err(|_| TimerError::NoRuntime)?;
        let (expiry_tx, expiry_queue) = queue::channel();

        let slots = (0..config.capacity)
            .map(|index| Mutex::new(TimerControlBlock::new(index)))
            .collect();
        // Popped from the back, so slot 0 is handed out first.
        let free_list = (0..config.capacity).rev().collect();

        log::info!(
            "Timer pool '{}' created with {} slots",
            config.name,
            config.capacity
        );

        let pool = TimerPool {
            shared: Arc::new(Shared {
                name: config.name,
                slots,
                free_list: Mutex::new(free_list),
                by_packet: Mutex::new(HashMap::new()),
                expiry_tx: Mutex::new(Some(expiry_tx)),
                runtime: runtime.clone(),
                cancel_token: cancel_token.child_token(),
            }),
        };

        let watched = pool.shared.cancel_token.clone();
        let shared = Arc::downgrade(&pool.shared);
        runtime.spawn(watch_cancellation(watched, shared));

        Ok((pool, expiry_queue))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Number of slots currently `Free`.
    pub fn free_slots(&self) -> usize {
        lock(&self.shared.free_list).len()
    }

    /// Claim a free slot. The slot comes back `Stopped` and unconfigured.
    ///
    /// Concurrent callers never receive the same slot. Returns
    /// `PoolExhausted` while every slot is in use.
    pub fn find_free_slot(&self) -> Result<SlotId> {
        let index = lock(&self.shared.free_list)
            .pop()
            .ok_or(TimerError::PoolExhausted {
                capacity: self.capacity(),
            })?;
        let id = lock(&self.shared.slots[index]).claim();
        log::debug!("Timer pool '{}' allocated slot {}", self.shared.name, id);
        Ok(id)
    }

    /// Slot currently bound to `packet`, whether running or stopped.
    pub fn lookup(&self, packet: PacketRef) -> Option<SlotId> {
        lock(&self.shared.by_packet).get(&packet).copied()
    }

    /// Set the interval used by the next `start`.
    pub fn set_interval(&self, slot: SlotId, interval: Duration) -> Result<()> {
        let mut tcb = self.slot(slot)?;
        tcb.check(slot, "set the interval of")?;
        tcb.set_interval(interval)
    }

    /// Bind the slot to an action and the entities it concerns.
    ///
    /// Rejected while the slot is `Started`; stop it first. A packet can be
    /// bound to at most one slot at a time.
    pub fn set_action(
        &self,
        slot: SlotId,
        action: Action,
        packet: Option<PacketRef>,
        connection: Option<ConnectionRef>,
    ) -> Result<()> {
        let binding = Binding::new(action, packet, connection)?;
        let mut tcb = self.slot(slot)?;
        tcb.check(slot, "set the action of")?;

        let mut by_packet = lock(&self.shared.by_packet);
        if let Some(packet) = packet {
            match by_packet.get(&packet) {
                Some(&owner) if owner != slot => {
                    return Err(TimerError::PacketAlreadyArmed {
                        packet,
                        slot: owner,
                    });
                }
                _ => {}
            }
        }

        let previous = tcb.set_binding(binding)?;
        if let Some(old) = previous.and_then(|b| b.packet()) {
            by_packet.remove(&old);
        }
        if let Some(packet) = packet {
            by_packet.insert(packet, slot);
        }
        Ok(())
    }

    /// Arm the countdown with the configured interval.
    pub fn start(&self, slot: SlotId) -> Result<()> {
        let mut tcb = self.slot(slot)?;
        tcb.check(slot, "start")?;
        if self.shared.cancel_token.is_cancelled() {
            return Err(TimerError::ShutDown);
        }

        let token = self.shared.cancel_token.child_token();
        let armed = tcb.arm(token.clone())?;

        let shared = Arc::clone(&self.shared);
        let epoch = armed.epoch;
        countdown::spawn(&self.shared.runtime, armed.interval, token, move || {
            shared.fire(slot.index(), epoch);
        });

        log::debug!(
            "Timer pool '{}' started slot {} for {:?}",
            self.shared.name,
            slot,
            armed.interval
        );
        Ok(())
    }

    /// Cancel the countdown but keep the slot and its configuration.
    ///
    /// The slot can be started again. Stopping a stopped slot is a no-op.
    pub fn stop(&self, slot: SlotId) -> Result<()> {
        let mut tcb = self.slot(slot)?;
        tcb.check(slot, "stop")?;
        if tcb.stop()? {
            log::debug!("Timer pool '{}' stopped slot {}", self.shared.name, slot);
        }
        Ok(())
    }

    /// Cancel any running countdown and return the slot to the pool.
    ///
    /// A record already published for this slot is not retracted. Freeing a
    /// slot that is already free, or through an id from an earlier
    /// allocation, does nothing.
    pub fn free(&self, slot: SlotId) -> Result<()> {
        {
            let mut tcb = self.slot(slot)?;
            if !tcb.is_current(slot) {
                return Ok(());
            }
            let binding = tcb.release();
            if let Some(packet) = binding.and_then(|b| b.packet()) {
                let mut by_packet = lock(&self.shared.by_packet);
                if by_packet.get(&packet) == Some(&slot) {
                    by_packet.remove(&packet);
                }
            }
        }

        lock(&self.shared.free_list).push(slot.index());
        log::debug!("Timer pool '{}' freed slot {}", self.shared.name, slot);
        Ok(())
    }

    /// Current state of the slot at `index`.
    pub fn state(&self, index: usize) -> Result<TimerState> {
        Ok(self.slot_at(index)?.state())
    }

    pub fn interval(&self, slot: SlotId) -> Result<Option<Duration>> {
        let tcb = self.slot(slot)?;
        tcb.check(slot, "read")?;
        Ok(tcb.interval())
    }

    /// Action and references the slot is bound to, if configured.
    pub fn binding(&self, slot: SlotId) -> Result<Option<Binding>> {
        let tcb = self.slot(slot)?;
        tcb.check(slot, "read")?;
        Ok(tcb.binding())
    }

    /// Cancel every outstanding countdown, refuse further starts and close
    /// the expiry queue.
    ///
    /// Running slots become `Stopped`; nothing is published after this
    /// returns. Records already queued can still be dequeued. Slots can
    /// still be configured, freed and allocated.
    pub fn shutdown(&self) {
        self.shared.shut_down();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel_token.is_cancelled()
    }

    fn slot(&self, slot: SlotId) -> Result<MutexGuard<'_, TimerControlBlock>> {
        self.slot_at(slot.index())
    }

    fn slot_at(&self, index: usize) -> Result<MutexGuard<'_, TimerControlBlock>> {
        self.shared
            .slots
            .get(index)
            .map(lock)
            .ok_or(TimerError::UnknownSlot {
                index,
                capacity: self.capacity(),
            })
    }
}

/// Shuts the pool down once its token is cancelled from outside.
async fn watch_cancellation(token: CancellationToken, shared: Weak<Shared>) {
    token.cancelled().await;
    if let Some(shared) = shared.upgrade() {
        shared.shut_down();
    }
}

impl Shared {
    fn shut_down(&self) {
        self.cancel_token.cancel();
        let Some(expiry_tx) = lock(&self.expiry_tx).take() else {
            return;
        };
        let stopped = self
            .slots
            .iter()
            .map(|slot| lock(slot).stop())
            .filter(|stopped| matches!(stopped, Ok(true)))
            .count();
        drop(expiry_tx);
        log::info!(
            "Timer pool '{}' shut down, {} running timer(s) cancelled",
            self.name,
            stopped
        );
    }

    /// Countdown callback. Stops the slot and publishes its record, unless
    /// the arming for `epoch` was stopped or freed first.
    fn fire(&self, index: usize, epoch: u64) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        // Publishing under the slot lock orders the record before any free.
        let mut tcb = lock(slot);
        let Some(binding) = tcb.expire(epoch) else {
            return;
        };
        let record = ExpiryRecord::new(tcb.id(), binding);
        log::debug!("Timer pool '{}' slot {} expired", self.name, record.slot());

        let sent = lock(&self.expiry_tx)
            .as_ref()
            .is_some_and(|tx| tx.send(record).is_ok());
        if !sent {
            log::warn!(
                "Expiry queue of timer pool '{}' closed, dropping expiry of slot {}",
                self.name,
                record.slot()
            );
        }
    }
}
