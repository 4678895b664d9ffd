//! Timer control block: the per-slot state machine.
//!
//! A slot moves `Free -> Stopped` when the pool hands it out, `Stopped ->
//! Started` when armed, and back to `Stopped` when it fires or is stopped.
//! Only [`TimerControlBlock::release`] returns it to `Free`.
//!
//! Two counters keep stale actors out:
//! - the *generation* is bumped on every release and is part of the
//!   [`SlotId`], so an id from a previous allocation cannot touch the slot;
//! - the *epoch* is bumped on every arm, stop and release, so a countdown that
//!   was already scheduled when the slot was stopped or freed cannot fire it.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, TimerError};
use crate::handle::{ConnectionRef, PacketRef};

/// Identifies one allocation of one slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

impl SlotId {
    pub const fn new(index: usize, generation: u64) -> Self {
        SlotId { index, generation }
    }

    /// Position of the slot in the pool.
    pub const fn index(self) -> usize {
        self.index
    }

    pub const fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.generation)
    }
}

/// Timer state enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Free,
    Started,
    Stopped,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            TimerState::Free => "free",
            TimerState::Started => "started",
            TimerState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// What the consumer of an expiry record should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Retransmit,
    FreeTCB,
}

/// The action a slot is armed for, plus the entities it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    action: Action,
    packet: Option<PacketRef>,
    connection: Option<ConnectionRef>,
}

impl Binding {
    /// Fails unless at least one reference is present.
    pub fn new(
        action: Action,
        packet: Option<PacketRef>,
        connection: Option<ConnectionRef>,
    ) -> Result<Self> {
        if packet.is_none() && connection.is_none() {
            return Err(TimerError::InvalidConfiguration(
                "an action needs a packet or a connection reference",
            ));
        }
        Ok(Binding {
            action,
            packet,
            connection,
        })
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn packet(&self) -> Option<PacketRef> {
        self.packet
    }

    pub fn connection(&self) -> Option<ConnectionRef> {
        self.connection
    }
}

/// Everything the pool needs to schedule a countdown after a successful arm.
#[derive(Debug)]
pub(crate) struct Armed {
    pub(crate) epoch: u64,
    pub(crate) interval: Duration,
}

/// State of a single pool slot.
///
/// All transitions happen under the slot's mutex in the pool.
pub(crate) struct TimerControlBlock {
    index: usize,
    generation: u64,
    epoch: u64,
    state: TimerState,
    interval: Option<Duration>,
    binding: Option<Binding>,
    expiry_pending: bool,
    countdown: Option<CancellationToken>,
}

impl TimerControlBlock {
    pub(crate) fn new(index: usize) -> Self {
        TimerControlBlock {
            index,
            generation: 0,
            epoch: 0,
            state: TimerState::Free,
            interval: None,
            binding: None,
            expiry_pending: false,
            countdown: None,
        }
    }

    pub(crate) fn id(&self) -> SlotId {
        SlotId::new(self.index, self.generation)
    }

    pub(crate) fn state(&self) -> TimerState {
        self.state
    }

    pub(crate) fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub(crate) fn binding(&self) -> Option<Binding> {
        self.binding
    }

    /// Whether `id` names the current allocation of this slot.
    pub(crate) fn is_current(&self, id: SlotId) -> bool {
        self.state != TimerState::Free && id.generation == self.generation
    }

    /// Fails unless `id` names the current allocation: `InvalidState` if the
    /// slot has since been freed, `StaleSlot` if it was handed out again.
    pub(crate) fn check(&self, id: SlotId, operation: &'static str) -> Result<()> {
        if self.state == TimerState::Free {
            Err(TimerError::InvalidState {
                slot: id,
                state: TimerState::Free,
                operation,
            })
        } else if id.generation != self.generation {
            Err(TimerError::StaleSlot(id))
        } else {
            Ok(())
        }
    }

    /// Take a free slot out of the pool.
    ///
    /// Only called for indices popped from the free-list, which holds
    /// exactly the `Free` slots.
    pub(crate) fn claim(&mut self) -> SlotId {
        debug_assert_eq!(
            self.state,
            TimerState::Free,
            "slot {} on the free-list while in use",
            self.id()
        );
        self.state = TimerState::Stopped;
        self.id()
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(TimerError::InvalidConfiguration(
                "interval must be greater than zero",
            ));
        }
        if self.state == TimerState::Free {
            return Err(self.invalid_state("set the interval of"));
        }
        self.interval = Some(interval);
        Ok(())
    }

    /// Replace the binding, returning the previous one.
    pub(crate) fn set_binding(&mut self, binding: Binding) -> Result<Option<Binding>> {
        if self.state != TimerState::Stopped {
            return Err(self.invalid_state("set the action of"));
        }
        Ok(self.binding.replace(binding))
    }

    /// Transition to `Started`, storing the countdown's cancellation token.
    pub(crate) fn arm(&mut self, countdown: CancellationToken) -> Result<Armed> {
        if self.state != TimerState::Stopped {
            return Err(self.invalid_state("start"));
        }
        if self.expiry_pending {
            return Err(TimerError::ExpiryPending(self.id()));
        }
        let interval = self
            .interval
            .ok_or(TimerError::InvalidConfiguration("interval must be set before start"))?;
        if self.binding.is_none() {
            return Err(TimerError::InvalidConfiguration(
                "action must be set before start",
            ));
        }

        self.epoch += 1;
        self.state = TimerState::Started;
        self.countdown = Some(countdown);
        Ok(Armed {
            epoch: self.epoch,
            interval,
        })
    }

    /// Cancel a running countdown. Returns whether the slot was running.
    pub(crate) fn stop(&mut self) -> Result<bool> {
        match self.state {
            TimerState::Free => Err(self.invalid_state("stop")),
            TimerState::Stopped => Ok(false),
            TimerState::Started => {
                self.cancel_countdown();
                self.state = TimerState::Stopped;
                Ok(true)
            }
        }
    }

    /// Called by the countdown for `epoch`. Returns the binding to publish,
    /// or `None` if the arming was stopped or freed in the meantime.
    pub(crate) fn expire(&mut self, epoch: u64) -> Option<Binding> {
        if self.state != TimerState::Started || self.epoch != epoch {
            return None;
        }
        self.countdown = None;
        self.state = TimerState::Stopped;
        self.expiry_pending = true;
        self.binding
    }

    /// Return the slot to `Free`, handing back the binding it held.
    pub(crate) fn release(&mut self) -> Option<Binding> {
        self.cancel_countdown();
        self.state = TimerState::Free;
        self.generation += 1;
        self.interval = None;
        self.expiry_pending = false;
        self.binding.take()
    }

    /// Invalidate the current arming and cancel its countdown, if any.
    fn cancel_countdown(&mut self) {
        self.epoch += 1;
        if let Some(token) = self.countdown.take() {
            token.cancel();
        }
    }

    fn invalid_state(&self, operation: &'static str) -> TimerError {
        TimerError::InvalidState {
            slot: self.id(),
            state: self.state,
            operation,
        }
    }
}
