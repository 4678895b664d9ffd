//! Error types for timer pool operations.

use thiserror::Error;

use crate::handle::PacketRef;
use crate::timer::{SlotId, TimerState};

/// A convenience wrapper around `Result` for [`TimerError`].
pub type Result<T> = std::result::Result<T, TimerError>;

/// Errors surfaced by the timer pool.
///
/// `InvalidConfiguration`, `InvalidState`, `ExpiryPending` and `StaleSlot` are
/// caller bugs and are never retried internally. `PoolExhausted` is expected
/// backpressure that the protocol engine must handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TimerError {
    #[error("invalid timer configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("cannot {operation} slot {slot} while it is {state}")]
    InvalidState {
        slot: SlotId,
        state: TimerState,
        operation: &'static str,
    },

    #[error("slot {0} has fired and must be freed before it can be started again")]
    ExpiryPending(SlotId),

    #[error("timer pool exhausted: all {capacity} slots are in use")]
    PoolExhausted { capacity: usize },

    #[error("slot id {0} refers to a previous allocation")]
    StaleSlot(SlotId),

    #[error("slot index {index} out of range for a pool of {capacity} slots")]
    UnknownSlot { index: usize, capacity: usize },

    #[error("{packet} already has a timer in slot {slot}")]
    PacketAlreadyArmed { packet: PacketRef, slot: SlotId },

    #[error("timer pool must be created from within a tokio runtime")]
    NoRuntime,

    #[error("timer pool has been shut down")]
    ShutDown,
}

impl TimerError {
    /// Whether the caller may recover by waiting for a slot to be freed.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, TimerError::PoolExhausted { .. })
    }
}
