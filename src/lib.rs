//! # Retransmit Timers
//!
//! A fixed-capacity pool of retransmission timers for a TCP-like protocol
//! engine, built on top of Tokio.
//!
//! Each timer ties an expiry to the packet that may need retransmitting and the
//! connection that owns it. When a timer fires, the pool publishes an immutable
//! [`ExpiryRecord`] on an [`ExpiryQueue`] so the record is processed outside
//! the timer's own context.
//!
//! ## Features
//!
//! - **Fixed Capacity**: Slots are allocated from a free-list and recycled, never created per timer
//! - **Race-free Allocation**: Concurrent callers never receive the same slot
//! - **Exactly-once Expiry**: Each arming publishes at most one record, and none once freed
//! - **Stale-safe Handles**: Slot ids, packets and connections are generation-tagged
//! - **Packet Lookup**: Find the slot armed for a packet without scanning
//! - **Graceful Shutdown**: Support for cancellation tokens and clean shutdowns
//!
//! ## Quick Start
//!
//! ```rust
//! use retransmit_timers::{
//!     Action, ConnectionRef, ConnectionTable, PacketRef, PacketTable, PoolConfig, TimerPool,
//! };
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut packets = PacketTable::with_key();
//!     let mut connections = ConnectionTable::with_key();
//!     let packet = PacketRef(packets.insert(b"payload".to_vec()));
//!     let connection = ConnectionRef(connections.insert("10.0.0.1:80"));
//!
//!     // Create the pool and its expiry queue
//!     let config = PoolConfig::default().with_name("my_pool").with_capacity(16);
//!     let (pool, mut queue) = TimerPool::new(config, CancellationToken::new())?;
//!
//!     // Arm a retransmission timer
//!     let slot = pool.find_free_slot()?;
//!     pool.set_interval(slot, Duration::from_millis(20))?;
//!     pool.set_action(slot, Action::Retransmit, Some(packet), Some(connection))?;
//!     pool.start(slot)?;
//!
//!     // Wait for the expiry and re-validate the references before acting
//!     if let Some(record) = queue.dequeue().await {
//!         if let Some(bytes) = record.packet().and_then(|p| packets.get(p.0)) {
//!             println!("retransmitting {} bytes", bytes.len());
//!         }
//!         pool.free(record.slot())?;
//!     }
//!
//!     pool.shutdown();
//!     Ok(())
//! }
//! ```

mod countdown;
mod error;
mod handle;
mod pool;
mod queue;
mod timer;
mod worker;

pub use error::{Result, TimerError};
pub use handle::{
    ConnectionKey, ConnectionRef, ConnectionTable, PacketKey, PacketRef, PacketTable,
};
pub use pool::{PoolConfig, TimerPool};
pub use queue::{ExpiryQueue, ExpiryRecord};
pub use timer::{Action, Binding, SlotId, TimerState};
pub use worker::{Disposition, ExpiryHandler, ExpiryWorker};

// Re-export commonly used types for convenience
pub use slotmap::SlotMap;
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;
