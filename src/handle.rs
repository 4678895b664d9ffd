//! Non-owning, generation-tagged references to packets and connections.
//!
//! The timer pool never owns the packets or connections it is armed for. It
//! stores [`PacketRef`] and [`ConnectionRef`] values, which wrap `slotmap`
//! keys issued by a [`PacketTable`] or [`ConnectionTable`] owned by the
//! protocol engine. Once the engine removes an entry, every outstanding key to
//! it stops resolving, so consumers of expiry records re-validate their
//! references through the table before acting on them.

use std::fmt;

use slotmap::{Key, SlotMap};

slotmap::new_key_type! {
    /// Key of a packet awaiting acknowledgement.
    pub struct PacketKey;

    /// Key of a connection record (TCB).
    pub struct ConnectionKey;
}

/// Packets owned by the protocol engine.
pub type PacketTable<T> = SlotMap<PacketKey, T>;

/// Connection records owned by the protocol engine.
pub type ConnectionTable<T> = SlotMap<ConnectionKey, T>;

/// Reference to a packet awaiting acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketRef(pub PacketKey);

/// Reference to a connection record (TCB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionRef(pub ConnectionKey);

impl From<PacketKey> for PacketRef {
    fn from(key: PacketKey) -> Self {
        PacketRef(key)
    }
}

impl From<ConnectionKey> for ConnectionRef {
    fn from(key: ConnectionKey) -> Self {
        ConnectionRef(key)
    }
}

impl fmt::Display for PacketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet {:?}", self.0.data())
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {:?}", self.0.data())
    }
}

#[cfg(test)]
pub(crate) fn test_packet(n: u64) -> PacketRef {
    PacketRef(slotmap::KeyData::from_ffi(n).into())
}

#[cfg(test)]
pub(crate) fn test_connection(n: u64) -> ConnectionRef {
    ConnectionRef(slotmap::KeyData::from_ffi(n).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_packet_no_longer_resolves() {
        let mut packets = PacketTable::with_key();
        let old = PacketRef(packets.insert("syn"));
        assert_eq!(packets.get(old.0), Some(&"syn"));

        assert_eq!(packets.remove(old.0), Some("syn"));
        assert!(!packets.contains_key(old.0));

        // The storage is reused under a new version.
        let new = PacketRef(packets.insert("ack"));
        assert_ne!(new, old);
        assert_eq!(packets.get(old.0), None);
        assert_eq!(packets.get(new.0), Some(&"ack"));
    }

    #[test]
    fn test_display() {
        let mut connections = ConnectionTable::with_key();
        let conn = ConnectionRef::from(connections.insert(()));
        assert!(conn.to_string().starts_with("connection "));
        assert_eq!(test_packet(5).to_string(), "packet 5v1");
    }
}
