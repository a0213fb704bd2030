//! Room membership and fan-out backends.
//!
//! An [`Adapter`] answers two questions for a namespace: which rooms a socket
//! is in, and which sockets a broadcast should reach. The namespace does the
//! actual writes; a cross-process adapter would additionally forward the
//! broadcast to its peers.
//!
//! Adapters are built by an [`AdapterFactory`]. The server holds one factory
//! for all namespaces; swapping it re-initializes every namespace's adapter.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use switchboard_proto::Packet;

use crate::error::AdapterError;

/// Room name.
pub type Room = String;

/// Socket id within a namespace.
pub type SocketId = String;

/// Name of the stock in-memory adapter.
pub const DEFAULT_ADAPTER: &str = "default";

/// Recipient selection for a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Target rooms; empty means every socket in the namespace
    pub rooms: BTreeSet<Room>,
    /// Sockets to skip
    pub except: BTreeSet<SocketId>,
    /// Compression hint for transports that support it
    pub compress: bool,
}

/// Room membership backend for one namespace.
pub trait Adapter: Send + Sync {
    /// Add a socket to a room.
    fn add(&self, sid: &str, room: &str);

    /// Remove a socket from a room.
    fn del(&self, sid: &str, room: &str);

    /// Remove a socket from every room.
    fn del_all(&self, sid: &str);

    /// Rooms a socket is in.
    fn rooms_of(&self, sid: &str) -> Vec<Room>;

    /// Sockets in any of `rooms`, or every known socket when `rooms` is empty.
    fn sockets(&self, rooms: &BTreeSet<Room>) -> Vec<SocketId>;

    /// Resolve the local recipients of a broadcast.
    ///
    /// `packet` is passed so that distributed adapters can forward it; the
    /// in-memory adapter only looks at `opts`.
    fn broadcast_targets(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
    ) -> Result<Vec<SocketId>, AdapterError>;
}

/// Builds adapters for namespaces.
pub trait AdapterFactory: Send + Sync {
    /// Identifier of this adapter kind.
    fn name(&self) -> &str;

    /// Create an adapter for the namespace `nsp`.
    fn create(&self, nsp: &str) -> Box<dyn Adapter>;
}

/// Factory for [`MemoryAdapter`], registered as `"default"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryAdapterFactory;

impl AdapterFactory for MemoryAdapterFactory {
    fn name(&self) -> &str {
        DEFAULT_ADAPTER
    }

    fn create(&self, _nsp: &str) -> Box<dyn Adapter> {
        Box::new(MemoryAdapter::new())
    }
}

#[derive(Debug, Default)]
struct Rooms {
    /// Room → member sockets
    members: BTreeMap<Room, BTreeSet<SocketId>>,
    /// Socket → joined rooms
    joined: BTreeMap<SocketId, BTreeSet<Room>>,
}

/// In-process adapter.
///
/// Maintains bidirectional mappings: room → sockets (for broadcast) and
/// socket → rooms (for cleanup on disconnect). Empty rooms are dropped as soon
/// as their last member leaves. Ordered maps keep recipient order stable.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    rooms: RwLock<Rooms>,
}

impl MemoryAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sockets in a room.
    pub fn room_len(&self, room: &str) -> usize {
        self.rooms.read().members.get(room).map_or(0, BTreeSet::len)
    }
}

impl Adapter for MemoryAdapter {
    fn add(&self, sid: &str, room: &str) {
        let mut rooms = self.rooms.write();
        rooms.members.entry(room.to_string()).or_default().insert(sid.to_string());
        rooms.joined.entry(sid.to_string()).or_default().insert(room.to_string());
    }

    fn del(&self, sid: &str, room: &str) {
        let mut rooms = self.rooms.write();

        if let Some(members) = rooms.members.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                rooms.members.remove(room);
            }
        }

        if let Some(joined) = rooms.joined.get_mut(sid) {
            joined.remove(room);
            if joined.is_empty() {
                rooms.joined.remove(sid);
            }
        }
    }

    fn del_all(&self, sid: &str) {
        let mut rooms = self.rooms.write();
        let Some(joined) = rooms.joined.remove(sid) else {
            return;
        };

        for room in &joined {
            if let Some(members) = rooms.members.get_mut(room) {
                members.remove(sid);
                if members.is_empty() {
                    rooms.members.remove(room);
                }
            }
        }
    }

    fn rooms_of(&self, sid: &str) -> Vec<Room> {
        self.rooms.read().joined.get(sid).map(|r| r.iter().cloned().collect()).unwrap_or_default()
    }

    fn sockets(&self, rooms: &BTreeSet<Room>) -> Vec<SocketId> {
        let state = self.rooms.read();

        if rooms.is_empty() {
            return state.joined.keys().cloned().collect();
        }

        let unique: BTreeSet<&SocketId> =
            rooms.iter().filter_map(|room| state.members.get(room)).flatten().collect();
        unique.into_iter().cloned().collect()
    }

    fn broadcast_targets(
        &self,
        _packet: &Packet,
        opts: &BroadcastOptions,
    ) -> Result<Vec<SocketId>, AdapterError> {
        let mut targets = self.sockets(&opts.rooms);
        targets.retain(|sid| !opts.except.contains(sid));
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooms(names: &[&str]) -> BTreeSet<Room> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn add_and_lookup() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "lobby");
        adapter.add("b", "lobby");
        adapter.add("a", "a");

        assert_eq!(adapter.sockets(&rooms(&["lobby"])), vec!["a", "b"]);
        assert_eq!(adapter.rooms_of("a"), vec!["a", "lobby"]);
        assert_eq!(adapter.room_len("lobby"), 2);
    }

    #[test]
    fn sockets_in_several_rooms_are_deduplicated() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "x");
        adapter.add("a", "y");
        adapter.add("b", "y");

        assert_eq!(adapter.sockets(&rooms(&["x", "y"])), vec!["a", "b"]);
    }

    #[test]
    fn empty_room_selection_means_everyone() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "a");
        adapter.add("b", "b");

        assert_eq!(adapter.sockets(&BTreeSet::new()), vec!["a", "b"]);
    }

    #[test]
    fn del_drops_empty_rooms() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "lobby");
        adapter.del("a", "lobby");

        assert_eq!(adapter.room_len("lobby"), 0);
        assert!(adapter.rooms_of("a").is_empty());
        assert!(adapter.sockets(&BTreeSet::new()).is_empty());
    }

    #[test]
    fn del_all_removes_every_membership() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "x");
        adapter.add("a", "y");
        adapter.add("b", "x");

        adapter.del_all("a");

        assert_eq!(adapter.sockets(&rooms(&["x"])), vec!["b"]);
        assert_eq!(adapter.room_len("y"), 0);
        assert!(adapter.rooms_of("a").is_empty());
    }

    #[test]
    fn broadcast_targets_honour_except() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "x");
        adapter.add("b", "x");

        let opts = BroadcastOptions {
            rooms: rooms(&["x"]),
            except: ["a".to_string()].into_iter().collect(),
            compress: false,
        };
        let packet = Packet::event("/", "ping", vec![]);

        assert_eq!(adapter.broadcast_targets(&packet, &opts).unwrap(), vec!["b"]);
    }

    #[test]
    fn factory_is_named_default() {
        assert_eq!(MemoryAdapterFactory.name(), "default");
    }
}
