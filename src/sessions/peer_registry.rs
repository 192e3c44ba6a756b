//! Arena of the peers a session knows about.
//!
//! Peers are addressed by [`PeerHandle`]s that are never reused; names are an auxiliary index
//! into the arena, so two records can never silently share a name.

use std::collections::BTreeMap;

use crate::error::MeshError;
use crate::network::messages::PeerRecord;
use crate::network::peer::Peer;
use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::{debug_check_invariants, PeerHandle};

/// Registry of every peer a session knows about.
///
/// # Note
///
/// This type is re-exported in [`__internal`](crate::__internal) for testing.
/// It is not part of the stable public API.
pub struct PeerRegistry {
    peers: BTreeMap<PeerHandle, Peer>,
    names: BTreeMap<String, PeerHandle>,
    next_handle: u64,
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            peers,
            names,
            next_handle,
        } = self;

        f.debug_struct("PeerRegistry")
            .field("peers", &peers.values().collect::<Vec<_>>())
            .field("names", names)
            .field("next_handle", next_handle)
            .finish()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
            names: BTreeMap::new(),
            next_handle: 0,
        }
    }

    /// Reserves the handle for the next peer.
    pub fn allocate_handle(&mut self) -> PeerHandle {
        let handle = PeerHandle::new(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Adds `peer` under its own handle, indexing its name if it has one.
    ///
    /// # Errors
    ///
    /// [`MeshError::InvalidRequest`] if the handle or the name is already taken.
    pub fn insert(&mut self, peer: Peer) -> Result<PeerHandle, MeshError> {
        let handle = peer.handle();
        if self.peers.contains_key(&handle) {
            return Err(MeshError::InvalidRequest {
                info: format!("peer handle {handle} is already registered"),
            });
        }
        if let Some(name) = peer.name() {
            if self.names.contains_key(name) {
                return Err(MeshError::InvalidRequest {
                    info: format!("a peer named {name} is already registered"),
                });
            }
            self.names.insert(name.to_owned(), handle);
        }
        self.peers.insert(handle, peer);
        debug_check_invariants!(self, "PeerRegistry::insert");
        Ok(handle)
    }

    /// The peer behind `handle`.
    #[must_use]
    pub fn get(&self, handle: PeerHandle) -> Option<&Peer> {
        self.peers.get(&handle)
    }

    /// Mutable access to the peer behind `handle`.
    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.peers.get_mut(&handle)
    }

    /// The handle registered under `name`.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<PeerHandle> {
        self.names.get(name).copied()
    }

    /// Whether `name` belongs to some peer.
    #[must_use]
    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Names the peer behind `handle`.
    ///
    /// # Errors
    ///
    /// [`MeshError::UnknownPeer`] if the handle is not registered, [`MeshError::InvalidRequest`]
    /// if another peer already has the name.
    pub fn rename(&mut self, handle: PeerHandle, name: &str) -> Result<(), MeshError> {
        match self.names.get(name) {
            Some(owner) if *owner == handle => return Ok(()),
            Some(_) => {
                return Err(MeshError::InvalidRequest {
                    info: format!("a peer named {name} is already registered"),
                });
            },
            None => {},
        }
        let peer = self.peers.get_mut(&handle).ok_or_else(|| MeshError::UnknownPeer {
            name: handle.to_string(),
        })?;
        if let Some(old) = peer.name() {
            self.names.remove(old);
        }
        peer.set_name(name.to_owned());
        self.names.insert(name.to_owned(), handle);
        debug_check_invariants!(self, "PeerRegistry::rename");
        Ok(())
    }

    /// Takes the peer out of the registry and disconnects it.
    pub fn remove(&mut self, handle: PeerHandle) -> Option<Peer> {
        let mut peer = self.peers.remove(&handle)?;
        if let Some(name) = peer.name() {
            if self.names.get(name) == Some(&handle) {
                self.names.remove(name);
            }
        }
        peer.disconnect();
        debug_check_invariants!(self, "PeerRegistry::remove");
        Some(peer)
    }

    /// Moves the transport of `donor` into `target` and drops the donor record.
    ///
    /// Used when an anonymous inbound connection turns out to belong to a participant that
    /// already has a record (announced by the host but not yet connected).
    ///
    /// # Errors
    ///
    /// [`MeshError::UnknownPeer`] if either handle is not registered. The donor is gone either way.
    pub fn absorb(&mut self, target: PeerHandle, donor: PeerHandle) -> Result<(), MeshError> {
        let mut donor_peer = self.peers.remove(&donor).ok_or_else(|| MeshError::UnknownPeer {
            name: donor.to_string(),
        })?;
        if let Some(name) = donor_peer.name() {
            if self.names.get(name) == Some(&donor) {
                self.names.remove(name);
            }
        }
        let result = match self.peers.get_mut(&target) {
            Some(peer) => peer.adopt_transport(&mut donor_peer),
            None => Err(MeshError::UnknownPeer {
                name: target.to_string(),
            }),
        };
        donor_peer.disconnect();
        debug_check_invariants!(self, "PeerRegistry::absorb");
        result
    }

    /// Disconnects and drops every peer. Handles keep counting up.
    pub fn clear(&mut self) -> Vec<Peer> {
        self.names.clear();
        let mut peers: Vec<Peer> = std::mem::take(&mut self.peers).into_values().collect();
        for peer in &mut peers {
            peer.disconnect();
        }
        peers
    }

    /// Snapshot of every handle in insertion order.
    #[must_use]
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers.keys().copied().collect()
    }

    /// Every peer in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values()
    }

    /// Peers that completed their handshake, in insertion order.
    pub fn logged_in_iter(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values().filter(|p| p.state().is_logged_in())
    }

    /// Handles of logged-in peers, optionally skipping one.
    #[must_use]
    pub fn logged_in_handles(&self, except: Option<PeerHandle>) -> Vec<PeerHandle> {
        self.logged_in_iter()
            .map(Peer::handle)
            .filter(|h| Some(*h) != except)
            .collect()
    }

    /// The roster: announced, named, not removed, in insertion order.
    #[must_use]
    pub fn roster(&self) -> Vec<PeerRecord> {
        self.peers
            .values()
            .filter(|p| p.is_announced() && !p.state().is_removed())
            .filter_map(Peer::record)
            .collect()
    }

    /// Number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl InvariantChecker for PeerRegistry {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (name, handle) in &self.names {
            match self.peers.get(handle) {
                Some(peer) if peer.name() == Some(name.as_str()) => {},
                Some(peer) => {
                    return Err(InvariantViolation::new(
                        "PeerRegistry",
                        "name index points at a peer with a different name",
                    )
                    .with_details(format!("{name} -> {handle} named {:?}", peer.name())));
                },
                None => {
                    return Err(InvariantViolation::new(
                        "PeerRegistry",
                        "name index points at a missing peer",
                    )
                    .with_details(format!("{name} -> {handle}")));
                },
            }
        }
        for (handle, peer) in &self.peers {
            if let Some(name) = peer.name() {
                if self.names.get(name) != Some(handle) {
                    return Err(InvariantViolation::new("PeerRegistry", "named peer is not indexed")
                        .with_details(format!("{handle} named {name}")));
                }
            }
            if peer.handle() != *handle {
                return Err(InvariantViolation::new(
                    "PeerRegistry",
                    "peer stored under a foreign handle",
                ));
            }
            if PeerHandle::new(self.next_handle) <= *handle {
                return Err(InvariantViolation::new(
                    "PeerRegistry",
                    "handle was never allocated",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::peer::state::PeerState;
    use std::net::SocketAddr;

    const MAX: usize = 1024;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn named(registry: &mut PeerRegistry, name: &str, port: u16) -> PeerHandle {
        let handle = registry.allocate_handle();
        registry
            .insert(Peer::outbound(handle, name.to_owned(), addr(port), MAX))
            .unwrap()
    }

    #[test]
    fn handles_are_never_reused() {
        let mut registry = PeerRegistry::new();
        let a = named(&mut registry, "a", 1);
        registry.remove(a);
        let b = named(&mut registry, "a", 2);
        assert_ne!(a, b);
        assert!(registry.get(a).is_none());
        assert_eq!(registry.by_name("a"), Some(b));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = PeerRegistry::new();
        named(&mut registry, "bob", 1);
        let handle = registry.allocate_handle();
        let err = registry
            .insert(Peer::outbound(handle, "bob".to_owned(), addr(2), MAX))
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRequest { .. }));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn rename_moves_the_index() {
        let mut registry = PeerRegistry::new();
        let a = named(&mut registry, "a", 1);
        let b = named(&mut registry, "b", 2);
        registry.rename(a, "c").unwrap();
        assert_eq!(registry.by_name("c"), Some(a));
        assert!(!registry.contains_name("a"));
        assert!(registry.rename(a, "b").is_err());
        registry.rename(b, "b").unwrap();
        assert!(matches!(
            registry.rename(PeerHandle::new(99), "z"),
            Err(MeshError::UnknownPeer { .. })
        ));
        registry.check_invariants().unwrap();
    }

    #[test]
    fn remove_disconnects() {
        let mut registry = PeerRegistry::new();
        let a = named(&mut registry, "a", 1);
        let peer = registry.remove(a).unwrap();
        assert_eq!(peer.state(), PeerState::Removed);
        assert!(registry.is_empty());
        assert!(registry.remove(a).is_none());
    }

    #[test]
    fn roster_lists_announced_peers_in_insertion_order() {
        let mut registry = PeerRegistry::new();
        let a = named(&mut registry, "a", 1);
        let b = named(&mut registry, "b", 2);
        let c = named(&mut registry, "c", 3);
        registry.get_mut(c).unwrap().set_announced();
        registry.get_mut(a).unwrap().set_announced();
        let names: Vec<_> = registry.roster().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(registry.roster()[1].addr.port(), 3);
        assert!(registry.get(b).is_some());
    }

    #[test]
    fn logged_in_filter() {
        let mut registry = PeerRegistry::new();
        let a = named(&mut registry, "a", 1);
        let b = named(&mut registry, "b", 2);
        registry.get_mut(a).unwrap().log_in().unwrap();
        registry.get_mut(b).unwrap().log_in().unwrap();
        assert_eq!(registry.logged_in_handles(None), vec![a, b]);
        assert_eq!(registry.logged_in_handles(Some(a)), vec![b]);
    }

    #[test]
    fn absorb_moves_the_transport() {
        use crate::network::memory::MemoryNetwork;
        use crate::network::messages::ClientChat;
        use crate::Network;

        let mut net = MemoryNetwork::new();
        let mut listener = net.listen(9300).unwrap();
        let mut client = Peer::outbound(PeerHandle::new(100), "dave".to_owned(), listener.local_addr(), MAX);
        client.attach(net.connect(listener.local_addr()).unwrap()).unwrap();
        client
            .send_payload(&ClientChat {
                text: "hi".to_owned(),
            })
            .unwrap();

        let mut registry = PeerRegistry::new();
        let handle = registry.allocate_handle();
        let placeholder = registry
            .insert(Peer::expected(handle, "dave".to_owned(), addr(4000), MAX))
            .unwrap();
        let (connection, remote) = listener.accept().unwrap().unwrap();
        let handle = registry.allocate_handle();
        let donor = registry
            .insert(Peer::accepted(handle, connection, remote, MAX))
            .unwrap();

        registry.absorb(placeholder, donor).unwrap();
        assert!(registry.get(donor).is_none());
        let peer = registry.get_mut(placeholder).unwrap();
        assert!(peer.has_connection());
        assert_eq!(peer.record().unwrap().addr.port(), 4000);
        let message = peer.try_receive().unwrap().unwrap();
        assert_eq!(message.parse::<ClientChat>().unwrap().text, "hi");
        registry.check_invariants().unwrap();
    }

    #[test]
    fn clear_empties_everything() {
        let mut registry = PeerRegistry::new();
        named(&mut registry, "a", 1);
        named(&mut registry, "b", 2);
        let dropped = registry.clear();
        assert_eq!(dropped.len(), 2);
        assert!(dropped.iter().all(|p| p.state().is_removed()));
        assert!(registry.is_empty());
        assert!(registry.by_name("a").is_none());
        assert_eq!(registry.len(), 0);
    }
}
