//! Neighbor tracking and time-master/gateway election.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::{ControlPlaneEvent, EventListener};
use crate::protocol::framing::{BinaryCodec, Reader, Writer};
use crate::protocol::ProtocolError;

/// Identifies a node in the fleet. Small integer, assigned out of band.
pub type NodeId = u8;

/// A location report, as carried on HELLO and LOCATION_UPDATE messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude, in decimal degrees.
    pub lat: f64,
    /// Longitude, in decimal degrees.
    pub lon: f64,
    /// Altitude, in meters.
    pub alt: f64,
}

impl BinaryCodec for Location {
    fn write_to(&self, w: &mut Writer) {
        self.lat.write_to(w);
        self.lon.write_to(w);
        self.alt.write_to(w);
    }

    fn read_from(r: &mut Reader) -> Result<Self, ProtocolError> {
        Ok(Self {
            lat: f64::read_from(r)?,
            lon: f64::read_from(r)?,
            alt: f64::read_from(r)?,
        })
    }
}

/// A known neighbor and its last-reported state.
#[derive(Debug, Clone)]
pub struct Neighbor {
    /// The neighbor's node id.
    pub node_id: NodeId,
    /// Whether this neighbor has announced itself as gateway-capable.
    pub is_gateway: bool,
    /// Last reported location, if any.
    pub location: Option<Location>,
    /// Monotonic time this neighbor's last HELLO was received.
    pub last_seen: f64,
}

impl Neighbor {
    /// Creates a neighbor record observed at `now`.
    #[must_use]
    pub fn new(node_id: NodeId, is_gateway: bool, location: Option<Location>, now: f64) -> Self {
        Self {
            node_id,
            is_gateway,
            location,
            last_seen: now,
        }
    }
}

struct Inner {
    self_id: NodeId,
    neighbors: BTreeMap<NodeId, Neighbor>,
    time_master: NodeId,
}

impl Inner {
    /// Recomputes the time master: the lowest node id among gateways, or the
    /// lowest node id overall if no gateway exists.
    fn recompute_time_master(&self) -> NodeId {
        let gateway_min = self
            .neighbors
            .values()
            .filter(|n| n.is_gateway)
            .map(|n| n.node_id)
            .min();
        match gateway_min {
            Some(id) => id,
            None => *self.neighbors.keys().next().unwrap_or(&self.self_id),
        }
    }
}

/// The set of known neighbors, including the self node, with time-master
/// election.
pub struct Neighborhood {
    inner: RwLock<Inner>,
    listener: Arc<dyn EventListener>,
}

impl Neighborhood {
    /// Creates a new `Neighborhood` containing only the self node.
    ///
    /// `self_is_gateway` seeds the self node's gateway flag, which
    /// participates in election like any other neighbor's.
    #[must_use]
    pub fn new(self_id: NodeId, self_is_gateway: bool, listener: Arc<dyn EventListener>) -> Self {
        let mut neighbors = BTreeMap::new();
        neighbors.insert(
            self_id,
            Neighbor::new(self_id, self_is_gateway, None, 0.0),
        );
        Self {
            inner: RwLock::new(Inner {
                self_id,
                neighbors,
                time_master: self_id,
            }),
            listener,
        }
    }

    /// Returns this node's own id.
    #[must_use]
    pub fn self_id(&self) -> NodeId {
        self.inner.read().self_id
    }

    /// Adds or refreshes a neighbor. Adding the same id again updates its
    /// state rather than duplicating it. Fires `NeighborAdded` only the
    /// first time a given id is seen, and `GatewayElected` if the election
    /// outcome changes.
    pub fn add(&self, node_id: NodeId, is_gateway: bool, location: Option<Location>, now: f64) {
        let mut inner = self.inner.write();
        let is_new = !inner.neighbors.contains_key(&node_id);
        inner
            .neighbors
            .insert(node_id, Neighbor::new(node_id, is_gateway, location, now));

        let new_master = inner.recompute_time_master();
        let master_changed = new_master != inner.time_master;
        inner.time_master = new_master;
        drop(inner);

        if is_new {
            self.listener
                .on_event(ControlPlaneEvent::NeighborAdded { node_id });
        }
        if master_changed {
            self.listener
                .on_event(ControlPlaneEvent::GatewayElected { node_id: new_master });
        }
    }

    /// Removes a neighbor (a timeout or explicit departure). The self node
    /// cannot be removed.
    pub fn remove(&self, node_id: NodeId) {
        let mut inner = self.inner.write();
        if node_id == inner.self_id {
            return;
        }
        let removed = inner.neighbors.remove(&node_id).is_some();
        if !removed {
            return;
        }

        let new_master = inner.recompute_time_master();
        let master_changed = new_master != inner.time_master;
        inner.time_master = new_master;
        drop(inner);

        self.listener
            .on_event(ControlPlaneEvent::NeighborRemoved { node_id });
        if master_changed {
            self.listener
                .on_event(ControlPlaneEvent::GatewayElected { node_id: new_master });
        }
    }

    /// Returns the currently elected time master.
    #[must_use]
    pub fn time_master(&self) -> NodeId {
        self.inner.read().time_master
    }

    /// Returns whether the self node is currently the time master (and thus
    /// the gateway).
    #[must_use]
    pub fn is_self_gateway(&self) -> bool {
        let inner = self.inner.read();
        inner.time_master == inner.self_id
    }

    /// Returns a snapshot of all known neighbors, including self.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Neighbor> {
        self.inner.read().neighbors.values().cloned().collect()
    }

    /// Returns a specific neighbor's record, if known.
    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<Neighbor> {
        self.inner.read().neighbors.get(&node_id).cloned()
    }

    /// Returns the number of known neighbors, including self.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().neighbors.len()
    }

    /// Returns whether only the self node is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventListener;

    fn neighborhood(self_id: NodeId, self_is_gateway: bool) -> Neighborhood {
        Neighborhood::new(self_id, self_is_gateway, Arc::new(NoopEventListener))
    }

    #[test]
    fn self_node_always_present() {
        let n = neighborhood(1, false);
        assert_eq!(n.len(), 1);
        assert!(n.get(1).is_some());
    }

    #[test]
    fn election_prefers_lowest_gateway_id() {
        let n = neighborhood(5, false);
        n.add(3, false, None, 0.0);
        n.add(2, true, None, 0.0);
        n.add(7, true, None, 0.0);
        // Lowest gateway id among {2, 7} is 2.
        assert_eq!(n.time_master(), 2);
    }

    #[test]
    fn election_falls_back_to_lowest_id_without_a_gateway() {
        let n = neighborhood(5, false);
        n.add(9, false, None, 0.0);
        n.add(1, false, None, 0.0);
        assert_eq!(n.time_master(), 1);
    }

    #[test]
    fn adding_same_id_is_idempotent() {
        let n = neighborhood(1, false);
        n.add(2, false, None, 0.0);
        n.add(2, false, None, 1.0);
        assert_eq!(n.len(), 2);
        assert_eq!(n.get(2).unwrap().last_seen, 1.0);
    }

    #[test]
    fn self_node_cannot_be_removed() {
        let n = neighborhood(1, false);
        n.remove(1);
        assert_eq!(n.len(), 1);
    }

    #[test]
    fn removing_gateway_reelects() {
        let n = neighborhood(5, false);
        n.add(2, true, None, 0.0);
        assert_eq!(n.time_master(), 2);
        n.remove(2);
        assert_eq!(n.time_master(), 5);
    }
}
