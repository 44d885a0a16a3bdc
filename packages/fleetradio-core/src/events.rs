//! Event system for decoupling subsystems that would otherwise hold cyclic
//! references.
//!
//! [`Neighborhood`](crate::neighborhood::Neighborhood) and
//! [`LinkController`](crate::link::controller::LinkController) do not hold a
//! back-reference to [`ControlPlaneController`](crate::controller::ControlPlaneController);
//! instead they notify it, and anything else interested, through an
//! [`EventListener`] handle. This avoids the cyclic ownership the
//! controller/neighborhood/link relationship would otherwise require.

use serde::Serialize;

/// Domain events raised by the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlPlaneEvent {
    /// A new neighbor was added to the neighborhood.
    NeighborAdded {
        /// Node id of the new neighbor.
        node_id: u8,
    },
    /// A neighbor was removed (timed out or explicitly left).
    NeighborRemoved {
        /// Node id of the departed neighbor.
        node_id: u8,
    },
    /// A new node was elected gateway / time master.
    GatewayElected {
        /// Node id of the elected gateway.
        node_id: u8,
    },
    /// A link-layer destination exceeded its retransmission budget.
    PeerUnreachable {
        /// Node id that became unreachable.
        node_id: u8,
    },
    /// A link-layer destination that was unreachable is responding again.
    PeerReachable {
        /// Node id that became reachable again.
        node_id: u8,
    },
    /// A new MAC schedule was installed.
    ScheduleInstalled {
        /// Installed schedule's sequence number.
        seq: u32,
    },
    /// A mandate entered a new scoring stage.
    MandateStageTransition {
        /// Flow the mandate applies to.
        flow_uid: u16,
        /// Measurement period the new stage begins at.
        mp: u64,
    },
}

/// Receives [`ControlPlaneEvent`]s emitted by subsystems.
///
/// Implementations should not block; long-running work triggered by an event
/// should be spawned as its own task.
pub trait EventListener: Send + Sync {
    /// Handles an emitted event.
    fn on_event(&self, event: ControlPlaneEvent);
}

/// Listener that discards all events, used when nothing needs to observe
/// them (most unit tests).
pub struct NoopEventListener;

impl EventListener for NoopEventListener {
    fn on_event(&self, _event: ControlPlaneEvent) {}
}

/// Listener that logs every event at debug level.
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: ControlPlaneEvent) {
        log::debug!("control plane event: {event:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingListener {
        count: AtomicUsize,
    }

    impl EventListener for CountingListener {
        fn on_event(&self, _event: ControlPlaneEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_listener_tracks_events() {
        let listener = Arc::new(CountingListener {
            count: AtomicUsize::new(0),
        });
        listener.on_event(ControlPlaneEvent::NeighborAdded { node_id: 2 });
        listener.on_event(ControlPlaneEvent::GatewayElected { node_id: 1 });
        assert_eq!(listener.count.load(Ordering::SeqCst), 2);
    }
}
