//! Neighbor discovery: ALOHA HELLO broadcasting until a schedule exists,
//! then periodic liveness HELLOs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::link::controller::LinkController;
use crate::neighborhood::{Location, Neighborhood, NodeId};
use crate::runtime::TaskSpawner;

/// A HELLO announcement: carries just enough for a listener to register the
/// sender in its neighborhood, plus the fixed broadcast transmit parameters
/// the DSP layer used to send it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// The sending node's id.
    pub node_id: NodeId,
    /// Whether the sender considers itself gateway-capable.
    pub is_gateway: bool,
    /// The sender's last known location.
    pub location: Option<Location>,
    /// Fixed MCS index the sender used for this broadcast.
    pub mcs: u8,
    /// Gain offset the sender used for this broadcast.
    pub gain_db: f64,
}

/// Sends and receives HELLO announcements. The actual over-the-air HELLO
/// exchange happens at the DSP layer; this trait is the control plane's
/// only dependency on it.
#[async_trait]
pub trait HelloTransport: Send + Sync {
    /// Broadcasts a HELLO.
    async fn broadcast(&self, hello: Hello);
}

/// Drives the two-phase HELLO schedule (discovery, then standard liveness)
/// and feeds received HELLOs into a [`Neighborhood`].
pub struct NeighborDiscovery {
    self_id: NodeId,
    self_is_gateway: Arc<AtomicBool>,
    location: parking_lot::RwLock<Option<Location>>,
    neighborhood: Arc<Neighborhood>,
    link: Arc<LinkController>,
    transport: Arc<dyn HelloTransport>,
    discovery_hello_interval: Duration,
    standard_hello_interval: Duration,
    /// Flips to standard-phase cadence once a schedule has been installed.
    scheduled: Arc<AtomicBool>,
}

impl NeighborDiscovery {
    /// Creates a new discovery driver for `self_id`.
    #[must_use]
    pub fn new(
        self_id: NodeId,
        self_is_gateway: bool,
        neighborhood: Arc<Neighborhood>,
        link: Arc<LinkController>,
        transport: Arc<dyn HelloTransport>,
        discovery_hello_interval: Duration,
        standard_hello_interval: Duration,
    ) -> Self {
        Self {
            self_id,
            self_is_gateway: Arc::new(AtomicBool::new(self_is_gateway)),
            location: parking_lot::RwLock::new(None),
            neighborhood,
            link,
            transport,
            discovery_hello_interval,
            standard_hello_interval,
            scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Updates the location included in outgoing HELLOs.
    pub fn set_location(&self, location: Location) {
        *self.location.write() = Some(location);
    }

    /// Signals that a schedule has been installed; subsequent HELLOs use the
    /// standard liveness cadence instead of the discovery cadence.
    pub fn mark_scheduled(&self) {
        self.scheduled.store(true, Ordering::SeqCst);
    }

    /// Processes a HELLO received from a peer, adding or refreshing it in
    /// the neighborhood.
    pub fn on_hello(&self, hello: Hello, now: f64) {
        if hello.node_id == self.self_id {
            return;
        }
        self.neighborhood
            .add(hello.node_id, hello.is_gateway, hello.location, now);
    }

    fn hello(&self) -> Hello {
        Hello {
            node_id: self.self_id,
            is_gateway: self.self_is_gateway.load(Ordering::SeqCst),
            location: *self.location.read(),
            mcs: self.link.broadcast_mcs(),
            gain_db: self.link.broadcast_gain_db(),
        }
    }

    /// Spawns the HELLO-sending loop onto `spawner`. Runs until
    /// `cancel_token` is triggered. A randomized start delay (uniform over
    /// one discovery interval) desynchronizes peers that boot at the same
    /// time.
    pub fn spawn(self: Arc<Self>, spawner: &dyn TaskSpawner, cancel_token: CancellationToken) {
        spawner.spawn_named("discovery", async move {
            let start_delay = self.discovery_hello_interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
            tokio::select! {
                _ = cancel_token.cancelled() => return,
                () = tokio::time::sleep(start_delay) => {}
            }

            loop {
                let scheduled = self.scheduled.load(Ordering::SeqCst);
                let base = if scheduled {
                    self.standard_hello_interval
                } else {
                    self.discovery_hello_interval
                };
                let jitter = if scheduled {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0))
                };

                self.transport.broadcast(self.hello()).await;

                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    () = tokio::time::sleep(base + jitter) => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventListener;
    use crate::link::controller::LinkTunables;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn link() -> Arc<LinkController> {
        Arc::new(LinkController::new(
            LinkTunables {
                window_size: 8,
                max_sacks: 4,
                retransmission_delay: Duration::from_millis(100),
                retransmission_delay_slop: 2.0,
                min_retransmission_delay: Duration::from_millis(50),
                max_retransmissions: Some(5),
                explicit_nak_window: 4,
                explicit_nak_window_duration: Duration::from_secs(1),
                mcs_min: 0,
                mcs_max: 3,
                evm_thresholds: vec![40.0, 30.0, 20.0, 10.0],
                up_threshold: 0.02,
                down_threshold: 0.1,
                short_per_window: Duration::from_secs(1),
                long_per_window: Duration::from_secs(10),
                mcs_markov_alpha: 0.9,
                mcs_prob_floor: 0.05,
                mcs_broadcast: 0,
                mcs_ack: 0,
                broadcast_gain_db: 3.0,
                ack_gain_db: 3.0,
                enforce_ordering: false,
            },
            Arc::new(NoopEventListener),
        ))
    }

    struct RecordingTransport {
        count: AtomicUsize,
        last: Mutex<Option<Hello>>,
    }

    #[async_trait]
    impl HelloTransport for RecordingTransport {
        async fn broadcast(&self, hello: Hello) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(hello);
        }
    }

    #[test]
    fn on_hello_adds_peer_to_neighborhood() {
        let neighborhood = Arc::new(Neighborhood::new(1, false, Arc::new(NoopEventListener)));
        let transport = Arc::new(RecordingTransport {
            count: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let discovery = NeighborDiscovery::new(
            1,
            false,
            Arc::clone(&neighborhood),
            link(),
            transport,
            Duration::from_secs(5),
            Duration::from_secs(15),
        );

        discovery.on_hello(
            Hello {
                node_id: 2,
                is_gateway: true,
                location: None,
                mcs: 0,
                gain_db: 3.0,
            },
            0.0,
        );

        assert!(neighborhood.get(2).is_some());
        assert_eq!(neighborhood.time_master(), 2);
    }

    #[test]
    fn self_hello_is_ignored() {
        let neighborhood = Arc::new(Neighborhood::new(1, false, Arc::new(NoopEventListener)));
        let transport = Arc::new(RecordingTransport {
            count: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let discovery = NeighborDiscovery::new(
            1,
            false,
            Arc::clone(&neighborhood),
            link(),
            transport,
            Duration::from_secs(5),
            Duration::from_secs(15),
        );
        discovery.on_hello(
            Hello {
                node_id: 1,
                is_gateway: false,
                location: None,
                mcs: 0,
                gain_db: 3.0,
            },
            0.0,
        );
        assert_eq!(neighborhood.len(), 1);
    }

    #[tokio::test]
    async fn spawned_loop_broadcasts_hello() {
        use crate::runtime::TokioSpawner;

        let neighborhood = Arc::new(Neighborhood::new(1, false, Arc::new(NoopEventListener)));
        let transport = Arc::new(RecordingTransport {
            count: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let discovery = Arc::new(NeighborDiscovery::new(
            1,
            true,
            neighborhood,
            link(),
            Arc::clone(&transport) as Arc<dyn HelloTransport>,
            Duration::from_millis(5),
            Duration::from_secs(15),
        ));

        let cancel = CancellationToken::new();
        let spawner = TokioSpawner::current();
        discovery.spawn(&spawner, cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert!(transport.count.load(Ordering::SeqCst) >= 1);
        assert_eq!(transport.last.lock().unwrap().unwrap().node_id, 1);
    }
}
