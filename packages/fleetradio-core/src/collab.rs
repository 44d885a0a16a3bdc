//! Collaboration bus client: registers with a well-known server, then pushes
//! HELLO, LOCATION_UPDATE, SPECTRUM_USAGE, and DETAILED_PERFORMANCE reports
//! to peer fleets on independent cadences.
//!
//! The actual ZMQ REQ/PUSH sockets live outside this module, behind
//! [`CollabTransport`], the way [`crate::discovery::HelloTransport`] keeps
//! the discovery driver off the over-the-air layer. Spectrum and
//! performance data similarly arrive through traits so this module never
//! reaches into [`crate::mac`] or [`crate::mandate`] directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;


use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::CollabError;
use crate::neighborhood::{Location, Neighborhood, NodeId};
use crate::protocol::collab::{CilVoxel, FlowPerformanceSummary, PeerMessage, RegistrationMessage};
use crate::runtime::TaskSpawner;
use crate::time::TimeSource;

/// Sends registration requests and pushes peer messages. Implementations own
/// the ZMQ REQ socket (registration) and PUSH socket (peer reports).
#[async_trait]
pub trait CollabTransport: Send + Sync {
    /// Sends a registration-channel message and returns the server's reply.
    async fn register(&self, msg: RegistrationMessage) -> Result<RegistrationMessage, CollabError>;

    /// Pushes a peer message. Best-effort: failures are logged by the caller,
    /// not retried here.
    async fn push(&self, msg: PeerMessage) -> Result<(), CollabError>;
}

/// Supplies spectrum-usage voxels for SPECTRUM_USAGE reports.
pub trait SpectrumUsageSource: Send + Sync {
    /// Voxels drained from observed load since the last report.
    fn historical_voxels(&self) -> Vec<CilVoxel>;

    /// Voxels predicted for the next `horizon` from the current
    /// schedule/ALOHA channel assignment.
    fn predicted_voxels(&self, horizon: Duration) -> Vec<CilVoxel>;
}

/// Supplies per-flow performance summaries for DETAILED_PERFORMANCE reports.
pub trait PerformanceSnapshotSource: Send + Sync {
    /// The current per-flow ensemble summaries.
    fn flow_summaries(&self) -> Vec<FlowPerformanceSummary>;
}

/// Reporting cadences for the collaboration client.
#[derive(Debug, Clone, Copy)]
pub struct CollabTunables {
    /// Interval between LOCATION_UPDATE reports.
    pub location_update_period: Duration,
    /// Minimum interval between SPECTRUM_USAGE reports.
    pub spectrum_usage_update_period_min: Duration,
    /// Maximum interval between SPECTRUM_USAGE reports.
    pub spectrum_usage_update_period_max: Duration,
    /// Interval between DETAILED_PERFORMANCE reports.
    pub detailed_performance_update_period: Duration,
    /// Registration keepalive period; a KEEPALIVE is sent every half of
    /// this.
    pub keepalive_seconds: u64,
    /// Max age of a neighbor's last-seen timestamp before it is excluded
    /// from a LOCATION_UPDATE report.
    pub max_location_age: Duration,
    /// Forward horizon used when predicting SPECTRUM_USAGE voxels.
    pub spec_future_period: Duration,
}

struct Session {
    nonce: u64,
}

/// Drives the collaboration bus: one registration session plus independent
/// periodic push loops.
pub struct CollaborationClient {
    self_id: NodeId,
    session: Mutex<Option<Session>>,
    msg_count: AtomicU64,
    neighborhood: Arc<Neighborhood>,
    time: Arc<TimeSource>,
    transport: Arc<dyn CollabTransport>,
    spectrum: Arc<dyn SpectrumUsageSource>,
    performance: Arc<dyn PerformanceSnapshotSource>,
    tunables: CollabTunables,
}

impl CollaborationClient {
    /// Creates a new collaboration client. `register` must be called before
    /// `spawn` so the session nonce is available to the push loops.
    #[must_use]
    pub fn new(
        self_id: NodeId,
        neighborhood: Arc<Neighborhood>,
        time: Arc<TimeSource>,
        transport: Arc<dyn CollabTransport>,
        spectrum: Arc<dyn SpectrumUsageSource>,
        performance: Arc<dyn PerformanceSnapshotSource>,
        tunables: CollabTunables,
    ) -> Self {
        Self {
            self_id,
            session: Mutex::new(None),
            msg_count: AtomicU64::new(0),
            neighborhood,
            time,
            transport,
            spectrum,
            performance,
            tunables,
        }
    }

    /// Registers with the collaboration server, establishing the session
    /// nonce used by subsequent KEEPALIVE/LEAVE messages.
    pub async fn register(&self) -> Result<Vec<NodeId>, CollabError> {
        let reply = self
            .transport
            .register(RegistrationMessage::Register {
                sender_id: self.self_id,
            })
            .await?;
        match reply {
            RegistrationMessage::Inform {
                nonce, neighbors, ..
            } => {
                *self.session.lock() = Some(Session { nonce });
                Ok(neighbors)
            }
            other => {
                log::warn!("unexpected registration reply: {other:?}");
                Ok(Vec::new())
            }
        }
    }

    /// Sends LEAVE if a session is established. Called on shutdown.
    pub async fn leave(&self) -> Result<(), CollabError> {
        let nonce = match self.session.lock().take() {
            Some(session) => session.nonce,
            None => return Ok(()),
        };
        self.transport
            .register(RegistrationMessage::Leave {
                sender_id: self.self_id,
                nonce,
            })
            .await?;
        Ok(())
    }

    fn next_msg_count(&self) -> u64 {
        self.msg_count.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_keepalive(&self) {
        let nonce = match self.session.lock().as_ref() {
            Some(session) => session.nonce,
            None => return,
        };
        if let Err(err) = self
            .transport
            .register(RegistrationMessage::Keepalive {
                sender_id: self.self_id,
                nonce,
            })
            .await
        {
            log::warn!("collaboration keepalive failed: {err}");
        }
    }

    async fn send_location_update(&self) {
        let now = self.time.now();
        let locations: Vec<(NodeId, Location)> = self
            .neighborhood
            .snapshot()
            .into_iter()
            .filter(|n| now - n.last_seen <= self.tunables.max_location_age.as_secs_f64())
            .filter_map(|n| n.location.map(|loc| (n.node_id, loc)))
            .collect();

        let msg = PeerMessage::LocationUpdate {
            sender_id: self.self_id,
            msg_count: self.next_msg_count(),
            timestamp: self.time.now_wall(),
            locations,
        };
        if let Err(err) = self.transport.push(msg).await {
            log::warn!("location update push failed: {err}");
        }
    }

    async fn send_spectrum_usage(&self) {
        let msg = PeerMessage::SpectrumUsage {
            sender_id: self.self_id,
            msg_count: self.next_msg_count(),
            timestamp: self.time.now_wall(),
            historical: self.spectrum.historical_voxels(),
            predicted: self
                .spectrum
                .predicted_voxels(self.tunables.spec_future_period),
        };
        if let Err(err) = self.transport.push(msg).await {
            log::warn!("spectrum usage push failed: {err}");
        }
    }

    async fn send_detailed_performance(&self) {
        let msg = PeerMessage::DetailedPerformance {
            sender_id: self.self_id,
            msg_count: self.next_msg_count(),
            timestamp: self.time.now_wall(),
            flows: self.performance.flow_summaries(),
        };
        if let Err(err) = self.transport.push(msg).await {
            log::warn!("detailed performance push failed: {err}");
        }
    }

    /// Spawns the keepalive loop and the three periodic push loops onto
    /// `spawner`. All tasks exit when `cancel_token` is triggered.
    pub fn spawn(self: Arc<Self>, spawner: &dyn TaskSpawner, cancel_token: CancellationToken) {
        self.clone().spawn_hello(spawner, cancel_token.clone());
        self.clone()
            .spawn_periodic(
                "collab-location",
                spawner,
                cancel_token.clone(),
                self.tunables.location_update_period,
                |client| Box::pin(async move { client.send_location_update().await }),
            );
        self.clone().spawn_spectrum_usage(spawner, cancel_token.clone());
        self.clone().spawn_periodic(
            "collab-detailed-performance",
            spawner,
            cancel_token.clone(),
            self.tunables.detailed_performance_update_period,
            |client| Box::pin(async move { client.send_detailed_performance().await }),
        );
        self.spawn_keepalive(spawner, cancel_token);
    }

    fn spawn_keepalive(self: Arc<Self>, spawner: &dyn TaskSpawner, cancel_token: CancellationToken) {
        let period = Duration::from_secs(self.tunables.keepalive_seconds.max(1) / 2);
        self.spawn_periodic("collab-keepalive", spawner, cancel_token, period, |client| {
            Box::pin(async move { client.send_keepalive().await })
        });
    }

    fn spawn_hello(self: Arc<Self>, spawner: &dyn TaskSpawner, cancel_token: CancellationToken) {
        spawner.spawn_named("collab-hello", async move {
            let msg = PeerMessage::Hello {
                sender_id: self.self_id,
                msg_count: self.next_msg_count(),
                timestamp: self.time.now_wall(),
            };
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                result = self.transport.push(msg) => {
                    if let Err(err) = result {
                        log::warn!("hello push failed: {err}");
                    }
                }
            }
        });
    }

    fn spawn_spectrum_usage(self: Arc<Self>, spawner: &dyn TaskSpawner, cancel_token: CancellationToken) {
        spawner.spawn_named("collab-spectrum-usage", async move {
            loop {
                let min = self.tunables.spectrum_usage_update_period_min;
                let max = self.tunables.spectrum_usage_update_period_max;
                let period = if max > min {
                    min + Duration::from_secs_f64(
                        rand::thread_rng().gen_range(0.0..(max - min).as_secs_f64()),
                    )
                } else {
                    min
                };
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    () = tokio::time::sleep(period) => {}
                }
                self.send_spectrum_usage().await;
            }
        });
    }

    fn spawn_periodic<F>(
        self: Arc<Self>,
        name: &'static str,
        spawner: &dyn TaskSpawner,
        cancel_token: CancellationToken,
        period: Duration,
        action: F,
    ) where
        F: for<'a> Fn(
                &'a Arc<Self>,
            )
                -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>
            + Send
            + Sync
            + 'static,
    {
        spawner.spawn_named(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = interval.tick() => {
                        action(&self).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        registrations: StdMutex<Vec<RegistrationMessage>>,
        pushes: StdMutex<Vec<PeerMessage>>,
        push_count: AtomicUsize,
    }

    #[async_trait]
    impl CollabTransport for RecordingTransport {
        async fn register(
            &self,
            msg: RegistrationMessage,
        ) -> Result<RegistrationMessage, CollabError> {
            self.registrations.lock().unwrap().push(msg);
            Ok(RegistrationMessage::Inform {
                nonce: 7,
                keepalive_seconds: 2,
                neighbors: vec![2, 3],
            })
        }

        async fn push(&self, msg: PeerMessage) -> Result<(), CollabError> {
            self.push_count.fetch_add(1, Ordering::SeqCst);
            self.pushes.lock().unwrap().push(msg);
            Ok(())
        }
    }

    struct EmptySpectrum;
    impl SpectrumUsageSource for EmptySpectrum {
        fn historical_voxels(&self) -> Vec<CilVoxel> {
            Vec::new()
        }
        fn predicted_voxels(&self, _horizon: Duration) -> Vec<CilVoxel> {
            Vec::new()
        }
    }

    struct EmptyPerformance;
    impl PerformanceSnapshotSource for EmptyPerformance {
        fn flow_summaries(&self) -> Vec<FlowPerformanceSummary> {
            Vec::new()
        }
    }

    fn tunables() -> CollabTunables {
        CollabTunables {
            location_update_period: Duration::from_millis(5),
            spectrum_usage_update_period_min: Duration::from_millis(5),
            spectrum_usage_update_period_max: Duration::from_millis(10),
            detailed_performance_update_period: Duration::from_millis(5),
            keepalive_seconds: 1,
            max_location_age: Duration::from_secs(60),
            spec_future_period: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn register_establishes_session_and_returns_seed_neighbors() {
        let neighborhood = Arc::new(Neighborhood::new(1, false, Arc::new(NoopEventListener)));
        let transport = Arc::new(RecordingTransport {
            registrations: StdMutex::new(Vec::new()),
            pushes: StdMutex::new(Vec::new()),
            push_count: AtomicUsize::new(0),
        });
        let client = CollaborationClient::new(
            1,
            neighborhood,
            Arc::new(TimeSource::new()),
            Arc::clone(&transport) as Arc<dyn CollabTransport>,
            Arc::new(EmptySpectrum),
            Arc::new(EmptyPerformance),
            tunables(),
        );

        let neighbors = client.register().await.unwrap();
        assert_eq!(neighbors, vec![2, 3]);
        assert_eq!(transport.registrations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leave_without_a_session_is_a_noop() {
        let neighborhood = Arc::new(Neighborhood::new(1, false, Arc::new(NoopEventListener)));
        let transport = Arc::new(RecordingTransport {
            registrations: StdMutex::new(Vec::new()),
            pushes: StdMutex::new(Vec::new()),
            push_count: AtomicUsize::new(0),
        });
        let client = CollaborationClient::new(
            1,
            neighborhood,
            Arc::new(TimeSource::new()),
            Arc::clone(&transport) as Arc<dyn CollabTransport>,
            Arc::new(EmptySpectrum),
            Arc::new(EmptyPerformance),
            tunables(),
        );
        client.leave().await.unwrap();
        assert!(transport.registrations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_loops_push_reports_over_time() {
        use crate::runtime::TokioSpawner;

        let neighborhood = Arc::new(Neighborhood::new(1, false, Arc::new(NoopEventListener)));
        let transport = Arc::new(RecordingTransport {
            registrations: StdMutex::new(Vec::new()),
            pushes: StdMutex::new(Vec::new()),
            push_count: AtomicUsize::new(0),
        });
        let client = Arc::new(CollaborationClient::new(
            1,
            neighborhood,
            Arc::new(TimeSource::new()),
            Arc::clone(&transport) as Arc<dyn CollabTransport>,
            Arc::new(EmptySpectrum),
            Arc::new(EmptyPerformance),
            tunables(),
        ));
        client.register().await.unwrap();

        let cancel = CancellationToken::new();
        let spawner = TokioSpawner::current();
        client.spawn(&spawner, cancel.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();

        assert!(transport.push_count.load(Ordering::SeqCst) >= 3);
    }
}
