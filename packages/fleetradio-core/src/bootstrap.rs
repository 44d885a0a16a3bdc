//! Composition root: wires every control-plane subsystem together.
//!
//! This module holds the single place where [`Neighborhood`], [`LinkController`],
//! [`NeighborDiscovery`], [`MacController`], the optional [`CollaborationClient`],
//! and [`ControlPlaneController`] are constructed and handed to each other. The
//! concrete transports (UDP internal protocol, ZMQ collaboration bus, local
//! remote-control socket, OS route table) are supplied by the caller, since
//! they're platform/deployment-specific and live in `apps/fleetradio-server`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::collab::{
    CollabTransport, CollaborationClient, CollabTunables, PerformanceSnapshotSource,
    SpectrumUsageSource,
};
use crate::config::Config;
use crate::controller::{
    ClockProbeTransport, ControlPlaneController, ControllerEventBridge, InternalTransport,
    NoopClockProbeTransport, RouteTable,
};
use crate::discovery::{HelloTransport, NeighborDiscovery};
use crate::error::ControlPlaneResult;
use crate::events::{EventListener, LoggingEventListener};
use crate::flow::FlowPerformance;
use crate::link::controller::{LinkController, LinkTunables};
use crate::mac::MacController;
use crate::neighborhood::{Neighborhood, NodeId};
use crate::persistence::ScoreLog;
use crate::runtime::TokioSpawner;
use crate::time::TimeSource;

/// Everything the caller needs to supply to bring up a node: identity,
/// configuration, and the platform-specific transports this crate only
/// knows about through traits.
pub struct NodeDeps {
    /// This node's id.
    pub self_id: NodeId,
    /// Whether this node may be elected gateway/time master.
    pub is_gateway_capable: bool,
    /// Tunables for every subsystem.
    pub config: Config,
    /// Broadcasts HELLO announcements over the air.
    pub hello_transport: Arc<dyn HelloTransport>,
    /// Sends/receives the internal peer protocol over UDP.
    pub internal_transport: Arc<dyn InternalTransport>,
    /// Exchanges clock-sync probes with the time master.
    pub clock_probe: Arc<dyn ClockProbeTransport>,
    /// Installs/removes OS routes for discovered peers.
    pub route_table: Arc<dyn RouteTable>,
    /// Collaboration-bus transport and data sources. `None` for a node that
    /// never participates in the collaboration bus (only the gateway does).
    pub collab: Option<CollabDeps>,
    /// Scenario parameters known at boot; refined later via
    /// `UpdateEnvironment` requests.
    pub initial_frequency: f64,
    /// See [`NodeDeps::initial_frequency`].
    pub initial_bandwidth: f64,
    /// Channel count of the scheduling grid.
    pub nchannels: usize,
    /// Slot count of the scheduling grid.
    pub nslots: usize,
    /// Directory `score_reported.csv` is written under, if scoring is
    /// persisted for this node.
    pub log_dir: Option<PathBuf>,
}

/// Collaboration-bus wiring, supplied only for nodes that register with it.
pub struct CollabDeps {
    /// REQ/PUSH socket pair to the collaboration server and peer fleets.
    pub transport: Arc<dyn CollabTransport>,
    /// Supplies historical/predicted spectrum-usage voxels.
    pub spectrum: Arc<dyn SpectrumUsageSource>,
    /// Supplies per-flow performance summaries.
    pub performance: Arc<dyn PerformanceSnapshotSource>,
}

/// Every subsystem instantiated during bootstrap, ready for the caller to
/// attach I/O (socket read loops feeding `discovery`/`controller`) and call
/// [`ControlPlaneController::spawn_active_tasks`].
pub struct BootstrappedNode {
    /// The lifecycle state machine and cooperative task owner.
    pub controller: Arc<ControlPlaneController>,
    /// Known-peer set, shared with whatever feeds it HELLO/schedule events.
    pub neighborhood: Arc<Neighborhood>,
    /// Drives HELLO broadcasting and admits received HELLOs.
    pub discovery: Arc<NeighborDiscovery>,
    /// Per-peer ARQ/AMC state, the DSP's packet-ingest handoff point.
    pub link: Arc<LinkController>,
    /// Per-flow counters fed by the DSP's packet callbacks.
    pub flow_perf: Arc<FlowPerformance>,
    /// Skew-corrected wall clock shared across the node.
    pub time: Arc<TimeSource>,
    /// Tokio-backed spawner used for every cooperative task.
    pub spawner: TokioSpawner,
    /// Cancels every cooperative task on shutdown.
    pub cancel_token: CancellationToken,
}

fn link_tunables(config: &Config) -> LinkTunables {
    LinkTunables {
        window_size: config.arq_window_size,
        max_sacks: config.max_sacks,
        retransmission_delay: config.retransmission_delay,
        retransmission_delay_slop: config.retransmission_delay_slop,
        min_retransmission_delay: config.min_retransmission_delay,
        max_retransmissions: config.max_retransmissions,
        explicit_nak_window: config.explicit_nak_window,
        explicit_nak_window_duration: config.explicit_nak_window_duration,
        mcs_min: config.mcs_min,
        mcs_max: config.mcs_max,
        evm_thresholds: config.evm_thresholds.clone(),
        up_threshold: config.up_threshold,
        down_threshold: config.down_threshold,
        short_per_window: config.short_per_window,
        long_per_window: config.long_per_window,
        mcs_markov_alpha: config.mcs_markov_alpha,
        mcs_prob_floor: config.mcs_prob_floor,
        mcs_broadcast: config.mcs_broadcast,
        mcs_ack: config.mcs_ack,
        broadcast_gain_db: config.broadcast_gain_db,
        ack_gain_db: config.ack_gain_db,
        enforce_ordering: config.enforce_ordering,
    }
}

/// Wires every subsystem for one node and returns it ready to run.
///
/// Wiring order matters because of the circular dependency between
/// [`Neighborhood`]/[`LinkController`] (which raise events) and
/// [`ControlPlaneController`] (which reacts to them): a [`ControllerEventBridge`]
/// is built first, given a fresh reschedule [`Notify`] and the caller's
/// [`RouteTable`], and used as the event listener for both before the
/// controller itself is constructed.
///
/// # Errors
///
/// Returns an error if `log_dir` is set and `score_reported.csv` cannot be
/// opened.
pub fn bootstrap_node(deps: NodeDeps) -> ControlPlaneResult<BootstrappedNode> {
    let spawner = TokioSpawner::current();
    let cancel_token = CancellationToken::new();
    let reschedule = Arc::new(Notify::new());
    let time = Arc::new(TimeSource::new());

    let bridge_listener: Arc<dyn EventListener> = Arc::new(LoggingEventListener);
    let bridge = Arc::new(ControllerEventBridge::new(
        Arc::clone(&reschedule),
        deps.route_table,
        bridge_listener,
    ));

    let neighborhood = Arc::new(Neighborhood::new(
        deps.self_id,
        deps.is_gateway_capable,
        Arc::clone(&bridge) as Arc<dyn EventListener>,
    ));

    let flow_perf = Arc::new(FlowPerformance::new());

    let link = Arc::new(LinkController::new(
        link_tunables(&deps.config),
        Arc::clone(&bridge) as Arc<dyn EventListener>,
    ));

    let mac = MacController::new_aloha(deps.nchannels, deps.config.aloha_prob, 0);

    let discovery = Arc::new(NeighborDiscovery::new(
        deps.self_id,
        deps.is_gateway_capable,
        Arc::clone(&neighborhood),
        Arc::clone(&link),
        deps.hello_transport,
        Duration::from_secs_f64(deps.config.discovery_hello_interval_s),
        Duration::from_secs_f64(deps.config.standard_hello_interval_s),
    ));

    let collab = deps.collab.map(|collab_deps| {
        Arc::new(CollaborationClient::new(
            deps.self_id,
            Arc::clone(&neighborhood),
            Arc::clone(&time),
            collab_deps.transport,
            collab_deps.spectrum,
            collab_deps.performance,
            CollabTunables {
                location_update_period: deps.config.location_update_period,
                spectrum_usage_update_period_min: deps.config.spectrum_usage_update_period_min,
                spectrum_usage_update_period_max: deps.config.spectrum_usage_update_period_max,
                detailed_performance_update_period: deps.config.detailed_performance_update_period,
                keepalive_seconds: deps.config.keepalive_seconds,
                max_location_age: deps.config.max_location_age,
                spec_future_period: deps.config.spec_future_period,
            },
        ))
    });

    let clock_probe: Arc<dyn ClockProbeTransport> = if deps.is_gateway_capable {
        Arc::new(NoopClockProbeTransport)
    } else {
        deps.clock_probe
    };

    let controller = Arc::new(ControlPlaneController::new(
        deps.self_id,
        deps.config,
        Arc::clone(&time),
        Arc::clone(&neighborhood),
        Arc::clone(&flow_perf),
        Arc::clone(&link),
        mac,
        Arc::clone(&discovery),
        collab,
        deps.internal_transport,
        clock_probe,
        reschedule,
        deps.initial_frequency,
        deps.initial_bandwidth,
        deps.nchannels,
        deps.nslots,
    ));

    if let Some(log_dir) = deps.log_dir {
        controller.set_score_log(ScoreLog::open(&log_dir)?);
    }

    controller.mark_ready();

    Ok(BootstrappedNode {
        controller,
        neighborhood,
        discovery,
        link,
        flow_perf,
        time,
        spawner,
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NoopRouteTable;
    use crate::protocol::internal::InternalMessage;
    use crate::protocol::ProtocolError;
    use async_trait::async_trait;

    struct NoopHello;
    #[async_trait]
    impl HelloTransport for NoopHello {
        async fn broadcast(&self, _hello: crate::discovery::Hello) {}
    }

    struct NoopInternal;
    #[async_trait]
    impl InternalTransport for NoopInternal {
        async fn unicast(&self, _to: NodeId, _msg: InternalMessage) -> Result<(), ProtocolError> {
            Ok(())
        }
        async fn broadcast(&self, _msg: InternalMessage) {}
    }

    #[tokio::test]
    async fn bootstraps_a_gateway_node_without_collab() {
        let deps = NodeDeps {
            self_id: 1,
            is_gateway_capable: true,
            config: Config::default(),
            hello_transport: Arc::new(NoopHello),
            internal_transport: Arc::new(NoopInternal),
            clock_probe: Arc::new(NoopClockProbeTransport),
            route_table: Arc::new(NoopRouteTable),
            collab: None,
            initial_frequency: 915_000_000.0,
            initial_bandwidth: 5_000_000.0,
            nchannels: 1,
            nslots: 8,
            log_dir: None,
        };
        let node = bootstrap_node(deps).unwrap();
        assert_eq!(
            node.controller.state(),
            crate::protocol::control::RadioState::Ready
        );
    }
}
