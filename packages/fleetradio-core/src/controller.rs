//! The gateway-elected controller: owns the lifecycle state machine, the
//! cooperative tasks spawned while `Active`, and the external remote-control
//! request/response protocol.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::collab::CollaborationClient;
use crate::config::Config;
use crate::discovery::NeighborDiscovery;
use crate::events::{ControlPlaneEvent, EventListener};
use crate::flow::{FlowId, FlowPerformance};
use crate::link::LinkController;
use crate::mac::MacController;
use crate::mandate::{Mandate, MandateScorer, Requirement, ScoringInput};
use crate::neighborhood::{Neighborhood, NodeId};
use crate::persistence::{ScoreLog, ScoreReportRow};
use crate::protocol::control::{
    parse_environment_updates, parse_goals, ControlRequest, ControlResponse, EnvironmentUpdate,
    Goal, RadioCommandKind, RadioState,
};
use crate::protocol::internal::{FlowStatsWire, InternalMessage};
use crate::protocol::ProtocolError;
use crate::runtime::TaskSpawner;
use crate::schedule;
use crate::time::{time_to_mp, TimeSource, WallTime};

/// Sends internal-protocol messages to peers. The controller never opens a
/// UDP socket itself; `apps/fleetradio-server` supplies the concrete
/// implementation over port 4096.
#[async_trait]
pub trait InternalTransport: Send + Sync {
    /// Sends a message to one peer.
    async fn unicast(&self, to: NodeId, msg: InternalMessage) -> Result<(), ProtocolError>;

    /// Sends a message to every known peer.
    async fn broadcast(&self, msg: InternalMessage);
}

/// Installs and removes kernel routes for peers on the external traffic
/// subnet. Kept behind a trait because route manipulation is OS-specific and
/// has no meaningful in-process test double beyond a no-op.
pub trait RouteTable: Send + Sync {
    /// Installs a route for a newly discovered peer.
    fn install_route(&self, node_id: NodeId);
    /// Removes a peer's route.
    fn remove_route(&self, node_id: NodeId);
}

/// A `RouteTable` that does nothing; used where no external subnet is
/// configured and in tests.
pub struct NoopRouteTable;

impl RouteTable for NoopRouteTable {
    fn install_route(&self, _node_id: NodeId) {}
    fn remove_route(&self, _node_id: NodeId) {}
}

/// Exchanges timestamped probes with the time master. The DSP layer owns the
/// actual over-the-air exchange; this trait is the control plane's only
/// dependency on it.
#[async_trait]
pub trait ClockProbeTransport: Send + Sync {
    /// Runs one probe exchange with `master`, returning `(echoed, master)`
    /// timestamp pairs suitable for [`crate::time::regress`], or `None` if
    /// too few samples were collected.
    async fn exchange(&self, master: NodeId) -> Option<(Vec<(f64, f64)>, Vec<(f64, f64)>)>;
}

/// A `ClockProbeTransport` that never produces samples; used for single-node
/// deployments and tests.
pub struct NoopClockProbeTransport;

#[async_trait]
impl ClockProbeTransport for NoopClockProbeTransport {
    async fn exchange(&self, _master: NodeId) -> Option<(Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        None
    }
}

/// Accumulates one (flow, MP) cell's sent/received counters as the source
/// and sink sides of a flow report them, possibly at different times.
#[derive(Debug, Clone, Copy, Default)]
struct WireFlowAcc {
    sent_packets: u64,
    sent_bytes: u64,
    recv_packets: u64,
    recv_bytes: u64,
}

/// Environment parameters that can change at runtime via `UpdateEnvironment`.
#[derive(Debug, Clone, Copy)]
struct Scenario {
    frequency: f64,
    bandwidth: f64,
    start: WallTime,
    nchannels: usize,
    nslots: usize,
    scoring_percent_threshold: Option<f64>,
    scoring_point_threshold: Option<u32>,
}

/// Bridges [`Neighborhood`]/[`LinkController`] events to the controller
/// without the controller itself needing to be constructed first: it is
/// built and handed to both before the controller exists, then the
/// controller's `reschedule` notifier (cloned into it) and a [`RouteTable`]
/// are all it needs to do its job.
pub struct ControllerEventBridge {
    reschedule: Arc<Notify>,
    routes: Arc<dyn RouteTable>,
    inner: Arc<dyn EventListener>,
}

impl ControllerEventBridge {
    /// Creates a bridge forwarding to `inner` after acting on route/
    /// reschedule implications.
    #[must_use]
    pub fn new(
        reschedule: Arc<Notify>,
        routes: Arc<dyn RouteTable>,
        inner: Arc<dyn EventListener>,
    ) -> Self {
        Self {
            reschedule,
            routes,
            inner,
        }
    }
}

impl EventListener for ControllerEventBridge {
    fn on_event(&self, event: ControlPlaneEvent) {
        match event {
            ControlPlaneEvent::NeighborAdded { node_id } => {
                self.routes.install_route(node_id);
                self.reschedule.notify_one();
            }
            ControlPlaneEvent::NeighborRemoved { node_id } => {
                self.routes.remove_route(node_id);
                self.reschedule.notify_one();
            }
            _ => {}
        }
        self.inner.on_event(event);
    }
}

/// Owns the lifecycle state machine and every cooperative task spawned while
/// `Active`.
pub struct ControlPlaneController {
    self_id: NodeId,
    config: Config,
    state: Mutex<RadioState>,
    time: Arc<TimeSource>,
    neighborhood: Arc<Neighborhood>,
    flow_perf: Arc<FlowPerformance>,
    scorer: Mutex<MandateScorer>,
    link: Arc<LinkController>,
    mac: Mutex<MacController>,
    discovery: Arc<NeighborDiscovery>,
    collab: Option<Arc<CollaborationClient>>,
    internal_transport: Arc<dyn InternalTransport>,
    clock_probe: Arc<dyn ClockProbeTransport>,
    score_log: Mutex<Option<ScoreLog>>,
    wire_flow_acc: Mutex<BTreeMap<(FlowId, u64), WireFlowAcc>>,
    scenario: RwLock<Scenario>,
    schedule_affinity: Mutex<BTreeMap<NodeId, schedule::ChannelIdx>>,
    reschedule: Arc<Notify>,
    schedule_seq: AtomicU32,
    last_reported_mp: AtomicU64,
    cancel_token: CancellationToken,
}

impl ControlPlaneController {
    /// Creates a controller in `Booting` state.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        self_id: NodeId,
        config: Config,
        time: Arc<TimeSource>,
        neighborhood: Arc<Neighborhood>,
        flow_perf: Arc<FlowPerformance>,
        link: Arc<LinkController>,
        mac: MacController,
        discovery: Arc<NeighborDiscovery>,
        collab: Option<Arc<CollaborationClient>>,
        internal_transport: Arc<dyn InternalTransport>,
        clock_probe: Arc<dyn ClockProbeTransport>,
        reschedule: Arc<Notify>,
        initial_frequency: f64,
        initial_bandwidth: f64,
        nchannels: usize,
        nslots: usize,
    ) -> Self {
        let start = time.now_wall();
        Self {
            self_id,
            config,
            state: Mutex::new(RadioState::Booting),
            time,
            neighborhood,
            flow_perf,
            scorer: Mutex::new(MandateScorer::new()),
            link,
            mac: Mutex::new(mac),
            discovery,
            collab,
            internal_transport,
            clock_probe,
            score_log: Mutex::new(None),
            wire_flow_acc: Mutex::new(BTreeMap::new()),
            scenario: RwLock::new(Scenario {
                frequency: initial_frequency,
                bandwidth: initial_bandwidth,
                start,
                nchannels,
                nslots,
                scoring_percent_threshold: None,
                scoring_point_threshold: None,
            }),
            schedule_affinity: Mutex::new(BTreeMap::new()),
            reschedule,
            schedule_seq: AtomicU32::new(0),
            last_reported_mp: AtomicU64::new(0),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RadioState {
        *self.state.lock()
    }

    /// Returns the link controller, the DSP's handoff point for packet
    /// ingest callbacks and ACK/NAK-driven MCS feedback.
    #[must_use]
    pub fn link_controller(&self) -> &Arc<LinkController> {
        &self.link
    }

    /// Attaches a `score_reported.csv` writer, opened by the caller (the
    /// binary knows the log directory).
    pub fn set_score_log(&self, log: ScoreLog) {
        *self.score_log.lock() = Some(log);
    }

    /// Transitions `Booting -> Ready`. Called once by the composition root
    /// after every service is wired up.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == RadioState::Booting {
            *state = RadioState::Ready;
        }
    }

    fn current_mp(&self) -> u64 {
        time_to_mp(
            self.time.now_wall(),
            self.scenario.read().start,
            self.config.measurement_period,
        )
    }

    fn mandate_from_goal(goal: &Goal) -> Mandate {
        let requirement = if let Some(bps) = goal.requirements.min_throughput_bps {
            Requirement::MinThroughputBps(bps)
        } else if let Some(deadline) = goal.requirements.file_transfer_deadline_s {
            Requirement::FileDeadlineS(deadline)
        } else if let Some(latency) = goal.requirements.max_latency_s {
            Requirement::MaxLatencyS(latency)
        } else {
            Requirement::MinThroughputBps(0.0)
        };
        Mandate {
            flow_uid: goal.flow_uid,
            hold_period: goal.hold_period.max(0.0).round() as u64,
            points: goal.point_value.max(0.0).round() as u32,
            requirement,
        }
    }

    /// Handles one request from the local remote-control socket.
    pub async fn handle_request(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::RadioCommand { command, .. } => self.handle_command(command).await,
            ControlRequest::UpdateMandatedOutcomes { goals, .. } => {
                self.handle_update_mandates(&goals)
            }
            ControlRequest::UpdateEnvironment { environment, .. } => {
                self.handle_update_environment(&environment)
            }
        }
    }

    async fn handle_command(&self, command: RadioCommandKind) -> ControlResponse {
        match command {
            RadioCommandKind::Status => ControlResponse::Status {
                state: self.state(),
                info: format!("{} neighbors known", self.neighborhood.len()),
            },
            RadioCommandKind::Start => {
                let mut state = self.state.lock();
                if *state == RadioState::Ready {
                    *state = RadioState::Active;
                    ControlResponse::Status {
                        state: RadioState::Active,
                        info: "started".into(),
                    }
                } else {
                    ControlResponse::Status {
                        state: *state,
                        info: format!("cannot start from {:?}", *state),
                    }
                }
            }
            RadioCommandKind::Stop => {
                let can_stop = {
                    let mut state = self.state.lock();
                    let can = matches!(*state, RadioState::Ready | RadioState::Active);
                    if can {
                        *state = RadioState::Stopping;
                    }
                    can
                };
                if can_stop {
                    self.shutdown().await;
                    ControlResponse::Status {
                        state: self.state(),
                        info: "stopped".into(),
                    }
                } else {
                    ControlResponse::Status {
                        state: self.state(),
                        info: "not running".into(),
                    }
                }
            }
        }
    }

    fn handle_update_mandates(&self, goals_json: &str) -> ControlResponse {
        match parse_goals(goals_json) {
            Ok(goals) => {
                let stage_start = self.current_mp();
                let mut scorer = self.scorer.lock();
                for goal in &goals {
                    scorer.set_mandate(Self::mandate_from_goal(goal), stage_start);
                }
                ControlResponse::Status {
                    state: self.state(),
                    info: format!("installed {} mandates", goals.len()),
                }
            }
            Err(err) => ControlResponse::Status {
                state: self.state(),
                info: format!("bad goals payload: {err}"),
            },
        }
    }

    fn apply_environment_update(&self, update: &EnvironmentUpdate) -> bool {
        let mut scenario = self.scenario.write();
        let mut bandwidth_changed = false;
        if let Some(freq) = update.scenario_center_frequency {
            scenario.frequency = freq;
        }
        if let Some(bw) = update.scenario_rf_bandwidth {
            if bw != scenario.bandwidth {
                bandwidth_changed = true;
            }
            scenario.bandwidth = bw;
        }
        if let Some(pct) = update.scoring_percent_threshold {
            scenario.scoring_percent_threshold = Some(pct);
        }
        if let Some(pts) = update.scoring_point_threshold {
            scenario.scoring_point_threshold = Some(pts.max(0) as u32);
        }
        bandwidth_changed
    }

    fn handle_update_environment(&self, environment_json: &str) -> ControlResponse {
        match parse_environment_updates(environment_json) {
            Ok(updates) => {
                let mut bandwidth_changed = false;
                for update in &updates {
                    bandwidth_changed |= self.apply_environment_update(update);
                }
                if bandwidth_changed {
                    self.reschedule.notify_one();
                }
                ControlResponse::Status {
                    state: self.state(),
                    info: format!("applied {} environment updates", updates.len()),
                }
            }
            Err(err) => ControlResponse::Status {
                state: self.state(),
                info: format!("bad environment payload: {err}"),
            },
        }
    }

    /// Handles a `Schedule` message received from the gateway. Rejects it if
    /// its (frequency, bandwidth) no longer matches the local configuration;
    /// otherwise installs it by sequence number (idempotent, monotonic).
    pub fn on_schedule_received(
        &self,
        seq: u32,
        frequency: f64,
        bandwidth: f64,
        nchannels: u32,
        nslots: u32,
        nodes: &[NodeId],
        cells: &[u8],
    ) -> bool {
        let scenario = *self.scenario.read();
        if (frequency - scenario.frequency).abs() > f64::EPSILON
            || (bandwidth - scenario.bandwidth).abs() > f64::EPSILON
        {
            log::warn!("rejecting schedule: frequency/bandwidth mismatch");
            return false;
        }
        let schedule = crate::schedule::Schedule::from_wire(nchannels as usize, nslots as usize, cells);
        let channel = match schedule::best_channel(&schedule, self.self_id) {
            Ok(chan) => chan,
            Err(_) => {
                log::warn!("schedule has no slot for self (node {})", self.self_id);
                return false;
            }
        };
        let _ = nodes;
        self.mac
            .lock()
            .install_tdma(seq, self.self_id, channel, schedule, false)
    }

    /// Handles a message received on the internal peer protocol (UDP port
    /// 4096). Only the gateway is expected to receive `Status`; any node may
    /// receive a `Schedule` the gateway distributes.
    pub fn on_internal_message(&self, msg: InternalMessage) {
        match msg {
            InternalMessage::Status {
                source_flows,
                sink_flows,
                ..
            } => self.ingest_peer_wire_flows(&source_flows, &sink_flows),
            InternalMessage::Schedule {
                seq,
                frequency,
                bandwidth,
                nchannels,
                nslots,
                nodes,
                schedule,
                ..
            } => {
                self.on_schedule_received(seq, frequency, bandwidth, nchannels, nslots, &nodes, &schedule);
            }
        }
    }

    /// Merges a peer's reported source/sink flow counters into the running
    /// per-(flow, MP) accumulator and rescoring whatever MPs they touch.
    /// Source and sink sides of a flow are usually reported by different
    /// nodes at different times; scores are refined as the missing side
    /// arrives.
    fn ingest_peer_wire_flows(&self, source_flows: &[FlowStatsWire], sink_flows: &[FlowStatsWire]) {
        let mut acc = self.wire_flow_acc.lock();
        let mut touched: Vec<(FlowId, u64)> = Vec::new();

        for wire in source_flows {
            for (i, (&npackets, &nbytes)) in
                wire.npackets.iter().zip(wire.nbytes.iter()).enumerate()
            {
                let mp = wire.first_mp + i as u64;
                let entry = acc.entry((wire.flow_uid, mp)).or_default();
                entry.sent_packets = npackets;
                entry.sent_bytes = nbytes;
                touched.push((wire.flow_uid, mp));
            }
        }
        for wire in sink_flows {
            for (i, (&npackets, &nbytes)) in
                wire.npackets.iter().zip(wire.nbytes.iter()).enumerate()
            {
                let mp = wire.first_mp + i as u64;
                let entry = acc.entry((wire.flow_uid, mp)).or_default();
                entry.recv_packets = npackets;
                entry.recv_bytes = nbytes;
                touched.push((wire.flow_uid, mp));
            }
        }

        let mut scorer = self.scorer.lock();
        for (flow_uid, mp) in &touched {
            let entry = acc[&(*flow_uid, *mp)];
            scorer.score_mp(
                *flow_uid,
                *mp,
                ScoringInput {
                    npackets_sent: entry.sent_packets,
                    nbytes_sent: entry.sent_bytes,
                    npackets_recv: entry.recv_packets,
                    nbytes_recv: entry.recv_bytes,
                },
            );
        }
        drop(scorer);
        drop(acc);

        if let Some((lower, upper)) = touched
            .iter()
            .map(|(_, mp)| *mp)
            .fold(None, |range: Option<(u64, u64)>, mp| {
                Some(range.map_or((mp, mp), |(lo, hi)| (lo.min(mp), hi.max(mp))))
            })
        {
            self.persist_scores(lower, upper);
        }
    }

    /// Runs every cooperative task for `Active` and returns once they have
    /// all been spawned. Tasks run until `shutdown` cancels them.
    pub fn spawn_active_tasks(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        self.spawn_discovery_task(spawner);
        self.spawn_clock_sync_task(spawner);
        self.spawn_status_task(spawner);
        self.spawn_dummy_keepalive(spawner);
        if self.neighborhood.is_self_gateway() {
            self.spawn_schedule_task(spawner);
            if let Some(collab) = &self.collab {
                let collab = Arc::clone(collab);
                let cancel = self.cancel_token.child_token();
                collab.spawn(spawner, cancel);
            }
        }
    }

    fn spawn_discovery_task(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let discovery = Arc::clone(&self.discovery);
        let cancel = self.cancel_token.child_token();
        discovery.spawn(spawner, cancel);
    }

    fn spawn_clock_sync_task(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let this = Arc::clone(self);
        let cancel = self.cancel_token.child_token();
        spawner.spawn_named("clock-sync", async move {
            let mut interval = tokio::time::interval(this.config.clock_sync_period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if this.neighborhood.is_self_gateway() {
                            continue;
                        }
                        let master = this.neighborhood.time_master();
                        if let Some((echoed, master_samples)) = this.clock_probe.exchange(master).await {
                            this.time.synchronize(&echoed, &master_samples, false);
                        }
                    }
                }
            }
        });
    }

    fn spawn_schedule_task(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let this = Arc::clone(self);
        let cancel = self.cancel_token.child_token();
        spawner.spawn_named("schedule", async move {
            let rebroadcast_period = Duration::from_secs(10);
            let mut rebroadcast = tokio::time::interval(rebroadcast_period);
            rebroadcast.tick().await;
            let mut last: Option<InternalMessage> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    () = this.reschedule.notified() => {
                        last = Some(this.rebuild_and_distribute().await);
                    }
                    _ = rebroadcast.tick() => {
                        if let Some(msg) = &last {
                            this.internal_transport.broadcast(msg.clone()).await;
                        }
                    }
                }
            }
        });
    }

    async fn rebuild_and_distribute(self: &Arc<Self>) -> InternalMessage {
        let neighbors: Vec<NodeId> = self
            .neighborhood
            .snapshot()
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        let scenario = *self.scenario.read();
        let seq = self.schedule_seq.fetch_add(1, Ordering::SeqCst) + 1;

        // §4.5/§4.7: a single channel means plain TDMA; multiple channels
        // with exactly one slot means FDMA (one dedicated channel per
        // node, no time-sharing); otherwise channels are time-shared via
        // fair_schedule, which keeps each peer on its previously assigned
        // channel across a reschedule.
        let schedule = if scenario.nchannels <= 1 {
            schedule::pure_tdma(&neighbors)
        } else if scenario.nslots <= 1 {
            schedule::full_channel_schedule(scenario.nchannels, 1, &neighbors, 1)
        } else {
            let prior_affinity = self.schedule_affinity.lock().clone();
            let (schedule, affinity) =
                schedule::fair_schedule(scenario.nchannels, scenario.nslots, &neighbors, 1, &prior_affinity);
            *self.schedule_affinity.lock() = affinity;
            schedule
        };

        let own_channel = schedule::best_channel(&schedule, self.self_id).unwrap_or(0);
        {
            let mut mac = self.mac.lock();
            if scenario.nchannels > 1 && scenario.nslots <= 1 {
                mac.install_fdma(seq, own_channel);
            } else {
                mac.install_tdma(seq, self.self_id, own_channel, schedule.clone(), false);
            }
        }
        self.discovery.mark_scheduled();

        let msg = InternalMessage::Schedule {
            seq,
            frequency: scenario.frequency,
            bandwidth: scenario.bandwidth,
            scenario_start_time: scenario.start,
            nchannels: schedule.nchannels() as u32,
            nslots: schedule.nslots() as u32,
            nodes: neighbors.clone(),
            schedule: schedule.to_wire(),
        };

        for node in neighbors {
            if node == self.self_id {
                continue;
            }
            if let Err(err) = self.internal_transport.unicast(node, msg.clone()).await {
                log::warn!("schedule unicast to {node} failed: {err}");
            }
        }
        msg
    }

    fn spawn_status_task(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let this = Arc::clone(self);
        let cancel = self.cancel_token.child_token();
        spawner.spawn_named("status", async move {
            let mut interval = tokio::time::interval(this.config.status_update_period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => this.report_status().await,
                }
            }
        });
    }

    async fn report_status(self: &Arc<Self>) {
        let now_mp = self.current_mp();
        let ignore = self.config.stats_ignore_window;
        if now_mp < ignore {
            return;
        }
        let upper = now_mp - ignore;
        let lower = self.last_reported_mp.load(Ordering::SeqCst) + 1;
        if lower > upper {
            return;
        }
        self.last_reported_mp.store(upper, Ordering::SeqCst);

        let flows = self.flow_perf.drain(true);
        if self.neighborhood.is_self_gateway() {
            self.ingest_flow_stats(&flows, lower, upper);
        } else {
            let wire: Vec<FlowStatsWire> = flows
                .iter()
                .map(|f| FlowStatsWire::from_source(f, self.self_id, self.neighborhood.time_master()))
                .collect();
            let msg = InternalMessage::Status {
                radio_id: self.self_id,
                timestamp: self.time.now_wall(),
                location: None,
                source_flows: wire,
                sink_flows: Vec::new(),
                spectrum_stats: Vec::new(),
            };
            let master = self.neighborhood.time_master();
            if let Err(err) = self.internal_transport.unicast(master, msg).await {
                log::warn!("status report to gateway failed: {err}");
            }
        }
    }

    fn ingest_flow_stats(&self, flows: &[crate::flow::FlowStats], lower: u64, upper: u64) {
        let mut scorer = self.scorer.lock();
        for flow in flows {
            for mp in lower..=upper {
                if mp < flow.first_mp {
                    continue;
                }
                let idx = (mp - flow.first_mp) as usize;
                if idx >= flow.npackets_sent.len() {
                    continue;
                }
                scorer.score_mp(
                    flow.flow_id,
                    mp,
                    ScoringInput {
                        npackets_sent: flow.npackets_sent[idx],
                        nbytes_sent: flow.nbytes_sent[idx],
                        npackets_recv: flow.npackets_recv[idx],
                        nbytes_recv: flow.nbytes_recv[idx],
                    },
                );
            }
        }
        drop(scorer);
        self.persist_scores(lower, upper);
    }

    fn persist_scores(&self, lower: u64, upper: u64) {
        let scorer = self.scorer.lock();
        let mut log = self.score_log.lock();
        let Some(log) = log.as_mut() else { return };
        for mp in lower..=upper {
            let mandates_achieved = scorer.stable_count(mp);
            let total_score_achieved = scorer.ensemble_score(mp);
            if let Err(err) = log.append_mp(ScoreReportRow {
                mp,
                mandates_achieved,
                total_score_achieved,
            }) {
                log::error!("failed to append score row for mp {mp}: {err}");
            }
        }
    }

    fn spawn_dummy_keepalive(self: &Arc<Self>, spawner: &dyn TaskSpawner) {
        let cancel = self.cancel_token.child_token();
        spawner.spawn_named("keepalive", async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
            }
        });
    }

    /// Cancels every `Active` task, drains the collaboration session, and
    /// transitions to `Finished`. Errors during cancellation are logged, not
    /// propagated, per the cooperative-cancellation design.
    ///
    /// `TaskSpawner` hands back no join handle, so cancellation can't wait on
    /// actual task completion; a fixed grace period gives spawned loops a
    /// chance to observe the token before we tear down shared state under
    /// them.
    pub async fn shutdown(&self) {
        if let Some(collab) = &self.collab {
            if let Err(err) = collab.leave().await {
                log::warn!("collaboration leave failed during shutdown: {err}");
            }
        }
        self.cancel_token.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;

        if let Some(mut log) = self.score_log.lock().take() {
            if let Err(err) = log.finalize() {
                log::error!("failed to finalize score log: {err}");
            }
        }

        *self.state.lock() = RadioState::Finished;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventListener;
    use crate::link::LinkTunables;
    use std::sync::Mutex as StdMutex;

    fn link_tunables() -> LinkTunables {
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
        }
    }

    struct RecordingTransport {
        unicasts: StdMutex<Vec<(NodeId, InternalMessage)>>,
    }

    #[async_trait]
    impl InternalTransport for RecordingTransport {
        async fn unicast(&self, to: NodeId, msg: InternalMessage) -> Result<(), ProtocolError> {
            self.unicasts.lock().unwrap().push((to, msg));
            Ok(())
        }
        async fn broadcast(&self, _msg: InternalMessage) {}
    }

    struct NoopHelloTransport;

    #[async_trait]
    impl crate::discovery::HelloTransport for NoopHelloTransport {
        async fn broadcast(&self, _hello: crate::discovery::Hello) {}
    }

    fn controller(self_id: NodeId) -> Arc<ControlPlaneController> {
        let listener = Arc::new(NoopEventListener);
        let neighborhood = Arc::new(Neighborhood::new(self_id, true, listener.clone()));
        let flow_perf = Arc::new(FlowPerformance::new());
        let link = Arc::new(LinkController::new(link_tunables(), listener));
        let mac = MacController::new_aloha(1, 0.1, 0);
        let discovery = Arc::new(NeighborDiscovery::new(
            self_id,
            true,
            Arc::clone(&neighborhood),
            Arc::clone(&link),
            Arc::new(NoopHelloTransport),
            Duration::from_secs(5),
            Duration::from_secs(15),
        ));
        let transport = Arc::new(RecordingTransport {
            unicasts: StdMutex::new(Vec::new()),
        });
        Arc::new(ControlPlaneController::new(
            self_id,
            Config::default(),
            Arc::new(TimeSource::new()),
            neighborhood,
            flow_perf,
            link,
            mac,
            discovery,
            None,
            transport,
            Arc::new(NoopClockProbeTransport),
            Arc::new(Notify::new()),
            915_000_000.0,
            5_000_000.0,
            1,
            8,
        ))
    }

    #[tokio::test]
    async fn start_requires_ready_state() {
        let c = controller(1);
        let resp = c.handle_request(ControlRequest::RadioCommand {
            timestamp: 0.0,
            command: RadioCommandKind::Start,
        }).await;
        match resp {
            ControlResponse::Status { state, .. } => assert_eq!(state, RadioState::Booting),
        }
        c.mark_ready();
        let resp = c.handle_request(ControlRequest::RadioCommand {
            timestamp: 0.0,
            command: RadioCommandKind::Start,
        }).await;
        match resp {
            ControlResponse::Status { state, .. } => assert_eq!(state, RadioState::Active),
        }
    }

    #[tokio::test]
    async fn stop_drains_tasks_and_reaches_finished() {
        let c = controller(1);
        c.mark_ready();
        c.handle_request(ControlRequest::RadioCommand {
            timestamp: 0.0,
            command: RadioCommandKind::Start,
        })
        .await;
        let resp = c.handle_request(ControlRequest::RadioCommand {
            timestamp: 0.0,
            command: RadioCommandKind::Stop,
        })
        .await;
        match resp {
            ControlResponse::Status { state, .. } => assert_eq!(state, RadioState::Finished),
        }
    }

    #[tokio::test]
    async fn update_mandated_outcomes_installs_a_mandate() {
        let c = controller(1);
        let goals = r#"[{"flow_uid":1,"hold_period":2,"requirements":{"min_throughput_bps":1000}}]"#;
        let resp = c
            .handle_request(ControlRequest::UpdateMandatedOutcomes {
                timestamp: 0.0,
                goals: goals.to_string(),
            })
            .await;
        match resp {
            ControlResponse::Status { info, .. } => assert!(info.contains("installed 1")),
        }
    }

    #[tokio::test]
    async fn environment_update_changing_bandwidth_triggers_reschedule() {
        let c = controller(1);
        let environment = r#"[{"scenario_rf_bandwidth":10000000}]"#;
        c.handle_request(ControlRequest::UpdateEnvironment {
            timestamp: 0.0,
            environment: environment.to_string(),
        })
        .await;
        assert_eq!(c.scenario.read().bandwidth, 10_000_000.0);
    }

    #[test]
    fn schedule_rejected_on_frequency_mismatch() {
        let c = controller(1);
        let accepted = c.on_schedule_received(1, 999.0, 5_000_000.0, 1, 1, &[1], &[1]);
        assert!(!accepted);
    }

    #[tokio::test]
    async fn status_report_scores_once_both_sides_are_known() {
        let c = controller(1);
        let goals = r#"[{"flow_uid":7,"hold_period":0,"point_value":10,"requirements":{"min_throughput_bps":1}}]"#;
        c.handle_request(ControlRequest::UpdateMandatedOutcomes {
            timestamp: 0.0,
            goals: goals.to_string(),
        })
        .await;

        let source = FlowStatsWire {
            flow_uid: 7,
            src: 2,
            dest: 3,
            first_mp: 0,
            npackets: vec![10],
            nbytes: vec![1000],
        };
        c.on_internal_message(InternalMessage::Status {
            radio_id: 2,
            timestamp: 0.0,
            location: None,
            source_flows: vec![source],
            sink_flows: vec![],
            spectrum_stats: vec![],
        });

        let sink = FlowStatsWire {
            flow_uid: 7,
            src: 2,
            dest: 3,
            first_mp: 0,
            npackets: vec![10],
            nbytes: vec![1000],
        };
        c.on_internal_message(InternalMessage::Status {
            radio_id: 3,
            timestamp: 0.0,
            location: None,
            source_flows: vec![],
            sink_flows: vec![sink],
            spectrum_stats: vec![],
        });

        assert_eq!(c.scorer.lock().ensemble_score(0), 10);
    }
}
