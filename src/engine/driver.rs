//! The per-run driver: a single-writer cooperative scheduler.
//!
//! One driver task owns one run. It holds the run's lease, pops ready
//! nodes in deterministic order, gates each dispatch through the policy
//! oracle, invokes node behavior, and appends the resulting events — all
//! state mutation flows through [`RunState::apply`] on appended events, so
//! live state and replayed state can never diverge.
//!
//! Suspension points (oracle calls, gateway invocations, retry backoff,
//! human parking) honor the per-run cancel signal and the global shutdown
//! signal. Lease loss aborts the local step, re-acquires, and reloads
//! state from the store before continuing.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::DecisionRecord;
use crate::events::EventDraft;
use crate::gateway::{AgentInvocation, AgentReply};
use crate::graphs::NodeDef;
use crate::lease::{AcquireOutcome, LeaseToken, RenewOutcome};
use crate::policy::{Decision, OracleEdge, OracleInput, OracleNode};
use crate::store::{AppendOutcome, Snapshot, StoreError};
use crate::types::{CorrelationId, NodeKind};

use super::reducer::RunState;
use super::replay::rebuild_state;
use super::retry::retry_delay;
use super::{EngineError, EngineInner};

/// Outcome of a resume call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The approval value was applied to a pending human checkpoint.
    Accepted,
    /// The run has no pending human checkpoint.
    NotPending,
    /// No such run is known to this engine.
    UnknownRun,
}

/// Control messages delivered to a driver from the engine facade.
pub(crate) enum DriverMessage {
    Resume {
        value: Value,
        reply: oneshot::Sender<ResumeOutcome>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
}

/// Interpretation of a resume approval value: a bare `true`, or an object
/// with `"approved": true`. Everything else rejects.
#[must_use]
pub fn approval_granted(value: &Value) -> bool {
    value.as_bool().unwrap_or_else(|| {
        value
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    })
}

enum DriverError {
    Store(StoreError),
    LeaseLost,
}

enum Flow {
    Continue,
    Done,
}

struct BehaviorFailure {
    message: String,
    transient: bool,
}

pub(crate) struct RunDriver {
    pub(crate) shared: Arc<EngineInner>,
    pub(crate) graph: Arc<crate::graphs::Graph>,
    pub(crate) correlation_id: CorrelationId,
    pub(crate) state: RunState,
    pub(crate) lease: LeaseToken,
    pub(crate) inbox: mpsc::Receiver<DriverMessage>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) shutdown: watch::Receiver<Option<Instant>>,
    pub(crate) last_snapshot_seq: u64,
    lease_renewed_at: Instant,
    /// Nodes whose `node.started` survived a crash without a completion;
    /// they re-dispatch with their recorded attempt number.
    recovered: BTreeSet<String>,
}

impl RunDriver {
    pub(crate) fn new(
        shared: Arc<EngineInner>,
        graph: Arc<crate::graphs::Graph>,
        correlation_id: CorrelationId,
        state: RunState,
        lease: LeaseToken,
        inbox: mpsc::Receiver<DriverMessage>,
        cancel: watch::Receiver<bool>,
        shutdown: watch::Receiver<Option<Instant>>,
        last_snapshot_seq: u64,
    ) -> Self {
        Self {
            shared,
            graph,
            correlation_id,
            state,
            lease,
            inbox,
            cancel,
            shutdown,
            last_snapshot_seq,
            lease_renewed_at: Instant::now(),
            recovered: BTreeSet::new(),
        }
    }

    #[instrument(skip(self), fields(run = %self.correlation_id))]
    pub(crate) async fn run(mut self) {
        self.requeue_in_flight();
        loop {
            match self.tick().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => break,
                Err(DriverError::LeaseLost) => {
                    warn!("run lease lost; attempting re-acquisition");
                    if !self.reacquire_and_reload().await {
                        error!("could not re-acquire run lease; abandoning driver");
                        break;
                    }
                }
                Err(DriverError::Store(StoreError::SequenceConflict { sequence, .. })) => {
                    // Duplicate-scheduler signal: verify the lease, then
                    // yield to whatever the store already holds.
                    warn!(sequence, "append sequence conflict; reloading from store");
                    if !self.reload().await {
                        break;
                    }
                }
                Err(DriverError::Store(e)) => {
                    error!(error = %e, "store failure; suspending run driver");
                    break;
                }
            }
        }
        let _ = self.shared.leases.release(&self.lease).await;
        debug!("run driver exited");
    }

    /// One scheduling decision: handle control messages, then dispatch the
    /// next ready node, park on pending humans, or terminate.
    async fn tick(&mut self) -> Result<Flow, DriverError> {
        self.drain_inbox().await?;

        if self.state.is_terminal() {
            return Ok(Flow::Done);
        }
        if *self.cancel.borrow() {
            let cid = self.correlation_id.clone();
            self.append_and_apply(vec![EventDraft::workflow_failed(&cid, "cancelled", None)])
                .await?;
            info!("run cancelled");
            return Ok(Flow::Done);
        }
        if self.shutdown.borrow().is_some() {
            // Parked, not failed: the run resumes on the next recovery.
            info!("shutdown requested; parking run");
            return Ok(Flow::Done);
        }

        let graph = self.graph.clone();
        match graph.pick_next(self.state.ready.iter()).cloned() {
            Some(node) => {
                self.step(&node).await?;
                Ok(Flow::Continue)
            }
            None if !self.state.pending_humans.is_empty() => {
                self.park().await?;
                Ok(Flow::Continue)
            }
            None => {
                let cid = self.correlation_id.clone();
                if self.state.all_terminals_completed(&graph) {
                    let outputs = self.state.terminal_outputs(&graph);
                    self.append_and_apply(vec![EventDraft::workflow_completed(&cid, outputs)])
                        .await?;
                    info!("run completed");
                } else {
                    // Empty frontier without completion means the graph
                    // wedged; surface it as an explicit terminal event.
                    self.append_and_apply(vec![EventDraft::workflow_failed(&cid, "stalled", None)])
                        .await?;
                    warn!("run stalled with empty frontier");
                }
                Ok(Flow::Done)
            }
        }
    }

    /// Dispatch one node: policy gates, then kind-specific behavior.
    async fn step(&mut self, node: &NodeDef) -> Result<(), DriverError> {
        let cid = self.correlation_id.clone();
        let graph = self.graph.clone();

        // Every incoming edge consults the oracle; one deny fails the run.
        let gates: Vec<crate::graphs::CompiledEdge> =
            graph.incoming_edges(&node.id).cloned().collect();
        let mut policies_applied: Vec<String> = Vec::new();
        for edge in &gates {
            for tag in &edge.policies {
                if !policies_applied.contains(tag) {
                    policies_applied.push(tag.clone());
                }
            }
        }
        for edge in &gates {
            let from = graph.node_id_at(edge.from).to_string();
            let input = OracleInput {
                node: OracleNode {
                    id: node.id.clone(),
                    name: node.name.clone(),
                    kind: node.kind,
                },
                bag: self.state.context.bag().clone(),
                policies: edge.policies.clone(),
                edge: OracleEdge {
                    from: from.clone(),
                    to: node.id.clone(),
                },
            };
            if let Decision::Deny { reason } = self.shared.oracle.evaluate(&input).await {
                self.append_and_apply(vec![
                    EventDraft::policy_denied(&cid, &from, &node.id, &reason, &edge.policies),
                    EventDraft::workflow_failed(&cid, "policy_denied", Some(&node.id)),
                ])
                .await?;
                self.record_decision(node, false, policies_applied, Value::Null, Value::Null, 0.0, AgentReply::default())
                    .await;
                info!(node = %node.id, %reason, "edge denied by policy; run failed");
                return Ok(());
            }
        }

        if node.kind.is_human() {
            let key = node.approval_key.clone().unwrap_or_default();
            self.append_and_apply(vec![EventDraft::human_awaited(&cid, &node.id, &key)])
                .await?;
            self.record_decision(node, true, policies_applied, Value::Null, Value::Null, 0.0, AgentReply::default())
                .await;
            debug!(node = %node.id, "awaiting human approval");
            return Ok(());
        }

        // Recovered in-flight nodes resume their recorded attempt; the
        // duplicate `node.started` append below is absorbed by the store.
        let attempt = if self.recovered.remove(&node.id) {
            self.state.attempts.get(&node.id).copied().unwrap_or(1).max(1)
        } else {
            self.state.attempts.get(&node.id).copied().unwrap_or(0) + 1
        };
        self.append_and_apply(vec![EventDraft::node_started(&cid, &node.id, attempt)])
            .await?;

        let projected = node.projection.apply(&self.state.context);
        let started_at = std::time::Instant::now();
        let outcome = self.invoke_behavior(node, attempt, projected.clone()).await;
        let latency_ms = started_at.elapsed().as_secs_f64() * 1000.0;

        // A step that outlived the shutdown drain deadline terminates the
        // run instead of committing its result.
        let shutdown_deadline = *self.shutdown.borrow();
        if let Some(deadline) = shutdown_deadline {
            if Instant::now() > deadline {
                self.append_and_apply(vec![EventDraft::workflow_failed(&cid, "shutdown", Some(&node.id))])
                    .await?;
                warn!(node = %node.id, "step overran shutdown drain deadline");
                return Ok(());
            }
        }

        match outcome {
            Ok(reply) => {
                self.append_and_apply(vec![EventDraft::node_completed(
                    &cid,
                    &node.id,
                    attempt,
                    reply.output.clone(),
                )])
                .await?;
                self.record_decision(
                    node,
                    true,
                    policies_applied,
                    projected,
                    reply.output.clone(),
                    latency_ms,
                    reply,
                )
                .await;
            }
            Err(failure) => {
                let will_retry = failure.transient && node.retry.allows_another(attempt);
                self.append_and_apply(vec![EventDraft::node_failed(
                    &cid,
                    &node.id,
                    attempt,
                    &failure.message,
                    failure.transient,
                    will_retry,
                )])
                .await?;
                self.record_decision(
                    node,
                    true,
                    policies_applied,
                    projected,
                    json!({ "error": failure.message }),
                    latency_ms,
                    AgentReply::default(),
                )
                .await;
                if will_retry {
                    let delay = retry_delay(&node.retry, attempt);
                    debug!(node = %node.id, attempt, ?delay, "transient failure; backing off");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = self.cancel.changed() => {}
                        _ = self.shutdown.changed() => {}
                    }
                } else {
                    self.append_and_apply(vec![EventDraft::workflow_failed(
                        &cid,
                        "node_failed",
                        Some(&node.id),
                    )])
                    .await?;
                    warn!(node = %node.id, attempt, "node failed permanently; run failed");
                }
            }
        }
        Ok(())
    }

    async fn invoke_behavior(
        &self,
        node: &NodeDef,
        attempt: u32,
        input: Value,
    ) -> Result<AgentReply, BehaviorFailure> {
        match node.kind {
            NodeKind::Agent => {
                let invocation = AgentInvocation {
                    correlation_id: self.correlation_id.clone(),
                    node_id: node.id.clone(),
                    node_name: node.name.clone(),
                    attempt,
                    input,
                };
                match tokio::time::timeout(node.timeout, self.shared.gateway.invoke(invocation))
                    .await
                {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(e)) => Err(BehaviorFailure {
                        transient: e.is_transient(),
                        message: e.to_string(),
                    }),
                    Err(_) => Err(BehaviorFailure {
                        transient: true,
                        message: format!("attempt timed out after {:?}", node.timeout),
                    }),
                }
            }
            // Task and Terminal are pure over the projected context.
            // Human never reaches behavior dispatch; it parks in `step`.
            NodeKind::Task | NodeKind::Terminal | NodeKind::Human => {
                Ok(AgentReply::from_output(input))
            }
        }
    }

    /// Block until something requires attention: a control message, a
    /// cancel/shutdown edge, or a lease renewal tick.
    async fn park(&mut self) -> Result<(), DriverError> {
        enum Wake {
            Message(Option<DriverMessage>),
            Signal,
            RenewTick,
        }
        let renew_tick = self.shared.config.lease_ttl / 4;
        let wake = tokio::select! {
            msg = self.inbox.recv() => Wake::Message(msg),
            _ = self.cancel.changed() => Wake::Signal,
            _ = self.shutdown.changed() => Wake::Signal,
            () = tokio::time::sleep(renew_tick) => Wake::RenewTick,
        };
        match wake {
            Wake::Message(Some(msg)) => self.handle_message(msg).await?,
            // Engine dropped the handle; nothing can wake this run.
            Wake::Message(None) => {}
            Wake::Signal => {}
            Wake::RenewTick => self.ensure_lease().await?,
        }
        Ok(())
    }

    async fn drain_inbox(&mut self) -> Result<(), DriverError> {
        while let Ok(msg) = self.inbox.try_recv() {
            self.handle_message(msg).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: DriverMessage) -> Result<(), DriverError> {
        match msg {
            DriverMessage::Resume { value, reply } => {
                let outcome = self.handle_resume(value).await?;
                let _ = reply.send(outcome);
            }
            DriverMessage::TakeSnapshot { reply } => {
                let result = self
                    .write_snapshot_now()
                    .await
                    .map_err(|e| EngineError::Store { source: e });
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    async fn handle_resume(&mut self, value: Value) -> Result<ResumeOutcome, DriverError> {
        if self.state.is_terminal() || self.state.pending_humans.is_empty() {
            return Ok(ResumeOutcome::NotPending);
        }
        let graph = self.graph.clone();
        // Multiple pending checkpoints resolve in scheduling order.
        let Some(node) = graph.pick_next(self.state.pending_humans.iter()).cloned() else {
            return Ok(ResumeOutcome::NotPending);
        };
        let key = node.approval_key.clone().unwrap_or_default();
        let cid = self.correlation_id.clone();

        if approval_granted(&value) {
            self.append_and_apply(vec![EventDraft::human_approved(&cid, &node.id, &key, value)])
                .await?;
            info!(node = %node.id, "human checkpoint approved");
        } else {
            self.append_and_apply(vec![
                EventDraft::human_rejected(&cid, &node.id, &key, value),
                EventDraft::workflow_failed(&cid, "rejected", Some(&node.id)),
            ])
            .await?;
            info!(node = %node.id, "human checkpoint rejected; run failed");
        }
        Ok(ResumeOutcome::Accepted)
    }

    /// Append under the lease and fold every newly materialized event into
    /// the state; deduplicated events were applied during replay already.
    async fn append_and_apply(&mut self, drafts: Vec<EventDraft>) -> Result<(), DriverError> {
        self.ensure_lease().await?;
        let receipt = self
            .shared
            .store
            .append(&self.correlation_id, drafts)
            .await
            .map_err(DriverError::Store)?;
        let graph = self.graph.clone();
        for outcome in &receipt.outcomes {
            if let AppendOutcome::Appended(event) = outcome {
                self.state.apply(&graph, event);
            }
        }
        if let Some(nudge) = &self.shared.publisher_nudge {
            nudge.notify_one();
        }
        self.maybe_snapshot().await;
        Ok(())
    }

    /// Snapshot every k events. Write failures are logged and skipped —
    /// snapshots are advisory; the log is the source of truth.
    async fn maybe_snapshot(&mut self) {
        let interval = self.shared.config.snapshot_interval.max(2);
        if self.state.is_terminal()
            || self.state.last_applied.saturating_sub(self.last_snapshot_seq) < interval
        {
            return;
        }
        let covered = self.state.last_applied;
        match self.write_snapshot_now().await {
            Ok(snapshot_id) => {
                self.last_snapshot_seq = covered;
                let cid = self.correlation_id.clone();
                if let Err(e) = self
                    .append_and_apply_marker(EventDraft::snapshot_created(&cid, &snapshot_id, covered))
                    .await
                {
                    warn!(error = %e, "snapshot marker append failed");
                }
            }
            Err(e) => warn!(error = %e, "snapshot write failed; continuing without"),
        }
    }

    /// Marker append that skips the snapshot check, so a marker can never
    /// trigger another snapshot.
    async fn append_and_apply_marker(&mut self, draft: EventDraft) -> Result<(), StoreError> {
        let receipt = self
            .shared
            .store
            .append(&self.correlation_id, vec![draft])
            .await?;
        let graph = self.graph.clone();
        for outcome in &receipt.outcomes {
            if let AppendOutcome::Appended(event) = outcome {
                self.state.apply(&graph, event);
            }
        }
        Ok(())
    }

    async fn write_snapshot_now(&mut self) -> Result<String, StoreError> {
        let snapshot_id = self.shared.ids.snapshot_id();
        self.shared
            .store
            .write_snapshot(Snapshot {
                correlation_id: self.correlation_id.clone(),
                snapshot_id: snapshot_id.clone(),
                up_to_sequence: self.state.last_applied,
                payload: self.state.to_value(),
                created_at: chrono::Utc::now(),
            })
            .await?;
        debug!(up_to = self.state.last_applied, "snapshot written");
        Ok(snapshot_id)
    }

    async fn ensure_lease(&mut self) -> Result<(), DriverError> {
        let ttl = self.shared.config.lease_ttl;
        if self.lease_renewed_at.elapsed() < ttl / 4 {
            return Ok(());
        }
        match self.shared.leases.renew(&self.lease, ttl).await {
            Ok(RenewOutcome::Renewed) => {
                self.lease_renewed_at = Instant::now();
                Ok(())
            }
            Ok(RenewOutcome::Lost) => Err(DriverError::LeaseLost),
            Err(e) => {
                warn!(error = %e, "lease renewal backend error; treating as lost");
                Err(DriverError::LeaseLost)
            }
        }
    }

    /// After losing the lease: re-acquire with backoff, then reload.
    async fn reacquire_and_reload(&mut self) -> bool {
        let ttl = self.shared.config.lease_ttl;
        for _ in 0..5 {
            match self
                .shared
                .leases
                .acquire(self.correlation_id.as_str(), ttl)
                .await
            {
                Ok(AcquireOutcome::Acquired(token)) => {
                    self.lease = token;
                    self.lease_renewed_at = Instant::now();
                    return self.reload().await;
                }
                Ok(AcquireOutcome::Busy) => {}
                Err(e) => warn!(error = %e, "lease re-acquisition backend error"),
            }
            tokio::time::sleep(ttl / 2).await;
        }
        false
    }

    /// Reload state from snapshot + events and requeue interrupted nodes.
    async fn reload(&mut self) -> bool {
        match rebuild_state(&self.shared.store, &self.graph, &self.correlation_id).await {
            Ok((state, snapshot_seq)) => {
                self.state = state;
                self.last_snapshot_seq = snapshot_seq;
                self.recovered.clear();
                self.requeue_in_flight();
                true
            }
            Err(e) => {
                error!(error = %e, "state reload failed; abandoning driver");
                false
            }
        }
    }

    /// Interrupted `node.started` entries go back to the ready set and
    /// re-dispatch with their recorded attempt number.
    fn requeue_in_flight(&mut self) {
        let interrupted: Vec<String> = self.state.in_flight.iter().cloned().collect();
        for id in interrupted {
            self.state.in_flight.remove(&id);
            self.state.ready.insert(id.clone());
            self.recovered.insert(id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_decision(
        &self,
        node: &NodeDef,
        allowed: bool,
        policies_applied: Vec<String>,
        input_snapshot: Value,
        output_snapshot: Value,
        latency_ms: f64,
        reply: AgentReply,
    ) {
        self.shared
            .recorder
            .emit(DecisionRecord {
                correlation_id: self.correlation_id.clone(),
                workflow_id: self.graph.id().to_string(),
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                node_kind: node.kind,
                allowed,
                policies_applied,
                input_snapshot,
                output_snapshot,
                external_calls: reply.external_calls,
                cost_meters: reply.cost_meters,
                latency_ms: Some(latency_ms),
                created_at: chrono::Utc::now(),
            })
            .await;
    }
}
