//! The execution engine: run admission, drivers, resume, and recovery.
//!
//! [`Engine`] is the process-wide coordination point. It holds the adapter
//! set (store, leases, oracle, gateway, decision sink), a registry of
//! compiled graphs, and a bounded pool of run drivers. Each run is driven
//! by a single cooperative scheduler task holding the run's lease
//! ([`driver`]); runs execute in parallel across the pool.
//!
//! Admission is explicit: when the pool (or a tenant's slice of it) is
//! full, [`Engine::start`] fails with [`EngineError::Busy`] rather than
//! queueing — the ingress layer decides whether to translate that into a
//! retry response.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gantry::engine::{Engine, EngineConfig};
//! use gantry::lease::InMemoryLeaseManager;
//! use gantry::spec::WorkflowSpec;
//! use gantry::store::InMemoryEventStore;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder(
//!     Arc::new(InMemoryEventStore::new()),
//!     Arc::new(InMemoryLeaseManager::new()),
//! )
//! .config(EngineConfig::default())
//! .build();
//!
//! let spec = WorkflowSpec::from_yaml(include_str!("../../demos/shipping.yaml"))?;
//! let graph_id = engine.compile(spec)?;
//! let cid = engine.start(&graph_id, json!({"parcel": {"kg": 3}}), None).await?;
//! let events = engine.events(&cid, 0).await?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod reducer;
pub mod replay;
pub mod retry;

pub use driver::{approval_granted, ResumeOutcome};
pub use reducer::{RunState, RunStatus};
pub use retry::retry_delay;

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::audit::{DecisionRecorder, DecisionSink, MemoryDecisionSink};
use crate::events::Event;
use crate::gateway::{AgentGateway, EchoGateway};
use crate::graphs::{CompileError, Graph, GraphBuilder};
use crate::lease::{AcquireOutcome, LeaseManager, LeaseToken};
use crate::policy::{AllowAllOracle, OracleClient, PolicyOracle};
use crate::spec::WorkflowSpec;
use crate::store::{EventStore, Snapshot, SnapshotMeta, StoreError};
use crate::types::{CorrelationId, EventType};
use crate::utils::ids::IdGenerator;

use driver::{DriverMessage, RunDriver};

/// Engine tunables.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Hard cap on concurrently driven runs; admission beyond it is
    /// rejected with [`EngineError::Busy`].
    pub max_concurrent_runs: usize,
    /// Per-tenant slice of the pool when a tenant tag is supplied.
    pub max_runs_per_tenant: usize,
    /// Run lease TTL; drivers renew below TTL/2.
    pub lease_ttl: Duration,
    /// Snapshot cadence k: a snapshot is written every k events.
    pub snapshot_interval: u64,
    /// How long shutdown drains in-flight steps before they terminate
    /// with `reason=shutdown`.
    pub drain_deadline: Duration,
    /// Oracle retry attempts and base backoff.
    pub oracle_attempts: u32,
    pub oracle_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 64,
            max_runs_per_tenant: 16,
            lease_ttl: Duration::from_secs(10),
            snapshot_interval: 50,
            drain_deadline: Duration::from_secs(30),
            oracle_attempts: 3,
            oracle_backoff: Duration::from_millis(50),
        }
    }
}

/// Engine-surface failures.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("unknown graph `{graph_id}`")]
    #[diagnostic(
        code(gantry::engine::unknown_graph),
        help("Compile and register the workflow spec before starting runs.")
    )]
    UnknownGraph { graph_id: String },

    #[error("unknown run {correlation_id}")]
    #[diagnostic(code(gantry::engine::unknown_run))]
    UnknownRun { correlation_id: CorrelationId },

    #[error("run-driver pool exhausted")]
    #[diagnostic(
        code(gantry::engine::busy),
        help("Admission is bounded; retry after capacity frees up.")
    )]
    Busy,

    #[error("run {correlation_id} is unavailable: its lease is held elsewhere")]
    #[diagnostic(code(gantry::engine::run_unavailable))]
    RunUnavailable { correlation_id: CorrelationId },

    #[error("snapshot `{snapshot_id}` not found for run {correlation_id}")]
    #[diagnostic(code(gantry::engine::snapshot_missing))]
    SnapshotMissing {
        correlation_id: CorrelationId,
        snapshot_id: String,
    },

    #[error(transparent)]
    #[diagnostic(code(gantry::engine::compile))]
    Compile {
        #[from]
        source: CompileError,
    },

    #[error(transparent)]
    #[diagnostic(code(gantry::engine::store))]
    Store {
        #[from]
        source: StoreError,
    },

    #[error("lease backend failure: {message}")]
    #[diagnostic(code(gantry::engine::lease))]
    Lease { message: String },
}

/// Adapter set and shared state, visible to drivers.
pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn EventStore>,
    pub(crate) leases: Arc<dyn LeaseManager>,
    pub(crate) oracle: OracleClient,
    pub(crate) gateway: Arc<dyn AgentGateway>,
    pub(crate) recorder: DecisionRecorder,
    pub(crate) config: EngineConfig,
    pub(crate) publisher_nudge: Option<Arc<Notify>>,
    pub(crate) ids: IdGenerator,
}

struct RunHandle {
    inbox: mpsc::Sender<DriverMessage>,
    cancel: watch::Sender<bool>,
}

/// Builder for [`Engine`]; store and lease manager are mandatory, every
/// other adapter has a test-friendly default.
pub struct EngineBuilder {
    store: Arc<dyn EventStore>,
    leases: Arc<dyn LeaseManager>,
    oracle: Arc<dyn PolicyOracle>,
    gateway: Arc<dyn AgentGateway>,
    sink: Arc<dyn DecisionSink>,
    publisher_nudge: Option<Arc<Notify>>,
    config: EngineConfig,
}

impl EngineBuilder {
    #[must_use]
    pub fn oracle(mut self, oracle: Arc<dyn PolicyOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    #[must_use]
    pub fn gateway(mut self, gateway: Arc<dyn AgentGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    #[must_use]
    pub fn decision_sink(mut self, sink: Arc<dyn DecisionSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Wire the outbox publisher's waker so appends cut its poll latency.
    #[must_use]
    pub fn publisher_nudge(mut self, nudge: Arc<Notify>) -> Self {
        self.publisher_nudge = Some(nudge);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let oracle = OracleClient::new(self.oracle)
            .with_retries(self.config.oracle_attempts, self.config.oracle_backoff);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        Engine {
            inner: Arc::new(EngineInner {
                store: self.store,
                leases: self.leases,
                oracle,
                gateway: self.gateway,
                recorder: DecisionRecorder::new(self.sink),
                config: self.config.clone(),
                publisher_nudge: self.publisher_nudge,
                ids: IdGenerator::new(),
            }),
            graphs: std::sync::Mutex::new(FxHashMap::default()),
            runs: Arc::new(Mutex::new(FxHashMap::default())),
            run_permits: Arc::new(Semaphore::new(self.config.max_concurrent_runs)),
            tenant_permits: std::sync::Mutex::new(FxHashMap::default()),
            shutdown_tx,
            shutdown_rx,
        }
    }
}

/// The workflow execution engine. See the module docs.
pub struct Engine {
    inner: Arc<EngineInner>,
    graphs: std::sync::Mutex<FxHashMap<String, Arc<Graph>>>,
    runs: Arc<Mutex<FxHashMap<CorrelationId, RunHandle>>>,
    run_permits: Arc<Semaphore>,
    tenant_permits: std::sync::Mutex<FxHashMap<String, Arc<Semaphore>>>,
    shutdown_tx: watch::Sender<Option<Instant>>,
    shutdown_rx: watch::Receiver<Option<Instant>>,
}

impl Engine {
    /// Start building an engine over the two mandatory adapters.
    #[must_use]
    pub fn builder(store: Arc<dyn EventStore>, leases: Arc<dyn LeaseManager>) -> EngineBuilder {
        EngineBuilder {
            store,
            leases,
            oracle: Arc::new(AllowAllOracle),
            gateway: Arc::new(EchoGateway),
            sink: Arc::new(MemoryDecisionSink::new()),
            publisher_nudge: None,
            config: EngineConfig::default(),
        }
    }

    /// Compile a declarative spec and register the resulting graph.
    /// Returns the graph id used by [`start`](Self::start).
    pub fn compile(&self, spec: WorkflowSpec) -> Result<String, CompileError> {
        let graph = GraphBuilder::from_spec(spec).compile()?;
        Ok(self.register(graph))
    }

    /// Register a pre-compiled graph; replaces any graph with the same id.
    pub fn register(&self, graph: Graph) -> String {
        let id = graph.id().to_string();
        self.graphs
            .lock()
            .expect("graph registry poisoned")
            .insert(id.clone(), Arc::new(graph));
        id
    }

    fn graph(&self, graph_id: &str) -> Result<Arc<Graph>, EngineError> {
        self.graphs
            .lock()
            .expect("graph registry poisoned")
            .get(graph_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownGraph {
                graph_id: graph_id.to_string(),
            })
    }

    fn tenant_semaphore(&self, tenant: &str) -> Arc<Semaphore> {
        self.tenant_permits
            .lock()
            .expect("tenant permits poisoned")
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.inner.config.max_runs_per_tenant)))
            .clone()
    }

    /// Start a new run of a registered graph.
    #[instrument(skip(self, initial_bag), err)]
    pub async fn start(
        &self,
        graph_id: &str,
        initial_bag: Value,
        tenant: Option<String>,
    ) -> Result<CorrelationId, EngineError> {
        let graph = self.graph(graph_id)?;

        let permit = self
            .run_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::Busy)?;
        let tenant_permit = match &tenant {
            Some(t) => Some(
                self.tenant_semaphore(t)
                    .try_acquire_owned()
                    .map_err(|_| EngineError::Busy)?,
            ),
            None => None,
        };

        let cid = self.inner.ids.correlation_id();
        let lease = self.acquire_lease(&cid).await?;

        let appended = self
            .inner
            .store
            .append(
                &cid,
                vec![crate::events::EventDraft::workflow_started(
                    &cid,
                    graph.id(),
                    initial_bag,
                    tenant.as_deref(),
                )],
            )
            .await;
        let receipt = match appended {
            Ok(receipt) => receipt,
            Err(e) => {
                let _ = self.inner.leases.release(&lease).await;
                return Err(e.into());
            }
        };
        let mut state = RunState::default();
        for outcome in &receipt.outcomes {
            if let crate::store::AppendOutcome::Appended(event) = outcome {
                state.apply(&graph, event);
            }
        }
        if let Some(nudge) = &self.inner.publisher_nudge {
            nudge.notify_one();
        }

        info!(run = %cid, graph = %graph_id, "run started");
        self.spawn_driver(graph, cid.clone(), state, lease, 0, permit, tenant_permit)
            .await;
        Ok(cid)
    }

    /// Resume a run parked on a human checkpoint with a typed approval
    /// value.
    pub async fn resume(&self, correlation_id: &CorrelationId, value: Value) -> ResumeOutcome {
        let sender = {
            self.runs
                .lock()
                .await
                .get(correlation_id)
                .map(|h| h.inbox.clone())
        };
        let Some(sender) = sender else {
            return ResumeOutcome::UnknownRun;
        };
        let (tx, rx) = oneshot::channel();
        if sender
            .send(DriverMessage::Resume { value, reply: tx })
            .await
            .is_err()
        {
            return ResumeOutcome::UnknownRun;
        }
        rx.await.unwrap_or(ResumeOutcome::UnknownRun)
    }

    /// Signal a run to cancel. The driver appends `workflow.failed` with
    /// `reason=cancelled` once outstanding calls return or time out.
    pub async fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        match self.runs.lock().await.get(correlation_id) {
            Some(handle) => handle.cancel.send(true).is_ok(),
            None => false,
        }
    }

    /// Whether a driver is currently active (running or parked) for the run.
    pub async fn is_active(&self, correlation_id: &CorrelationId) -> bool {
        self.runs.lock().await.contains_key(correlation_id)
    }

    /// Recover a run from durable state and resume driving it.
    ///
    /// Safe to call for terminated runs (no-op) and idempotent for already
    /// active runs.
    #[instrument(skip(self), err)]
    pub async fn recover(&self, correlation_id: &CorrelationId) -> Result<(), EngineError> {
        if self.is_active(correlation_id).await {
            return Ok(());
        }
        let graph = self.graph_for_run(correlation_id).await?;

        let permit = self
            .run_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::Busy)?;
        let lease = match self
            .inner
            .leases
            .acquire(correlation_id.as_str(), self.inner.config.lease_ttl)
            .await
            .map_err(|e| EngineError::Lease {
                message: e.to_string(),
            })? {
            AcquireOutcome::Acquired(token) => token,
            AcquireOutcome::Busy => {
                return Err(EngineError::RunUnavailable {
                    correlation_id: correlation_id.clone(),
                })
            }
        };

        let (state, snapshot_seq) =
            replay::rebuild_state(&self.inner.store, &graph, correlation_id).await?;
        if state.is_terminal() {
            let _ = self.inner.leases.release(&lease).await;
            return Ok(());
        }
        let tenant_permit = match &state.tenant {
            Some(t) => Some(
                self.tenant_semaphore(t)
                    .try_acquire_owned()
                    .map_err(|_| EngineError::Busy)?,
            ),
            None => None,
        };

        info!(run = %correlation_id, from_seq = state.last_applied, "run recovered");
        self.spawn_driver(
            graph,
            correlation_id.clone(),
            state,
            lease,
            snapshot_seq,
            permit,
            tenant_permit,
        )
        .await;
        Ok(())
    }

    /// Event stream for a run, restartable from `from_seq` (exclusive).
    pub async fn events(
        &self,
        correlation_id: &CorrelationId,
        from_seq: u64,
    ) -> Result<Vec<Event>, EngineError> {
        Ok(self.inner.store.load(correlation_id, from_seq).await?)
    }

    /// Write a snapshot of the run's current state; returns its id.
    pub async fn snapshot(&self, correlation_id: &CorrelationId) -> Result<String, EngineError> {
        // An active driver snapshots under its own lease.
        let sender = {
            self.runs
                .lock()
                .await
                .get(correlation_id)
                .map(|h| h.inbox.clone())
        };
        if let Some(sender) = sender {
            let (tx, rx) = oneshot::channel();
            if sender
                .send(DriverMessage::TakeSnapshot { reply: tx })
                .await
                .is_ok()
            {
                if let Ok(result) = rx.await {
                    return result;
                }
            }
        }

        // Inactive run: take the lease, rebuild, snapshot, release.
        let graph = self.graph_for_run(correlation_id).await?;
        let lease = match self
            .inner
            .leases
            .acquire(correlation_id.as_str(), self.inner.config.lease_ttl)
            .await
            .map_err(|e| EngineError::Lease {
                message: e.to_string(),
            })? {
            AcquireOutcome::Acquired(token) => token,
            AcquireOutcome::Busy => {
                return Err(EngineError::RunUnavailable {
                    correlation_id: correlation_id.clone(),
                })
            }
        };
        let result = async {
            let (state, _) =
                replay::rebuild_state(&self.inner.store, &graph, correlation_id).await?;
            let snapshot_id = self.inner.ids.snapshot_id();
            self.inner
                .store
                .write_snapshot(Snapshot {
                    correlation_id: correlation_id.clone(),
                    snapshot_id: snapshot_id.clone(),
                    up_to_sequence: state.last_applied,
                    payload: state.to_value(),
                    created_at: chrono::Utc::now(),
                })
                .await?;
            Ok(snapshot_id)
        }
        .await;
        let _ = self.inner.leases.release(&lease).await;
        result.map_err(|source: StoreError| EngineError::Store { source })
    }

    /// Snapshot catalogue for a run, oldest first.
    pub async fn list_snapshots(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<SnapshotMeta>, EngineError> {
        Ok(self.inner.store.list_snapshots(correlation_id).await?)
    }

    /// Audit replay: reconstruct state through a historical snapshot by
    /// folding events from zero, and halt without executing anything.
    pub async fn replay(
        &self,
        correlation_id: &CorrelationId,
        snapshot_id: &str,
    ) -> Result<RunState, EngineError> {
        let graph = self.graph_for_run(correlation_id).await?;
        match replay::replay_through_snapshot(&self.inner.store, &graph, correlation_id, snapshot_id)
            .await?
        {
            Some((_, state)) => Ok(state),
            None => Err(EngineError::SnapshotMissing {
                correlation_id: correlation_id.clone(),
                snapshot_id: snapshot_id.to_string(),
            }),
        }
    }

    /// Graceful shutdown: signal every driver, then wait for the pool to
    /// drain up to the configured deadline.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + self.inner.config.drain_deadline;
        let _ = self.shutdown_tx.send(Some(deadline));
        let runs = self.runs.clone();
        let drained = async move {
            loop {
                if runs.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        if tokio::time::timeout(self.inner.config.drain_deadline + Duration::from_secs(1), drained)
            .await
            .is_err()
        {
            warn!("drivers still busy past drain deadline");
        }
        info!("engine shut down");
    }

    async fn acquire_lease(&self, correlation_id: &CorrelationId) -> Result<LeaseToken, EngineError> {
        match self
            .inner
            .leases
            .acquire(correlation_id.as_str(), self.inner.config.lease_ttl)
            .await
            .map_err(|e| EngineError::Lease {
                message: e.to_string(),
            })? {
            AcquireOutcome::Acquired(token) => Ok(token),
            // A fresh correlation id contended: treat as transient pressure.
            AcquireOutcome::Busy => Err(EngineError::Busy),
        }
    }

    /// Resolve the graph a stored run was started against.
    async fn graph_for_run(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Arc<Graph>, EngineError> {
        let events = self.inner.store.load(correlation_id, 0).await?;
        let started = events
            .iter()
            .find(|e| e.event_type == EventType::WorkflowStarted)
            .ok_or_else(|| EngineError::UnknownRun {
                correlation_id: correlation_id.clone(),
            })?;
        let p: crate::events::payload::WorkflowStarted = started.payload_as();
        self.graph(&p.spec_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_driver(
        &self,
        graph: Arc<Graph>,
        correlation_id: CorrelationId,
        state: RunState,
        lease: LeaseToken,
        last_snapshot_seq: u64,
        permit: tokio::sync::OwnedSemaphorePermit,
        tenant_permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let driver = RunDriver::new(
            self.inner.clone(),
            graph,
            correlation_id.clone(),
            state,
            lease,
            inbox_rx,
            cancel_rx,
            self.shutdown_rx.clone(),
            last_snapshot_seq,
        );

        let runs = self.runs.clone();
        let cid = correlation_id.clone();
        self.runs.lock().await.insert(
            correlation_id,
            RunHandle {
                inbox: inbox_tx,
                cancel: cancel_tx,
            },
        );
        tokio::spawn(async move {
            driver.run().await;
            runs.lock().await.remove(&cid);
            drop(tenant_permit);
            drop(permit);
        });
    }
}
