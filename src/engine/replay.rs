//! Snapshot-based recovery and audit replay.
//!
//! Recovery reads the latest snapshot (if any) and folds the event tail
//! through the same reducer used during live execution. Audit replay
//! reconstructs the state a historical snapshot covered by folding events
//! from zero — which doubles as a losslessness check on the snapshot
//! mechanism, since both paths must agree.

use std::sync::Arc;

use crate::graphs::Graph;
use crate::store::{EventStore, Result, Snapshot};
use crate::types::CorrelationId;

use super::reducer::{replay, RunState};

/// Rebuild current state: latest snapshot plus the event tail.
///
/// Returns the state and the sequence of the snapshot it started from
/// (0 when replaying from the beginning).
pub async fn rebuild_state(
    store: &Arc<dyn EventStore>,
    graph: &Graph,
    correlation_id: &CorrelationId,
) -> Result<(RunState, u64)> {
    let snapshot = store.read_snapshot(correlation_id).await?;
    let (base, from_seq) = match snapshot {
        Some(s) => (RunState::from_value(s.payload), s.up_to_sequence),
        None => (RunState::default(), 0),
    };
    let tail = store.load(correlation_id, from_seq).await?;
    Ok((replay(graph, base, &tail), from_seq))
}

/// Reconstruct state through a specific snapshot and halt: fold events
/// from zero up to the snapshot's sequence. Returns `None` when the
/// snapshot does not exist.
pub async fn replay_through_snapshot(
    store: &Arc<dyn EventStore>,
    graph: &Graph,
    correlation_id: &CorrelationId,
    snapshot_id: &str,
) -> Result<Option<(Snapshot, RunState)>> {
    let Some(snapshot) = store.read_snapshot_by_id(correlation_id, snapshot_id).await? else {
        return Ok(None);
    };
    let events = store.load(correlation_id, 0).await?;
    let state = replay(
        graph,
        RunState::default(),
        events
            .iter()
            .filter(|e| e.sequence <= snapshot.up_to_sequence),
    );
    Ok(Some((snapshot, state)))
}
