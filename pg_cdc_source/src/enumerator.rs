use std::collections::{HashMap, VecDeque};
use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::offset::LogOffset;
use crate::split::{
    FinishedChunkRecord, SnapshotSplit, SourceSplit, StreamSplit, STREAM_SPLIT_ID,
};
use crate::table::{TableRef, TableSchemaSnapshot};

/// Lifecycle phase of the one streaming split owned by the enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// No streaming split materialized yet; snapshot splits are still being
    /// discovered and assigned.
    Unknown,
    /// A streaming split value exists but is withheld from assignment while
    /// newly discovered snapshot splits are interleaved.
    Suspended,
    /// The streaming split is assignable: not suspended, total known.
    Active,
    /// Active, and every expected snapshot chunk has been folded in.
    Complete,
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Suspended => write!(f, "suspended"),
            Self::Active => write!(f, "active"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Single writer of the canonical split state.
///
/// Every operation is one read-modify-write step over immutable split
/// values; the mailbox loop ([`run_enumerator`]) serializes those steps, so
/// no two completion reports are ever folded against the same stale base.
pub struct SplitEnumerator {
    pending: VecDeque<SnapshotSplit>,
    assigned: HashMap<String, SnapshotSplit>,
    finished_chunks: Vec<FinishedChunkRecord>,
    table_schemas: HashMap<TableRef, TableSchemaSnapshot>,
    table_ddls: HashMap<TableRef, String>,
    stream_split: Option<StreamSplit>,
    stream_split_owned: bool,
    awaiting_suspend_ack: bool,
    discovery_finished: bool,
    expected_total: Option<usize>,
    initial_offset: LogOffset,
}

impl SplitEnumerator {
    /// `initial_offset` is the log position captured when the job started;
    /// it seeds snapshot split scheduling and is the streaming split's
    /// starting offset if no chunk watermark precedes it.
    pub fn new(initial_offset: LogOffset) -> SplitEnumerator {
        SplitEnumerator {
            pending: VecDeque::new(),
            assigned: HashMap::new(),
            finished_chunks: Vec::new(),
            table_schemas: HashMap::new(),
            table_ddls: HashMap::new(),
            stream_split: None,
            stream_split_owned: false,
            awaiting_suspend_ack: false,
            discovery_finished: false,
            expected_total: None,
            initial_offset,
        }
    }

    /// Rebuilds the enumerator from a persisted checkpoint. Splits that were
    /// assigned at checkpoint time come back as pending; the finished-chunk
    /// accumulation is restored from the checkpoint even when no streaming
    /// split existed yet, since completed chunks are never re-reported.
    pub fn from_checkpoint(initial_offset: LogOffset, state: EnumeratorState) -> SplitEnumerator {
        let mut enumerator = SplitEnumerator::new(initial_offset);
        enumerator.finished_chunks = state.finished_chunks;
        enumerator.table_schemas = state.table_schemas;
        enumerator.table_ddls = state.table_ddls;
        for split in state.splits {
            match split {
                SourceSplit::Snapshot(split) => enumerator.pending.push_back(split),
                SourceSplit::Stream(split) => {
                    if !split.is_suspended() {
                        enumerator.expected_total = split.total_chunk_count();
                        enumerator.discovery_finished = split.total_chunk_count().is_some();
                    }
                    enumerator.stream_split = Some(split);
                }
            }
        }
        // snapshot work outstanding, or records the split never absorbed,
        // mean the checkpoint was taken mid rediscovery; an active stream
        // split must not ship that stale view, so it goes back through the
        // suspended state until discovery reports a fresh total
        if let Some(split) = &enumerator.stream_split {
            let stale = !enumerator.pending.is_empty()
                || split.finished_chunks().len() != enumerator.finished_chunks.len();
            if !split.is_suspended() && stale {
                enumerator.stream_split = Some(split.suspend());
                enumerator.discovery_finished = false;
                enumerator.expected_total = None;
            }
        }
        info!(
            pending = enumerator.pending.len(),
            finished = enumerator.finished_chunks.len(),
            phase = %enumerator.phase(),
            "enumerator restored from checkpoint"
        );
        enumerator
    }

    /// Enqueues newly discovered snapshot splits.
    ///
    /// Returns `true` when the streaming split is currently owned by a
    /// reader and a suspension handshake must be started: the reader has to
    /// yield the split before it can be handed out again, so the new chunks
    /// never race its in-flight event merging.
    pub fn add_snapshot_splits(&mut self, splits: Vec<SnapshotSplit>) -> bool {
        if self.discovery_finished {
            // discovery reopened, the previously known total no longer holds
            self.discovery_finished = false;
            self.expected_total = None;
        }

        let mut request_suspend = false;
        if let Some(split) = &self.stream_split {
            if self.stream_split_owned {
                if !self.awaiting_suspend_ack {
                    self.awaiting_suspend_ack = true;
                    request_suspend = true;
                    info!(
                        count = splits.len(),
                        "new snapshot splits discovered, requesting stream split suspension"
                    );
                }
            } else if !split.is_suspended() {
                self.stream_split = Some(split.suspend());
                info!("stream split suspended while new snapshot splits are interleaved");
            }
        }

        for split in splits {
            debug!(split_id = split.split_id(), "queued snapshot split");
            self.pending.push_back(split);
        }
        request_suspend
    }

    /// Reader-failure path: unfinished splits come back for reassignment.
    ///
    /// A streaming split handed back this way voids any suspension handshake
    /// its reader still owed; it is parked in suspended form and reactivated
    /// with the current accumulation once discovery is (still) finished, so
    /// a stale total or missing records can never ship.
    pub fn add_splits_back(&mut self, splits: Vec<SourceSplit>) {
        for split in splits {
            warn!(split_id = split.split_id(), "split returned for reassignment");
            match split {
                SourceSplit::Snapshot(split) => {
                    self.assigned.remove(split.split_id());
                    self.pending.push_back(split);
                }
                SourceSplit::Stream(split) => {
                    self.awaiting_suspend_ack = false;
                    self.stream_split_owned = false;
                    self.stream_split = Some(if split.is_suspended() {
                        split
                    } else {
                        split.suspend()
                    });
                    if self.discovery_finished {
                        if let Some(total) = self.expected_total {
                            self.resume_stream_split(total);
                        }
                    }
                }
            }
        }
    }

    /// Folds chunk-completion reports into the bookkeeping and, when an
    /// active streaming split already exists, amends it through the
    /// copy-producing factory operations.
    pub fn handle_finished_chunks(
        &mut self,
        records: Vec<FinishedChunkRecord>,
        schemas: HashMap<TableRef, TableSchemaSnapshot>,
        ddls: HashMap<TableRef, String>,
    ) {
        for record in &records {
            assert!(
                self.assigned.remove(&record.split_id).is_some(),
                "finished report for split {} that was never assigned",
                record.split_id
            );
            debug!(
                split_id = %record.split_id,
                completed_at = %record.completed_at,
                "snapshot chunk finished"
            );
        }

        self.finished_chunks.extend(records.iter().cloned());
        self.table_schemas.extend(schemas.clone());
        self.table_ddls.extend(ddls);

        // a suspended split carries no accumulation, and a split awaiting
        // its suspension ack has a stale total; in both cases the records
        // gathered here are folded back in on resume
        if let Some(split) = &self.stream_split {
            if !split.is_suspended() && !self.awaiting_suspend_ack {
                let amended = split
                    .append_finished_chunks(records)
                    .fill_table_schemas(schemas)
                    .with_table_ddls(self.table_ddls.clone());
                self.stream_split = Some(amended);
            }
        }
    }

    /// The reader's suspension acknowledgment: it has stopped consuming and
    /// hands the split back in suspended form. Ends the blocking handshake.
    /// When discovery finished while the handshake was in flight, the split
    /// is reactivated right away.
    pub fn handle_stream_split_returned(&mut self, split: StreamSplit) {
        assert!(
            split.is_suspended(),
            "a returned stream split must be suspended"
        );
        assert!(
            self.stream_split_owned,
            "stream split handed back but never handed out"
        );
        info!(split_id = split.split_id(), "stream split suspended and returned");
        self.stream_split = Some(split);
        self.stream_split_owned = false;
        self.awaiting_suspend_ack = false;

        if self.discovery_finished {
            if let Some(total) = self.expected_total {
                self.resume_stream_split(total);
            }
        }
    }

    /// Chunk discovery has finished and the final expected count is known.
    /// A withheld streaming split is reactivated with the accumulated
    /// records and schemas folded back in; a split still owned by a reader
    /// stays untouched until its suspension ack arrives.
    pub fn finish_discovery(&mut self, total_chunk_count: usize) {
        self.discovery_finished = true;
        self.expected_total = Some(total_chunk_count);
        info!(total_chunk_count, "snapshot chunk discovery finished");
        self.resume_stream_split(total_chunk_count);
    }

    fn resume_stream_split(&mut self, total_chunk_count: usize) {
        let Some(split) = &self.stream_split else {
            return;
        };
        if !split.is_suspended() {
            return;
        }
        let resumed = split
            .resume(total_chunk_count)
            .append_finished_chunks(self.finished_chunks.clone())
            .fill_table_schemas(self.table_schemas.clone())
            .with_table_ddls(self.table_ddls.clone());
        self.stream_split = Some(resumed);
    }

    /// Hands out the next unit of work, if any.
    ///
    /// Pending snapshot splits go first, stamped with the position their
    /// chunk read starts from. The streaming split is handed out only once
    /// all discovered snapshot work has been assigned and reported finished,
    /// discovery is complete, no suspension handshake is pending and no
    /// reader currently owns it.
    pub fn next_split(&mut self) -> Option<SourceSplit> {
        if let Some(split) = self.pending.pop_front() {
            let split = split.with_starting_offset(self.initial_offset);
            self.assigned
                .insert(split.split_id().to_string(), split.clone());
            debug!(split_id = split.split_id(), "assigned snapshot split");
            return Some(SourceSplit::Snapshot(split));
        }

        if self.awaiting_suspend_ack || self.stream_split_owned {
            return None;
        }
        if !self.assigned.is_empty() {
            return None;
        }
        let total = self.expected_total?;
        if !self.discovery_finished {
            return None;
        }

        let split = match &self.stream_split {
            Some(split) => split.clone(),
            None => self.materialize_stream_split(total),
        };
        self.stream_split = Some(split.clone());
        self.stream_split_owned = true;
        info!(%split, phase = %self.phase(), "assigned stream split");
        Some(SourceSplit::Stream(split))
    }

    fn materialize_stream_split(&self, total_chunk_count: usize) -> StreamSplit {
        // start from the earliest chunk watermark so no event between the
        // earliest and latest watermark is skipped
        let starting_offset = self
            .finished_chunks
            .iter()
            .map(|record| record.completed_at)
            .min()
            .unwrap_or(self.initial_offset);
        StreamSplit::new(
            STREAM_SPLIT_ID,
            starting_offset,
            LogOffset::no_stopping(),
            self.finished_chunks.clone(),
            self.table_schemas.clone(),
            Some(total_chunk_count),
        )
        .with_table_ddls(self.table_ddls.clone())
    }

    pub fn phase(&self) -> StreamPhase {
        match &self.stream_split {
            None => StreamPhase::Unknown,
            Some(split) if split.is_suspended() => StreamPhase::Suspended,
            Some(split) if split.is_completed() => StreamPhase::Complete,
            Some(_) => StreamPhase::Active,
        }
    }

    pub fn stream_split(&self) -> Option<&StreamSplit> {
        self.stream_split.as_ref()
    }

    /// The full state to persist in a checkpoint: unassigned and in-flight
    /// snapshot work, the canonical streaming split value, and the
    /// finished-chunk accumulation. The accumulation is persisted in its own
    /// right because a streaming split may not exist yet (or may be
    /// suspended, and thus empty) when the checkpoint is taken, while the
    /// chunks it describes are terminal and will never be re-reported.
    pub fn state(&self) -> EnumeratorState {
        let mut splits: Vec<SourceSplit> = self
            .pending
            .iter()
            .cloned()
            .map(SourceSplit::Snapshot)
            .collect();
        splits.extend(self.assigned.values().cloned().map(SourceSplit::Snapshot));
        if let Some(split) = &self.stream_split {
            splits.push(SourceSplit::Stream(split.clone()));
        }
        EnumeratorState {
            splits,
            finished_chunks: self.finished_chunks.clone(),
            table_schemas: self.table_schemas.clone(),
            table_ddls: self.table_ddls.clone(),
        }
    }
}

/// The durable form of the enumerator: the live split set plus the
/// finished-chunk accumulation that may not be reflected in any split yet.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratorState {
    pub splits: Vec<SourceSplit>,
    pub finished_chunks: Vec<FinishedChunkRecord>,
    pub table_schemas: HashMap<TableRef, TableSchemaSnapshot>,
    pub table_ddls: HashMap<TableRef, String>,
}

/// Events driving the enumerator's single-writer loop.
#[derive(Debug)]
pub enum EnumeratorEvent {
    /// A reader asks for its next unit of work.
    SplitRequested {
        reply: oneshot::Sender<Option<SourceSplit>>,
    },
    /// The chunk-splitting collaborator discovered more snapshot splits.
    SnapshotSplitsDiscovered { splits: Vec<SnapshotSplit> },
    /// The chunk-splitting collaborator enumerated the last chunk.
    DiscoveryFinished { total_chunk_count: usize },
    /// A reader reports completed chunks with the schemas it captured.
    ChunksFinished {
        records: Vec<FinishedChunkRecord>,
        schemas: HashMap<TableRef, TableSchemaSnapshot>,
        ddls: HashMap<TableRef, String>,
    },
    /// The streaming reader acknowledges suspension by yielding its split.
    StreamSplitReturned { split: StreamSplit },
    /// A failed reader's splits come back for reassignment.
    SplitsReturned { splits: Vec<SourceSplit> },
}

/// Requests the enumerator pushes to the reader side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderRequest {
    SuspendStreamSplit,
}

/// Processes enumerator events one at a time, serializing every
/// read-modify-write step over the canonical split state.
///
/// Returns the enumerator once the event channel closes so the caller can
/// checkpoint its final state.
pub async fn run_enumerator(
    mut enumerator: SplitEnumerator,
    mut events: mpsc::Receiver<EnumeratorEvent>,
    reader_requests: mpsc::Sender<ReaderRequest>,
) -> SplitEnumerator {
    while let Some(event) = events.recv().await {
        match event {
            EnumeratorEvent::SplitRequested { reply } => {
                let split = enumerator.next_split();
                // a reader that went away simply drops its request
                let _ = reply.send(split);
            }
            EnumeratorEvent::SnapshotSplitsDiscovered { splits } => {
                if enumerator.add_snapshot_splits(splits)
                    && reader_requests
                        .send(ReaderRequest::SuspendStreamSplit)
                        .await
                        .is_err()
                {
                    warn!("reader side closed while a suspension request was pending");
                }
            }
            EnumeratorEvent::DiscoveryFinished { total_chunk_count } => {
                enumerator.finish_discovery(total_chunk_count);
            }
            EnumeratorEvent::ChunksFinished {
                records,
                schemas,
                ddls,
            } => enumerator.handle_finished_chunks(records, schemas, ddls),
            EnumeratorEvent::StreamSplitReturned { split } => {
                enumerator.handle_stream_split_returned(split);
            }
            EnumeratorEvent::SplitsReturned { splits } => enumerator.add_splits_back(splits),
        }
    }
    enumerator
}
