use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::offset::LogOffset;
use crate::table::{TableRef, TableSchemaSnapshot};

/// Identifier of the single streaming split of a source instance.
pub const STREAM_SPLIT_ID: &str = "stream-split";

/// Key-range boundaries of one snapshot chunk.
///
/// The start bound is inclusive and the end bound exclusive; `None` means
/// unbounded on that side. Boundaries are produced by the chunk-splitting
/// collaborator and stored verbatim, never validated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: Option<Value>,
    pub end: Option<Value>,
}

impl ChunkRange {
    pub fn new(start: Option<Value>, end: Option<Value>) -> ChunkRange {
        ChunkRange { start, end }
    }

    pub fn unbounded() -> ChunkRange {
        ChunkRange {
            start: None,
            end: None,
        }
    }

    /// Whether `key` falls inside this range. Keys that cannot be compared
    /// against a bound are treated as outside the range.
    pub fn contains(&self, key: &Value) -> bool {
        let after_start = match &self.start {
            None => true,
            Some(start) => matches!(
                compare_keys(key, start),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        };
        let before_end = match &self.end {
            None => true,
            Some(end) => matches!(compare_keys(key, end), Some(Ordering::Less)),
        };
        after_start && before_end
    }
}

fn compare_keys(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                Some(a.cmp(&b))
            } else {
                let a = a.as_f64()?;
                let b = b.as_f64()?;
                a.partial_cmp(&b)
            }
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        // composite chunk keys compare lexicographically, element by element
        (Value::Array(a), Value::Array(b)) => {
            for (a, b) in a.iter().zip(b.iter()) {
                match compare_keys(a, b)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => None,
    }
}

/// Summary of one completed snapshot chunk.
///
/// `completed_at` is the log position at which the chunk's snapshot read
/// finished; it becomes the low watermark for merging streaming events
/// against the chunk's key range. Within a streaming split, records keep
/// their insertion order and later records supersede earlier ones for
/// overlapping ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedChunkRecord {
    pub split_id: String,
    pub table: TableRef,
    pub range: ChunkRange,
    pub completed_at: LogOffset,
}

impl FinishedChunkRecord {
    pub fn new(
        split_id: impl Into<String>,
        table: TableRef,
        range: ChunkRange,
        completed_at: LogOffset,
    ) -> FinishedChunkRecord {
        FinishedChunkRecord {
            split_id: split_id.into(),
            table,
            range,
            completed_at,
        }
    }
}

/// A bounded unit of table work: one key range of one table.
///
/// Produced by the chunk-splitting collaborator, assigned to exactly one
/// reader at a time and terminal once reported complete.
#[derive(Debug)]
pub struct SnapshotSplit {
    split_id: String,
    table: TableRef,
    range: ChunkRange,
    starting_offset: Option<LogOffset>,
    serialized: OnceLock<Bytes>,
}

impl SnapshotSplit {
    pub fn new(split_id: impl Into<String>, table: TableRef, range: ChunkRange) -> SnapshotSplit {
        SnapshotSplit {
            split_id: split_id.into(),
            table,
            range,
            starting_offset: None,
            serialized: OnceLock::new(),
        }
    }

    pub(crate) fn from_parts(
        split_id: String,
        table: TableRef,
        range: ChunkRange,
        starting_offset: Option<LogOffset>,
    ) -> SnapshotSplit {
        SnapshotSplit {
            split_id,
            table,
            range,
            starting_offset,
            serialized: OnceLock::new(),
        }
    }

    pub fn split_id(&self) -> &str {
        &self.split_id
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn range(&self) -> &ChunkRange {
        &self.range
    }

    /// The log position at which the chunk's constituent read begins.
    /// `None` until the split has been scheduled.
    pub fn starting_offset(&self) -> Option<LogOffset> {
        self.starting_offset
    }

    /// Returns a copy stamped with the position the chunk read starts from.
    pub fn with_starting_offset(&self, starting_offset: LogOffset) -> SnapshotSplit {
        SnapshotSplit {
            split_id: self.split_id.clone(),
            table: self.table.clone(),
            range: self.range.clone(),
            starting_offset: Some(starting_offset),
            serialized: OnceLock::new(),
        }
    }

    pub(crate) fn serialized_form(&self) -> &OnceLock<Bytes> {
        &self.serialized
    }
}

impl Clone for SnapshotSplit {
    fn clone(&self) -> SnapshotSplit {
        SnapshotSplit {
            split_id: self.split_id.clone(),
            table: self.table.clone(),
            range: self.range.clone(),
            starting_offset: self.starting_offset,
            serialized: OnceLock::new(),
        }
    }
}

impl PartialEq for SnapshotSplit {
    fn eq(&self, other: &Self) -> bool {
        // the serialized-form cache is derived state, not identity
        self.split_id == other.split_id
            && self.table == other.table
            && self.range == other.range
            && self.starting_offset == other.starting_offset
    }
}

/// The single split representing ongoing consumption of the replication log
/// tail for the whole table set.
///
/// The entity is immutable: every amendment goes through a copy-producing
/// operation, so the enumerator can hold one canonical reference and swap it
/// atomically with no partial-write window visible to a checkpoint.
#[derive(Debug)]
pub struct StreamSplit {
    split_id: String,
    starting_offset: LogOffset,
    ending_offset: LogOffset,
    finished_chunks: Vec<FinishedChunkRecord>,
    table_schemas: HashMap<TableRef, TableSchemaSnapshot>,
    table_ddls: HashMap<TableRef, String>,
    total_chunk_count: Option<usize>,
    suspended: bool,
    serialized: OnceLock<Bytes>,
}

impl StreamSplit {
    pub fn new(
        split_id: impl Into<String>,
        starting_offset: LogOffset,
        ending_offset: LogOffset,
        finished_chunks: Vec<FinishedChunkRecord>,
        table_schemas: HashMap<TableRef, TableSchemaSnapshot>,
        total_chunk_count: Option<usize>,
    ) -> StreamSplit {
        Self::from_parts(
            split_id.into(),
            starting_offset,
            ending_offset,
            finished_chunks,
            table_schemas,
            HashMap::new(),
            total_chunk_count,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        split_id: String,
        starting_offset: LogOffset,
        ending_offset: LogOffset,
        finished_chunks: Vec<FinishedChunkRecord>,
        table_schemas: HashMap<TableRef, TableSchemaSnapshot>,
        table_ddls: HashMap<TableRef, String>,
        total_chunk_count: Option<usize>,
        suspended: bool,
    ) -> StreamSplit {
        assert!(
            ending_offset.is_no_stopping() || ending_offset >= starting_offset,
            "bounded ending offset {ending_offset} precedes starting offset {starting_offset}"
        );
        if let Some(total) = total_chunk_count {
            assert!(
                finished_chunks.len() <= total,
                "{} finished chunk records exceed the expected total of {total}",
                finished_chunks.len()
            );
        }
        assert!(
            !suspended || (finished_chunks.is_empty() && table_schemas.is_empty()),
            "a suspended stream split must not carry finished chunks or schemas"
        );
        StreamSplit {
            split_id,
            starting_offset,
            ending_offset,
            finished_chunks,
            table_schemas,
            table_ddls,
            total_chunk_count,
            suspended,
            serialized: OnceLock::new(),
        }
    }

    /// Attaches the advisory DDL texts. DDLs are carried through checkpoints
    /// and suspension but never participate in split identity.
    pub fn with_table_ddls(mut self, table_ddls: HashMap<TableRef, String>) -> StreamSplit {
        self.table_ddls = table_ddls;
        self.serialized = OnceLock::new();
        self
    }

    pub fn split_id(&self) -> &str {
        &self.split_id
    }

    pub fn starting_offset(&self) -> LogOffset {
        self.starting_offset
    }

    pub fn ending_offset(&self) -> LogOffset {
        self.ending_offset
    }

    pub fn finished_chunks(&self) -> &[FinishedChunkRecord] {
        &self.finished_chunks
    }

    pub fn table_schemas(&self) -> &HashMap<TableRef, TableSchemaSnapshot> {
        &self.table_schemas
    }

    pub fn table_ddls(&self) -> &HashMap<TableRef, String> {
        &self.table_ddls
    }

    /// The expected number of snapshot chunks once all have been enumerated,
    /// `None` while discovery is still running.
    pub fn total_chunk_count(&self) -> Option<usize> {
        self.total_chunk_count
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Whether every expected snapshot chunk has reported completion and had
    /// its record folded in. Always `false` while the total is unknown.
    pub fn is_completed(&self) -> bool {
        self.total_chunk_count
            .is_some_and(|total| self.finished_chunks.len() == total)
    }

    /// Returns a new split with `new_records` folded in ahead of the existing
    /// records; all other fields are copied verbatim.
    ///
    /// No de-duplication is performed. Callers must invoke this idempotently.
    /// Panics when the combined record count would exceed a known expected
    /// total, since every record stands for a distinct completed chunk.
    pub fn append_finished_chunks(
        &self,
        new_records: Vec<FinishedChunkRecord>,
    ) -> StreamSplit {
        let mut finished_chunks = new_records;
        finished_chunks.extend(self.finished_chunks.iter().cloned());
        Self::from_parts(
            self.split_id.clone(),
            self.starting_offset,
            self.ending_offset,
            finished_chunks,
            self.table_schemas.clone(),
            self.table_ddls.clone(),
            self.total_chunk_count,
            self.suspended,
        )
    }

    /// Returns a new split whose schema map is the union of the existing map
    /// and `new_schemas`; the argument wins on key collision.
    pub fn fill_table_schemas(
        &self,
        new_schemas: HashMap<TableRef, TableSchemaSnapshot>,
    ) -> StreamSplit {
        let mut table_schemas = self.table_schemas.clone();
        table_schemas.extend(new_schemas);
        Self::from_parts(
            self.split_id.clone(),
            self.starting_offset,
            self.ending_offset,
            self.finished_chunks.clone(),
            table_schemas,
            self.table_ddls.clone(),
            self.total_chunk_count,
            self.suspended,
        )
    }

    /// The hand-back form a reader produces when it must yield the split so
    /// that newly discovered snapshot splits can be interleaved: same
    /// identity, offsets and total, accumulation cleared, flag raised.
    /// DDL texts are advisory and survive suspension.
    pub fn suspend(&self) -> StreamSplit {
        Self::from_parts(
            self.split_id.clone(),
            self.starting_offset,
            self.ending_offset,
            Vec::new(),
            HashMap::new(),
            self.table_ddls.clone(),
            self.total_chunk_count,
            true,
        )
    }

    /// Reactivates a suspended split once discovery has finished and the
    /// final expected chunk count is known.
    pub fn resume(&self, total_chunk_count: usize) -> StreamSplit {
        assert!(
            self.suspended,
            "resume called on a stream split that was never suspended"
        );
        Self::from_parts(
            self.split_id.clone(),
            self.starting_offset,
            self.ending_offset,
            self.finished_chunks.clone(),
            self.table_schemas.clone(),
            self.table_ddls.clone(),
            Some(total_chunk_count),
            false,
        )
    }

    /// Duplicate-suppression check for the streaming reader: an event for
    /// `table`/`key` observed at `offset` is emitted unless a finished
    /// snapshot chunk already captured that key at or beyond the offset.
    ///
    /// The scan keeps the last matching record since later records supersede
    /// earlier ones for overlapping ranges. Keys outside every finished
    /// range, and tables with no finished chunk at all, are emitted.
    pub fn should_emit(&self, table: &TableRef, key: &Value, offset: LogOffset) -> bool {
        let mut watermark = None;
        for record in &self.finished_chunks {
            if record.table == *table && record.range.contains(key) {
                watermark = Some(record.completed_at);
            }
        }
        match watermark {
            Some(watermark) => offset >= watermark,
            None => true,
        }
    }

    pub(crate) fn serialized_form(&self) -> &OnceLock<Bytes> {
        &self.serialized
    }
}

impl Clone for StreamSplit {
    fn clone(&self) -> StreamSplit {
        StreamSplit {
            split_id: self.split_id.clone(),
            starting_offset: self.starting_offset,
            ending_offset: self.ending_offset,
            finished_chunks: self.finished_chunks.clone(),
            table_schemas: self.table_schemas.clone(),
            table_ddls: self.table_ddls.clone(),
            total_chunk_count: self.total_chunk_count,
            suspended: self.suspended,
            serialized: OnceLock::new(),
        }
    }
}

impl PartialEq for StreamSplit {
    fn eq(&self, other: &Self) -> bool {
        // table_ddls and the serialized-form cache are advisory/derived and
        // intentionally excluded from split identity
        self.split_id == other.split_id
            && self.starting_offset == other.starting_offset
            && self.ending_offset == other.ending_offset
            && self.finished_chunks == other.finished_chunks
            && self.table_schemas == other.table_schemas
            && self.total_chunk_count == other.total_chunk_count
            && self.suspended == other.suspended
    }
}

impl fmt::Display for StreamSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamSplit {{ id: {}, start: {}, end: {}, suspended: {} }}",
            self.split_id, self.starting_offset, self.ending_offset, self.suspended
        )
    }
}

/// A unit of work handed to a reader: either one bounded snapshot chunk or
/// the single streaming tail. The split id is stable and usable as a
/// progress-reporting key.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSplit {
    Snapshot(SnapshotSplit),
    Stream(StreamSplit),
}

impl SourceSplit {
    pub fn split_id(&self) -> &str {
        match self {
            SourceSplit::Snapshot(split) => split.split_id(),
            SourceSplit::Stream(split) => split.split_id(),
        }
    }

    pub fn as_stream(&self) -> Option<&StreamSplit> {
        match self {
            SourceSplit::Stream(split) => Some(split),
            SourceSplit::Snapshot(_) => None,
        }
    }

    pub fn as_snapshot(&self) -> Option<&SnapshotSplit> {
        match self {
            SourceSplit::Snapshot(split) => Some(split),
            SourceSplit::Stream(_) => None,
        }
    }
}

impl From<SnapshotSplit> for SourceSplit {
    fn from(split: SnapshotSplit) -> SourceSplit {
        SourceSplit::Snapshot(split)
    }
}

impl From<StreamSplit> for SourceSplit {
    fn from(split: StreamSplit) -> SourceSplit {
        SourceSplit::Stream(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnDescriptor;
    use serde_json::json;
    use tokio_postgres::types::Type;

    fn orders() -> TableRef {
        TableRef::new("inventory", "public", "orders")
    }

    fn customers() -> TableRef {
        TableRef::new("inventory", "public", "customers")
    }

    fn schema_for(table: TableRef) -> TableSchemaSnapshot {
        TableSchemaSnapshot::new(
            table,
            vec![ColumnDescriptor::new("id", Type::INT8, -1, false, true)],
        )
    }

    fn record(split_id: &str, table: TableRef, start: i64, end: i64, at: u64) -> FinishedChunkRecord {
        FinishedChunkRecord::new(
            split_id,
            table,
            ChunkRange::new(Some(json!(start)), Some(json!(end))),
            LogOffset::from(at),
        )
    }

    fn stream_split(total: Option<usize>) -> StreamSplit {
        StreamSplit::new(
            STREAM_SPLIT_ID,
            LogOffset::from(100),
            LogOffset::no_stopping(),
            Vec::new(),
            HashMap::new(),
            total,
        )
    }

    #[test]
    fn completion_tracks_the_expected_total() {
        let split = stream_split(Some(3))
            .append_finished_chunks(vec![record("orders-0", orders(), 0, 100, 150)])
            .append_finished_chunks(vec![record("orders-1", orders(), 100, 200, 160)]);
        assert!(!split.is_completed());

        let split = split.append_finished_chunks(vec![record("orders-2", orders(), 200, 300, 170)]);
        assert!(split.is_completed());
    }

    #[test]
    fn completion_is_false_while_the_total_is_unknown() {
        let split = stream_split(None);
        assert!(!split.is_completed());
    }

    #[test]
    fn appended_records_come_before_existing_ones() {
        let split = stream_split(Some(2))
            .append_finished_chunks(vec![record("orders-0", orders(), 0, 100, 150)])
            .append_finished_chunks(vec![record("orders-1", orders(), 100, 200, 160)]);
        let ids: Vec<&str> = split
            .finished_chunks()
            .iter()
            .map(|r| r.split_id.as_str())
            .collect();
        assert_eq!(ids, ["orders-1", "orders-0"]);
    }

    #[test]
    fn appending_nothing_is_a_content_no_op() {
        let split = stream_split(Some(2))
            .append_finished_chunks(vec![record("orders-0", orders(), 0, 100, 150)]);
        assert_eq!(split.append_finished_chunks(Vec::new()), split);
    }

    #[test]
    #[should_panic(expected = "exceed the expected total")]
    fn appending_past_the_total_is_a_caller_bug() {
        stream_split(Some(1)).append_finished_chunks(vec![
            record("orders-0", orders(), 0, 100, 150),
            record("orders-1", orders(), 100, 200, 160),
        ]);
    }

    #[test]
    fn filling_schemas_unions_both_maps() {
        let split = stream_split(Some(1))
            .fill_table_schemas(HashMap::from([(orders(), schema_for(orders()))]));
        let split =
            split.fill_table_schemas(HashMap::from([(customers(), schema_for(customers()))]));
        assert_eq!(split.table_schemas().len(), 2);
        assert!(split.table_schemas().contains_key(&orders()));
        assert!(split.table_schemas().contains_key(&customers()));
    }

    #[test]
    fn filling_schemas_is_idempotent() {
        let schemas = HashMap::from([(orders(), schema_for(orders()))]);
        let once = stream_split(Some(1)).fill_table_schemas(schemas.clone());
        let twice = once.fill_table_schemas(schemas);
        assert_eq!(once, twice);
    }

    #[test]
    fn suspension_clears_accumulation_and_keeps_identity() {
        let ddls = HashMap::from([(orders(), "CREATE TABLE orders (id bigint)".to_string())]);
        let split = stream_split(Some(3))
            .with_table_ddls(ddls.clone())
            .append_finished_chunks(vec![
                record("orders-0", orders(), 0, 100, 150),
                record("orders-1", orders(), 100, 200, 160),
            ])
            .fill_table_schemas(HashMap::from([(orders(), schema_for(orders()))]));

        let suspended = split.suspend();
        assert!(suspended.is_suspended());
        assert!(suspended.finished_chunks().is_empty());
        assert!(suspended.table_schemas().is_empty());
        assert_eq!(suspended.split_id(), split.split_id());
        assert_eq!(suspended.starting_offset(), split.starting_offset());
        assert_eq!(suspended.ending_offset(), split.ending_offset());
        assert_eq!(suspended.table_ddls(), &ddls);
    }

    #[test]
    fn resume_installs_the_new_total_and_never_resurrects_old_state() {
        let split = stream_split(Some(2))
            .append_finished_chunks(vec![record("orders-0", orders(), 0, 100, 150)])
            .fill_table_schemas(HashMap::from([(orders(), schema_for(orders()))]));

        let resumed = split.suspend().resume(5);
        assert!(!resumed.is_suspended());
        assert_eq!(resumed.total_chunk_count(), Some(5));
        assert!(resumed.finished_chunks().is_empty());
        assert!(resumed.table_schemas().is_empty());
        assert_eq!(resumed.split_id(), split.split_id());
        assert_eq!(resumed.starting_offset(), split.starting_offset());
        assert_eq!(resumed.ending_offset(), split.ending_offset());
    }

    #[test]
    #[should_panic(expected = "never suspended")]
    fn resuming_an_active_split_is_a_caller_bug() {
        stream_split(Some(1)).resume(1);
    }

    #[test]
    fn equality_ignores_ddl_texts() {
        let split = stream_split(Some(1));
        let with_ddls = split.clone().with_table_ddls(HashMap::from([(
            orders(),
            "CREATE TABLE orders (id bigint)".to_string(),
        )]));
        assert_eq!(split, with_ddls);
    }

    #[test]
    fn events_below_the_chunk_watermark_are_suppressed() {
        let split = stream_split(Some(2)).append_finished_chunks(vec![
            record("orders-0", orders(), 0, 100, 150),
            record("orders-1", orders(), 100, 200, 170),
        ]);

        // key 50 lives in the first chunk, watermark 150
        assert!(!split.should_emit(&orders(), &json!(50), LogOffset::from(140)));
        assert!(split.should_emit(&orders(), &json!(50), LogOffset::from(150)));

        // key 150 lives in the second chunk, watermark 170
        assert!(!split.should_emit(&orders(), &json!(150), LogOffset::from(160)));
        assert!(split.should_emit(&orders(), &json!(150), LogOffset::from(180)));
    }

    #[test]
    fn later_records_supersede_earlier_ones_for_overlapping_ranges() {
        let split = stream_split(None).append_finished_chunks(vec![
            record("orders-0", orders(), 0, 100, 150),
            record("orders-0r", orders(), 0, 100, 190),
        ]);
        assert!(!split.should_emit(&orders(), &json!(50), LogOffset::from(160)));
        assert!(split.should_emit(&orders(), &json!(50), LogOffset::from(190)));
    }

    #[test]
    fn unsnapshotted_keys_and_tables_are_always_emitted() {
        let split = stream_split(Some(1))
            .append_finished_chunks(vec![record("orders-0", orders(), 0, 100, 150)]);
        assert!(split.should_emit(&orders(), &json!(500), LogOffset::from(1)));
        assert!(split.should_emit(&customers(), &json!(1), LogOffset::from(1)));
    }

    #[test]
    fn composite_keys_compare_lexicographically() {
        let range = ChunkRange::new(Some(json!([1, "a"])), Some(json!([2, "m"])));
        assert!(range.contains(&json!([1, "z"])));
        assert!(range.contains(&json!([2, "a"])));
        assert!(!range.contains(&json!([2, "z"])));
        assert!(!range.contains(&json!([0, "a"])));
    }

    #[test]
    fn snapshot_split_is_stamped_when_scheduled() {
        let split = SnapshotSplit::new("orders-0", orders(), ChunkRange::unbounded());
        assert_eq!(split.starting_offset(), None);

        let scheduled = split.with_starting_offset(LogOffset::from(100));
        assert_eq!(scheduled.starting_offset(), Some(LogOffset::from(100)));
        assert_eq!(scheduled.split_id(), split.split_id());
        assert_eq!(scheduled.table(), split.table());
    }
}
