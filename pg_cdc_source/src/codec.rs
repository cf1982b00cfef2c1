use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_postgres::types::Type;
use tracing::trace;

use crate::enumerator::EnumeratorState;
use crate::offset::LogOffset;
use crate::split::{ChunkRange, FinishedChunkRecord, SnapshotSplit, SourceSplit, StreamSplit};
use crate::table::{ColumnDescriptor, TableRef, TableSchemaSnapshot};

/// Current checkpoint format version, written as the first byte.
const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty checkpoint payload")]
    EmptyCheckpoint,

    #[error("unsupported checkpoint format version: {0}")]
    UnsupportedVersion(u8),

    #[error("corrupt checkpoint payload: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("unknown column type oid: {0}")]
    UnknownTypeOid(u32),

    #[error("inconsistent checkpoint: {0}")]
    Inconsistent(&'static str),
}

/// Serializes splits to checkpoint bytes and back.
///
/// Every field round-trips exactly, including the suspension flag and the
/// DDL map, even though split equality ignores the latter. Encoding consults
/// the split's per-instance memoization cell first, so repeated checkpoint
/// writes of the same immutable value reuse the same bytes.
#[derive(Debug, Default)]
pub struct SplitCodec;

impl SplitCodec {
    pub fn new() -> SplitCodec {
        SplitCodec
    }

    pub fn encode(&self, split: &SourceSplit) -> Result<Bytes, CodecError> {
        let cache = match split {
            SourceSplit::Snapshot(split) => split.serialized_form(),
            SourceSplit::Stream(split) => split.serialized_form(),
        };
        if let Some(bytes) = cache.get() {
            trace!(split_id = split.split_id(), "reusing cached split bytes");
            return Ok(bytes.clone());
        }

        let wire = WireSplit::from_split(split);
        let mut buf = vec![FORMAT_VERSION];
        serde_json::to_writer(&mut buf, &wire)?;
        let bytes = Bytes::from(buf);
        let _ = cache.set(bytes.clone());
        Ok(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<SourceSplit, CodecError> {
        let payload = Self::check_version(bytes)?;
        let wire: WireSplit = serde_json::from_slice(payload)?;
        wire.into_split()
    }

    /// Serializes the full enumerator state, the split set plus the
    /// finished-chunk accumulation that no split may carry yet. No caching:
    /// the state is a fresh aggregate on every call.
    pub fn encode_state(&self, state: &EnumeratorState) -> Result<Bytes, CodecError> {
        let wire = WireEnumeratorState::from_state(state);
        let mut buf = vec![FORMAT_VERSION];
        serde_json::to_writer(&mut buf, &wire)?;
        Ok(Bytes::from(buf))
    }

    pub fn decode_state(&self, bytes: &[u8]) -> Result<EnumeratorState, CodecError> {
        let payload = Self::check_version(bytes)?;
        let wire: WireEnumeratorState = serde_json::from_slice(payload)?;
        wire.into_state()
    }

    fn check_version(bytes: &[u8]) -> Result<&[u8], CodecError> {
        let (&version, payload) = bytes.split_first().ok_or(CodecError::EmptyCheckpoint)?;
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(payload)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireSplit {
    Snapshot(WireSnapshotSplit),
    Stream(WireStreamSplit),
}

#[derive(Serialize, Deserialize)]
struct WireEnumeratorState {
    splits: Vec<WireSplit>,
    finished_chunks: Vec<WireFinishedChunk>,
    table_schemas: Vec<WireTableSchema>,
    table_ddls: Vec<(WireTableRef, String)>,
}

#[derive(Serialize, Deserialize)]
struct WireSnapshotSplit {
    split_id: String,
    table: WireTableRef,
    range: ChunkRange,
    starting_offset: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct WireStreamSplit {
    split_id: String,
    starting_offset: u64,
    ending_offset: u64,
    finished_chunks: Vec<WireFinishedChunk>,
    table_schemas: Vec<WireTableSchema>,
    table_ddls: Vec<(WireTableRef, String)>,
    /// -1 while the expected total is still unknown.
    total_chunk_count: i64,
    suspended: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
struct WireTableRef {
    database: String,
    schema: String,
    name: String,
}

#[derive(Serialize, Deserialize)]
struct WireFinishedChunk {
    split_id: String,
    table: WireTableRef,
    range: ChunkRange,
    completed_at: u64,
}

#[derive(Serialize, Deserialize)]
struct WireTableSchema {
    table: WireTableRef,
    columns: Vec<WireColumn>,
}

#[derive(Serialize, Deserialize)]
struct WireColumn {
    name: String,
    type_oid: u32,
    modifier: i32,
    nullable: bool,
    primary: bool,
}

impl WireSplit {
    fn from_split(split: &SourceSplit) -> WireSplit {
        match split {
            SourceSplit::Snapshot(split) => WireSplit::Snapshot(WireSnapshotSplit {
                split_id: split.split_id().to_string(),
                table: WireTableRef::from_table(split.table()),
                range: split.range().clone(),
                starting_offset: split.starting_offset().map(u64::from),
            }),
            SourceSplit::Stream(split) => WireSplit::Stream(WireStreamSplit {
                split_id: split.split_id().to_string(),
                starting_offset: split.starting_offset().into(),
                ending_offset: split.ending_offset().into(),
                finished_chunks: chunks_to_wire(split.finished_chunks()),
                table_schemas: schemas_to_wire(split.table_schemas()),
                table_ddls: ddls_to_wire(split.table_ddls()),
                total_chunk_count: split
                    .total_chunk_count()
                    .map(|total| total as i64)
                    .unwrap_or(-1),
                suspended: split.is_suspended(),
            }),
        }
    }

    fn into_split(self) -> Result<SourceSplit, CodecError> {
        match self {
            WireSplit::Snapshot(wire) => Ok(SourceSplit::Snapshot(SnapshotSplit::from_parts(
                wire.split_id,
                wire.table.into_table(),
                wire.range,
                wire.starting_offset.map(LogOffset::from),
            ))),
            WireSplit::Stream(wire) => {
                let starting_offset = LogOffset::from(wire.starting_offset);
                let ending_offset = LogOffset::from(wire.ending_offset);
                if !ending_offset.is_no_stopping() && ending_offset < starting_offset {
                    return Err(CodecError::Inconsistent(
                        "ending offset precedes starting offset",
                    ));
                }

                let finished_chunks = chunks_from_wire(wire.finished_chunks);
                let table_schemas = schemas_from_wire(wire.table_schemas)?;
                let table_ddls = ddls_from_wire(wire.table_ddls);

                let total_chunk_count = if wire.total_chunk_count < 0 {
                    None
                } else {
                    Some(wire.total_chunk_count as usize)
                };
                if let Some(total) = total_chunk_count {
                    if finished_chunks.len() > total {
                        return Err(CodecError::Inconsistent(
                            "finished chunk records exceed the expected total",
                        ));
                    }
                }
                if wire.suspended && (!finished_chunks.is_empty() || !table_schemas.is_empty()) {
                    return Err(CodecError::Inconsistent(
                        "suspended split carries accumulation",
                    ));
                }

                Ok(SourceSplit::Stream(StreamSplit::from_parts(
                    wire.split_id,
                    starting_offset,
                    ending_offset,
                    finished_chunks,
                    table_schemas,
                    table_ddls,
                    total_chunk_count,
                    wire.suspended,
                )))
            }
        }
    }
}

impl WireEnumeratorState {
    fn from_state(state: &EnumeratorState) -> WireEnumeratorState {
        WireEnumeratorState {
            splits: state.splits.iter().map(WireSplit::from_split).collect(),
            finished_chunks: chunks_to_wire(&state.finished_chunks),
            table_schemas: schemas_to_wire(&state.table_schemas),
            table_ddls: ddls_to_wire(&state.table_ddls),
        }
    }

    fn into_state(self) -> Result<EnumeratorState, CodecError> {
        let splits = self
            .splits
            .into_iter()
            .map(WireSplit::into_split)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EnumeratorState {
            splits,
            finished_chunks: chunks_from_wire(self.finished_chunks),
            table_schemas: schemas_from_wire(self.table_schemas)?,
            table_ddls: ddls_from_wire(self.table_ddls),
        })
    }
}

fn chunks_to_wire(records: &[FinishedChunkRecord]) -> Vec<WireFinishedChunk> {
    records
        .iter()
        .map(|record| WireFinishedChunk {
            split_id: record.split_id.clone(),
            table: WireTableRef::from_table(&record.table),
            range: record.range.clone(),
            completed_at: record.completed_at.into(),
        })
        .collect()
}

fn chunks_from_wire(records: Vec<WireFinishedChunk>) -> Vec<FinishedChunkRecord> {
    records
        .into_iter()
        .map(|record| {
            FinishedChunkRecord::new(
                record.split_id,
                record.table.into_table(),
                record.range,
                LogOffset::from(record.completed_at),
            )
        })
        .collect()
}

// map entries are sorted so that the encoded form of a given value is
// deterministic
fn schemas_to_wire(schemas: &HashMap<TableRef, TableSchemaSnapshot>) -> Vec<WireTableSchema> {
    let mut wire: Vec<WireTableSchema> = schemas
        .values()
        .map(|snapshot| WireTableSchema {
            table: WireTableRef::from_table(&snapshot.table),
            columns: snapshot
                .columns
                .iter()
                .map(|column| WireColumn {
                    name: column.name.clone(),
                    type_oid: column.typ.oid(),
                    modifier: column.modifier,
                    nullable: column.nullable,
                    primary: column.primary,
                })
                .collect(),
        })
        .collect();
    wire.sort_by(|a, b| a.table.cmp(&b.table));
    wire
}

fn schemas_from_wire(
    schemas: Vec<WireTableSchema>,
) -> Result<HashMap<TableRef, TableSchemaSnapshot>, CodecError> {
    let mut out = HashMap::with_capacity(schemas.len());
    for schema in schemas {
        let table = schema.table.into_table();
        let mut columns = Vec::with_capacity(schema.columns.len());
        for column in schema.columns {
            let typ = Type::from_oid(column.type_oid)
                .ok_or(CodecError::UnknownTypeOid(column.type_oid))?;
            columns.push(ColumnDescriptor::new(
                column.name,
                typ,
                column.modifier,
                column.nullable,
                column.primary,
            ));
        }
        out.insert(table.clone(), TableSchemaSnapshot::new(table, columns));
    }
    Ok(out)
}

fn ddls_to_wire(ddls: &HashMap<TableRef, String>) -> Vec<(WireTableRef, String)> {
    let mut wire: Vec<(WireTableRef, String)> = ddls
        .iter()
        .map(|(table, ddl)| (WireTableRef::from_table(table), ddl.clone()))
        .collect();
    wire.sort_by(|a, b| a.0.cmp(&b.0));
    wire
}

fn ddls_from_wire(ddls: Vec<(WireTableRef, String)>) -> HashMap<TableRef, String> {
    ddls.into_iter()
        .map(|(table, ddl)| (table.into_table(), ddl))
        .collect()
}

impl WireTableRef {
    fn from_table(table: &TableRef) -> WireTableRef {
        WireTableRef {
            database: table.database.clone(),
            schema: table.schema.clone(),
            name: table.name.clone(),
        }
    }

    fn into_table(self) -> TableRef {
        TableRef::new(self.database, self.schema, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::STREAM_SPLIT_ID;
    use serde_json::json;

    fn orders() -> TableRef {
        TableRef::new("inventory", "public", "orders")
    }

    fn orders_schema() -> TableSchemaSnapshot {
        TableSchemaSnapshot::new(
            orders(),
            vec![
                ColumnDescriptor::new("id", Type::INT8, -1, false, true),
                ColumnDescriptor::new("note", Type::TEXT, -1, true, false),
            ],
        )
    }

    fn stream_split() -> StreamSplit {
        StreamSplit::new(
            STREAM_SPLIT_ID,
            LogOffset::from(100),
            LogOffset::no_stopping(),
            vec![FinishedChunkRecord::new(
                "orders-0",
                orders(),
                ChunkRange::new(Some(json!(0)), Some(json!(100))),
                LogOffset::from(150),
            )],
            HashMap::from([(orders(), orders_schema())]),
            Some(3),
        )
        .with_table_ddls(HashMap::from([(
            orders(),
            "CREATE TABLE orders (id bigint, note text)".to_string(),
        )]))
    }

    #[test]
    fn snapshot_split_round_trips() {
        let codec = SplitCodec::new();
        let split = SourceSplit::Snapshot(
            SnapshotSplit::new(
                "orders-0",
                orders(),
                ChunkRange::new(Some(json!(0)), Some(json!(100))),
            )
            .with_starting_offset(LogOffset::from(100)),
        );

        let bytes = codec.encode(&split).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), split);
    }

    #[test]
    fn unscheduled_snapshot_split_round_trips() {
        let codec = SplitCodec::new();
        let split =
            SourceSplit::Snapshot(SnapshotSplit::new("orders-1", orders(), ChunkRange::unbounded()));

        let bytes = codec.encode(&split).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.as_snapshot().unwrap().starting_offset(), None);
        assert_eq!(decoded, split);
    }

    #[test]
    fn stream_split_round_trips_including_advisory_fields() {
        let codec = SplitCodec::new();
        let original = stream_split();
        let split = SourceSplit::Stream(original.clone());

        let bytes = codec.encode(&split).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, split);

        // equality ignores the DDL map, so it gets its own check
        let decoded = decoded.as_stream().unwrap();
        assert_eq!(decoded.table_ddls(), original.table_ddls());
        assert!(!decoded.is_suspended());
    }

    #[test]
    fn suspended_split_round_trips() {
        let codec = SplitCodec::new();
        let split = SourceSplit::Stream(stream_split().suspend());

        let bytes = codec.encode(&split).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, split);
        assert!(decoded.as_stream().unwrap().is_suspended());
        assert!(!decoded.as_stream().unwrap().table_ddls().is_empty());
    }

    #[test]
    fn unknown_total_round_trips_as_unknown() {
        let codec = SplitCodec::new();
        let split = SourceSplit::Stream(StreamSplit::new(
            STREAM_SPLIT_ID,
            LogOffset::from(100),
            LogOffset::no_stopping(),
            Vec::new(),
            HashMap::new(),
            None,
        ));

        let bytes = codec.encode(&split).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.as_stream().unwrap().total_chunk_count(), None);
    }

    #[test]
    fn enumerator_state_round_trips_with_unattached_accumulation() {
        let codec = SplitCodec::new();
        // the shape of a checkpoint taken mid snapshot: a pending chunk and
        // finished records that no streaming split carries yet
        let state = EnumeratorState {
            splits: vec![SourceSplit::Snapshot(SnapshotSplit::new(
                "orders-1",
                orders(),
                ChunkRange::new(Some(json!(100)), Some(json!(200))),
            ))],
            finished_chunks: vec![FinishedChunkRecord::new(
                "orders-0",
                orders(),
                ChunkRange::new(Some(json!(0)), Some(json!(100))),
                LogOffset::from(150),
            )],
            table_schemas: HashMap::from([(orders(), orders_schema())]),
            table_ddls: HashMap::from([(
                orders(),
                "CREATE TABLE orders (id bigint, note text)".to_string(),
            )]),
        };

        let bytes = codec.encode_state(&state).unwrap();
        let decoded = codec.decode_state(&bytes).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn state_payload_version_is_checked() {
        let codec = SplitCodec::new();
        let state = EnumeratorState {
            splits: Vec::new(),
            finished_chunks: Vec::new(),
            table_schemas: HashMap::new(),
            table_ddls: HashMap::new(),
        };
        let mut bytes = codec.encode_state(&state).unwrap().to_vec();
        bytes[0] = 99;
        assert!(matches!(
            codec.decode_state(&bytes),
            Err(CodecError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn repeated_encodes_reuse_the_cached_bytes() {
        let codec = SplitCodec::new();
        let split = SourceSplit::Stream(stream_split());

        let first = codec.encode(&split).unwrap();
        let second = codec.encode(&split).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_ptr(), second.as_ptr());

        // a derived value is a distinct instance with a fresh cache
        let amended = SourceSplit::Stream(
            split
                .as_stream()
                .unwrap()
                .append_finished_chunks(Vec::new()),
        );
        let third = codec.encode(&amended).unwrap();
        assert_ne!(first.as_ptr(), third.as_ptr());
    }

    #[test]
    fn empty_payload_is_rejected() {
        let codec = SplitCodec::new();
        assert!(matches!(
            codec.decode(&[]),
            Err(CodecError::EmptyCheckpoint)
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let codec = SplitCodec::new();
        let mut bytes = codec
            .encode(&SourceSplit::Stream(stream_split()))
            .unwrap()
            .to_vec();
        bytes[0] = 99;
        assert!(matches!(
            codec.decode(&bytes),
            Err(CodecError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let codec = SplitCodec::new();
        let mut bytes = codec
            .encode(&SourceSplit::Stream(stream_split()))
            .unwrap()
            .to_vec();
        bytes.truncate(bytes.len() / 2);
        assert!(matches!(codec.decode(&bytes), Err(CodecError::Corrupt(_))));
    }

    #[test]
    fn unknown_type_oid_is_rejected() {
        let codec = SplitCodec::new();
        let payload = json!({
            "kind": "stream",
            "split_id": STREAM_SPLIT_ID,
            "starting_offset": 100,
            "ending_offset": u64::MAX,
            "finished_chunks": [],
            "table_schemas": [{
                "table": { "database": "inventory", "schema": "public", "name": "orders" },
                "columns": [{
                    "name": "id",
                    "type_oid": 999_999,
                    "modifier": -1,
                    "nullable": false,
                    "primary": true
                }]
            }],
            "table_ddls": [],
            "total_chunk_count": -1,
            "suspended": false
        });
        let mut bytes = vec![1u8];
        bytes.extend(serde_json::to_vec(&payload).unwrap());
        assert!(matches!(
            codec.decode(&bytes),
            Err(CodecError::UnknownTypeOid(999_999))
        ));
    }

    #[test]
    fn inconsistent_suspension_is_rejected() {
        let codec = SplitCodec::new();
        let payload = json!({
            "kind": "stream",
            "split_id": STREAM_SPLIT_ID,
            "starting_offset": 100,
            "ending_offset": u64::MAX,
            "finished_chunks": [{
                "split_id": "orders-0",
                "table": { "database": "inventory", "schema": "public", "name": "orders" },
                "range": { "start": 0, "end": 100 },
                "completed_at": 150
            }],
            "table_schemas": [],
            "table_ddls": [],
            "total_chunk_count": 1,
            "suspended": true
        });
        let mut bytes = vec![1u8];
        bytes.extend(serde_json::to_vec(&payload).unwrap());
        assert!(matches!(
            codec.decode(&bytes),
            Err(CodecError::Inconsistent(_))
        ));
    }
}
