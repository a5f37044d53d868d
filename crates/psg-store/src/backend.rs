use bytes::Bytes;
use psg_model::{BioseqInfo, BlobProps, NAnnotRecord, SplitHistoryRecord};

use crate::{Fetch, FetchError};

/// Key parts of a bioseq-info storage query, richest first. Absent parts
/// widen the match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BioseqInfoQuery {
    pub accession: String,
    pub version: Option<i32>,
    pub seq_id_type: Option<i32>,
    pub gi: Option<i64>,
}

/// Events streamed by a storage fetch. Each operation delivers its typed
/// events in order and terminates with exactly one `Done` or `Error`.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    /// Blob properties, or confirmation they are absent.
    BlobProps { props: BlobProps, found: bool },
    /// One slice of blob data. `chunk_no` ascends from 0 without gaps.
    BlobChunk {
        data: Bytes,
        chunk_no: i64,
        is_last: bool,
    },
    /// All split-history rows matching the queried split version.
    SplitHistory(Vec<SplitHistoryRecord>),
    /// One named-annotation row.
    NAnnot(NAnnotRecord),
    /// All bioseq-info rows matching a [`BioseqInfoQuery`].
    BioseqInfoRecords(Vec<BioseqInfo>),
    Done,
    Error(FetchError),
}

/// The asynchronous blob storage engine. Every method starts the operation
/// immediately and returns a [`Fetch`] handle streaming its events; none of
/// them block the caller.
///
/// The engine performs no retries of its own; retry policy belongs to the
/// request workflow driving the fetch.
pub trait Storage: Send + Sync + 'static {
    /// Load a blob's properties. `last_modified` of `None` picks the
    /// latest version.
    fn load_blob_props(&self, keyspace: &str, sat_key: i64, last_modified: Option<i64>) -> Fetch;

    /// Load a blob: properties (unless `props` was already obtained, e.g.
    /// from the cache) followed by its data chunks.
    fn load_blob(
        &self,
        keyspace: &str,
        sat_key: i64,
        last_modified: Option<i64>,
        props: Option<BlobProps>,
    ) -> Fetch;

    /// Fetch the split-history rows of a TSE at a split version.
    fn split_history(&self, keyspace: &str, sat_key: i64, split_version: i32) -> Fetch;

    /// Fetch named-annotation rows for a bioseq, filtered to `names`.
    fn named_annots(
        &self,
        keyspace: &str,
        accession: &str,
        version: Option<i32>,
        seq_id_type: Option<i32>,
        names: &[String],
    ) -> Fetch;

    /// Query the bioseq-info table.
    fn bioseq_info(&self, keyspace: &str, query: BioseqInfoQuery) -> Fetch;
}
