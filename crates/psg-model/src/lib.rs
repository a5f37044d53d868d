//! Value types shared across the PubSeq Gateway: sequence and blob
//! identifiers, the records served from the property stores, and the
//! outcome of seq-id resolution.

mod blob_id;
mod records;
mod seq_id;

pub use blob_id::{BlobId, ChunkId, Id2Info, SPLIT_INFO_CHUNK};
pub use records::{BioseqInfo, BlobProps, NAnnotRecord, SplitHistoryRecord};
pub use seq_id::{is_insdc_type, OsltIds, SeqId};

/// Parse failures for the identifier types in this crate.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed seq_id '{0}'")]
    MalformedSeqId(String),
    #[error("malformed blob_id '{0}': expected 'sat.sat_key' with both parts non-negative integers")]
    MalformedBlobId(String),
    #[error("invalid id2_info '{0}': expected 'sat.info.chunks[.split_version]'")]
    InvalidId2Info(String),
}

/// How a seq-id resolution concluded. A resolution is usable only for the
/// four *found* variants; `NotResolved` means the canonical bioseq-info
/// must not be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionResult {
    BioseqDb,
    BioseqCache,
    Si2csiDb,
    Si2csiCache,
    NotResolved,
}

impl ResolutionResult {
    pub fn is_resolved(self) -> bool {
        !matches!(self, ResolutionResult::NotResolved)
    }
}

/// The product of the resolution engine: a bioseq-info record, how it was
/// obtained, and how many storage round-trips it took.
#[derive(Debug, Clone)]
pub struct BioseqResolution {
    pub result: ResolutionResult,
    pub bioseq_info: BioseqInfo,
    pub storage_query_count: u32,
}

impl BioseqResolution {
    pub fn unresolved() -> Self {
        Self {
            result: ResolutionResult::NotResolved,
            bioseq_info: BioseqInfo::default(),
            storage_query_count: 0,
        }
    }
}
