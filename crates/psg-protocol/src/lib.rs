//! The PSG reply wire protocol.
//!
//! A reply is a sequence of chunks, each framed as a single header line
//! followed by `size` payload bytes:
//!
//! ```text
//! PSG-Reply-Chunk: item_id=<N>&item_type=<T>&chunk_type=<C>&...&size=<S>\n
//! <S bytes of payload>
//! ```
//!
//! Item id 0 is reserved for reply-level chunks; all other items draw from a
//! single per-reply counter. A `meta` chunk is always a completion and
//! carries the item's (or reply's) final `n_chunks`.

pub mod frame;
mod parse;

pub use frame::FrameBuilder;
pub use parse::{ReplyChunk, ReplyParser};

/// Leading literal of every chunk header.
pub const CHUNK_PREFIX: &[u8] = b"PSG-Reply-Chunk: ";

/// Item id of reply-level chunks.
pub const REPLY_ITEM_ID: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("chunk header does not start with the reply-chunk prefix")]
    BadPrefix,
    #[error("chunk header missing required argument '{0}'")]
    MissingArg(&'static str),
    #[error("chunk header argument '{name}' has invalid value '{value}'")]
    BadArg { name: &'static str, value: String },
    #[error("chunk header exceeds {0} bytes")]
    HeaderTooLong(usize),
}

/// What a reply item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    BioseqInfo,
    BlobProp,
    Blob,
    Reply,
    BioseqNa,
    PublicComment,
    Processor,
    IpgInfo,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::BioseqInfo => "bioseq_info",
            ItemType::BlobProp => "blob_prop",
            ItemType::Blob => "blob",
            ItemType::Reply => "reply",
            ItemType::BioseqNa => "bioseq_na",
            ItemType::PublicComment => "public_comment",
            ItemType::Processor => "processor",
            ItemType::IpgInfo => "ipg_info",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "bioseq_info" => ItemType::BioseqInfo,
            "blob_prop" => ItemType::BlobProp,
            "blob" => ItemType::Blob,
            "reply" => ItemType::Reply,
            "bioseq_na" => ItemType::BioseqNa,
            "public_comment" => ItemType::PublicComment,
            "processor" => ItemType::Processor,
            "ipg_info" => ItemType::IpgInfo,
            _ => return None,
        })
    }
}

/// Bitmask over the chunk kinds; `meta` always denotes a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkType(u8);

impl ChunkType {
    pub const META: ChunkType = ChunkType(0x01);
    pub const DATA: ChunkType = ChunkType(0x02);
    pub const MESSAGE: ChunkType = ChunkType(0x04);

    pub fn contains(self, other: ChunkType) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_meta(self) -> bool {
        self.contains(ChunkType::META)
    }

    pub fn is_data(self) -> bool {
        self.contains(ChunkType::DATA)
    }

    pub fn is_message(self) -> bool {
        self.contains(ChunkType::MESSAGE)
    }

    /// Comma-joined wire form, e.g. `data` or `data,meta`.
    pub fn as_wire(self) -> String {
        let mut parts = Vec::new();
        if self.is_data() {
            parts.push("data");
        }
        if self.is_message() {
            parts.push("message");
        }
        if self.is_meta() {
            parts.push("meta");
        }
        parts.join(",")
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        let mut out = ChunkType::default();
        for part in s.split(',') {
            out = match part {
                "meta" => ChunkType(out.0 | ChunkType::META.0),
                "data" => ChunkType(out.0 | ChunkType::DATA.0),
                "message" => ChunkType(out.0 | ChunkType::MESSAGE.0),
                _ => return None,
            };
        }
        if out.0 == 0 {
            None
        } else {
            Some(out)
        }
    }
}

impl std::ops::BitOr for ChunkType {
    type Output = ChunkType;
    fn bitor(self, rhs: ChunkType) -> ChunkType {
        ChunkType(self.0 | rhs.0)
    }
}

/// Message severities carried on `message` chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Trace,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "trace" => Severity::Trace,
            "info" => Severity::Info,
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            "critical" => Severity::Critical,
            _ => return None,
        })
    }

    pub fn is_error(self) -> bool {
        self >= Severity::Error
    }
}

/// Application error codes carried on `message` chunks alongside the
/// HTTP-like status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrCode {
    Unknown = 300,
    MalformedParameter = 301,
    MissingParameter = 302,
    BadUrl = 303,
    BioseqInfoNotFound = 310,
    Si2csiNotFound = 311,
    MalformedSeqId = 312,
    BioseqInfoMultipleRecords = 313,
    InvalidId2Info = 320,
    UnknownResolvedSatellite = 321,
    SplitHistoryNotFound = 322,
    BlobPropsNotFound = 323,
    BlobForbidden = 324,
    ExcludedBlob = 325,
    StorageTimeout = 330,
    StorageUnavailable = 331,
    Cancelled = 332,
    ServerLogic = 340,
}

impl ErrCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            300 => ErrCode::Unknown,
            301 => ErrCode::MalformedParameter,
            302 => ErrCode::MissingParameter,
            303 => ErrCode::BadUrl,
            310 => ErrCode::BioseqInfoNotFound,
            311 => ErrCode::Si2csiNotFound,
            312 => ErrCode::MalformedSeqId,
            313 => ErrCode::BioseqInfoMultipleRecords,
            320 => ErrCode::InvalidId2Info,
            321 => ErrCode::UnknownResolvedSatellite,
            322 => ErrCode::SplitHistoryNotFound,
            323 => ErrCode::BlobPropsNotFound,
            324 => ErrCode::BlobForbidden,
            325 => ErrCode::ExcludedBlob,
            330 => ErrCode::StorageTimeout,
            331 => ErrCode::StorageUnavailable,
            332 => ErrCode::Cancelled,
            340 => ErrCode::ServerLogic,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn item_type_round_trip() {
        for t in [
            ItemType::BioseqInfo,
            ItemType::BlobProp,
            ItemType::Blob,
            ItemType::Reply,
            ItemType::BioseqNa,
            ItemType::PublicComment,
            ItemType::Processor,
            ItemType::IpgInfo,
        ] {
            assert_eq!(ItemType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(ItemType::from_str("nope"), None);
    }

    #[test]
    fn chunk_type_wire_forms() {
        assert_eq!(ChunkType::DATA.as_wire(), "data");
        assert_eq!((ChunkType::DATA | ChunkType::META).as_wire(), "data,meta");
        assert_eq!(ChunkType::from_wire("meta"), Some(ChunkType::META));
        assert_eq!(
            ChunkType::from_wire("data,meta"),
            Some(ChunkType::DATA | ChunkType::META)
        );
        assert!(ChunkType::from_wire("data,meta").unwrap().is_meta());
        assert_eq!(ChunkType::from_wire(""), None);
        assert_eq!(ChunkType::from_wire("bogus"), None);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Error.is_error());
        assert!(Severity::Critical.is_error());
        assert!(!Severity::Warning.is_error());
    }
}
