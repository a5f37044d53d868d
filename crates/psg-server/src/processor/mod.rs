use std::sync::Arc;

use psg_model::BlobId;
use psg_protocol::{ErrCode, Severity};
use tokio_util::sync::CancellationToken;

use crate::app::AppContext;
use crate::reply::{PeerGone, Reply};

mod annot;
mod blob;
mod get_blob;
mod resolve;
mod tse_chunk;

pub use blob::BlobPipeline;

/// Which stores a request may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseCache {
    /// Cache first, storage second.
    #[default]
    Default,
    CacheOnly,
    DbOnly,
}

impl UseCache {
    pub fn allows_cache(self) -> bool {
        !matches!(self, UseCache::DbOnly)
    }

    pub fn allows_db(self) -> bool {
        !matches!(self, UseCache::CacheOnly)
    }
}

/// How much of a TSE the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TseOption {
    /// Properties only, never data.
    None,
    /// Split-info only; nothing when the blob is not split.
    Slim,
    /// Split-info when split, the whole original blob otherwise.
    Smart,
    /// Split-info plus every chunk when split, the original otherwise.
    Whole,
    /// The original blob bytes, split or not.
    Orig,
}

/// Payload rendering of bioseq-info items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    Native,
    #[default]
    Json,
    Protobuf,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Native => "native",
            OutputFormat::Json => "json",
            OutputFormat::Protobuf => "protobuf",
        }
    }
}

/// Field selection on `/ID/get` bioseq-info payloads. An empty set means
/// everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncludeFlags(pub u32);

impl IncludeFlags {
    pub const NO_TSE: u32 = 1 << 0;
    pub const FAST_INFO: u32 = 1 << 1;
    pub const WHOLE_TSE: u32 = 1 << 2;
    pub const ORIG_TSE: u32 = 1 << 3;
    pub const CANON_ID: u32 = 1 << 4;
    pub const OTHER_IDS: u32 = 1 << 5;
    pub const MOL_TYPE: u32 = 1 << 6;
    pub const LENGTH: u32 = 1 << 7;
    pub const STATE: u32 = 1 << 8;
    pub const BLOB_ID: u32 = 1 << 9;
    pub const TAX_ID: u32 = 1 << 10;
    pub const HASH: u32 = 1 << 11;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub seq_id: String,
    pub seq_id_type: Option<i32>,
    pub fmt: OutputFormat,
    pub use_cache: UseCache,
}

#[derive(Debug, Clone)]
pub struct GetBlobBySeqIdRequest {
    pub seq_id: String,
    pub seq_id_type: Option<i32>,
    pub tse: TseOption,
    pub use_cache: UseCache,
    pub exclude_blobs: Vec<BlobId>,
    pub include: IncludeFlags,
}

#[derive(Debug, Clone)]
pub struct GetBlobRequest {
    pub blob_id: BlobId,
    pub last_modified: Option<i64>,
    pub tse: TseOption,
    pub use_cache: UseCache,
}

#[derive(Debug, Clone)]
pub struct TseChunkRequest {
    pub tse_id: BlobId,
    pub chunk: i64,
    pub split_version: i32,
    pub use_cache: UseCache,
}

#[derive(Debug, Clone)]
pub struct NamedAnnotRequest {
    pub seq_id: String,
    pub seq_id_type: Option<i32>,
    pub names: Vec<String>,
    pub use_cache: UseCache,
}

/// A parsed, validated PSG request.
#[derive(Debug, Clone)]
pub enum Request {
    Resolve(ResolveRequest),
    GetBlobBySeqId(GetBlobBySeqIdRequest),
    GetBlob(GetBlobRequest),
    TseChunk(TseChunkRequest),
    NamedAnnot(NamedAnnotRequest),
}

/// Why a processor's workflow stopped early.
#[derive(Debug)]
pub enum Interrupt {
    /// The peer disconnected; nothing further can be sent.
    PeerGone,
    /// The request was cancelled cooperatively.
    Cancelled,
    /// A terminal condition was already framed into the reply.
    Finished,
}

impl From<PeerGone> for Interrupt {
    fn from(_: PeerGone) -> Self {
        Interrupt::PeerGone
    }
}

pub type Flow = Result<(), Interrupt>;

/// One request's workflow. `create` recognizes requests of its kind;
/// `run` drives the work to reply completion, framing every failure.
#[async_trait::async_trait]
pub trait Processor: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>) -> Flow;
}

/// Bind a request to the first processor that recognizes it.
pub fn create_processor(
    app: Arc<AppContext>,
    reply: Arc<Reply>,
    cancel: CancellationToken,
    request: Request,
) -> Option<Box<dyn Processor>> {
    type Create =
        fn(Arc<AppContext>, Arc<Reply>, CancellationToken, &Request) -> Option<Box<dyn Processor>>;
    let constructors: [Create; 5] = [
        resolve::ResolveProcessor::create,
        get_blob::GetBlobBySeqIdProcessor::create,
        get_blob::GetBlobProcessor::create,
        tse_chunk::TseChunkProcessor::create,
        annot::NamedAnnotProcessor::create,
    ];
    constructors
        .iter()
        .find_map(|create| create(app.clone(), reply.clone(), cancel.clone(), &request))
}

/// Drive a processor to completion: run the workflow under the request
/// deadline, then make sure the reply is properly finished whatever
/// happened.
pub async fn run_processor(
    app: Arc<AppContext>,
    reply: Arc<Reply>,
    cancel: CancellationToken,
    processor: Box<dyn Processor>,
) {
    let name = processor.name();
    let deadline = app.config.request_timeout;

    let outcome = tokio::select! {
        outcome = tokio::time::timeout(deadline, processor.run()) => outcome,
        () = cancel.cancelled() => Ok(Err(Interrupt::Cancelled)),
    };

    match outcome {
        Ok(Ok(())) | Ok(Err(Interrupt::Finished)) => {}
        Ok(Err(Interrupt::PeerGone)) => {
            tracing::debug!(processor = name, "peer went away mid-reply");
            return;
        }
        Ok(Err(Interrupt::Cancelled)) => {
            let _ = reply
                .send_reply_message(
                    499,
                    ErrCode::Cancelled,
                    Severity::Warning,
                    "request cancelled",
                )
                .await;
        }
        Err(_elapsed) => {
            let _ = reply
                .send_reply_message(
                    504,
                    ErrCode::StorageTimeout,
                    Severity::Error,
                    "request processing timed out",
                )
                .await;
        }
    }

    if reply.complete_reply().await.is_err() {
        tracing::debug!(processor = name, "peer went away before reply completion");
    }
}
