use std::sync::Arc;

use psg_model::{BlobId, Id2Info};
use psg_protocol::{ErrCode, Severity};
use psg_store::{CacheLookup, FetchEvent};
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, AppCounters};
use crate::processor::{Flow, Interrupt, Processor, Request, TseChunkRequest};
use crate::reply::Reply;
use crate::retry::RetryingFetch;

/// `/ID/get_tse_chunk`: serve a single chunk of a split TSE.
///
/// The cached parent properties are tried first; when they carry a usable
/// id2-info at the requested split version, the chunk can be served with
/// no storage round-trip for metadata. Any mismatch falls back to the
/// split-history table.
pub struct TseChunkProcessor {
    app: Arc<AppContext>,
    reply: Arc<Reply>,
    request: TseChunkRequest,
}

impl TseChunkProcessor {
    pub fn create(
        app: Arc<AppContext>,
        reply: Arc<Reply>,
        _cancel: CancellationToken,
        request: &Request,
    ) -> Option<Box<dyn Processor>> {
        let Request::TseChunk(request) = request else {
            return None;
        };
        Some(Box::new(Self {
            app,
            reply,
            request: request.clone(),
        }))
    }

    /// The cache fast path. `Some` when the chunk request was fully served
    /// (or terminally failed) from cached metadata.
    async fn try_cache_path(&self) -> Option<Flow> {
        let request = &self.request;
        if !request.use_cache.allows_cache() {
            return None;
        }

        let parent = request.tse_id;
        let props = match self.app.cache.blob_prop(parent.sat, parent.sat_key, None) {
            CacheLookup::Found(props) => props,
            CacheLookup::NotFound => {
                tracing::warn!(%parent, "TSE parent properties are not found in cache");
                return None;
            }
            CacheLookup::Failure(msg) => {
                tracing::warn!(%parent, msg, "TSE parent property cache failure");
                return None;
            }
        };

        if props.id2_info.is_empty() {
            tracing::warn!(%parent, "blob properties id2_info is empty in cache");
            return None;
        }
        let Ok(id2) = props.id2_info.parse::<Id2Info>() else {
            tracing::warn!(%parent, id2_info = props.id2_info, "unparsable id2_info in cache");
            return None;
        };
        if id2.split_version() != request.split_version {
            tracing::warn!(
                %parent,
                cached = id2.split_version(),
                requested = request.split_version,
                "split version in cache does not match the request"
            );
            return None;
        }
        if request.chunk < 1 || request.chunk > id2.chunks() as i64 {
            // Validated against fresher metadata on the fallback path.
            return None;
        }

        let chunk_blob = BlobId::new(id2.sat(), id2.chunk_sat_key(request.chunk));
        let Some(keyspace) = self.app.sat_name(chunk_blob.sat).map(str::to_string) else {
            return None;
        };
        if !self
            .app
            .cache
            .blob_prop(chunk_blob.sat, chunk_blob.sat_key, None)
            .is_found()
        {
            tracing::warn!(%chunk_blob, "TSE chunk blob properties are not found in cache");
            return None;
        }

        Some(self.serve_chunk_blob(keyspace, chunk_blob).await)
    }

    /// The fallback: fetch the split history, then derive and serve the
    /// chunk from its id2-info. Failures here finish the request.
    async fn history_path(&self) -> Flow {
        let request = &self.request;
        let parent = request.tse_id;

        let Some(parent_keyspace) = self.app.sat_name(parent.sat).map(str::to_string) else {
            return self.fail(
                500,
                ErrCode::UnknownResolvedSatellite,
                &format!("unknown satellite number {} for blob {parent}", parent.sat),
            )
            .await;
        };

        let storage = self.app.storage.clone();
        let split_version = request.split_version;
        let sat_key = parent.sat_key;
        let mut fetch = RetryingFetch::new(
            move || storage.split_history(&parent_keyspace, sat_key, split_version),
            self.app.config.max_retries,
            self.app.config.io_timer_period,
        );

        let mut records = Vec::new();
        loop {
            match fetch.next_event().await {
                Some(FetchEvent::SplitHistory(batch)) => records.extend(batch),
                Some(FetchEvent::Done) | None => break,
                Some(FetchEvent::Error(err)) => {
                    AppCounters::inc(&self.app.counters.unknown_error);
                    return self.fail(err.status, err.code, &err.message).await;
                }
                Some(other) => {
                    tracing::warn!(%parent, ?other, "unexpected split-history event");
                }
            }
        }

        if records.is_empty() {
            AppCounters::inc(&self.app.counters.split_history_not_found);
            return self.fail(
                404,
                ErrCode::SplitHistoryNotFound,
                &format!(
                    "split history version {} is not found for the TSE id {parent}",
                    request.split_version
                ),
            )
            .await;
        }

        // The query pins the split version, so at most one record matches.
        let id2: Id2Info = match records[0].id2_info.parse() {
            Ok(id2) => id2,
            Err(err) => {
                AppCounters::inc(&self.app.counters.invalid_id2_info);
                return self.fail(
                    500,
                    ErrCode::InvalidId2Info,
                    &format!("error extracting id2 info for blob {parent}: {err}"),
                )
                .await;
            }
        };

        if request.chunk < 1 || request.chunk > id2.chunks() as i64 {
            AppCounters::inc(&self.app.counters.malformed_args);
            return self.fail(
                400,
                ErrCode::MalformedParameter,
                &format!(
                    "invalid chunk requested; the number of available chunks: {}, requested number: {}",
                    id2.chunks(),
                    request.chunk
                ),
            )
            .await;
        }

        let chunk_blob = BlobId::new(id2.sat(), id2.chunk_sat_key(request.chunk));
        let Some(keyspace) = self.app.sat_name(chunk_blob.sat).map(str::to_string) else {
            AppCounters::inc(&self.app.counters.sat_to_sat_name);
            return self.fail(
                500,
                ErrCode::UnknownResolvedSatellite,
                &format!(
                    "unknown TSE chunk satellite number {} for the blob {chunk_blob}",
                    chunk_blob.sat
                ),
            )
            .await;
        };

        // Chunk props come from the cache when possible; a cache-only
        // request cannot go further without them.
        if !self.request.use_cache.allows_db()
            && !self
                .app
                .cache
                .blob_prop(chunk_blob.sat, chunk_blob.sat_key, None)
                .is_found()
        {
            AppCounters::inc(&self.app.counters.blob_not_found);
            return self.fail(
                404,
                ErrCode::BlobPropsNotFound,
                &format!("TSE chunk blob {chunk_blob} properties are not found in cache"),
            )
            .await;
        }

        self.serve_chunk_blob(keyspace, chunk_blob).await
    }

    /// Serve the chunk blob itself: its own properties item plus data
    /// labeled with the requested chunk number.
    async fn serve_chunk_blob(&self, keyspace: String, chunk_blob: BlobId) -> Flow {
        crate::processor::BlobPipeline::new(self.app.clone(), self.reply.clone())
            .serve_chunk(
                keyspace,
                chunk_blob,
                self.request.chunk,
                self.request.use_cache,
                true,
            )
            .await
    }

    async fn fail(&self, status: u16, code: ErrCode, message: &str) -> Flow {
        if (400..500).contains(&status) {
            tracing::warn!(message);
        } else {
            tracing::error!(message);
        }
        self.reply
            .send_reply_message(status, code, Severity::Error, message)
            .await?;
        Err(Interrupt::Finished)
    }
}

#[async_trait::async_trait]
impl Processor for TseChunkProcessor {
    fn name(&self) -> &'static str {
        "tse_chunk"
    }

    async fn run(self: Box<Self>) -> Flow {
        if let Some(outcome) = self.try_cache_path().await {
            return outcome;
        }
        self.history_path().await
    }
}
