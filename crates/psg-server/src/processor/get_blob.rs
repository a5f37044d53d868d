use std::sync::Arc;

use psg_protocol::{ErrCode, Severity};
use tokio_util::sync::CancellationToken;

use crate::app::AppContext;
use crate::processor::resolve::{resolve_or_frame, send_bioseq_info};
use crate::processor::{
    BlobPipeline, Flow, GetBlobBySeqIdRequest, GetBlobRequest, IncludeFlags, OutputFormat,
    Processor, Request,
};
use crate::reply::Reply;

/// `/ID/get`: resolve a seq-id, emit its bioseq-info, then retrieve the
/// blob the resolution points at.
pub struct GetBlobBySeqIdProcessor {
    app: Arc<AppContext>,
    reply: Arc<Reply>,
    request: GetBlobBySeqIdRequest,
}

impl GetBlobBySeqIdProcessor {
    pub fn create(
        app: Arc<AppContext>,
        reply: Arc<Reply>,
        _cancel: CancellationToken,
        request: &Request,
    ) -> Option<Box<dyn Processor>> {
        let Request::GetBlobBySeqId(request) = request else {
            return None;
        };
        Some(Box::new(Self {
            app,
            reply,
            request: request.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl Processor for GetBlobBySeqIdProcessor {
    fn name(&self) -> &'static str {
        "get_blob_by_seq_id"
    }

    async fn run(self: Box<Self>) -> Flow {
        let request = &self.request;
        let resolution = resolve_or_frame(
            &self.app,
            &self.reply,
            &request.seq_id,
            request.seq_id_type,
            request.use_cache,
        )
        .await?;

        send_bioseq_info(
            &self.reply,
            &resolution.bioseq_info,
            OutputFormat::Json,
            request.include,
        )
        .await?;

        // Both flags ask for the bioseq-info alone, without blob retrieval.
        if request.include.contains(IncludeFlags::NO_TSE)
            || request.include.contains(IncludeFlags::FAST_INFO)
        {
            return Ok(());
        }

        let blob_id = resolution.bioseq_info.blob_id();

        if request.exclude_blobs.contains(&blob_id) {
            let item = self.reply.next_item_id().await;
            self.reply
                .send_blob_message(
                    item,
                    blob_id,
                    200,
                    ErrCode::ExcludedBlob,
                    Severity::Info,
                    &format!("blob {blob_id} is excluded by the request"),
                )
                .await?;
            self.reply.complete_blob(item, blob_id).await?;
            return Ok(());
        }

        BlobPipeline::new(self.app.clone(), self.reply.clone())
            .serve(blob_id, None, request.use_cache, request.tse)
            .await
    }
}

/// `/ID/getblob`: retrieve a blob addressed directly by `sat.sat_key`.
pub struct GetBlobProcessor {
    app: Arc<AppContext>,
    reply: Arc<Reply>,
    request: GetBlobRequest,
}

impl GetBlobProcessor {
    pub fn create(
        app: Arc<AppContext>,
        reply: Arc<Reply>,
        _cancel: CancellationToken,
        request: &Request,
    ) -> Option<Box<dyn Processor>> {
        let Request::GetBlob(request) = request else {
            return None;
        };
        Some(Box::new(Self {
            app,
            reply,
            request: request.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl Processor for GetBlobProcessor {
    fn name(&self) -> &'static str {
        "get_blob"
    }

    async fn run(self: Box<Self>) -> Flow {
        let request = &self.request;
        BlobPipeline::new(self.app.clone(), self.reply.clone())
            .serve(
                request.blob_id,
                request.last_modified,
                request.use_cache,
                request.tse,
            )
            .await
    }
}
