use std::sync::Arc;

use psg_model::{BlobId, BlobProps, Id2Info, SPLIT_INFO_CHUNK};
use psg_protocol::{ErrCode, Severity};
use psg_store::{CacheLookup, FetchError, FetchEvent};

use crate::app::{AppContext, AppCounters};
use crate::processor::{Flow, Interrupt, TseOption, UseCache};
use crate::reply::Reply;
use crate::retry::RetryingFetch;

/// The blob retrieval engine shared by every blob-serving request kind:
/// property lookup (cache first), the forbidden gate, the split/original
/// decision, and the chunk fetches themselves.
pub struct BlobPipeline {
    app: Arc<AppContext>,
    reply: Arc<Reply>,
}

impl BlobPipeline {
    pub fn new(app: Arc<AppContext>, reply: Arc<Reply>) -> Self {
        Self { app, reply }
    }

    /// Serve one blob under `tse` semantics: properties item, then
    /// whatever data the option calls for.
    pub async fn serve(
        &self,
        blob_id: BlobId,
        last_modified: Option<i64>,
        use_cache: UseCache,
        tse: TseOption,
    ) -> Flow {
        let Some(keyspace) = self.app.sat_name(blob_id.sat).map(str::to_string) else {
            return self.unknown_satellite(blob_id).await;
        };

        let cached = self.cached_props(blob_id, last_modified, use_cache);

        if let Some(props) = cached {
            return self
                .serve_with_props(&keyspace, blob_id, props, use_cache, tse)
                .await;
        }

        if !use_cache.allows_db() {
            let item = self.reply.next_item_id().await;
            AppCounters::inc(&self.app.counters.blob_not_found);
            self.reply
                .send_blob_prop_message(
                    item,
                    blob_id,
                    404,
                    ErrCode::BlobPropsNotFound,
                    Severity::Error,
                    &format!("blob {blob_id} properties are not found in cache"),
                )
                .await?;
            self.reply.complete_blob_prop(item, blob_id).await?;
            return Ok(());
        }

        // Props from storage.
        let mut fetch = self.load_blob_fetch(&keyspace, blob_id.sat_key, last_modified, None);
        loop {
            match fetch.next_event().await {
                Some(FetchEvent::BlobProps { props, found }) => {
                    if !found {
                        let item = self.reply.next_item_id().await;
                        AppCounters::inc(&self.app.counters.blob_not_found);
                        self.reply
                            .send_blob_prop_message(
                                item,
                                blob_id,
                                404,
                                ErrCode::BlobPropsNotFound,
                                Severity::Error,
                                &format!("blob {blob_id} is not found"),
                            )
                            .await?;
                        self.reply.complete_blob_prop(item, blob_id).await?;
                        return Ok(());
                    }
                    // Drop this fetch; the serving path starts its own with
                    // the properties in hand, shaped by the TSE option.
                    drop(fetch);
                    return self
                        .serve_with_props(&keyspace, blob_id, props, use_cache, tse)
                        .await;
                }
                Some(FetchEvent::Error(err)) => {
                    let item = self.reply.next_item_id().await;
                    self.frame_error(item, true, blob_id, &err).await?;
                    return Ok(());
                }
                Some(FetchEvent::Done) | None => {
                    let item = self.reply.next_item_id().await;
                    self.frame_error(
                        item,
                        true,
                        blob_id,
                        &FetchError::internal("blob props fetch ended without a result"),
                    )
                    .await?;
                    return Ok(());
                }
                Some(other) => {
                    tracing::warn!(%blob_id, ?other, "unexpected event ahead of blob props");
                }
            }
        }
    }

    /// Serve a blob whose properties are already in hand.
    pub async fn serve_with_props(
        &self,
        keyspace: &str,
        blob_id: BlobId,
        props: BlobProps,
        use_cache: UseCache,
        tse: TseOption,
    ) -> Flow {
        let prop_item = self.reply.next_item_id().await;
        let payload = serde_json::to_vec(&props).expect("blob props serialize");
        self.reply
            .send_blob_prop_data(prop_item, blob_id, &payload)
            .await?;

        if props.is_forbidden() {
            self.reply.complete_blob_prop(prop_item, blob_id).await?;
            let blob_item = self.reply.next_item_id().await;
            self.reply
                .send_blob_message(
                    blob_item,
                    blob_id,
                    403,
                    ErrCode::BlobForbidden,
                    Severity::Warning,
                    "Blob retrieval is not authorized",
                )
                .await?;
            self.reply.complete_blob(blob_item, blob_id).await?;
            return Ok(());
        }

        let want_split = !props.id2_info.is_empty()
            && matches!(tse, TseOption::Slim | TseOption::Smart | TseOption::Whole);

        if want_split {
            let id2: Id2Info = match props.id2_info.parse() {
                Ok(id2) => id2,
                Err(err) => {
                    self.reply.complete_blob_prop(prop_item, blob_id).await?;
                    AppCounters::inc(&self.app.counters.invalid_id2_info);
                    self.reply
                        .send_reply_message(500, ErrCode::InvalidId2Info, Severity::Error, &format!(
                            "error extracting id2 info for blob {blob_id}: {err}"
                        ))
                        .await?;
                    return Err(Interrupt::Finished);
                }
            };
            let Some(split_keyspace) = self.app.sat_name(id2.sat()).map(str::to_string) else {
                self.reply.complete_blob_prop(prop_item, blob_id).await?;
                return self.unknown_satellite(BlobId::new(id2.sat(), id2.split_info_sat_key())).await;
            };
            self.reply.complete_blob_prop(prop_item, blob_id).await?;

            // The split-info record always goes out; data chunks only for
            // a whole-TSE request. Chunk fetches run concurrently, each as
            // its own pair of reply items.
            let split_info_id = BlobId::new(id2.sat(), id2.split_info_sat_key());
            let mut serves = vec![self.serve_chunk(
                split_keyspace.clone(),
                split_info_id,
                SPLIT_INFO_CHUNK,
                use_cache,
                false,
            )];
            if tse == TseOption::Whole {
                for chunk_no in 1..=id2.chunks() as i64 {
                    serves.push(self.serve_chunk(
                        split_keyspace.clone(),
                        BlobId::new(id2.sat(), id2.chunk_sat_key(chunk_no)),
                        chunk_no,
                        use_cache,
                        true,
                    ));
                }
            }
            futures::future::try_join_all(serves).await?;
            return Ok(());
        }

        self.reply.complete_blob_prop(prop_item, blob_id).await?;

        match tse {
            TseOption::None => Ok(()),
            // Not split: a slim request carries no data.
            TseOption::Slim if props.id2_info.is_empty() => Ok(()),
            _ => {
                self.stream_blob_data(keyspace, blob_id, Some(props), None, false)
                    .await
            }
        }
    }

    /// Serve a single split chunk: optionally its own properties item,
    /// then its data under the `id2_chunk` label.
    pub(super) async fn serve_chunk(
        &self,
        keyspace: String,
        blob_id: BlobId,
        id2_chunk: i64,
        use_cache: UseCache,
        with_props: bool,
    ) -> Flow {
        let cached = self.cached_props(blob_id, None, use_cache);

        if with_props {
            if let Some(props) = &cached {
                let prop_item = self.reply.next_item_id().await;
                let payload = serde_json::to_vec(props).expect("blob props serialize");
                self.reply
                    .send_blob_prop_data(prop_item, blob_id, &payload)
                    .await?;
                self.reply.complete_blob_prop(prop_item, blob_id).await?;
            }
        }

        // Props still wanted on the wire if the cache had nothing.
        let emit_props = with_props && cached.is_none();
        self.stream_blob_data(&keyspace, blob_id, cached, Some(id2_chunk), emit_props)
            .await
    }

    /// Drive one blob-data fetch into the reply: `blob` data chunks in
    /// storage order, plus a properties item when `emit_props` is set and
    /// the properties arrive from storage.
    async fn stream_blob_data(
        &self,
        keyspace: &str,
        blob_id: BlobId,
        props: Option<BlobProps>,
        id2_chunk: Option<i64>,
        emit_props: bool,
    ) -> Flow {
        let mut fetch = self.load_blob_fetch(keyspace, blob_id.sat_key, None, props);
        let mut blob_item: Option<u32> = None;
        let mut props_emitted = false;
        let mut bytes_sent: u64 = 0;

        loop {
            match fetch.next_event().await {
                Some(FetchEvent::BlobProps { props, found }) => {
                    if !found {
                        let item = self.reply.next_item_id().await;
                        AppCounters::inc(&self.app.counters.blob_not_found);
                        let stage_is_props = emit_props && !props_emitted;
                        self.frame_error(
                            item,
                            stage_is_props,
                            blob_id,
                            &FetchError::new(
                                404,
                                ErrCode::BlobPropsNotFound,
                                Severity::Error,
                                format!("blob {blob_id} is not found"),
                            ),
                        )
                        .await?;
                        return Ok(());
                    }
                    if emit_props && !props_emitted {
                        let prop_item = self.reply.next_item_id().await;
                        let payload = serde_json::to_vec(&props).expect("blob props serialize");
                        self.reply
                            .send_blob_prop_data(prop_item, blob_id, &payload)
                            .await?;
                        self.reply.complete_blob_prop(prop_item, blob_id).await?;
                        props_emitted = true;
                    }
                }
                Some(FetchEvent::BlobChunk { data, chunk_no, .. }) => {
                    let item = match blob_item {
                        Some(item) => item,
                        None => {
                            let item = self.reply.next_item_id().await;
                            blob_item = Some(item);
                            item
                        }
                    };
                    bytes_sent += data.len() as u64;
                    self.reply
                        .send_blob_data(item, blob_id, id2_chunk, chunk_no, &data)
                        .await?;
                }
                Some(FetchEvent::Done) | None => {
                    if let Some(item) = blob_item {
                        self.reply.complete_blob(item, blob_id).await?;
                    }
                    metrics::counter!("psg_blob_bytes_sent").increment(bytes_sent);
                    return Ok(());
                }
                Some(FetchEvent::Error(err)) => {
                    AppCounters::inc(&self.app.counters.blob_error);
                    match blob_item {
                        Some(item) => {
                            self.reply
                                .send_blob_message(
                                    item,
                                    blob_id,
                                    err.status,
                                    err.code,
                                    err.severity,
                                    &err.message,
                                )
                                .await?;
                            self.reply.complete_blob(item, blob_id).await?;
                        }
                        None => {
                            let item = self.reply.next_item_id().await;
                            let stage_is_props = emit_props && !props_emitted;
                            self.frame_error(item, stage_is_props, blob_id, &err).await?;
                        }
                    }
                    return Ok(());
                }
                Some(other) => {
                    tracing::warn!(%blob_id, ?other, "unexpected blob fetch event");
                }
            }
        }
    }

    fn cached_props(
        &self,
        blob_id: BlobId,
        last_modified: Option<i64>,
        use_cache: UseCache,
    ) -> Option<BlobProps> {
        if !use_cache.allows_cache() {
            return None;
        }
        match self
            .app
            .cache
            .blob_prop(blob_id.sat, blob_id.sat_key, last_modified)
        {
            CacheLookup::Found(props) => Some(props),
            CacheLookup::NotFound => None,
            CacheLookup::Failure(msg) => {
                tracing::warn!(%blob_id, msg, "blob-prop cache failure");
                None
            }
        }
    }

    fn load_blob_fetch(
        &self,
        keyspace: &str,
        sat_key: i64,
        last_modified: Option<i64>,
        props: Option<BlobProps>,
    ) -> RetryingFetch {
        let storage = self.app.storage.clone();
        let keyspace = keyspace.to_string();
        RetryingFetch::new(
            move || storage.load_blob(&keyspace, sat_key, last_modified, props.clone()),
            self.app.config.max_retries,
            self.app.config.io_timer_period,
        )
    }

    /// An error framed onto the item matching the stage it happened at.
    async fn frame_error(
        &self,
        item_id: u32,
        props_stage: bool,
        blob_id: BlobId,
        err: &FetchError,
    ) -> Flow {
        if props_stage {
            self.reply
                .send_blob_prop_message(
                    item_id,
                    blob_id,
                    err.status,
                    err.code,
                    err.severity,
                    &err.message,
                )
                .await?;
            self.reply.complete_blob_prop(item_id, blob_id).await?;
        } else {
            self.reply
                .send_blob_message(item_id, blob_id, err.status, err.code, err.severity, &err.message)
                .await?;
            self.reply.complete_blob(item_id, blob_id).await?;
        }
        Ok(())
    }

    async fn unknown_satellite(&self, blob_id: BlobId) -> Flow {
        AppCounters::inc(&self.app.counters.sat_to_sat_name);
        self.reply
            .send_reply_message(
                500,
                ErrCode::UnknownResolvedSatellite,
                Severity::Error,
                &format!("unknown satellite number {} for blob {blob_id}", blob_id.sat),
            )
            .await?;
        Err(Interrupt::Finished)
    }
}
