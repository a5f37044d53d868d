use std::sync::Arc;

use psg_store::FetchEvent;
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, AppCounters};
use crate::processor::resolve::{resolve_or_frame, send_bioseq_info};
use crate::processor::{
    Flow, IncludeFlags, NamedAnnotRequest, OutputFormat, Processor, Request,
};
use crate::reply::Reply;
use crate::retry::RetryingFetch;

/// `/ID/get_na`: resolve a seq-id and emit one `bioseq_na` item per
/// matching named annotation, searching every configured annotation
/// keyspace.
pub struct NamedAnnotProcessor {
    app: Arc<AppContext>,
    reply: Arc<Reply>,
    request: NamedAnnotRequest,
}

impl NamedAnnotProcessor {
    pub fn create(
        app: Arc<AppContext>,
        reply: Arc<Reply>,
        _cancel: CancellationToken,
        request: &Request,
    ) -> Option<Box<dyn Processor>> {
        let Request::NamedAnnot(request) = request else {
            return None;
        };
        Some(Box::new(Self {
            app,
            reply,
            request: request.clone(),
        }))
    }

    async fn fetch_keyspace(&self, keyspace: &str, accession: &str, version: i32, seq_id_type: i32) -> Flow {
        let storage = self.app.storage.clone();
        let keyspace_owned = keyspace.to_string();
        let accession_owned = accession.to_string();
        let names = self.request.names.clone();
        let mut fetch = RetryingFetch::new(
            move || {
                storage.named_annots(
                    &keyspace_owned,
                    &accession_owned,
                    Some(version),
                    Some(seq_id_type),
                    &names,
                )
            },
            self.app.config.max_retries,
            self.app.config.io_timer_period,
        );

        loop {
            match fetch.next_event().await {
                Some(FetchEvent::NAnnot(record)) => {
                    let item = self.reply.next_item_id().await;
                    let payload = serde_json::to_vec(&record).expect("nannot serialize");
                    self.reply
                        .send_na_data(item, &record.annot_name, &payload)
                        .await?;
                    self.reply.complete_na(item, &record.annot_name).await?;
                }
                Some(FetchEvent::Done) | None => return Ok(()),
                Some(FetchEvent::Error(err)) => {
                    AppCounters::inc(&self.app.counters.unknown_error);
                    // One keyspace failing does not kill the others; the
                    // failure is surfaced as a reply-level message.
                    self.reply
                        .send_reply_message(err.status, err.code, err.severity, &err.message)
                        .await?;
                    return Ok(());
                }
                Some(other) => {
                    tracing::warn!(keyspace, ?other, "unexpected named-annot event");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Processor for NamedAnnotProcessor {
    fn name(&self) -> &'static str {
        "named_annot"
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

        let info = &resolution.bioseq_info;
        send_bioseq_info(&self.reply, info, OutputFormat::Json, IncludeFlags::default()).await?;

        // Annotation keyspaces are queried concurrently; each record is its
        // own reply item.
        let fetches: Vec<_> = self
            .app
            .config
            .na_keyspaces
            .iter()
            .map(|keyspace| {
                self.fetch_keyspace(keyspace, &info.accession, info.version, info.seq_id_type)
            })
            .collect();
        futures::future::try_join_all(fetches).await?;
        Ok(())
    }
}
