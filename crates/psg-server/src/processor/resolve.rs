use std::sync::Arc;

use psg_model::{BioseqInfo, BioseqResolution};
use psg_protocol::{ErrCode, Severity};
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, AppCounters};
use crate::processor::{
    Flow, IncludeFlags, Interrupt, OutputFormat, Processor, Request, ResolveRequest,
};
use crate::reply::Reply;
use crate::resolver;

/// `/ID/resolve`: resolution only, one bioseq-info item.
pub struct ResolveProcessor {
    app: Arc<AppContext>,
    reply: Arc<Reply>,
    request: ResolveRequest,
}

impl ResolveProcessor {
    pub fn create(
        app: Arc<AppContext>,
        reply: Arc<Reply>,
        _cancel: CancellationToken,
        request: &Request,
    ) -> Option<Box<dyn Processor>> {
        let Request::Resolve(request) = request else {
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
impl Processor for ResolveProcessor {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn run(self: Box<Self>) -> Flow {
        let resolution = resolve_or_frame(
            &self.app,
            &self.reply,
            &self.request.seq_id,
            self.request.seq_id_type,
            self.request.use_cache,
        )
        .await?;

        send_bioseq_info(
            &self.reply,
            &resolution.bioseq_info,
            self.request.fmt,
            IncludeFlags::default(),
        )
        .await?;
        Ok(())
    }
}

/// Resolve a seq-id or frame why it could not be, raising the matching
/// counters. The error paths finish the request.
pub(super) async fn resolve_or_frame(
    app: &AppContext,
    reply: &Reply,
    seq_id: &str,
    seq_id_type: Option<i32>,
    use_cache: crate::processor::UseCache,
) -> Result<BioseqResolution, Interrupt> {
    match resolver::resolve(app, seq_id, seq_id_type, use_cache).await {
        Ok(resolution) if resolution.result.is_resolved() => Ok(resolution),
        Ok(_) => {
            AppCounters::inc(&app.counters.resolve_not_found);
            reply
                .send_reply_message(
                    404,
                    ErrCode::BioseqInfoNotFound,
                    Severity::Error,
                    &format!("could not resolve seq_id {seq_id}"),
                )
                .await?;
            Err(Interrupt::Finished)
        }
        Err(err) => {
            if err.code == ErrCode::MalformedSeqId {
                AppCounters::inc(&app.counters.malformed_args);
            } else {
                AppCounters::inc(&app.counters.resolve_error);
            }
            reply
                .send_reply_message(err.status, err.code, err.severity, &err.message)
                .await?;
            Err(Interrupt::Finished)
        }
    }
}

/// Emit a bioseq-info item: one data chunk in the requested rendering plus
/// its completion.
pub(super) async fn send_bioseq_info(
    reply: &Reply,
    info: &BioseqInfo,
    fmt: OutputFormat,
    include: IncludeFlags,
) -> Flow {
    let item = reply.next_item_id().await;
    let payload = bioseq_info_payload(info, include);
    reply
        .send_bioseq_info_data(item, fmt.as_str(), &payload)
        .await?;
    reply.complete_bioseq_info(item).await?;
    Ok(())
}

/// Render a bioseq-info record, honoring the requested field subset. An
/// empty flag set means the full record.
pub(super) fn bioseq_info_payload(info: &BioseqInfo, include: IncludeFlags) -> Vec<u8> {
    if include.is_empty() {
        return serde_json::to_vec(info).expect("bioseq info serialize");
    }

    let mut value = serde_json::json!({
        "accession": info.accession,
        "version": info.version,
        "seq_id_type": info.seq_id_type,
    });
    let fields = value.as_object_mut().expect("object payload");
    if include.contains(IncludeFlags::OTHER_IDS) {
        fields.insert(
            "seq_ids".into(),
            serde_json::to_value(&info.seq_ids).expect("seq ids serialize"),
        );
    }
    if include.contains(IncludeFlags::MOL_TYPE) {
        fields.insert("mol_type".into(), info.mol_type.into());
    }
    if include.contains(IncludeFlags::LENGTH) {
        fields.insert("length".into(), info.length.into());
    }
    if include.contains(IncludeFlags::STATE) {
        fields.insert("state".into(), info.state.into());
    }
    if include.contains(IncludeFlags::BLOB_ID) {
        fields.insert("sat".into(), info.sat.into());
        fields.insert("sat_key".into(), info.sat_key.into());
    }
    if include.contains(IncludeFlags::TAX_ID) {
        fields.insert("tax_id".into(), info.tax_id.into());
    }
    if include.contains(IncludeFlags::HASH) {
        fields.insert("hash".into(), info.hash.into());
    }
    serde_json::to_vec(&value).expect("bioseq info serialize")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_field_selection() {
        let info = BioseqInfo {
            accession: "NM_000170".into(),
            version: 1,
            seq_id_type: 10,
            gi: 4557232,
            sat: 4,
            sat_key: 12345,
            tax_id: 9606,
            length: 2400,
            ..BioseqInfo::default()
        };

        let full: serde_json::Value =
            serde_json::from_slice(&bioseq_info_payload(&info, IncludeFlags::default())).unwrap();
        assert_eq!(full["gi"], 4557232);
        assert_eq!(full["tax_id"], 9606);

        let mut flags = IncludeFlags::default();
        flags.insert(IncludeFlags::BLOB_ID);
        flags.insert(IncludeFlags::LENGTH);
        let partial: serde_json::Value =
            serde_json::from_slice(&bioseq_info_payload(&info, flags)).unwrap();
        assert_eq!(partial["accession"], "NM_000170");
        assert_eq!(partial["sat"], 4);
        assert_eq!(partial["length"], 2400);
        assert!(partial.get("tax_id").is_none());
        assert!(partial.get("gi").is_none());
    }
}
