use std::collections::HashMap;

use bytes::Bytes;
use psg_model::BlobId;
use psg_protocol::{frame, ErrCode, ItemType, Severity};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

/// The peer went away; nothing further can be delivered.
#[derive(Debug, thiserror::Error)]
#[error("reply peer is gone")]
pub struct PeerGone;

#[derive(Default)]
struct ItemState {
    chunks: usize,
    completed: bool,
}

struct Inner {
    tx: mpsc::Sender<Bytes>,
    next_item_id: u32,
    total_chunks: usize,
    items: HashMap<u32, ItemState>,
    completed: bool,
    overall_status: u16,
}

/// The server side of one PSG reply.
///
/// Chunks are framed here and pushed into a bounded channel drained by the
/// HTTP response body; awaiting channel capacity is the flow-control
/// discipline, so emitters never outrun the peer.
///
/// Invariants enforced:
/// - item ids are unique within the reply (id 0 is the reply itself);
/// - a completed item rejects further chunks;
/// - the reply completion is emitted once, with `n_chunks` equal to the
///   number of chunks sent before it.
pub struct Reply {
    inner: Mutex<Inner>,
}

impl Reply {
    pub fn new(buffer: usize) -> (Self, ReceiverStream<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                inner: Mutex::new(Inner {
                    tx,
                    next_item_id: 0,
                    total_chunks: 0,
                    items: HashMap::new(),
                    completed: false,
                    overall_status: 200,
                }),
            },
            ReceiverStream::new(rx),
        )
    }

    /// Allocate the next item id of this reply.
    pub async fn next_item_id(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.next_item_id += 1;
        inner.next_item_id
    }

    /// Raise the overall request status; it only ever gets worse.
    pub async fn update_overall_status(&self, status: u16) {
        let mut inner = self.inner.lock().await;
        inner.overall_status = inner.overall_status.max(status);
    }

    pub async fn overall_status(&self) -> u16 {
        self.inner.lock().await.overall_status
    }

    pub async fn is_completed(&self) -> bool {
        self.inner.lock().await.completed
    }

    pub async fn send_bioseq_info_data(
        &self,
        item_id: u32,
        fmt: &str,
        payload: &[u8],
    ) -> Result<(), PeerGone> {
        self.send_item_chunk(
            item_id,
            frame::data_chunk(item_id, ItemType::BioseqInfo, &[("fmt", fmt)], 0, payload),
        )
        .await
    }

    pub async fn complete_bioseq_info(&self, item_id: u32) -> Result<(), PeerGone> {
        self.complete_item(item_id, ItemType::BioseqInfo, &[]).await
    }

    pub async fn send_blob_prop_data(
        &self,
        item_id: u32,
        blob_id: BlobId,
        payload: &[u8],
    ) -> Result<(), PeerGone> {
        let blob_id = blob_id.to_string();
        self.send_item_chunk(
            item_id,
            frame::data_chunk(
                item_id,
                ItemType::BlobProp,
                &[("blob_id", &blob_id)],
                0,
                payload,
            ),
        )
        .await
    }

    pub async fn send_blob_prop_message(
        &self,
        item_id: u32,
        blob_id: BlobId,
        status: u16,
        code: ErrCode,
        severity: Severity,
        text: &str,
    ) -> Result<(), PeerGone> {
        self.update_overall_status(status).await;
        let blob_id = blob_id.to_string();
        self.send_item_chunk(
            item_id,
            frame::message_chunk(
                item_id,
                ItemType::BlobProp,
                &[("blob_id", &blob_id)],
                status,
                code,
                severity,
                text,
            ),
        )
        .await
    }

    pub async fn complete_blob_prop(&self, item_id: u32, blob_id: BlobId) -> Result<(), PeerGone> {
        let blob_id = blob_id.to_string();
        self.complete_item(item_id, ItemType::BlobProp, &[("blob_id", &blob_id)])
            .await
    }

    pub async fn send_blob_data(
        &self,
        item_id: u32,
        blob_id: BlobId,
        id2_chunk: Option<i64>,
        chunk_no: i64,
        payload: &[u8],
    ) -> Result<(), PeerGone> {
        let blob_id = blob_id.to_string();
        let id2_chunk = id2_chunk.map(|c| c.to_string());
        let mut extra = vec![("blob_id", blob_id.as_str())];
        if let Some(id2_chunk) = &id2_chunk {
            extra.push(("id2_chunk", id2_chunk.as_str()));
        }
        self.send_item_chunk(
            item_id,
            frame::data_chunk(item_id, ItemType::Blob, &extra, chunk_no, payload),
        )
        .await
    }

    pub async fn send_blob_message(
        &self,
        item_id: u32,
        blob_id: BlobId,
        status: u16,
        code: ErrCode,
        severity: Severity,
        text: &str,
    ) -> Result<(), PeerGone> {
        self.update_overall_status(status).await;
        let blob_id = blob_id.to_string();
        self.send_item_chunk(
            item_id,
            frame::message_chunk(
                item_id,
                ItemType::Blob,
                &[("blob_id", &blob_id)],
                status,
                code,
                severity,
                text,
            ),
        )
        .await
    }

    pub async fn complete_blob(&self, item_id: u32, blob_id: BlobId) -> Result<(), PeerGone> {
        let blob_id = blob_id.to_string();
        self.complete_item(item_id, ItemType::Blob, &[("blob_id", &blob_id)])
            .await
    }

    pub async fn send_na_data(
        &self,
        item_id: u32,
        annot_name: &str,
        payload: &[u8],
    ) -> Result<(), PeerGone> {
        self.send_item_chunk(
            item_id,
            frame::data_chunk(item_id, ItemType::BioseqNa, &[("na", annot_name)], 0, payload),
        )
        .await
    }

    pub async fn complete_na(&self, item_id: u32, annot_name: &str) -> Result<(), PeerGone> {
        self.complete_item(item_id, ItemType::BioseqNa, &[("na", annot_name)])
            .await
    }

    /// A reply-level message, item id 0.
    pub async fn send_reply_message(
        &self,
        status: u16,
        code: ErrCode,
        severity: Severity,
        text: &str,
    ) -> Result<(), PeerGone> {
        self.update_overall_status(status).await;
        let chunk = frame::reply_message_chunk(status, code, severity, text);
        let mut inner = self.inner.lock().await;
        if inner.completed {
            tracing::warn!("reply message after completion dropped");
            return Ok(());
        }
        inner.push(chunk).await
    }

    /// Finish the reply. Exactly one completion goes out; repeated calls
    /// are no-ops.
    pub async fn complete_reply(&self) -> Result<(), PeerGone> {
        let mut inner = self.inner.lock().await;
        if inner.completed {
            return Ok(());
        }
        inner.completed = true;
        let chunk = frame::reply_meta_chunk(inner.total_chunks, inner.overall_status);
        inner.push(chunk).await
    }

    async fn send_item_chunk(&self, item_id: u32, chunk: Bytes) -> Result<(), PeerGone> {
        let mut inner = self.inner.lock().await;
        if inner.completed {
            tracing::warn!(item_id, "chunk after reply completion dropped");
            return Ok(());
        }
        let item = inner.items.entry(item_id).or_default();
        if item.completed {
            tracing::warn!(item_id, "chunk after item completion dropped");
            return Ok(());
        }
        item.chunks += 1;
        inner.push(chunk).await
    }

    async fn complete_item(
        &self,
        item_id: u32,
        item_type: ItemType,
        extra: &[(&str, &str)],
    ) -> Result<(), PeerGone> {
        let mut inner = self.inner.lock().await;
        if inner.completed {
            return Ok(());
        }
        let item = inner.items.entry(item_id).or_default();
        if item.completed {
            tracing::warn!(item_id, "item completed twice");
            return Ok(());
        }
        item.completed = true;
        // The completion itself counts toward the item's chunk total.
        let n_chunks = item.chunks + 1;
        item.chunks = n_chunks;
        let chunk = frame::item_meta_chunk(item_id, item_type, extra, n_chunks);
        inner.push(chunk).await
    }
}

impl Inner {
    async fn push(&mut self, chunk: Bytes) -> Result<(), PeerGone> {
        self.total_chunks += 1;
        self.tx.send(chunk).await.map_err(|_| PeerGone)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;
    use psg_protocol::ReplyParser;

    async fn drain(rx: ReceiverStream<Bytes>) -> Vec<psg_protocol::ReplyChunk> {
        let bytes: Vec<u8> = rx
            .collect::<Vec<_>>()
            .await
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect();
        ReplyParser::new().push(&bytes).unwrap()
    }

    #[tokio::test]
    async fn reply_completion_counts_prior_chunks() {
        let (reply, rx) = Reply::new(16);

        let item = reply.next_item_id().await;
        reply
            .send_bioseq_info_data(item, "json", b"{}")
            .await
            .unwrap();
        reply.complete_bioseq_info(item).await.unwrap();
        reply.complete_reply().await.unwrap();
        drop(reply);

        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 3);
        let last = chunks.last().unwrap();
        assert_eq!(last.item_id, 0);
        assert!(last.chunk_type.is_meta());
        assert_eq!(last.n_chunks(), Some(2));
        assert_eq!(last.status(), Some(200));
    }

    #[tokio::test]
    async fn item_completion_counts_itself() {
        let (reply, rx) = Reply::new(16);
        let blob_id = BlobId::new(4, 12345);

        let item = reply.next_item_id().await;
        reply
            .send_blob_data(item, blob_id, None, 0, b"aa")
            .await
            .unwrap();
        reply
            .send_blob_data(item, blob_id, None, 1, b"bb")
            .await
            .unwrap();
        reply.complete_blob(item, blob_id).await.unwrap();
        reply.complete_reply().await.unwrap();
        drop(reply);

        let chunks = drain(rx).await;
        let meta = &chunks[2];
        assert!(meta.chunk_type.is_meta());
        assert_eq!(meta.n_chunks(), Some(3));
        assert_eq!(meta.blob_id(), Some("4.12345"));
    }

    #[tokio::test]
    async fn emits_after_completion_are_dropped() {
        let (reply, rx) = Reply::new(16);
        let blob_id = BlobId::new(4, 1);

        let item = reply.next_item_id().await;
        reply.complete_blob(item, blob_id).await.unwrap();
        // Rejected: the item is sealed.
        reply
            .send_blob_data(item, blob_id, None, 0, b"zz")
            .await
            .unwrap();
        reply.complete_reply().await.unwrap();
        // Rejected: the reply is sealed.
        reply
            .send_reply_message(500, ErrCode::Unknown, Severity::Error, "late")
            .await
            .unwrap();
        reply.complete_reply().await.unwrap();
        drop(reply);

        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].n_chunks(), Some(1));
    }

    #[tokio::test]
    async fn overall_status_rides_reply_completion() {
        let (reply, rx) = Reply::new(16);
        reply
            .send_reply_message(
                404,
                ErrCode::BioseqInfoNotFound,
                Severity::Error,
                "no such seq_id",
            )
            .await
            .unwrap();
        reply.complete_reply().await.unwrap();
        drop(reply);

        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].status(), Some(404));
        assert_eq!(chunks[1].n_chunks(), Some(1));
    }

    #[tokio::test]
    async fn item_ids_are_unique_and_dense() {
        let (reply, _rx) = Reply::new(16);
        assert_eq!(reply.next_item_id().await, 1);
        assert_eq!(reply.next_item_id().await, 2);
        assert_eq!(reply.next_item_id().await, 3);
    }
}
