use std::collections::HashMap;

use psg_protocol::{ItemType, ReplyChunk, Severity, WireError, REPLY_ITEM_ID};

/// Terminal and in-flight states of a reply item (and of the reply as a
/// whole).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    InProgress,
    Success,
    NotFound,
    Forbidden,
    Error,
}

impl ItemStatus {
    fn from_http(status: u16) -> Self {
        match status {
            0..=399 => ItemStatus::Success,
            404 => ItemStatus::NotFound,
            401 | 403 => ItemStatus::Forbidden,
            _ => ItemStatus::Error,
        }
    }

    /// Statuses only ever degrade: an error sticks even if later chunks
    /// look fine.
    fn worsen(self, other: ItemStatus) -> ItemStatus {
        use ItemStatus::*;
        match (self, other) {
            (Error, _) | (_, Error) => Error,
            (Forbidden, _) | (_, Forbidden) => Forbidden,
            (NotFound, _) | (_, NotFound) => NotFound,
            (InProgress, s) | (s, InProgress) => s,
            (Success, Success) => Success,
        }
    }
}

/// One assembled reply item.
#[derive(Debug)]
pub struct ReplyItem {
    pub item_id: u32,
    pub item_type: ItemType,
    pub blob_id: Option<String>,
    pub status: ItemStatus,
    pub chunks: Vec<ReplyChunk>,
    pub messages: Vec<String>,
    expected: Option<u64>,
    received: u64,
}

impl ReplyItem {
    fn new(item_id: u32, item_type: ItemType) -> Self {
        Self {
            item_id,
            item_type,
            blob_id: None,
            status: ItemStatus::InProgress,
            chunks: Vec::new(),
            messages: Vec::new(),
            expected: None,
            received: 0,
        }
    }

    /// Concatenated payload of the item's data chunks.
    pub fn data(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|c| c.chunk_type.is_data())
            .flat_map(|c| c.payload.iter().copied())
            .collect()
    }
}

/// Assembles a stream of decoded chunks into items and tracks reply
/// completion, including the `n_chunks` accounting on item and reply
/// metas.
#[derive(Default)]
pub struct ReplyAssembler {
    items: HashMap<u32, ReplyItem>,
    reply_status: Option<ItemStatus>,
    reply_messages: Vec<String>,
    chunks_seen: u64,
    complete: bool,
    broken: Option<String>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any chunk has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.chunks_seen == 0
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn ingest(&mut self, chunk: ReplyChunk) -> Result<(), WireError> {
        if self.complete {
            return Err(WireError::BadArg {
                name: "item_id",
                value: "chunk after reply completion".to_string(),
            });
        }

        if chunk.item_id == REPLY_ITEM_ID {
            return self.ingest_reply_chunk(chunk);
        }

        self.chunks_seen += 1;
        let item = self
            .items
            .entry(chunk.item_id)
            .or_insert_with(|| ReplyItem::new(chunk.item_id, chunk.item_type));
        item.received += 1;
        if item.blob_id.is_none() {
            item.blob_id = chunk.blob_id().map(str::to_string);
        }

        if chunk.chunk_type.is_message() {
            let text = String::from_utf8_lossy(&chunk.payload).into_owned();
            if let Some(status) = chunk.status() {
                item.status = item.status.worsen(ItemStatus::from_http(status));
            } else if chunk.severity().is_some_and(Severity::is_error) {
                item.status = item.status.worsen(ItemStatus::Error);
            }
            item.messages.push(text);
        }

        if chunk.chunk_type.is_meta() {
            item.expected = chunk.n_chunks();
            if item.status == ItemStatus::InProgress {
                item.status = ItemStatus::Success;
            }
            if item.expected != Some(item.received) {
                self.broken = Some(format!(
                    "item {} expected {:?} chunks, received {}",
                    chunk.item_id, item.expected, item.received
                ));
            }
        }

        item.chunks.push(chunk);
        Ok(())
    }

    fn ingest_reply_chunk(&mut self, chunk: ReplyChunk) -> Result<(), WireError> {
        if chunk.chunk_type.is_message() {
            self.chunks_seen += 1;
            if let Some(status) = chunk.status() {
                let status = ItemStatus::from_http(status);
                self.reply_status = Some(
                    self.reply_status
                        .map_or(status, |current| current.worsen(status)),
                );
            }
            self.reply_messages
                .push(String::from_utf8_lossy(&chunk.payload).into_owned());
            return Ok(());
        }

        if chunk.chunk_type.is_meta() {
            if chunk.n_chunks() != Some(self.chunks_seen) {
                self.broken = Some(format!(
                    "reply completion claims {:?} chunks, {} were received",
                    chunk.n_chunks(),
                    self.chunks_seen
                ));
            }
            self.complete = true;
            return Ok(());
        }

        Err(WireError::BadArg {
            name: "chunk_type",
            value: "reply-level data chunk".to_string(),
        })
    }

    pub fn into_reply(self) -> CompletedReply {
        let mut status = self.reply_status.unwrap_or(ItemStatus::InProgress);
        let mut items: Vec<ReplyItem> = self.items.into_values().collect();
        items.sort_by_key(|item| item.item_id);

        for item in &items {
            status = status.worsen(item.status);
        }
        if status == ItemStatus::InProgress {
            status = ItemStatus::Success;
        }
        if self.broken.is_some() {
            status = ItemStatus::Error;
        }

        CompletedReply {
            status,
            items,
            messages: self.reply_messages,
            framing_error: self.broken,
        }
    }
}

/// A fully received reply.
#[derive(Debug)]
pub struct CompletedReply {
    pub status: ItemStatus,
    pub items: Vec<ReplyItem>,
    /// Reply-level message texts.
    pub messages: Vec<String>,
    /// Set when chunk accounting did not line up with the completions.
    pub framing_error: Option<String>,
}

impl CompletedReply {
    pub fn items_of_type(&self, item_type: ItemType) -> impl Iterator<Item = &ReplyItem> {
        self.items
            .iter()
            .filter(move |item| item.item_type == item_type)
    }
}
