use bytes::{BufMut, Bytes, BytesMut};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::{ChunkType, ErrCode, ItemType, Severity, CHUNK_PREFIX, REPLY_ITEM_ID};

// Characters that would break the `name=value&...` header line.
const ARG_VALUE_ESCAPES: &AsciiSet = &CONTROLS.add(b'&').add(b'=').add(b'%').add(b' ');

/// Composes one wire chunk: a header line of `name=value` pairs followed by
/// the payload whose length is recorded in the trailing `size` argument.
pub struct FrameBuilder {
    header: String,
}

impl FrameBuilder {
    pub fn new(item_id: u32, item_type: ItemType, chunk_type: ChunkType) -> Self {
        let mut builder = Self {
            header: String::with_capacity(96),
        };
        builder.push_raw("item_id", itoa(item_id as i64));
        builder.push_raw("item_type", item_type.as_str().to_string());
        builder.push_raw("chunk_type", chunk_type.as_wire());
        builder
    }

    pub fn arg(mut self, name: &str, value: &str) -> Self {
        let value = utf8_percent_encode(value, ARG_VALUE_ESCAPES).to_string();
        self.push_raw(name, value);
        self
    }

    pub fn int_arg(mut self, name: &str, value: i64) -> Self {
        self.push_raw(name, itoa(value));
        self
    }

    /// Finish the chunk, appending `size` and the payload.
    pub fn finish(mut self, payload: &[u8]) -> Bytes {
        self.push_raw("size", itoa(payload.len() as i64));

        let mut out =
            BytesMut::with_capacity(CHUNK_PREFIX.len() + self.header.len() + 1 + payload.len());
        out.put_slice(CHUNK_PREFIX);
        out.put_slice(self.header.as_bytes());
        out.put_u8(b'\n');
        out.put_slice(payload);
        out.freeze()
    }

    fn push_raw(&mut self, name: &str, value: String) {
        if !self.header.is_empty() {
            self.header.push('&');
        }
        self.header.push_str(name);
        self.header.push('=');
        self.header.push_str(&value);
    }
}

fn itoa(v: i64) -> String {
    v.to_string()
}

/// A data chunk of an item. `chunk_no` is monotone per item, starting at 0.
pub fn data_chunk(
    item_id: u32,
    item_type: ItemType,
    extra: &[(&str, &str)],
    chunk_no: i64,
    payload: &[u8],
) -> Bytes {
    let mut b = FrameBuilder::new(item_id, item_type, ChunkType::DATA);
    for (name, value) in extra {
        b = b.arg(name, value);
    }
    b.int_arg("chunk_no", chunk_no).finish(payload)
}

/// A message chunk: the text rides in the payload, the classification in
/// the header.
pub fn message_chunk(
    item_id: u32,
    item_type: ItemType,
    extra: &[(&str, &str)],
    status: u16,
    code: ErrCode,
    severity: Severity,
    text: &str,
) -> Bytes {
    let mut b = FrameBuilder::new(item_id, item_type, ChunkType::MESSAGE);
    for (name, value) in extra {
        b = b.arg(name, value);
    }
    b.int_arg("status", status as i64)
        .int_arg("code", code as i64)
        .arg("severity", severity.as_str())
        .finish(text.as_bytes())
}

/// An item completion. `n_chunks` counts every chunk of the item,
/// including this one.
pub fn item_meta_chunk(
    item_id: u32,
    item_type: ItemType,
    extra: &[(&str, &str)],
    n_chunks: usize,
) -> Bytes {
    let mut b = FrameBuilder::new(item_id, item_type, ChunkType::META);
    for (name, value) in extra {
        b = b.arg(name, value);
    }
    b.int_arg("n_chunks", n_chunks as i64).finish(&[])
}

/// A reply-level message at item id 0.
pub fn reply_message_chunk(status: u16, code: ErrCode, severity: Severity, text: &str) -> Bytes {
    message_chunk(
        REPLY_ITEM_ID,
        ItemType::Reply,
        &[],
        status,
        code,
        severity,
        text,
    )
}

/// The reply completion. `n_chunks` counts every chunk previously sent in
/// the reply; this chunk itself is not included.
pub fn reply_meta_chunk(n_chunks: usize, status: u16) -> Bytes {
    FrameBuilder::new(REPLY_ITEM_ID, ItemType::Reply, ChunkType::META)
        .int_arg("n_chunks", n_chunks as i64)
        .int_arg("status", status as i64)
        .finish(&[])
}
