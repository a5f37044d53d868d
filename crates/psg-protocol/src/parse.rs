use bytes::{Bytes, BytesMut};
use percent_encoding::percent_decode_str;

use crate::{ChunkType, ItemType, Severity, WireError, CHUNK_PREFIX};

const MAX_HEADER_LEN: usize = 16 * 1024;

/// One decoded reply chunk: its header arguments plus the payload bytes.
#[derive(Debug, Clone)]
pub struct ReplyChunk {
    pub item_id: u32,
    pub item_type: ItemType,
    pub chunk_type: ChunkType,
    pub args: Vec<(String, String)>,
    pub payload: Bytes,
}

impl ReplyChunk {
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn int_arg(&self, name: &str) -> Option<i64> {
        self.arg(name).and_then(|v| v.parse().ok())
    }

    pub fn chunk_no(&self) -> Option<i64> {
        self.int_arg("chunk_no")
    }

    pub fn n_chunks(&self) -> Option<u64> {
        self.int_arg("n_chunks").and_then(|v| u64::try_from(v).ok())
    }

    pub fn status(&self) -> Option<u16> {
        self.int_arg("status").and_then(|v| u16::try_from(v).ok())
    }

    pub fn code(&self) -> Option<u32> {
        self.int_arg("code").and_then(|v| u32::try_from(v).ok())
    }

    pub fn severity(&self) -> Option<Severity> {
        self.arg("severity").and_then(Severity::from_str)
    }

    pub fn blob_id(&self) -> Option<&str> {
        self.arg("blob_id")
    }

    pub fn id2_chunk(&self) -> Option<i64> {
        self.int_arg("id2_chunk")
    }
}

enum State {
    // How many prefix bytes have matched so far.
    Prefix(usize),
    Args,
    Data,
}

/// Incremental decoder of a PSG reply byte stream.
///
/// Feed arbitrary slices with [`ReplyParser::push`]; completed chunks come
/// back in order. The parser is a three-state machine: match the fixed
/// header prefix, accumulate `name=value&...` arguments up to the
/// terminating newline, then read `size` payload bytes.
pub struct ReplyParser {
    state: State,
    args_buf: Vec<u8>,
    pending: Option<ReplyChunk>,
    data: BytesMut,
    data_to_read: usize,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self {
            state: State::Prefix(0),
            args_buf: Vec::new(),
            pending: None,
            data: BytesMut::new(),
            data_to_read: 0,
        }
    }

    /// True when no chunk is partially decoded.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Prefix(0))
    }

    pub fn push(&mut self, mut input: &[u8]) -> Result<Vec<ReplyChunk>, WireError> {
        let mut out = Vec::new();

        while !input.is_empty() {
            match self.state {
                State::Prefix(matched) => {
                    let want = &CHUNK_PREFIX[matched..];
                    let take = want.len().min(input.len());
                    if input[..take] != want[..take] {
                        return Err(WireError::BadPrefix);
                    }
                    input = &input[take..];
                    if take == want.len() {
                        self.state = State::Args;
                    } else {
                        self.state = State::Prefix(matched + take);
                    }
                }
                State::Args => {
                    match input.iter().position(|b| *b == b'\n') {
                        Some(nl) => {
                            self.args_buf.extend_from_slice(&input[..nl]);
                            input = &input[nl + 1..];

                            let (chunk, size) = parse_header(&self.args_buf)?;
                            self.args_buf.clear();

                            if size == 0 {
                                out.push(chunk);
                                self.state = State::Prefix(0);
                            } else {
                                self.pending = Some(chunk);
                                self.data_to_read = size;
                                self.data = BytesMut::with_capacity(size);
                                self.state = State::Data;
                            }
                        }
                        None => {
                            self.args_buf.extend_from_slice(input);
                            if self.args_buf.len() > MAX_HEADER_LEN {
                                return Err(WireError::HeaderTooLong(MAX_HEADER_LEN));
                            }
                            input = &[];
                        }
                    }
                }
                State::Data => {
                    let take = self.data_to_read.min(input.len());
                    self.data.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    self.data_to_read -= take;

                    if self.data_to_read == 0 {
                        let mut chunk = self.pending.take().expect("pending chunk in Data state");
                        chunk.payload = std::mem::take(&mut self.data).freeze();
                        out.push(chunk);
                        self.state = State::Prefix(0);
                    }
                }
            }
        }

        Ok(out)
    }
}

fn parse_header(raw: &[u8]) -> Result<(ReplyChunk, usize), WireError> {
    let text = std::str::from_utf8(raw).map_err(|_| WireError::BadPrefix)?;

    let mut args = Vec::new();
    for pair in text.split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode_str(value)
            .decode_utf8()
            .map_err(|_| WireError::BadArg {
                name: "value",
                value: value.to_string(),
            })?
            .into_owned();
        args.push((name.to_string(), value));
    }

    fn find<'a>(args: &'a [(String, String)], name: &'static str) -> Result<&'a str, WireError> {
        args.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .ok_or(WireError::MissingArg(name))
    }

    let item_id_raw = find(&args, "item_id")?;
    let item_id: u32 = item_id_raw.parse().map_err(|_| WireError::BadArg {
        name: "item_id",
        value: item_id_raw.to_string(),
    })?;
    let item_type_raw = find(&args, "item_type")?;
    let item_type = ItemType::from_str(item_type_raw).ok_or_else(|| WireError::BadArg {
        name: "item_type",
        value: item_type_raw.to_string(),
    })?;
    let chunk_type_raw = find(&args, "chunk_type")?;
    let chunk_type = ChunkType::from_wire(chunk_type_raw).ok_or_else(|| WireError::BadArg {
        name: "chunk_type",
        value: chunk_type_raw.to_string(),
    })?;
    let size_raw = find(&args, "size")?;
    let size: usize = size_raw.parse().map_err(|_| WireError::BadArg {
        name: "size",
        value: size_raw.to_string(),
    })?;

    Ok((
        ReplyChunk {
            item_id,
            item_type,
            chunk_type,
            args,
            payload: Bytes::new(),
        },
        size,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame;
    use crate::ErrCode;

    fn wire(frames: &[Bytes]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.iter().copied()).collect()
    }

    fn sample_reply() -> Vec<u8> {
        wire(&[
            frame::data_chunk(1, ItemType::BioseqInfo, &[("fmt", "json")], 0, b"{\"a\":1}"),
            frame::item_meta_chunk(1, ItemType::BioseqInfo, &[], 2),
            frame::reply_meta_chunk(2, 200),
        ])
    }

    #[test]
    fn decodes_whole_buffer() {
        let mut parser = ReplyParser::new();
        let chunks = parser.push(&sample_reply()).unwrap();
        assert!(parser.is_idle());

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].item_id, 1);
        assert_eq!(chunks[0].item_type, ItemType::BioseqInfo);
        assert!(chunks[0].chunk_type.is_data());
        assert_eq!(chunks[0].arg("fmt"), Some("json"));
        assert_eq!(&chunks[0].payload[..], b"{\"a\":1}");

        assert!(chunks[1].chunk_type.is_meta());
        assert_eq!(chunks[1].n_chunks(), Some(2));

        assert_eq!(chunks[2].item_id, 0);
        assert_eq!(chunks[2].item_type, ItemType::Reply);
        assert_eq!(chunks[2].n_chunks(), Some(2));
        assert_eq!(chunks[2].status(), Some(200));
    }

    #[test]
    fn decodes_byte_at_a_time() {
        let bytes = sample_reply();
        let mut parser = ReplyParser::new();
        let mut chunks = Vec::new();
        for b in &bytes {
            chunks.extend(parser.push(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(chunks.len(), 3);
        assert!(parser.is_idle());
        assert_eq!(&chunks[0].payload[..], b"{\"a\":1}");
    }

    #[test]
    fn decodes_message_classification() {
        let bytes = wire(&[frame::reply_message_chunk(
            404,
            ErrCode::BioseqInfoNotFound,
            Severity::Error,
            "no such bioseq",
        )]);
        let mut parser = ReplyParser::new();
        let chunks = parser.push(&bytes).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].chunk_type.is_message());
        assert_eq!(chunks[0].status(), Some(404));
        assert_eq!(
            chunks[0].code().and_then(ErrCode::from_u32),
            Some(ErrCode::BioseqInfoNotFound)
        );
        assert_eq!(&chunks[0].payload[..], b"no such bioseq");
    }

    #[test]
    fn rejects_bad_prefix() {
        let mut parser = ReplyParser::new();
        assert!(matches!(
            parser.push(b"HTTP/1.1 200 OK\r\n"),
            Err(WireError::BadPrefix)
        ));
    }

    #[test]
    fn rejects_missing_size() {
        let mut parser = ReplyParser::new();
        let err = parser
            .push(b"PSG-Reply-Chunk: item_id=1&item_type=blob&chunk_type=data\n")
            .unwrap_err();
        assert!(matches!(err, WireError::MissingArg("size")));
    }

    #[test]
    fn payload_split_across_pushes() {
        let frame = frame::data_chunk(7, ItemType::Blob, &[("blob_id", "4.1")], 0, b"0123456789");
        let (a, b) = frame.split_at(frame.len() - 4);

        let mut parser = ReplyParser::new();
        assert!(parser.push(a).unwrap().is_empty());
        let chunks = parser.push(b).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0].payload[..], b"0123456789");
        assert_eq!(chunks[0].blob_id(), Some("4.1"));
    }
}
