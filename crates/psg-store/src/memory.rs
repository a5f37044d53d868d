use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use psg_model::{BioseqInfo, BlobProps, NAnnotRecord, SplitHistoryRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{BioseqInfoQuery, Fetch, FetchError, FetchEvent, Storage};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// An in-memory [`Storage`] engine. Rows are loaded up front; every fetch
/// runs as its own task streaming events, with optional artificial latency
/// and injectable faults, which is what the retry and cancellation paths
/// are tested against.
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

struct Inner {
    // Keyed by (keyspace, sat_key); rows sorted by descending last_modified.
    blob_props: HashMap<(String, i64), Vec<BlobProps>>,
    blobs: HashMap<(String, i64), Bytes>,
    split_histories: HashMap<(String, i64), Vec<SplitHistoryRecord>>,
    nannots: HashMap<String, Vec<NAnnotRecord>>,
    bioseq: HashMap<String, Vec<BioseqInfo>>,
    chunk_size: usize,
    latency: Option<Duration>,
    // Fail the next N fetches with this error, then recover.
    fault: Mutex<Option<FetchError>>,
    fault_budget: AtomicU32,
}

pub struct MemoryStorageBuilder {
    inner: Inner,
}

impl MemoryStorageBuilder {
    pub fn new() -> Self {
        Self {
            inner: Inner {
                blob_props: HashMap::new(),
                blobs: HashMap::new(),
                split_histories: HashMap::new(),
                nannots: HashMap::new(),
                bioseq: HashMap::new(),
                chunk_size: 64 * 1024,
                latency: None,
                fault: Mutex::new(None),
                fault_budget: AtomicU32::new(0),
            },
        }
    }

    /// Size of the data slices a blob is served in.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.inner.chunk_size = size.max(1);
        self
    }

    /// Delay injected ahead of each fetch's first event.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.inner.latency = Some(latency);
        self
    }

    pub fn blob(mut self, keyspace: &str, sat_key: i64, props: BlobProps, data: Bytes) -> Self {
        let rows = self
            .inner
            .blob_props
            .entry((keyspace.to_string(), sat_key))
            .or_default();
        rows.push(props);
        rows.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        self.inner.blobs.insert((keyspace.to_string(), sat_key), data);
        self
    }

    pub fn split_history(mut self, keyspace: &str, record: SplitHistoryRecord) -> Self {
        self.inner
            .split_histories
            .entry((keyspace.to_string(), record.sat_key))
            .or_default()
            .push(record);
        self
    }

    pub fn nannot(mut self, keyspace: &str, record: NAnnotRecord) -> Self {
        self.inner
            .nannots
            .entry(keyspace.to_string())
            .or_default()
            .push(record);
        self
    }

    pub fn bioseq_info(mut self, keyspace: &str, record: BioseqInfo) -> Self {
        self.inner
            .bioseq
            .entry(keyspace.to_string())
            .or_default()
            .push(record);
        self
    }

    pub fn build(self) -> MemoryStorage {
        MemoryStorage {
            inner: Arc::new(self.inner),
        }
    }
}

impl Default for MemoryStorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn builder() -> MemoryStorageBuilder {
        MemoryStorageBuilder::new()
    }

    /// Fail the next `count` fetches with `error`.
    pub fn inject_fault(&self, error: FetchError, count: u32) {
        *self.inner.fault.lock().unwrap() = Some(error);
        self.inner.fault_budget.store(count, Ordering::SeqCst);
    }

    fn start<F>(&self, produce: F) -> Fetch
    where
        F: FnOnce(&Inner) -> Vec<FetchEvent> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            if let Some(latency) = inner.latency {
                tokio::select! {
                    () = tokio::time::sleep(latency) => {}
                    () = token.cancelled() => return,
                }
            }

            let events = match inner.take_fault() {
                Some(err) => vec![FetchEvent::Error(err)],
                None => {
                    let mut events = produce(&inner);
                    if !matches!(events.last(), Some(FetchEvent::Error(_))) {
                        events.push(FetchEvent::Done);
                    }
                    events
                }
            };

            for event in events {
                tokio::select! {
                    res = tx.send(event) => {
                        if res.is_err() {
                            return;
                        }
                    }
                    () = token.cancelled() => {
                        let _ = tx.try_send(FetchEvent::Error(FetchError::cancelled()));
                        return;
                    }
                }
            }
        });

        Fetch::new(rx, cancel)
    }
}

impl Inner {
    fn take_fault(&self) -> Option<FetchError> {
        let budget = &self.fault_budget;
        loop {
            let current = budget.load(Ordering::SeqCst);
            if current == 0 {
                return None;
            }
            if budget
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return self.fault.lock().unwrap().clone();
            }
        }
    }

    fn props_row(&self, keyspace: &str, sat_key: i64, last_modified: Option<i64>) -> Option<BlobProps> {
        let rows = self.blob_props.get(&(keyspace.to_string(), sat_key))?;
        match last_modified {
            Some(lm) => rows.iter().find(|r| r.last_modified == lm).cloned(),
            None => rows.first().cloned(),
        }
    }
}

impl Storage for MemoryStorage {
    fn load_blob_props(&self, keyspace: &str, sat_key: i64, last_modified: Option<i64>) -> Fetch {
        let keyspace = keyspace.to_string();
        self.start(move |inner| {
            match inner.props_row(&keyspace, sat_key, last_modified) {
                Some(props) => vec![FetchEvent::BlobProps { props, found: true }],
                None => vec![FetchEvent::BlobProps {
                    props: BlobProps::default(),
                    found: false,
                }],
            }
        })
    }

    fn load_blob(
        &self,
        keyspace: &str,
        sat_key: i64,
        last_modified: Option<i64>,
        props: Option<BlobProps>,
    ) -> Fetch {
        let keyspace = keyspace.to_string();
        self.start(move |inner| {
            let props = match props.or_else(|| inner.props_row(&keyspace, sat_key, last_modified)) {
                Some(props) => props,
                None => {
                    return vec![FetchEvent::BlobProps {
                        props: BlobProps::default(),
                        found: false,
                    }]
                }
            };

            let mut events = vec![FetchEvent::BlobProps {
                props,
                found: true,
            }];

            let Some(data) = inner.blobs.get(&(keyspace.clone(), sat_key)) else {
                events.push(FetchEvent::Error(FetchError::internal(format!(
                    "blob data missing for {keyspace}:{sat_key}"
                ))));
                return events;
            };

            if data.is_empty() {
                events.push(FetchEvent::BlobChunk {
                    data: Bytes::new(),
                    chunk_no: 0,
                    is_last: true,
                });
                return events;
            }

            let total = data.len().div_ceil(inner.chunk_size);
            for (chunk_no, start) in (0..data.len()).step_by(inner.chunk_size).enumerate() {
                let end = (start + inner.chunk_size).min(data.len());
                events.push(FetchEvent::BlobChunk {
                    data: data.slice(start..end),
                    chunk_no: chunk_no as i64,
                    is_last: chunk_no + 1 == total,
                });
            }
            events
        })
    }

    fn split_history(&self, keyspace: &str, sat_key: i64, split_version: i32) -> Fetch {
        let keyspace = keyspace.to_string();
        self.start(move |inner| {
            let rows = inner
                .split_histories
                .get(&(keyspace, sat_key))
                .map(|rows| {
                    rows.iter()
                        .filter(|r| r.split_version == split_version)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            vec![FetchEvent::SplitHistory(rows)]
        })
    }

    fn named_annots(
        &self,
        keyspace: &str,
        accession: &str,
        version: Option<i32>,
        seq_id_type: Option<i32>,
        names: &[String],
    ) -> Fetch {
        let keyspace = keyspace.to_string();
        let accession = accession.to_string();
        let names = names.to_vec();
        self.start(move |inner| {
            let Some(rows) = inner.nannots.get(&keyspace) else {
                return Vec::new();
            };
            rows.iter()
                .filter(|r| {
                    r.accession.eq_ignore_ascii_case(&accession)
                        && version.map_or(true, |v| v == r.version)
                        && seq_id_type.map_or(true, |t| t == r.seq_id_type)
                        && names.iter().any(|n| n == &r.annot_name)
                })
                .cloned()
                .map(FetchEvent::NAnnot)
                .collect()
        })
    }

    fn bioseq_info(&self, keyspace: &str, query: BioseqInfoQuery) -> Fetch {
        let keyspace = keyspace.to_string();
        self.start(move |inner| {
            let rows = inner
                .bioseq
                .get(&keyspace)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| {
                            r.accession.eq_ignore_ascii_case(&query.accession)
                                && query.version.map_or(true, |v| v == r.version)
                                && query.seq_id_type.map_or(true, |t| t == r.seq_id_type)
                                && query.gi.map_or(true, |g| g == r.gi)
                        })
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            vec![FetchEvent::BioseqInfoRecords(rows)]
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn storage_with_blob(data: &'static [u8], chunk_size: usize) -> MemoryStorage {
        MemoryStorage::builder()
            .chunk_size(chunk_size)
            .blob(
                "ncbi_main",
                12345,
                BlobProps {
                    last_modified: 100,
                    size: data.len() as i64,
                    ..BlobProps::default()
                },
                Bytes::from_static(data),
            )
            .build()
    }

    #[tokio::test]
    async fn blob_load_streams_props_then_ordered_chunks() {
        let storage = storage_with_blob(b"abcdefghij", 4);
        let mut fetch = storage.load_blob("ncbi_main", 12345, None, None);

        let Some(FetchEvent::BlobProps { props, found }) = fetch.next_event().await else {
            panic!("expected props first");
        };
        assert!(found);
        assert_eq!(props.size, 10);

        let mut chunks = Vec::new();
        loop {
            match fetch.next_event().await {
                Some(FetchEvent::BlobChunk {
                    data,
                    chunk_no,
                    is_last,
                }) => {
                    chunks.push((chunk_no, data, is_last));
                }
                Some(FetchEvent::Done) => break,
                other => panic!("unexpected event {other:?}"),
            }
        }

        let nos: Vec<i64> = chunks.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(nos, vec![0, 1, 2]);
        assert!(chunks.last().unwrap().2);
        let joined: Vec<u8> = chunks.iter().flat_map(|(_, d, _)| d.iter().copied()).collect();
        assert_eq!(&joined, b"abcdefghij");
    }

    #[tokio::test]
    async fn missing_props_reported_not_found() {
        let storage = MemoryStorage::builder().build();
        let mut fetch = storage.load_blob_props("ncbi_main", 1, None);
        let Some(FetchEvent::BlobProps { found, .. }) = fetch.next_event().await else {
            panic!("expected props event");
        };
        assert!(!found);
        assert!(matches!(fetch.next_event().await, Some(FetchEvent::Done)));
    }

    #[tokio::test]
    async fn injected_fault_consumes_budget() {
        let storage = storage_with_blob(b"abc", 8);
        storage.inject_fault(FetchError::unavailable("node down"), 2);

        for _ in 0..2 {
            let mut fetch = storage.load_blob("ncbi_main", 12345, None, None);
            let Some(FetchEvent::Error(err)) = fetch.next_event().await else {
                panic!("expected injected error");
            };
            assert!(err.is_transient());
        }

        // Budget exhausted; the third fetch succeeds.
        let mut fetch = storage.load_blob("ncbi_main", 12345, None, None);
        assert!(matches!(
            fetch.next_event().await,
            Some(FetchEvent::BlobProps { found: true, .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_fetch_stops_streaming() {
        let storage = MemoryStorage::builder()
            .latency(Duration::from_millis(50))
            .build();
        let mut fetch = storage.load_blob_props("ncbi_main", 1, None);
        fetch.cancel();
        assert!(fetch.next_event().await.is_none());
    }

    #[tokio::test]
    async fn named_annots_filter_by_name() {
        let storage = MemoryStorage::builder()
            .nannot(
                "ncbi_na",
                NAnnotRecord {
                    accession: "NM_000170".into(),
                    version: 1,
                    seq_id_type: 10,
                    annot_name: "NA000000067.1".into(),
                    sat: 11,
                    sat_key: 7,
                    ..NAnnotRecord::default()
                },
            )
            .nannot(
                "ncbi_na",
                NAnnotRecord {
                    accession: "NM_000170".into(),
                    version: 1,
                    seq_id_type: 10,
                    annot_name: "NA000000099.1".into(),
                    sat: 11,
                    sat_key: 8,
                    ..NAnnotRecord::default()
                },
            )
            .build();

        let mut fetch = storage.named_annots(
            "ncbi_na",
            "NM_000170",
            Some(1),
            Some(10),
            &["NA000000067.1".to_string()],
        );

        let Some(FetchEvent::NAnnot(record)) = fetch.next_event().await else {
            panic!("expected one annotation");
        };
        assert_eq!(record.annot_name, "NA000000067.1");
        assert!(matches!(fetch.next_event().await, Some(FetchEvent::Done)));
    }
}
