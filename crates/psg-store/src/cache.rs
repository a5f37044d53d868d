use std::collections::HashMap;

use psg_model::{BioseqInfo, BlobProps};

/// Outcome of a synchronous cache probe. `Failure` means the cache itself
/// misbehaved; callers log it and fall through to storage unless the
/// request is cache-only.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Found(T),
    NotFound,
    Failure(String),
}

impl<T> CacheLookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            CacheLookup::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, CacheLookup::Found(_))
    }
}

/// Synchronous lookups against the embedded property cache. Lookups may
/// block only the calling task, for a bounded time.
pub trait PropCache: Send + Sync + 'static {
    /// Probe the bioseq-info index by its primary key parts. Absent parts
    /// widen the probe; a versionless probe returns the latest version.
    fn bioseq_info(
        &self,
        accession: &str,
        version: Option<i32>,
        seq_id_type: Option<i32>,
        gi: Option<i64>,
    ) -> CacheLookup<BioseqInfo>;

    /// Probe the secondary-id index with a raw seq-id string.
    fn si2csi(&self, seq_id: &str, seq_id_type: Option<i32>) -> CacheLookup<BioseqInfo>;

    /// Probe the blob-properties index. `last_modified` of `None` picks
    /// the latest recorded version.
    fn blob_prop(&self, sat: i32, sat_key: i64, last_modified: Option<i64>)
        -> CacheLookup<BlobProps>;
}

/// An in-memory [`PropCache`] over read-only tables, standing in for the
/// embedded cache store.
#[derive(Default)]
pub struct MemoryCache {
    bioseq: Vec<BioseqInfo>,
    si2csi: HashMap<String, BioseqInfo>,
    // Per (sat, sat_key): prop rows sorted by descending last_modified.
    blob_props: HashMap<(i32, i64), Vec<BlobProps>>,
    // When set, every lookup reports this failure.
    broken: Option<String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bioseq_info(&mut self, info: BioseqInfo) {
        self.bioseq.push(info);
    }

    /// Register a secondary-id row. The key is the raw seq-id text,
    /// optionally qualified by its type.
    pub fn add_si2csi(&mut self, seq_id: &str, seq_id_type: Option<i32>, info: BioseqInfo) {
        self.si2csi.insert(csi_key(seq_id, seq_id_type), info);
    }

    pub fn add_blob_prop(&mut self, sat: i32, sat_key: i64, props: BlobProps) {
        let rows = self.blob_props.entry((sat, sat_key)).or_default();
        rows.push(props);
        rows.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    }

    /// Make every subsequent lookup fail with `message`.
    pub fn poison(&mut self, message: &str) {
        self.broken = Some(message.to_string());
    }
}

fn csi_key(seq_id: &str, seq_id_type: Option<i32>) -> String {
    match seq_id_type {
        Some(t) => format!("{}#{t}", seq_id.to_ascii_uppercase()),
        None => seq_id.to_ascii_uppercase(),
    }
}

impl PropCache for MemoryCache {
    fn bioseq_info(
        &self,
        accession: &str,
        version: Option<i32>,
        seq_id_type: Option<i32>,
        gi: Option<i64>,
    ) -> CacheLookup<BioseqInfo> {
        if let Some(msg) = &self.broken {
            return CacheLookup::Failure(msg.clone());
        }

        let mut best: Option<&BioseqInfo> = None;
        for row in &self.bioseq {
            if !row.accession.eq_ignore_ascii_case(accession) {
                continue;
            }
            if version.is_some_and(|v| v != row.version) {
                continue;
            }
            if seq_id_type.is_some_and(|t| t != row.seq_id_type) {
                continue;
            }
            if gi.is_some_and(|g| g != row.gi) {
                continue;
            }
            if best.map_or(true, |b| row.version > b.version) {
                best = Some(row);
            }
        }

        match best {
            Some(row) => CacheLookup::Found(row.clone()),
            None => CacheLookup::NotFound,
        }
    }

    fn si2csi(&self, seq_id: &str, seq_id_type: Option<i32>) -> CacheLookup<BioseqInfo> {
        if let Some(msg) = &self.broken {
            return CacheLookup::Failure(msg.clone());
        }

        // A typed probe prefers the typed row but accepts an untyped one.
        if let Some(row) = self.si2csi.get(&csi_key(seq_id, seq_id_type)) {
            return CacheLookup::Found(row.clone());
        }
        if seq_id_type.is_some() {
            if let Some(row) = self.si2csi.get(&csi_key(seq_id, None)) {
                return CacheLookup::Found(row.clone());
            }
        }
        CacheLookup::NotFound
    }

    fn blob_prop(
        &self,
        sat: i32,
        sat_key: i64,
        last_modified: Option<i64>,
    ) -> CacheLookup<BlobProps> {
        if let Some(msg) = &self.broken {
            return CacheLookup::Failure(msg.clone());
        }

        let Some(rows) = self.blob_props.get(&(sat, sat_key)) else {
            return CacheLookup::NotFound;
        };
        let row = match last_modified {
            Some(lm) => rows.iter().find(|r| r.last_modified == lm),
            None => rows.first(),
        };
        match row {
            Some(r) => CacheLookup::Found(r.clone()),
            None => CacheLookup::NotFound,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(accession: &str, version: i32, seq_id_type: i32) -> BioseqInfo {
        BioseqInfo {
            accession: accession.into(),
            version,
            seq_id_type,
            sat: 4,
            sat_key: (100 + version) as i64,
            ..BioseqInfo::default()
        }
    }

    #[test]
    fn versionless_probe_returns_latest() {
        let mut cache = MemoryCache::new();
        cache.add_bioseq_info(info("NM_000170", 1, 10));
        cache.add_bioseq_info(info("NM_000170", 3, 10));
        cache.add_bioseq_info(info("NM_000170", 2, 10));

        let hit = cache.bioseq_info("NM_000170", None, None, None).found().unwrap();
        assert_eq!(hit.version, 3);

        let hit = cache.bioseq_info("nm_000170", Some(1), Some(10), None);
        assert_eq!(hit.found().unwrap().version, 1);

        assert!(!cache.bioseq_info("NM_000170", Some(9), None, None).is_found());
        assert!(!cache.bioseq_info("XR_999", None, None, None).is_found());
    }

    #[test]
    fn si2csi_type_preference() {
        let mut cache = MemoryCache::new();
        cache.add_si2csi("4557232", Some(12), info("NM_000170", 1, 10));
        cache.add_si2csi("U12345", None, info("U12345", 2, 5));

        assert!(cache.si2csi("4557232", Some(12)).is_found());
        assert!(!cache.si2csi("4557232", Some(11)).is_found());
        // Untyped row satisfies a typed probe.
        assert!(cache.si2csi("u12345", Some(5)).is_found());
    }

    #[test]
    fn blob_prop_picks_latest_when_unknown() {
        let mut cache = MemoryCache::new();
        cache.add_blob_prop(
            4,
            12345,
            BlobProps {
                last_modified: 100,
                size: 1,
                ..BlobProps::default()
            },
        );
        cache.add_blob_prop(
            4,
            12345,
            BlobProps {
                last_modified: 200,
                size: 2,
                ..BlobProps::default()
            },
        );

        assert_eq!(cache.blob_prop(4, 12345, None).found().unwrap().size, 2);
        assert_eq!(
            cache.blob_prop(4, 12345, Some(100)).found().unwrap().size,
            1
        );
        assert!(!cache.blob_prop(4, 12345, Some(300)).is_found());
        assert!(!cache.blob_prop(5, 12345, None).is_found());
    }

    #[test]
    fn poisoned_cache_reports_failure() {
        let mut cache = MemoryCache::new();
        cache.poison("backing store unreadable");
        assert!(matches!(
            cache.blob_prop(4, 1, None),
            CacheLookup::Failure(_)
        ));
        assert!(matches!(
            cache.si2csi("X", None),
            CacheLookup::Failure(_)
        ));
    }
}
