use psg_model::{is_insdc_type, BioseqInfo, BioseqResolution, ResolutionResult, SeqId};
use psg_protocol::{ErrCode, Severity};
use psg_store::{BioseqInfoQuery, CacheLookup, FetchError, FetchEvent};

use crate::app::AppContext;
use crate::processor::UseCache;
use crate::retry::RetryingFetch;

/// Turn a textual seq-id into its canonical bioseq-info record.
///
/// The cache is probed first: the primary lookup form against the
/// bioseq-info index, then each secondary form against the si2csi index.
/// Only when the cache is exhausted (and the request allows it) does a
/// storage query run, with an INSDC retry stripping the seq-id type when
/// the typed query matches nothing.
///
/// `Ok` with a `NotResolved` result means the id is simply unknown;
/// `Err` means the input was malformed or storage failed.
pub async fn resolve(
    app: &AppContext,
    text: &str,
    seq_id_type: Option<i32>,
    use_cache: UseCache,
) -> Result<BioseqResolution, FetchError> {
    let seq_id = SeqId::parse(text, seq_id_type).map_err(|err| {
        FetchError::new(400, ErrCode::MalformedSeqId, Severity::Error, err.to_string())
    })?;
    let oslt = seq_id.compose_oslt();

    let mut resolution = BioseqResolution::unresolved();

    if use_cache.allows_cache() {
        if let Some(found) = probe_cache(app, &seq_id, &oslt.secondaries) {
            resolution.result = found.0;
            resolution.bioseq_info = found.1;
            return Ok(resolution);
        }
    }

    if !use_cache.allows_db() {
        return Ok(resolution);
    }

    // The richest key available seeds the first storage query.
    let query = BioseqInfoQuery {
        accession: seq_id.accession().to_string(),
        version: seq_id.version(),
        seq_id_type: seq_id.seq_id_type(),
        gi: None,
    };

    let records = query_storage(app, query.clone(), &mut resolution).await?;
    match decide(records, query.version) {
        Decision::One(info) => {
            resolution.result = ResolutionResult::BioseqDb;
            resolution.bioseq_info = info;
        }
        Decision::None => {
            // An INSDC-typed miss may be recorded under a sibling type;
            // retry once without the type.
            if query.seq_id_type.is_some_and(is_insdc_type) {
                let retry = BioseqInfoQuery {
                    seq_id_type: None,
                    ..query
                };
                let records = query_storage(app, retry, &mut resolution).await?;
                if let Decision::One(info) = decide(records, resolution_version(&seq_id)) {
                    resolution.result = ResolutionResult::BioseqDb;
                    resolution.bioseq_info = info;
                }
            }
        }
        Decision::Ambiguous => {}
    }

    Ok(resolution)
}

fn resolution_version(seq_id: &SeqId) -> Option<i32> {
    seq_id.version()
}

fn probe_cache(
    app: &AppContext,
    seq_id: &SeqId,
    secondaries: &[String],
) -> Option<(ResolutionResult, BioseqInfo)> {
    // Primary form, against the bioseq-info index.
    match app.cache.bioseq_info(
        seq_id.accession(),
        seq_id.version(),
        seq_id.seq_id_type(),
        None,
    ) {
        CacheLookup::Found(info) => return Some((ResolutionResult::BioseqCache, info)),
        CacheLookup::NotFound => {}
        CacheLookup::Failure(msg) => {
            tracing::warn!(seq_id = seq_id.text(), msg, "bioseq-info cache failure");
        }
    }

    // Secondary forms, against the si2csi index.
    for secondary in secondaries {
        match app.cache.si2csi(secondary, seq_id.seq_id_type()) {
            CacheLookup::Found(csi) => {
                // The csi row names the canonical key; a follow-up probe may
                // upgrade it to the full bioseq-info record.
                match app
                    .cache
                    .bioseq_info(&csi.accession, Some(csi.version), Some(csi.seq_id_type), None)
                {
                    CacheLookup::Found(info) => {
                        return Some((ResolutionResult::BioseqCache, info))
                    }
                    CacheLookup::NotFound => {
                        return Some((ResolutionResult::Si2csiCache, csi));
                    }
                    CacheLookup::Failure(msg) => {
                        tracing::warn!(secondary, msg, "bioseq-info cache failure");
                        return Some((ResolutionResult::Si2csiCache, csi));
                    }
                }
            }
            CacheLookup::NotFound => {}
            CacheLookup::Failure(msg) => {
                tracing::warn!(secondary, msg, "si2csi cache failure");
            }
        }
    }

    None
}

enum Decision {
    One(BioseqInfo),
    None,
    Ambiguous,
}

/// Pick the served record out of a storage result set. Many records with a
/// version pinned is ambiguous; many without one resolves to the highest
/// version, first record winning ties.
fn decide(mut records: Vec<BioseqInfo>, version: Option<i32>) -> Decision {
    match records.len() {
        0 => Decision::None,
        1 => Decision::One(records.pop().expect("one record")),
        _ if version.is_some() => Decision::Ambiguous,
        _ => {
            let mut index = 0;
            let mut best = records[0].version;
            for (k, record) in records.iter().enumerate() {
                if record.version > best {
                    index = k;
                    best = record.version;
                }
            }
            Decision::One(records.swap_remove(index))
        }
    }
}

async fn query_storage(
    app: &AppContext,
    query: BioseqInfoQuery,
    resolution: &mut BioseqResolution,
) -> Result<Vec<BioseqInfo>, FetchError> {
    resolution.storage_query_count += 1;

    let storage = app.storage.clone();
    let keyspace = app.config.bioseq_keyspace.clone();
    let mut fetch = RetryingFetch::new(
        move || storage.bioseq_info(&keyspace, query.clone()),
        app.config.max_retries,
        app.config.io_timer_period,
    );

    let mut records = Vec::new();
    while let Some(event) = fetch.next_event().await {
        match event {
            FetchEvent::BioseqInfoRecords(batch) => records.extend(batch),
            FetchEvent::Done => break,
            FetchEvent::Error(err) => return Err(err),
            other => {
                return Err(FetchError::internal(format!(
                    "unexpected bioseq-info fetch event: {other:?}"
                )))
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;
    use clap::Parser;
    use psg_store::{MemoryCache, MemoryStorage};
    use std::sync::Arc;

    fn record(accession: &str, version: i32, seq_id_type: i32) -> BioseqInfo {
        BioseqInfo {
            accession: accession.into(),
            version,
            seq_id_type,
            sat: 4,
            sat_key: 12345,
            ..BioseqInfo::default()
        }
    }

    fn app(cache: MemoryCache, storage: MemoryStorage) -> AppContext {
        let config = Config::parse_from(["psg-server"]);
        AppContext::new(config, Arc::new(cache), Arc::new(storage))
    }

    #[tokio::test]
    async fn cache_hit_wins_without_storage_queries() {
        let mut cache = MemoryCache::new();
        cache.add_bioseq_info(record("NM_000170", 1, 10));
        let app = app(cache, MemoryStorage::builder().build());

        let res = resolve(&app, "NM_000170.1", None, UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::BioseqCache);
        assert_eq!(res.bioseq_info.version, 1);
        assert_eq!(res.storage_query_count, 0);
    }

    #[tokio::test]
    async fn secondary_id_resolves_through_si2csi() {
        let mut cache = MemoryCache::new();
        cache.add_si2csi("4557232", None, record("NM_000170", 1, 10));
        let app = app(cache, MemoryStorage::builder().build());

        let res = resolve(&app, "4557232", None, UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::Si2csiCache);
        assert_eq!(res.bioseq_info.accession, "NM_000170");
    }

    #[tokio::test]
    async fn storage_single_record() {
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("AC_000001", 3, 10))
            .build();
        let app = app(MemoryCache::new(), storage);

        let res = resolve(&app, "AC_000001.3", None, UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::BioseqDb);
        assert_eq!(res.storage_query_count, 1);
    }

    #[tokio::test]
    async fn storage_many_without_version_picks_highest() {
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("U12345", 1, 5))
            .bioseq_info("idmain", record("U12345", 3, 5))
            .bioseq_info("idmain", record("U12345", 2, 5))
            .build();
        let app = app(MemoryCache::new(), storage);

        let res = resolve(&app, "U12345", None, UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::BioseqDb);
        assert_eq!(res.bioseq_info.version, 3);
    }

    #[tokio::test]
    async fn storage_many_with_version_is_ambiguous() {
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("U12345", 2, 5))
            .bioseq_info("idmain", record("U12345", 2, 6))
            .build();
        let app = app(MemoryCache::new(), storage);

        let res = resolve(&app, "U12345.2", None, UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::NotResolved);
    }

    #[tokio::test]
    async fn insdc_type_falls_back_to_untyped_query() {
        // The record is typed EMBL(6); the query asks GenBank(5), which is
        // also INSDC, so the second untyped query finds it.
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("U12345", 1, 6))
            .build();
        let app = app(MemoryCache::new(), storage);

        let res = resolve(&app, "U12345", Some(5), UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::BioseqDb);
        assert_eq!(res.storage_query_count, 2);

        // A non-INSDC type gets no fallback.
        let res = resolve(&app, "U12345", Some(11), UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::NotResolved);
        assert_eq!(res.storage_query_count, 1);
    }

    #[tokio::test]
    async fn cache_only_never_queries_storage() {
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("U12345", 1, 5))
            .build();
        let app = app(MemoryCache::new(), storage);

        let res = resolve(&app, "U12345", None, UseCache::CacheOnly)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::NotResolved);
        assert_eq!(res.storage_query_count, 0);
    }

    #[tokio::test]
    async fn db_only_skips_cache() {
        let mut cache = MemoryCache::new();
        cache.add_bioseq_info(record("U12345", 9, 5));
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("U12345", 1, 5))
            .build();
        let app = app(cache, storage);

        let res = resolve(&app, "U12345", None, UseCache::DbOnly).await.unwrap();
        assert_eq!(res.result, ResolutionResult::BioseqDb);
        assert_eq!(res.bioseq_info.version, 1);
    }

    #[tokio::test]
    async fn poisoned_cache_degrades_to_storage() {
        let mut cache = MemoryCache::new();
        cache.poison("bad page");
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("U12345", 1, 5))
            .build();
        let app = app(cache, storage);

        let res = resolve(&app, "U12345", None, UseCache::Default)
            .await
            .unwrap();
        assert_eq!(res.result, ResolutionResult::BioseqDb);
    }

    #[tokio::test]
    async fn malformed_seq_id_is_an_error() {
        let app = app(MemoryCache::new(), MemoryStorage::builder().build());
        let err = resolve(&app, "NM_..1", None, UseCache::Default)
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.code, ErrCode::MalformedSeqId);
    }

    #[tokio::test]
    async fn canonical_and_raw_forms_agree() {
        let storage = MemoryStorage::builder()
            .bioseq_info("idmain", record("U12345", 2, 5))
            .build();
        let app = app(MemoryCache::new(), storage);

        let raw = resolve(&app, "u12345.2", None, UseCache::Default)
            .await
            .unwrap();
        let canonical = resolve(&app, "U12345.2", None, UseCache::Default)
            .await
            .unwrap();
        assert_eq!(raw.bioseq_info, canonical.bioseq_info);
    }
}
