use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use psg_model::{BioseqInfo, BlobProps, NAnnotRecord, SplitHistoryRecord};
use psg_server::{http, AppContext, Config};
use psg_store::{MemoryCache, MemoryStorage, PropCache, Storage};
use tracing_subscriber::EnvFilter;

/// Records served by the built-in in-memory backend, loaded from the
/// `--seed` JSON file. Stands in for the embedded cache plus the blob
/// store in local deployments and tests.
#[derive(Default, serde::Deserialize)]
struct Seed {
    #[serde(default)]
    bioseq_info: Vec<BioseqInfo>,
    #[serde(default)]
    si2csi: Vec<SeedSi2csi>,
    #[serde(default)]
    blobs: Vec<SeedBlob>,
    #[serde(default)]
    split_history: Vec<SeedSplitHistory>,
    #[serde(default)]
    named_annots: Vec<SeedNamedAnnot>,
}

#[derive(serde::Deserialize)]
struct SeedSi2csi {
    seq_id: String,
    seq_id_type: Option<i32>,
    info: BioseqInfo,
}

#[derive(serde::Deserialize)]
struct SeedBlob {
    keyspace: String,
    sat: i32,
    sat_key: i64,
    props: BlobProps,
    data: String,
}

#[derive(serde::Deserialize)]
struct SeedSplitHistory {
    keyspace: String,
    record: SplitHistoryRecord,
}

#[derive(serde::Deserialize)]
struct SeedNamedAnnot {
    keyspace: String,
    record: NAnnotRecord,
}

fn build_backends(config: &Config) -> anyhow::Result<(Arc<dyn PropCache>, Arc<dyn Storage>)> {
    let seed: Seed = match &config.seed {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("failed to read seed file {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse seed file {}", path.display()))?
        }
        None => Seed::default(),
    };

    let mut cache = MemoryCache::new();
    let mut storage = MemoryStorage::builder();

    for info in seed.bioseq_info {
        cache.add_bioseq_info(info.clone());
        storage = storage.bioseq_info(&config.bioseq_keyspace, info);
    }
    for row in seed.si2csi {
        cache.add_si2csi(&row.seq_id, row.seq_id_type, row.info);
    }
    for blob in seed.blobs {
        cache.add_blob_prop(blob.sat, blob.sat_key, blob.props.clone());
        storage = storage.blob(
            &blob.keyspace,
            blob.sat_key,
            blob.props,
            blob.data.into_bytes().into(),
        );
    }
    for row in seed.split_history {
        storage = storage.split_history(&row.keyspace, row.record);
    }
    for row in seed.named_annots {
        storage = storage.nannot(&row.keyspace, row.record);
    }

    Ok((Arc::new(cache), Arc::new(storage.build())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let (cache, storage) = build_backends(&config)?;
    let app = Arc::new(AppContext::new(config.clone(), cache, storage));

    tracing::info!(addr = %config.http_addr, "starting psg-server");

    axum::Server::bind(&config.http_addr)
        .serve(http::build_router(app).into_make_service())
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for CTRL-C");
            tracing::info!("received Ctrl+C, shutting down");
        })
        .await
        .context("http server failed")?;

    Ok(())
}
