use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// A PSG gateway: resolves sequence identifiers and streams sequence blobs
/// over the PSG reply-chunk protocol.
#[derive(Debug, Clone, Parser, serde::Serialize)]
#[command(about, version)]
pub struct Config {
    /// Address to serve HTTP requests on.
    #[arg(long, default_value = "0.0.0.0:2180", env = "PSG_HTTP_ADDR")]
    pub http_addr: SocketAddr,

    /// Satellite-to-keyspace mapping: the keyspace of satellite N is the
    /// N-th entry. Empty entries leave a satellite unmapped.
    #[arg(
        long,
        env = "PSG_SAT_NAMES",
        value_delimiter = ',',
        default_value = "satold,satprot,satddbj,satest,ncbi_main,ncbi_split"
    )]
    pub sat_names: Vec<String>,

    /// Keyspaces searched for named annotations.
    #[arg(long, env = "PSG_NA_KEYSPACES", value_delimiter = ',', default_value = "nannotg")]
    pub na_keyspaces: Vec<String>,

    /// Keyspace holding the bioseq-info and si2csi tables.
    #[arg(long, env = "PSG_BIOSEQ_KEYSPACE", default_value = "idmain")]
    pub bioseq_keyspace: String,

    /// How many times a transient storage error is retried per fetch.
    #[arg(long, env = "PSG_MAX_RETRIES", default_value = "2")]
    pub max_retries: u32,

    /// Base period of retry backoff and timer bookkeeping.
    #[arg(long, env = "PSG_IO_TIMER_PERIOD", value_parser = humantime::parse_duration, default_value = "1s")]
    pub io_timer_period: Duration,

    /// Per-request deadline; processors surface it as a 504 reply message.
    #[arg(long, env = "PSG_REQUEST_TIMEOUT", value_parser = humantime::parse_duration, default_value = "30s")]
    pub request_timeout: Duration,

    /// Maximum number of requests serviced at once.
    #[arg(long, env = "PSG_MAX_CONNECTIONS", default_value = "300")]
    pub max_connections: usize,

    /// How many reply chunks may be buffered ahead of the peer.
    #[arg(long, env = "PSG_REPLY_BUFFER", default_value = "64")]
    pub reply_buffer: usize,

    /// JSON file of records to serve from the built-in in-memory backend.
    #[arg(long, env = "PSG_SEED")]
    pub seed: Option<PathBuf>,
}

impl Config {
    /// Map a satellite number to its keyspace.
    pub fn sat_name(&self, sat: i32) -> Option<&str> {
        usize::try_from(sat)
            .ok()
            .and_then(|sat| self.sat_names.get(sat))
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}
