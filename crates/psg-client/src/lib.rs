//! A PSG client: submits requests to a discovered fleet of gateway
//! servers over HTTP and assembles their chunked replies.
//!
//! The transport keeps a rate-sorted server set refreshed by a discovery
//! loop, takes misbehaving servers out of rotation via per-server
//! throttling, bounds in-flight requests per server, retires slow
//! attempts through competitive resubmission, and retries failures under
//! two independent budgets (general failures and refused streams).

mod discovery;
mod pool;
mod reply;
mod throttle;

use std::sync::Arc;
use std::time::{Duration, Instant};

pub use discovery::{ScriptedDiscovery, ServerEndpoint, ServiceDiscovery, StaticDiscovery};
pub use pool::ClientStats;
pub use reply::{CompletedReply, ItemStatus, ReplyAssembler, ReplyItem};
pub use throttle::{Threshold, Throttle, ThrottleParams};

use psg_model::{BlobId, ChunkId};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no servers are available")]
    NoServers,
    #[error("request deadline expired")]
    Expired,
    #[error("request cancelled")]
    Cancelled,
    #[error("request failed: {0}")]
    Failed(String),
}

/// Tunables of the client transport. Time-based limits are expressed in
/// ticks of `io_timer_period`, the transport's bookkeeping interval.
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub io_timer_period: Duration,
    /// Ticks before an in-flight attempt is failed.
    pub request_timeout_ticks: u32,
    /// Ticks before a parallel attempt on another server is allowed.
    pub competitive_after_ticks: u32,
    /// Retry budget for general failures.
    pub request_retries: u32,
    /// Retry budget for refused streams.
    pub refused_stream_retries: u32,
    /// Concurrent request cap per server.
    pub max_concurrent_requests_per_server: usize,
    /// Discovery refresh period.
    pub rebalance_period: Duration,
    /// How long an empty discovery result is tolerated before requests
    /// are failed outright.
    pub fail_requests_grace: Duration,
    pub throttle: ThrottleParams,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            io_timer_period: Duration::from_secs(1),
            request_timeout_ticks: 10,
            competitive_after_ticks: 2,
            request_retries: 2,
            refused_stream_retries: 2,
            max_concurrent_requests_per_server: 100,
            rebalance_period: Duration::from_secs(10),
            fail_requests_grace: Duration::from_secs(60),
            throttle: ThrottleParams::default(),
        }
    }
}

/// A gateway request as its path and query string.
#[derive(Debug, Clone)]
pub struct PsgRequest {
    path_and_query: String,
}

impl PsgRequest {
    fn new(path: &str, pairs: &[(&str, &str)]) -> Self {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in pairs {
            query.append_pair(name, value);
        }
        Self {
            path_and_query: format!("{path}?{}", query.finish()),
        }
    }

    pub fn resolve(seq_id: &str) -> Self {
        Self::new("/ID/resolve", &[("seq_id", seq_id)])
    }

    pub fn get(seq_id: &str) -> Self {
        Self::new("/ID/get", &[("seq_id", seq_id)])
    }

    pub fn get_blob(blob_id: BlobId) -> Self {
        Self::new("/ID/getblob", &[("blob_id", &blob_id.to_string())])
    }

    pub fn get_tse_chunk(chunk: ChunkId, split_version: i32) -> Self {
        Self::new(
            "/ID/get_tse_chunk",
            &[
                ("tse_id", &chunk.parent.to_string()),
                ("chunk", &chunk.chunk_no.to_string()),
                ("split_version", &split_version.to_string()),
            ],
        )
    }

    pub fn get_na(seq_id: &str, names: &[&str]) -> Self {
        Self::new(
            "/ID/get_na",
            &[("seq_id", seq_id), ("names", &names.join(","))],
        )
    }

    /// Append one more query parameter.
    pub fn param(mut self, name: &str, value: &str) -> Self {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair(name, value);
        self.path_and_query.push('&');
        self.path_and_query.push_str(&query.finish());
        self
    }

    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }
}

/// The client transport. Cloning is cheap; all clones share the server
/// set, statistics and cancellation.
#[derive(Clone)]
pub struct Client {
    pool: Arc<pool::Pool>,
}

impl Client {
    /// Build a client and run the first discovery before returning, so
    /// requests can be submitted immediately. A background task keeps
    /// refreshing the server set every `rebalance_period`.
    pub async fn new(discovery: Arc<dyn ServiceDiscovery>, params: ClientParams) -> Self {
        let pool = Arc::new(pool::Pool::new(params));
        pool.update_servers(discovery.discover().await);

        let loop_pool = pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(loop_pool.params.rebalance_period) => {}
                    () = loop_pool.cancel.cancelled() => return,
                }
                let found = discovery.discover().await;
                loop_pool.update_servers(found);
            }
        });

        Self { pool }
    }

    /// Submit a request and wait for its complete reply, retrying and
    /// resubmitting within the configured budgets until `deadline`.
    pub async fn fetch(
        &self,
        request: PsgRequest,
        deadline: Instant,
    ) -> Result<CompletedReply, ClientError> {
        self.pool.fetch(request, deadline).await
    }

    /// Whether the transport is currently failing requests for lack of
    /// discovered servers.
    pub fn rejects_requests(&self) -> bool {
        self.pool.rejects_requests()
    }

    /// Cancel all in-flight and future requests.
    pub fn cancel(&self) {
        self.pool.cancel.cancel();
    }

    pub fn stats(&self) -> &ClientStats {
        &self.pool.stats
    }
}
