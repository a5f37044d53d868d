use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use psg_protocol::ReplyParser;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::reply::{CompletedReply, ReplyAssembler};
use crate::{ClientError, ClientParams, PsgRequest};

/// One known server and its scheduling state.
pub(crate) struct ServerState {
    pub authority: String,
    rate: Mutex<f64>,
    active: AtomicUsize,
    pub throttle: crate::Throttle,
}

impl ServerState {
    fn rate(&self) -> f64 {
        *self.rate.lock().unwrap()
    }
}

// Holds one of a server's request slots for the duration of an attempt.
struct Slot(Arc<ServerState>);

impl Slot {
    fn acquire(server: &Arc<ServerState>, cap: usize) -> Option<Slot> {
        if server.active.fetch_add(1, Ordering::SeqCst) < cap {
            Some(Slot(server.clone()))
        } else {
            server.active.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counters a consumer can read back, mainly to observe retry behavior.
#[derive(Default)]
pub struct ClientStats {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub request_retries: AtomicU64,
    pub refused_stream_retries: AtomicU64,
    pub competitive_submissions: AtomicU64,
}

impl ClientStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct AttemptError {
    refused: bool,
    /// True while nothing of a reply was received, which is the window in
    /// which a resubmission elsewhere is safe.
    in_progress: bool,
    message: String,
}

pub(crate) struct Pool {
    pub params: ClientParams,
    http: reqwest::Client,
    servers: RwLock<Vec<Arc<ServerState>>>,
    fail_requests: AtomicBool,
    empty_since: Mutex<Option<Instant>>,
    pub stats: ClientStats,
    pub cancel: CancellationToken,
}

impl Pool {
    pub fn new(params: ClientParams) -> Self {
        Self {
            params,
            http: reqwest::Client::new(),
            servers: RwLock::new(Vec::new()),
            fail_requests: AtomicBool::new(false),
            empty_since: Mutex::new(None),
            stats: ClientStats::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn rejects_requests(&self) -> bool {
        self.fail_requests.load(Ordering::SeqCst)
    }

    /// Apply a discovery result. An empty result keeps the previous set
    /// through the grace window, then flips the pool into fail mode; a
    /// non-empty one refreshes rates, preserves throttling state, and
    /// re-enables servers parked until discovery.
    pub fn update_servers(&self, found: Vec<crate::ServerEndpoint>) {
        if found.is_empty() {
            let mut empty_since = self.empty_since.lock().unwrap();
            let since = empty_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.params.fail_requests_grace
                && !self.fail_requests.swap(true, Ordering::SeqCst)
            {
                tracing::warn!("no servers discovered; failing requests");
            }
            return;
        }

        *self.empty_since.lock().unwrap() = None;
        self.fail_requests.store(false, Ordering::SeqCst);

        let mut servers = self.servers.write().unwrap();
        let mut next = Vec::with_capacity(found.len());
        for endpoint in found {
            match servers
                .iter()
                .find(|s| s.authority == endpoint.authority)
            {
                Some(existing) => {
                    *existing.rate.lock().unwrap() = endpoint.rate;
                    existing.throttle.discovered(&existing.authority);
                    next.push(existing.clone());
                }
                None => {
                    tracing::debug!(server = %endpoint.authority, "discovered server");
                    next.push(Arc::new(ServerState {
                        authority: endpoint.authority,
                        rate: Mutex::new(endpoint.rate),
                        active: AtomicUsize::new(0),
                        throttle: crate::Throttle::new(self.params.throttle.clone()),
                    }));
                }
            }
        }
        *servers = next;
    }

    /// Pick a server weighted by rate. Servers not yet tried by this
    /// request are preferred; zero-rate servers are standby and join only
    /// when nothing else is eligible.
    fn pick(&self, attempted: &HashSet<String>, fresh_only: bool) -> Option<Arc<ServerState>> {
        let servers = self.servers.read().unwrap();
        let eligible: Vec<&Arc<ServerState>> = servers
            .iter()
            .filter(|s| {
                !s.throttle.is_active()
                    && s.active.load(Ordering::SeqCst)
                        < self.params.max_concurrent_requests_per_server
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let fresh: Vec<&Arc<ServerState>> = eligible
            .iter()
            .copied()
            .filter(|s| !attempted.contains(&s.authority) && s.rate() > 0.0)
            .collect();
        let pool = if fresh.is_empty() {
            if fresh_only {
                return None;
            }
            &eligible
        } else {
            &fresh
        };

        let total: f64 = pool.iter().map(|s| s.rate()).sum();
        if total <= 0.0 {
            return Some(pool[0].clone());
        }
        let mut point = rand::thread_rng().gen_range(0.0..total);
        for server in pool.iter() {
            point -= server.rate();
            if point <= 0.0 {
                return Some((*server).clone());
            }
        }
        Some(pool[pool.len() - 1].clone())
    }

    pub async fn fetch(
        &self,
        request: PsgRequest,
        deadline: Instant,
    ) -> Result<CompletedReply, ClientError> {
        let deadline = tokio::time::Instant::from_std(deadline);
        tokio::select! {
            outcome = tokio::time::timeout_at(deadline, self.fetch_inner(request)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        ClientStats::inc(&self.stats.failures);
                        Err(ClientError::Expired)
                    }
                }
            }
            () = self.cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }

    async fn fetch_inner(&self, request: PsgRequest) -> Result<CompletedReply, ClientError> {
        let mut attempted = HashSet::new();
        let mut request_retries = self.params.request_retries;
        let mut refused_retries = self.params.refused_stream_retries;

        loop {
            if self.rejects_requests() {
                ClientStats::inc(&self.stats.failures);
                return Err(ClientError::NoServers);
            }
            let Some(server) = self.pick(&attempted, false) else {
                ClientStats::inc(&self.stats.failures);
                return Err(ClientError::NoServers);
            };
            attempted.insert(server.authority.clone());

            match self
                .attempt_with_competition(&request, server, &mut attempted)
                .await
            {
                Ok(reply) => {
                    ClientStats::inc(&self.stats.successes);
                    return Ok(reply);
                }
                Err(err) => {
                    let budget = if err.refused {
                        &mut refused_retries
                    } else {
                        &mut request_retries
                    };
                    if err.in_progress && *budget > 0 {
                        *budget -= 1;
                        if err.refused {
                            ClientStats::inc(&self.stats.refused_stream_retries);
                        } else {
                            ClientStats::inc(&self.stats.request_retries);
                        }
                        tracing::warn!(
                            error = %err.message,
                            refused = err.refused,
                            "retrying request"
                        );
                        continue;
                    }
                    ClientStats::inc(&self.stats.failures);
                    return Err(ClientError::Failed(err.message));
                }
            }
        }
    }

    /// Run one attempt, arming a parallel competitive attempt on another
    /// eligible server once the primary has been quiet for long enough.
    /// The first completed reply wins.
    async fn attempt_with_competition(
        &self,
        request: &PsgRequest,
        primary: Arc<ServerState>,
        attempted: &mut HashSet<String>,
    ) -> Result<CompletedReply, AttemptError> {
        type TaggedAttempt<'a> = Pin<
            Box<
                dyn Future<Output = (Arc<ServerState>, Result<CompletedReply, AttemptError>)>
                    + Send
                    + 'a,
            >,
        >;

        fn tag<'a>(
            pool: &'a Pool,
            server: Arc<ServerState>,
            request: PsgRequest,
        ) -> TaggedAttempt<'a> {
            Box::pin(async move {
                let result = pool.attempt(&server, request).await;
                (server, result)
            })
        }

        let mut in_flight: FuturesUnordered<TaggedAttempt<'_>> = FuturesUnordered::new();
        in_flight.push(tag(self, primary, request.clone()));

        let competitive_delay =
            self.params.io_timer_period * self.params.competitive_after_ticks;
        let competitive_timer = tokio::time::sleep(competitive_delay);
        tokio::pin!(competitive_timer);
        let mut competitive_armed = self.params.competitive_after_ticks > 0;

        let mut first_err: Option<AttemptError> = None;
        loop {
            tokio::select! {
                Some((server, result)) = in_flight.next() => {
                    match result {
                        Ok(reply) => {
                            server.throttle.on_success();
                            return Ok(reply);
                        }
                        Err(err) => {
                            server.throttle.on_failure(&server.authority);
                            let err = match first_err.take() {
                                Some(first) => first,
                                None => err,
                            };
                            if in_flight.is_empty() {
                                return Err(err);
                            }
                            first_err = Some(err);
                        }
                    }
                }
                () = &mut competitive_timer, if competitive_armed => {
                    competitive_armed = false;
                    if let Some(other) = self.pick(attempted, true) {
                        tracing::debug!(
                            server = %other.authority,
                            "starting competitive submission"
                        );
                        attempted.insert(other.authority.clone());
                        ClientStats::inc(&self.stats.competitive_submissions);
                        in_flight.push(tag(self, other, request.clone()));
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        server: &Arc<ServerState>,
        request: PsgRequest,
    ) -> Result<CompletedReply, AttemptError> {
        let Some(_slot) = Slot::acquire(server, self.params.max_concurrent_requests_per_server)
        else {
            return Err(AttemptError {
                refused: true,
                in_progress: true,
                message: format!("server {} has no free request slots", server.authority),
            });
        };

        let url = format!("{}{}", server.authority, request.path_and_query());
        let timeout = self.params.io_timer_period * self.params.request_timeout_ticks;
        let received_any = AtomicBool::new(false);

        match tokio::time::timeout(timeout, self.attempt_inner(&url, &received_any)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError {
                refused: false,
                in_progress: !received_any.load(Ordering::SeqCst),
                message: format!("request to {url} timed out"),
            }),
        }
    }

    async fn attempt_inner(
        &self,
        url: &str,
        received_any: &AtomicBool,
    ) -> Result<CompletedReply, AttemptError> {
        let transport_err = |err: &reqwest::Error| AttemptError {
            refused: err.is_connect(),
            in_progress: !received_any.load(Ordering::SeqCst),
            message: format!("request to {url} failed: {err}"),
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| transport_err(&err))?;

        let status = response.status();
        if status.as_u16() == 503 {
            // The server shed the request without touching it.
            return Err(AttemptError {
                refused: true,
                in_progress: true,
                message: format!("server refused request: {url}"),
            });
        }
        if !status.is_success() && status.as_u16() != 400 {
            return Err(AttemptError {
                refused: false,
                in_progress: true,
                message: format!("request to {url} failed with HTTP {status}"),
            });
        }

        // Malformed-request rejections still carry a framed reply, so the
        // 400 body is parsed like any other.
        let mut parser = ReplyParser::new();
        let mut assembler = ReplyAssembler::new();
        let body = response.bytes_stream();
        futures::pin_mut!(body);

        while let Some(piece) = body.next().await {
            let piece = piece.map_err(|err| transport_err(&err))?;
            received_any.store(true, Ordering::SeqCst);
            let chunks = parser.push(&piece).map_err(|err| AttemptError {
                refused: false,
                in_progress: false,
                message: format!("reply framing error: {err}"),
            })?;
            for chunk in chunks {
                assembler.ingest(chunk).map_err(|err| AttemptError {
                    refused: false,
                    in_progress: false,
                    message: format!("reply assembly error: {err}"),
                })?;
            }
            if assembler.is_complete() {
                return Ok(assembler.into_reply());
            }
        }

        Err(AttemptError {
            refused: false,
            in_progress: assembler.is_empty(),
            message: format!("reply from {url} ended before its completion"),
        })
    }
}
