use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use psg_client::{
    Client, ClientError, ClientParams, ItemStatus, PsgRequest, ScriptedDiscovery, ServerEndpoint,
    ServiceDiscovery, StaticDiscovery, ThrottleParams,
};
use psg_protocol::{frame, ItemType};

enum Behavior {
    Ok,
    /// 503 for the first `refusals` hits, then a good reply.
    RefuseThenOk { refusals: u64 },
    AlwaysRefuse,
    Hang,
}

struct MockState {
    hits: AtomicU64,
    behavior: Behavior,
}

impl MockState {
    fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }
}

fn psg_ok_body() -> Vec<u8> {
    let mut body = frame::data_chunk(
        1,
        ItemType::BioseqInfo,
        &[("fmt", "json")],
        0,
        b"{\"accession\":\"NM_000170\",\"version\":1}",
    )
    .to_vec();
    body.extend_from_slice(&frame::item_meta_chunk(1, ItemType::BioseqInfo, &[], 2));
    body.extend_from_slice(&frame::reply_meta_chunk(2, 200));
    body
}

async fn mock_handler(State(state): State<Arc<MockState>>) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    match state.behavior {
        Behavior::Ok => psg_response(),
        Behavior::RefuseThenOk { refusals } if hit < refusals => {
            (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response()
        }
        Behavior::RefuseThenOk { .. } => psg_response(),
        Behavior::AlwaysRefuse => (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response(),
        Behavior::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            (StatusCode::SERVICE_UNAVAILABLE, "gave up hanging").into_response()
        }
    }
}

fn psg_response() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ncbi-psg")],
        psg_ok_body(),
    )
        .into_response()
}

async fn spawn_mock(behavior: Behavior) -> (String, Arc<MockState>) {
    let state = Arc::new(MockState {
        hits: AtomicU64::new(0),
        behavior,
    });
    let router = Router::new()
        .fallback(mock_handler)
        .with_state(state.clone());
    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(router.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(async move {
        server.await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn fast_params() -> ClientParams {
    ClientParams {
        io_timer_period: Duration::from_millis(50),
        request_timeout_ticks: 10,
        competitive_after_ticks: 0,
        request_retries: 1,
        refused_stream_retries: 2,
        rebalance_period: Duration::from_millis(100),
        fail_requests_grace: Duration::from_millis(150),
        throttle: ThrottleParams {
            // Throttling off so retry behavior is observed in isolation.
            period: Duration::ZERO,
            ..ThrottleParams::default()
        },
        ..ClientParams::default()
    }
}

fn deadline(duration: Duration) -> Instant {
    Instant::now() + duration
}

async fn client_for(servers: Vec<ServerEndpoint>, params: ClientParams) -> Client {
    let discovery: Arc<dyn ServiceDiscovery> = Arc::new(StaticDiscovery::new(servers));
    Client::new(discovery, params).await
}

#[tokio::test]
async fn refused_streams_consume_their_own_retry_budget() {
    let (primary, primary_state) = spawn_mock(Behavior::RefuseThenOk { refusals: 2 }).await;
    let (standby, standby_state) = spawn_mock(Behavior::Ok).await;

    let client = client_for(
        vec![
            ServerEndpoint::new(primary, 1.0),
            // Zero rate keeps the second server on standby.
            ServerEndpoint::new(standby, 0.0),
        ],
        fast_params(),
    )
    .await;

    let reply = client
        .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(reply.status, ItemStatus::Success);
    assert_eq!(reply.items.len(), 1);

    let stats = client.stats();
    assert_eq!(stats.refused_stream_retries.load(Ordering::SeqCst), 2);
    assert_eq!(stats.request_retries.load(Ordering::SeqCst), 0);
    assert_eq!(stats.successes.load(Ordering::SeqCst), 1);

    // Both refusals and the final success landed on the primary; the
    // standby server was never contacted.
    assert_eq!(primary_state.hits(), 3);
    assert_eq!(standby_state.hits(), 0);
}

#[tokio::test]
async fn zero_retries_fail_exactly_once() {
    let (addr, state) = spawn_mock(Behavior::AlwaysRefuse).await;

    let client = client_for(
        vec![ServerEndpoint::new(addr, 1.0)],
        ClientParams {
            request_retries: 0,
            refused_stream_retries: 0,
            ..fast_params()
        },
    )
    .await;

    let err = client
        .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Failed(_)));

    let stats = client.stats();
    assert_eq!(stats.failures.load(Ordering::SeqCst), 1);
    assert_eq!(stats.refused_stream_retries.load(Ordering::SeqCst), 0);
    assert_eq!(state.hits(), 1);
}

#[tokio::test]
async fn slow_server_times_out_and_retries() {
    let (addr, state) = spawn_mock(Behavior::Hang).await;

    let client = client_for(
        vec![ServerEndpoint::new(addr, 1.0)],
        ClientParams {
            request_timeout_ticks: 2,
            request_retries: 2,
            ..fast_params()
        },
    )
    .await;

    let err = client
        .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Failed(_)));

    let stats = client.stats();
    assert_eq!(stats.request_retries.load(Ordering::SeqCst), 2);
    assert_eq!(state.hits(), 3);
}

#[tokio::test]
async fn competitive_submission_rescues_a_stuck_request() {
    let (stuck, _stuck_state) = spawn_mock(Behavior::Hang).await;
    let (healthy, healthy_state) = spawn_mock(Behavior::Ok).await;

    // The stuck server carries nearly all the rate, so the first pick is
    // overwhelmingly likely to land there; competition then reaches the
    // healthy one. A pick of the healthy server first is also a success,
    // just without the competitive attempt.
    let client = client_for(
        vec![
            ServerEndpoint::new(stuck, 1000.0),
            ServerEndpoint::new(healthy, 0.001),
        ],
        ClientParams {
            competitive_after_ticks: 2,
            request_timeout_ticks: 100,
            ..fast_params()
        },
    )
    .await;

    let reply = client
        .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(reply.status, ItemStatus::Success);
    assert_eq!(healthy_state.hits(), 1);
}

#[tokio::test]
async fn empty_discovery_fails_requests_after_the_grace_window() {
    let (addr, _state) = spawn_mock(Behavior::Ok).await;

    let discovery: Arc<dyn ServiceDiscovery> = Arc::new(ScriptedDiscovery::new(vec![
        vec![ServerEndpoint::new(addr.clone(), 1.0)],
        vec![],
        vec![],
        vec![],
        vec![],
        vec![ServerEndpoint::new(addr, 1.0)],
    ]));
    let client = Client::new(discovery, fast_params()).await;

    // Served normally while the set is fresh.
    assert!(!client.rejects_requests());
    client
        .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(5)))
        .await
        .unwrap();

    // Empty discoveries outlast the grace window: requests fail fast.
    let mut rejected = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if client.rejects_requests() {
            rejected = true;
            break;
        }
    }
    assert!(rejected, "client never entered fail mode");
    assert!(matches!(
        client
            .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(1)))
            .await,
        Err(ClientError::NoServers)
    ));

    // The next non-empty discovery recovers immediately.
    let mut recovered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !client.rejects_requests() {
            recovered = true;
            break;
        }
    }
    assert!(recovered, "client never recovered from fail mode");
}

#[tokio::test]
async fn cancellation_stops_in_flight_requests() {
    let (addr, _state) = spawn_mock(Behavior::Hang).await;

    let client = client_for(vec![ServerEndpoint::new(addr, 1.0)], fast_params()).await;

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(30)))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(ClientError::Cancelled)));
}

#[tokio::test]
async fn throttled_server_is_skipped_until_released() {
    let (flaky, flaky_state) = spawn_mock(Behavior::AlwaysRefuse).await;
    let (healthy, healthy_state) = spawn_mock(Behavior::Ok).await;

    let client = client_for(
        vec![
            ServerEndpoint::new(flaky, 1000.0),
            ServerEndpoint::new(healthy, 0.001),
        ],
        ClientParams {
            refused_stream_retries: 5,
            throttle: ThrottleParams {
                period: Duration::from_secs(30),
                max_failures: 1,
                ..ThrottleParams::default()
            },
            ..fast_params()
        },
    )
    .await;

    // The first attempt hits the flaky heavyweight, trips its throttle,
    // and the retry is forced onto the healthy standby.
    let reply = client
        .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(reply.status, ItemStatus::Success);
    assert_eq!(flaky_state.hits(), 1);
    assert_eq!(healthy_state.hits(), 1);

    // While throttled, the flaky server is not picked at all.
    client
        .fetch(PsgRequest::resolve("NM_000170.1"), deadline(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(flaky_state.hits(), 1);
    assert_eq!(healthy_state.hits(), 2);
}
