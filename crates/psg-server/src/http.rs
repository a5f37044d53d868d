use std::collections::HashMap;
use std::sync::Arc;

use axum::body::StreamBody;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use psg_model::BlobId;
use psg_protocol::{frame, ErrCode, Severity};
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, AppCounters};
use crate::processor::{
    self, GetBlobBySeqIdRequest, GetBlobRequest, IncludeFlags, NamedAnnotRequest, OutputFormat,
    Request, ResolveRequest, TseChunkRequest, TseOption, UseCache,
};
use crate::reply::Reply;

pub const CONTENT_TYPE_PSG: &str = "application/x-ncbi-psg";

pub fn build_router(app: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ID/resolve", get(id_resolve))
        .route("/ID/get", get(id_get))
        .route("/ID/getblob", get(id_getblob))
        .route("/ID/get_tse_chunk", get(id_get_tse_chunk))
        .route("/ID/get_na", get(id_get_na))
        .route("/ADMIN/config", get(admin_config))
        .route("/ADMIN/info", get(admin_info))
        .route("/ADMIN/status", get(admin_status))
        .fallback(bad_url)
        .with_state(app)
}

struct BadParams {
    code: ErrCode,
    message: String,
}

impl BadParams {
    fn malformed(message: impl Into<String>) -> Self {
        Self {
            code: ErrCode::MalformedParameter,
            message: message.into(),
        }
    }

    fn missing(name: &str) -> Self {
        Self {
            code: ErrCode::MissingParameter,
            message: format!("expected to have the '{name}' parameter"),
        }
    }
}

struct Params(HashMap<String, String>);

impl Params {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn require(&self, name: &str) -> Result<&str, BadParams> {
        self.get(name).ok_or_else(|| BadParams::missing(name))
    }

    fn use_cache(&self) -> Result<UseCache, BadParams> {
        match self.get("use_cache") {
            None => Ok(UseCache::Default),
            Some("yes") => Ok(UseCache::CacheOnly),
            Some("no") | Some("no_cache") => Ok(UseCache::DbOnly),
            Some(other) => Err(BadParams::malformed(format!(
                "malformed 'use_cache' parameter value '{other}'; expected yes, no or no_cache"
            ))),
        }
    }

    fn tse(&self, default: TseOption) -> Result<TseOption, BadParams> {
        match self.get("tse") {
            None => Ok(default),
            Some("none") => Ok(TseOption::None),
            Some("slim") => Ok(TseOption::Slim),
            Some("smart") => Ok(TseOption::Smart),
            Some("whole") => Ok(TseOption::Whole),
            Some("orig") => Ok(TseOption::Orig),
            Some(other) => Err(BadParams::malformed(format!(
                "malformed 'tse' parameter value '{other}'; expected none, slim, smart, whole or orig"
            ))),
        }
    }

    fn fmt(&self) -> Result<OutputFormat, BadParams> {
        match self.get("fmt") {
            None => Ok(OutputFormat::default()),
            Some("native") => Ok(OutputFormat::Native),
            Some("json") => Ok(OutputFormat::Json),
            Some("protobuf") => Ok(OutputFormat::Protobuf),
            Some(other) => Err(BadParams::malformed(format!(
                "malformed 'fmt' parameter value '{other}'; expected native, json or protobuf"
            ))),
        }
    }

    fn int<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, BadParams> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                BadParams::malformed(format!(
                    "error converting '{name}' parameter value '{raw}' to integer"
                ))
            }),
        }
    }

    fn blob_id(&self, name: &str) -> Result<BlobId, BadParams> {
        let raw = self.require(name)?;
        raw.parse().map_err(|_| {
            BadParams::malformed(format!(
                "malformed '{name}' parameter; expected format 'sat.sat_key' \
                 where both 'sat' and 'sat_key' are integers"
            ))
        })
    }

    fn exclude_blobs(&self) -> Result<Vec<BlobId>, BadParams> {
        let Some(raw) = self.get("exclude_blobs") else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse().map_err(|_| {
                    BadParams::malformed(format!(
                        "malformed 'exclude_blobs' entry '{part}'; expected 'sat.sat_key'"
                    ))
                })
            })
            .collect()
    }

    fn include_flags(&self) -> Result<IncludeFlags, BadParams> {
        const FLAGS: &[(&str, u32)] = &[
            ("no_tse", IncludeFlags::NO_TSE),
            ("fast_info", IncludeFlags::FAST_INFO),
            ("whole_tse", IncludeFlags::WHOLE_TSE),
            ("orig_tse", IncludeFlags::ORIG_TSE),
            ("canon_id", IncludeFlags::CANON_ID),
            ("other_ids", IncludeFlags::OTHER_IDS),
            ("mol_type", IncludeFlags::MOL_TYPE),
            ("length", IncludeFlags::LENGTH),
            ("state", IncludeFlags::STATE),
            ("blob_id", IncludeFlags::BLOB_ID),
            ("tax_id", IncludeFlags::TAX_ID),
            ("hash", IncludeFlags::HASH),
        ];

        let mut include = IncludeFlags::default();
        for (name, flag) in FLAGS {
            match self.get(name) {
                None => {}
                Some("yes") => include.insert(*flag),
                Some("no") => {}
                Some(other) => {
                    return Err(BadParams::malformed(format!(
                        "malformed '{name}' parameter value '{other}'; expected yes or no"
                    )))
                }
            }
        }
        Ok(include)
    }
}

async fn id_resolve(
    State(app): State<Arc<AppContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    AppCounters::inc(&app.counters.resolve_requests);
    let params = Params(params);
    let request = match parse_resolve(&params) {
        Ok(request) => request,
        Err(bad) => return bad_request(&app, bad),
    };
    dispatch(app, "resolve", Request::Resolve(request)).await
}

fn parse_resolve(params: &Params) -> Result<ResolveRequest, BadParams> {
    Ok(ResolveRequest {
        seq_id: params.require("seq_id")?.to_string(),
        seq_id_type: params.int("seq_id_type")?,
        fmt: params.fmt()?,
        use_cache: params.use_cache()?,
    })
}

async fn id_get(
    State(app): State<Arc<AppContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    AppCounters::inc(&app.counters.get_requests);
    let params = Params(params);
    let request = match parse_get(&params) {
        Ok(request) => request,
        Err(bad) => return bad_request(&app, bad),
    };
    dispatch(app, "get", Request::GetBlobBySeqId(request)).await
}

fn parse_get(params: &Params) -> Result<GetBlobBySeqIdRequest, BadParams> {
    let include = params.include_flags()?;
    // The flag set can force the TSE shape without an explicit `tse`.
    let mut tse = params.tse(TseOption::Whole)?;
    if params.get("tse").is_none() {
        if include.contains(IncludeFlags::ORIG_TSE) {
            tse = TseOption::Orig;
        }
        if include.contains(IncludeFlags::WHOLE_TSE) {
            tse = TseOption::Whole;
        }
    }
    Ok(GetBlobBySeqIdRequest {
        seq_id: params.require("seq_id")?.to_string(),
        seq_id_type: params.int("seq_id_type")?,
        tse,
        use_cache: params.use_cache()?,
        exclude_blobs: params.exclude_blobs()?,
        include,
    })
}

async fn id_getblob(
    State(app): State<Arc<AppContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    AppCounters::inc(&app.counters.getblob_requests);
    let params = Params(params);
    let request = match parse_getblob(&params) {
        Ok(request) => request,
        Err(bad) => return bad_request(&app, bad),
    };
    dispatch(app, "getblob", Request::GetBlob(request)).await
}

fn parse_getblob(params: &Params) -> Result<GetBlobRequest, BadParams> {
    Ok(GetBlobRequest {
        blob_id: params.blob_id("blob_id")?,
        last_modified: params.int("last_modified")?,
        tse: params.tse(TseOption::Orig)?,
        use_cache: params.use_cache()?,
    })
}

async fn id_get_tse_chunk(
    State(app): State<Arc<AppContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    AppCounters::inc(&app.counters.tse_chunk_requests);
    let params = Params(params);
    let request = match parse_tse_chunk(&params) {
        Ok(request) => request,
        Err(bad) => return bad_request(&app, bad),
    };
    dispatch(app, "get_tse_chunk", Request::TseChunk(request)).await
}

fn parse_tse_chunk(params: &Params) -> Result<TseChunkRequest, BadParams> {
    let chunk = params
        .int::<i64>("chunk")?
        .ok_or_else(|| BadParams::missing("chunk"))?;
    let split_version = params
        .int::<i32>("split_version")?
        .ok_or_else(|| BadParams::missing("split_version"))?;
    Ok(TseChunkRequest {
        tse_id: params.blob_id("tse_id")?,
        chunk,
        split_version,
        use_cache: params.use_cache()?,
    })
}

async fn id_get_na(
    State(app): State<Arc<AppContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    AppCounters::inc(&app.counters.annot_requests);
    let params = Params(params);
    let request = match parse_get_na(&params) {
        Ok(request) => request,
        Err(bad) => return bad_request(&app, bad),
    };
    dispatch(app, "get_na", Request::NamedAnnot(request)).await
}

fn parse_get_na(params: &Params) -> Result<NamedAnnotRequest, BadParams> {
    let names: Vec<String> = params
        .require("names")?
        .split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(BadParams::malformed(
            "the 'names' parameter must list at least one annotation",
        ));
    }
    Ok(NamedAnnotRequest {
        seq_id: params.require("seq_id")?.to_string(),
        seq_id_type: params.int("seq_id_type")?,
        names,
        use_cache: params.use_cache()?,
    })
}

/// Bind the request to its processor and stream the reply out.
async fn dispatch(app: Arc<AppContext>, endpoint: &'static str, request: Request) -> Response {
    metrics::counter!("psg_requests", "endpoint" => endpoint).increment(1);

    let Ok(permit) = app.limiter.clone().try_acquire_owned() else {
        metrics::counter!("psg_rejected_requests", "reason" => "over_limit").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server overloaded").into_response();
    };

    let (reply, body) = Reply::new(app.config.reply_buffer);
    let reply = Arc::new(reply);
    let cancel = CancellationToken::new();

    let Some(processor) =
        processor::create_processor(app.clone(), reply.clone(), cancel.clone(), request)
    else {
        AppCounters::inc(&app.counters.unknown_error);
        return (StatusCode::INTERNAL_SERVER_ERROR, "no processor for request").into_response();
    };

    tokio::spawn(async move {
        let _permit = permit;
        processor::run_processor(app, reply, cancel, processor).await;
    });

    let body = StreamBody::new(body.map(Ok::<_, std::io::Error>));
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, CONTENT_TYPE_PSG)],
        body,
    )
        .into_response()
}

/// Malformed requests still answer with a well-formed PSG reply: one
/// reply-level message and the completion, under HTTP 400.
fn bad_request(app: &AppContext, bad: BadParams) -> Response {
    match bad.code {
        ErrCode::MissingParameter => AppCounters::inc(&app.counters.insufficient_args),
        _ => AppCounters::inc(&app.counters.malformed_args),
    }
    tracing::warn!(message = bad.message, "rejecting malformed request");

    let mut body = frame::reply_message_chunk(400, bad.code, Severity::Error, &bad.message).to_vec();
    body.extend_from_slice(&frame::reply_meta_chunk(1, 400));
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, CONTENT_TYPE_PSG)],
        body,
    )
        .into_response()
}

async fn bad_url(State(app): State<Arc<AppContext>>) -> Response {
    AppCounters::inc(&app.counters.bad_url);
    bad_request(
        &app,
        BadParams {
            code: ErrCode::BadUrl,
            message: "the provided URL is not recognized".to_string(),
        },
    )
}

async fn admin_config(State(app): State<Arc<AppContext>>) -> Response {
    AppCounters::inc(&app.counters.admin_requests);
    axum::Json(serde_json::json!({ "configuration": app.config })).into_response()
}

async fn admin_info(State(app): State<Arc<AppContext>>) -> Response {
    AppCounters::inc(&app.counters.admin_requests);
    let started_at = app
        .started_at()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "pid": std::process::id(),
        "started_at": started_at,
    }))
    .into_response()
}

async fn admin_status(State(app): State<Arc<AppContext>>) -> Response {
    AppCounters::inc(&app.counters.admin_requests);
    axum::Json(serde_json::json!({
        "counters": app.counters.snapshot(),
        "available_request_slots": app.limiter.available_permits(),
    }))
    .into_response()
}
