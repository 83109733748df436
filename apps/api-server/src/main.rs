//! api-server: HTTP front for reward-gated short links.
//!
//! Serves the visitor gate, the click-settlement endpoint, owner link
//! management and operator actions over the domain services:
//! - Storage: SQLite (file, default) or in-memory when `STORAGE_PROVIDER=memory`.
//! - Identity: caller id from `X-Debug-User`; the identity provider sits in
//!   front of this server. Operators are listed in `OPERATOR_IDS`.
//! - Advisor: remote anomaly advisor at `ADVISOR_URL`, or a local burst
//!   heuristic when unset.
//!
//! Run:
//! ```bash
//! # pretty logs (default); PORT optional
//! OPERATOR_IDS=ops INITIAL_CPM=3.00 cargo run -p api-server
//!
//! # throwaway state
//! STORAGE_PROVIDER=memory LOG_FORMAT=json cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.

mod config;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::{
    extract::{ConnectInfo, Path, Query, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use domain::accounts::AccountService;
use domain::adapters::memory_repo::{InMemorySessionStore, InMemoryStore};
use domain::adapters::notifier::TracingNotifier;
use domain::adapters::SystemClock;
use domain::advisor::{AdvisorService, AnomalyAdvisor, BurstAdvisor};
use domain::clicks::ClickPolicy;
use domain::code::Base62CodeGenerator;
use domain::gate::{GateRejection, GateService, GateSession, GateState, GateTiming, RuleProgress};
use domain::rates::RateSource;
use domain::service::{LinkPatch, LinkService};
use domain::settlement::SettlementEngine;
use domain::{
    AccountStatus, Clock, CoreError, Link, Money, NewLink, RatePeriod, RequesterKey, RuleDraft,
    RuleKind, ShortCode, SponsorRule, Store, User, UserId, VisitSignals,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type DynStore = dyn Store;
type AppClock = Arc<dyn Clock>;
type Engine = SettlementEngine<DynStore, AppClock>;
type Gate = GateService<DynStore, InMemorySessionStore, AppClock>;
type Links = LinkService<DynStore, Base62CodeGenerator, AppClock>;
type Accounts = AccountService<DynStore, AppClock>;
type Advisor = AdvisorService<DynStore, AppClock>;

const DEFAULT_LIST_LIMIT: usize = 100;
const SESSION_PRUNE_EVERY: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    gate: Arc<Gate>,
    links: Arc<Links>,
    accounts: Arc<Accounts>,
    advisor: Arc<Advisor>,
    operators: Arc<HashSet<String>>,
    shortlink_domain: Option<String>,
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_insecure();

    let store = match build_store(&cfg) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "storage init failed");
            std::process::exit(1);
        }
    };
    let advisor = build_advisor(&cfg).await;
    let state = match build_state(&cfg, store, advisor, Arc::new(SystemClock)) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "startup failed");
            std::process::exit(1);
        }
    };
    spawn_session_pruner(state.gate.clone());

    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    let mut app = router(state)
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    // CORS - already validated in Config::from_env()
    let cors = if cfg.cors_allow_origin == HeaderValue::from_static("*") {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list([cfg.cors_allow_origin.clone()]))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::PATCH,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-debug-user"),
            ])
    };
    app = app.layer(cors);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    info!(%addr, "api-server listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, err = %e, "bind failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!(err = %e, "server error");
        std::process::exit(1);
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/:code", get(visit))
        .route("/api/visits/:session", get(gate_status))
        .route("/api/visits/:session/rules/:index/view", post(gate_view))
        .route("/api/visits/:session/rules/:index/open", post(gate_open))
        .route("/api/visits/:session/rules/:index/return", post(gate_return))
        .route("/api/visits/:session/complete", post(gate_complete))
        .route(
            "/api/visits/:session/sponsors/:sponsor/click",
            post(gate_sponsor_click),
        )
        .route("/api/clicks/:code", post(record_click))
        .route("/api/links", post(create_link).get(list_links))
        .route("/api/links/:code", get(get_link).patch(update_link))
        .route("/api/links/:code/rules", put(replace_rules))
        .route("/api/admin/rates", get(list_rates).post(set_rate))
        .route("/api/admin/users/:id", get(get_user))
        .route("/api/admin/users/:id/custom-rate", put(set_custom_rate))
        .route("/api/admin/users/:id/status", patch(set_user_status))
        .route("/api/admin/users/:id/payouts", post(record_payout))
        .route("/api/admin/settlements/reconcile", post(reconcile))
        .route("/api/admin/links/:code", patch(set_link_suspended))
        .route("/api/admin/links/:code/anomaly", get(review_link))
        .route("/api/admin/sponsors", post(create_sponsor))
        .with_state(state)
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

// Construct the store selected by config and feature flags.
fn build_store(cfg: &config::Config) -> Result<Arc<DynStore>, CoreError> {
    match cfg.storage_provider {
        #[cfg(feature = "sqlite")]
        config::StorageProvider::Sqlite => {
            let store = sqlite_adapter::SqliteStore::new(&cfg.db_path)?;
            info!(path = %cfg.db_path.display(), "using sqlite store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        config::StorageProvider::Sqlite => {
            warn!("built without the sqlite feature; falling back to in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        config::StorageProvider::Memory => Ok(Arc::new(InMemoryStore::new())),
    }
}

// The blocking HTTP client owns a runtime of its own, so it is built off the
// async workers.
async fn build_advisor(cfg: &config::Config) -> Arc<dyn AnomalyAdvisor> {
    let Some(url) = cfg.advisor_url.clone() else {
        info!("ADVISOR_URL not set, using local burst advisor");
        return Arc::new(BurstAdvisor::default());
    };
    let timeout = cfg.advisor_timeout;
    let built =
        tokio::task::spawn_blocking(move || advisor_client::HttpAdvisor::new(&url, timeout)).await;
    match built {
        Ok(Ok(client)) => {
            info!(endpoint = %client.endpoint(), "using remote anomaly advisor");
            Arc::new(client)
        }
        Ok(Err(e)) => {
            warn!(err = %e, "advisor client init failed, using local burst advisor");
            Arc::new(BurstAdvisor::default())
        }
        Err(e) => {
            warn!(err = %e, "advisor client init panicked, using local burst advisor");
            Arc::new(BurstAdvisor::default())
        }
    }
}

fn build_state(
    cfg: &config::Config,
    store: Arc<DynStore>,
    advisor: Arc<dyn AnomalyAdvisor>,
    clock: AppClock,
) -> Result<AppState, CoreError> {
    let notifier = Arc::new(TracingNotifier);
    let policy = ClickPolicy {
        dedup_window: cfg.dedup_window,
        milestone_step: cfg.milestone_step,
    };
    let engine = Arc::new(
        SettlementEngine::new(store.clone(), notifier.clone(), clock.clone(), policy)
            .with_fallback_rate(cfg.fallback_cpm),
    );
    if let Some(rate) = cfg.initial_cpm {
        engine.rates().seed_if_empty(rate)?;
    }
    let gate = GateService::new(
        store.clone(),
        Arc::new(InMemorySessionStore::new()),
        engine.clone(),
        clock.clone(),
        GateTiming {
            min_dwell: cfg.min_rule_dwell,
            session_ttl: cfg.session_ttl,
        },
    );
    let links = LinkService::new(store.clone(), Base62CodeGenerator::new(6), clock.clone())
        .with_default_sponsor(cfg.default_sponsor_url.clone());
    Ok(AppState {
        engine,
        gate: Arc::new(gate),
        links: Arc::new(links),
        accounts: Arc::new(AccountService::new(store.clone(), notifier, clock.clone())),
        advisor: Arc::new(AdvisorService::new(store, advisor, clock)),
        operators: Arc::new(cfg.operator_ids.clone()),
        shortlink_domain: cfg.shortlink_domain.clone(),
    })
}

fn spawn_session_pruner(gate: Arc<Gate>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SESSION_PRUNE_EVERY);
        loop {
            tick.tick().await;
            match gate.prune_expired() {
                Ok(0) => {}
                Ok(n) => debug!(pruned = n, "gate sessions pruned"),
                Err(e) => warn!(err = %e, "gate session prune failed"),
            }
        }
    });
}

// ============================================================================
// Errors and caller identity
// ============================================================================

struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            body: http_common::json_error_with_message(code, message),
        }
    }

    fn code(status: StatusCode, code: &str) -> Self {
        Self {
            status,
            body: http_common::json_err(code),
        }
    }

    fn internal() -> Self {
        Self::code(StatusCode::INTERNAL_SERVER_ERROR, "internal")
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let msg = e.to_string();
        match e {
            CoreError::InvalidUrl(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_url", &msg),
            CoreError::InvalidCode(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_code", &msg),
            CoreError::InvalidUserId => Self::new(StatusCode::BAD_REQUEST, "bad_request", &msg),
            CoreError::InvalidRule(_) => Self::new(StatusCode::BAD_REQUEST, "invalid_rule", &msg),
            CoreError::InvalidAmount(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_amount", &msg)
            }
            CoreError::AlreadyExists => Self::code(StatusCode::CONFLICT, "conflict"),
            CoreError::NotFound => Self::code(StatusCode::NOT_FOUND, "not_found"),
            CoreError::Forbidden => Self::code(StatusCode::FORBIDDEN, "forbidden"),
            CoreError::InvalidState(_) => Self::new(StatusCode::CONFLICT, "invalid_state", &msg),
            CoreError::Conflict(_) => {
                warn!(err = %msg, "conflict retries exhausted");
                Self::code(StatusCode::SERVICE_UNAVAILABLE, "retry")
            }
            CoreError::UpstreamUnavailable(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", &msg)
            }
            CoreError::Repository(_) => {
                error!(err = %msg, "repository error");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn caller(headers: &HeaderMap) -> Result<UserId, ApiError> {
    let raw = headers
        .get("x-debug-user")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::code(StatusCode::UNAUTHORIZED, "unauthorized"))?;
    UserId::new(raw.trim()).map_err(|_| {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid user id in X-Debug-User",
        )
    })
}

fn operator(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let id = caller(headers)?;
    if !state.operators.contains(id.as_str()) {
        warn!(user = %id.as_str(), "operator route denied");
        return Err(ApiError::code(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(id)
}

fn parse_code(raw: &str) -> Result<ShortCode, ApiError> {
    ShortCode::new(raw).map_err(ApiError::from)
}

fn parse_user(raw: &str) -> Result<UserId, ApiError> {
    UserId::new(raw).map_err(ApiError::from)
}

fn parse_amount(raw: &str) -> Result<Money, ApiError> {
    Money::parse(raw).map_err(ApiError::from)
}

fn visit_signals(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    client_token: Option<String>,
    client_first_use: Option<bool>,
) -> VisitSignals {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let peer = peer.map(|a| a.ip().to_string());
    let key = http_common::requester_key_from_headers(
        header("x-forwarded-for"),
        header("x-real-ip"),
        peer.as_deref(),
    );
    VisitSignals {
        requester_key: key.and_then(RequesterKey::new),
        client_token: client_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        // Clients that send nothing are treated as first use; the server-side
        // check still applies.
        client_first_use: client_first_use.unwrap_or(true),
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct GateRuleOut {
    index: u32,
    kind: &'static str,
    target_url: String,
    status: &'static str,
    viewed: bool,
}

#[derive(Serialize)]
struct GateSponsorOut {
    id: String,
    sponsor_url: String,
}

#[derive(Serialize)]
struct GateOut {
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_rule: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    rules: Vec<GateRuleOut>,
    sponsors: Vec<GateSponsorOut>,
    min_dwell_secs: u64,
}

fn gate_to_out(s: &GateSession) -> GateOut {
    let current_rule = match s.state {
        GateState::Evaluating { index } => Some(index),
        _ => None,
    };
    GateOut {
        session_id: s.id.clone(),
        code: s.link.as_ref().map(|c| c.as_str().to_string()),
        state: s.state.as_str(),
        current_rule,
        title: s.title.clone(),
        description: s.description.clone(),
        rules: s
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| GateRuleOut {
                index: r.position,
                kind: r.kind.as_str(),
                target_url: r.target_url.clone(),
                status: match s.progress.get(i) {
                    Some(RuleProgress::Loading { .. }) => "loading",
                    Some(RuleProgress::Completed) => "completed",
                    _ => "pending",
                },
                viewed: s.viewed.get(i).copied().unwrap_or(false),
            })
            .collect(),
        sponsors: s
            .sponsors
            .iter()
            .map(|sp| GateSponsorOut {
                id: sp.id.clone(),
                sponsor_url: sp.sponsor_url.clone(),
            })
            .collect(),
        min_dwell_secs: s.min_dwell.as_secs(),
    }
}

fn rejection_message(r: &GateRejection) -> String {
    match r {
        GateRejection::UnknownRule => "no such rule".into(),
        GateRejection::OutOfOrder { expected } => format!("complete rule {} first", expected),
        GateRejection::NotViewed => "view the rule before opening it".into(),
        GateRejection::NotOpened => "open the rule before returning".into(),
        GateRejection::TooSoon { remaining } => format!(
            "returned too soon, {} ms remaining; open the rule again",
            remaining.as_millis()
        ),
        GateRejection::AlreadyCompleted => "rule already completed".into(),
        GateRejection::NotReady { state } => format!("session is {}", state.as_str()),
    }
}

fn rejection_response(r: GateRejection, session: Option<&GateSession>) -> Response {
    let mut body = http_common::json_error_with_message(r.as_str(), &rejection_message(&r));
    if let GateRejection::TooSoon { remaining } = r {
        body["retry_after_ms"] = serde_json::json!(remaining.as_millis() as u64);
    }
    if let Some(s) = session {
        body["session"] = serde_json::to_value(gate_to_out(s)).unwrap_or(serde_json::Value::Null);
    }
    (StatusCode::CONFLICT, Json(body)).into_response()
}

#[derive(Deserialize)]
struct RuleIn {
    kind: String,
    target_url: String,
}

fn rule_drafts(rules: Vec<RuleIn>) -> Result<Vec<RuleDraft>, ApiError> {
    rules
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            let kind = RuleKind::parse(&r.kind).ok_or_else(|| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "invalid_rule",
                    &format!("rule {}: unknown kind '{}'", i, r.kind),
                )
            })?;
            Ok(RuleDraft {
                kind,
                target_url: r.target_url,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct CreateLinkReq {
    destination: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    rules: Vec<RuleIn>,
}

#[derive(Deserialize)]
struct UpdateLinkReq {
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct RulesReq {
    rules: Vec<RuleIn>,
}

#[derive(Serialize)]
struct RuleOut {
    position: u32,
    kind: &'static str,
    target_url: String,
}

#[derive(Serialize)]
struct LinkOut {
    code: String,
    short_url: String,
    destination: String,
    owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    rules: Vec<RuleOut>,
    monetizable: bool,
    total_clicks: u64,
    real_clicks: u64,
    generated_earnings: String,
    suspended: bool,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

#[derive(Serialize)]
struct ListOut {
    links: Vec<LinkOut>,
    total: usize,
}

fn link_to_out(link: Link, headers: &HeaderMap, shortlink_domain: &Option<String>) -> LinkOut {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    LinkOut {
        short_url: http_common::build_short_url(
            shortlink_domain.as_deref(),
            host,
            link.code.as_str(),
        ),
        code: link.code.as_str().to_string(),
        destination: link.destination,
        owner: link.owner.as_str().to_string(),
        title: link.title,
        description: link.description,
        rules: link
            .rules
            .iter()
            .map(|r| RuleOut {
                position: r.position,
                kind: r.kind.as_str(),
                target_url: r.target_url.clone(),
            })
            .collect(),
        monetizable: link.monetizable,
        total_clicks: link.total_clicks,
        real_clicks: link.real_clicks,
        generated_earnings: link.generated_earnings.to_string(),
        suspended: link.suspended,
        created_at: http_common::system_time_to_rfc3339(link.created_at),
        updated_at: link.updated_at.map(http_common::system_time_to_rfc3339),
    }
}

#[derive(Serialize)]
struct UserOut {
    id: String,
    status: &'static str,
    generated_earnings: String,
    paid_out: String,
    balance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_rate: Option<String>,
}

fn user_to_out(u: User) -> UserOut {
    let balance = u
        .generated_earnings
        .checked_sub(u.paid_out)
        .unwrap_or(Money::ZERO);
    UserOut {
        id: u.id.as_str().to_string(),
        status: u.status.as_str(),
        generated_earnings: u.generated_earnings.to_string(),
        paid_out: u.paid_out.to_string(),
        balance: balance.to_string(),
        custom_rate: u.custom_rate.map(|r| r.to_string()),
    }
}

#[derive(Serialize)]
struct PeriodOut {
    id: u64,
    rate: String,
    starts_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ends_at: Option<String>,
}

fn period_to_out(p: RatePeriod) -> PeriodOut {
    PeriodOut {
        id: p.id.0,
        rate: p.rate.to_string(),
        starts_at: http_common::system_time_to_rfc3339(p.starts_at),
        ends_at: p.ends_at.map(http_common::system_time_to_rfc3339),
    }
}

#[derive(Serialize)]
struct SponsorOut {
    id: String,
    code: String,
    sponsor_url: String,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
    views: u64,
    clicks: u64,
}

fn sponsor_to_out(s: SponsorRule) -> SponsorOut {
    SponsorOut {
        id: s.id,
        code: s.link.as_str().to_string(),
        sponsor_url: s.sponsor_url,
        active: s.active,
        expires_at: s.expires_at.map(http_common::system_time_to_rfc3339),
        views: s.views,
        clicks: s.clicks,
    }
}

// ============================================================================
// Visitor routes
// ============================================================================

#[derive(Deserialize)]
struct VisitQuery {
    /// Client dedup token.
    #[serde(default)]
    t: Option<String>,
    /// Client first-use claim.
    #[serde(default)]
    first: Option<String>,
}

async fn visit(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(q): Query<VisitQuery>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let Ok(code) = ShortCode::new(code) else {
        warn!("bad code in path");
        return ApiError::code(StatusCode::NOT_FOUND, "link_not_found").into_response();
    };
    let signals = visit_signals(
        &headers,
        peer.map(|ConnectInfo(a)| a),
        q.t,
        q.first.as_deref().map(http_common::is_truthy),
    );
    let session_id = uuid::Uuid::new_v4().to_string();
    let session = match state.gate.open(session_id.clone(), &code, signals) {
        Ok(s) => s,
        Err(e) => {
            error!(code = %code.as_str(), err = %e, "visit error");
            return ApiError::internal().into_response();
        }
    };
    match session.state {
        GateState::NotFound => {
            warn!(code = %code.as_str(), "visit 404");
            ApiError::code(StatusCode::NOT_FOUND, "link_not_found").into_response()
        }
        GateState::Suspended => {
            info!(code = %code.as_str(), "visit to suspended link");
            ApiError::code(StatusCode::GONE, "link_unavailable").into_response()
        }
        GateState::AllCompleted => match state.gate.complete(&session_id) {
            Ok(Ok(redirect)) => {
                info!(code = %code.as_str(), redirect_to = %redirect.destination, "direct redirect");
                Redirect::temporary(&redirect.destination).into_response()
            }
            Ok(Err(rejection)) => rejection_response(rejection, None),
            Err(e) => {
                error!(code = %code.as_str(), err = %e, "direct redirect failed");
                ApiError::internal().into_response()
            }
        },
        _ => {
            debug!(code = %code.as_str(), session = %session_id, "gate opened");
            (StatusCode::OK, Json(gate_to_out(&session))).into_response()
        }
    }
}

async fn gate_status(State(state): State<AppState>, Path(session): Path<String>) -> ApiResult {
    let s = state.gate.status(&session)?;
    Ok((StatusCode::OK, Json(gate_to_out(&s))).into_response())
}

fn gate_outcome(outcome: domain::gate::GateOutcome) -> Response {
    match outcome.rejection {
        None => (StatusCode::OK, Json(gate_to_out(&outcome.session))).into_response(),
        Some(r) => rejection_response(r, Some(&outcome.session)),
    }
}

async fn gate_view(
    State(state): State<AppState>,
    Path((session, index)): Path<(String, usize)>,
) -> ApiResult {
    Ok(gate_outcome(state.gate.register_view(&session, index)?))
}

async fn gate_open(
    State(state): State<AppState>,
    Path((session, index)): Path<(String, usize)>,
) -> ApiResult {
    Ok(gate_outcome(state.gate.open_rule(&session, index)?))
}

async fn gate_return(
    State(state): State<AppState>,
    Path((session, index)): Path<(String, usize)>,
) -> ApiResult {
    Ok(gate_outcome(state.gate.return_to_tab(&session, index)?))
}

#[derive(Serialize)]
struct CompleteOut {
    redirect_url: String,
}

async fn gate_complete(State(state): State<AppState>, Path(session): Path<String>) -> ApiResult {
    match state.gate.complete(&session)? {
        Ok(redirect) => Ok((
            StatusCode::OK,
            Json(CompleteOut {
                redirect_url: redirect.destination,
            }),
        )
            .into_response()),
        Err(rejection) => Ok(rejection_response(rejection, None)),
    }
}

#[derive(Serialize)]
struct SponsorClickOut {
    sponsor_url: String,
}

async fn gate_sponsor_click(
    State(state): State<AppState>,
    Path((session, sponsor)): Path<(String, String)>,
) -> ApiResult {
    let sponsor_url = state.gate.sponsor_click(&session, &sponsor)?;
    Ok((StatusCode::OK, Json(SponsorClickOut { sponsor_url })).into_response())
}

#[derive(Deserialize, Default)]
struct ClickReq {
    #[serde(default)]
    client_first_use: Option<bool>,
    #[serde(default)]
    client_token: Option<String>,
}

#[derive(Serialize)]
struct ClickOut {
    success: bool,
    billable: bool,
}

/// Click-settlement endpoint. Reports only whether the visit counted.
async fn record_click(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Option<Json<ClickReq>>,
) -> Response {
    let failed = |status: StatusCode| {
        (
            status,
            Json(ClickOut {
                success: false,
                billable: false,
            }),
        )
            .into_response()
    };
    let Ok(code) = ShortCode::new(code) else {
        return failed(StatusCode::NOT_FOUND);
    };
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let signals = visit_signals(
        &headers,
        peer.map(|ConnectInfo(a)| a),
        req.client_token,
        req.client_first_use,
    );
    match state.engine.settle_visit(&code, signals) {
        Ok(outcome) => {
            debug!(
                code = %code.as_str(),
                click_id = outcome.click_id.0,
                reason = outcome.reason.as_str(),
                "click settled"
            );
            (
                StatusCode::OK,
                Json(ClickOut {
                    success: true,
                    billable: outcome.billable,
                }),
            )
                .into_response()
        }
        Err(CoreError::NotFound) => failed(StatusCode::NOT_FOUND),
        Err(e) if e.is_conflict() => {
            warn!(code = %code.as_str(), err = %e, "click settlement contended");
            failed(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(e) => {
            error!(code = %code.as_str(), err = %e, "click settlement failed");
            failed(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// Owner routes
// ============================================================================

async fn create_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateLinkReq>,
) -> ApiResult {
    let owner = caller(&headers)?;
    let custom_code = match body.alias.as_deref().filter(|a| !a.is_empty()) {
        Some(alias) => Some(domain::validate::validate_custom_code(alias)?),
        None => None,
    };
    let input = NewLink {
        destination: body.destination,
        custom_code,
        title: body.title,
        description: body.description,
        rules: rule_drafts(body.rules)?,
    };
    let link = state.links.create(&owner, input)?;
    info!(code = %link.code.as_str(), owner = %owner.as_str(), "create ok");
    Ok((
        StatusCode::CREATED,
        Json(link_to_out(link, &headers, &state.shortlink_domain)),
    )
        .into_response())
}

async fn list_links(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> ApiResult {
    let owner = caller(&headers)?;
    let limit = http_common::parse_limit_query(query.as_deref()).unwrap_or(DEFAULT_LIST_LIMIT);
    let links: Vec<LinkOut> = state
        .links
        .list_by_owner(&owner, limit)?
        .into_iter()
        .map(|l| link_to_out(l, &headers, &state.shortlink_domain))
        .collect();
    let total = links.len();
    Ok((StatusCode::OK, Json(ListOut { links, total })).into_response())
}

async fn get_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> ApiResult {
    let who = caller(&headers)?;
    let link = state.links.get(&parse_code(&code)?)?;
    if link.owner != who && !state.operators.contains(who.as_str()) {
        return Err(ApiError::code(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok((
        StatusCode::OK,
        Json(link_to_out(link, &headers, &state.shortlink_domain)),
    )
        .into_response())
}

async fn update_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
    Json(body): Json<UpdateLinkReq>,
) -> ApiResult {
    let who = caller(&headers)?;
    let patch = LinkPatch {
        destination: body.destination,
        title: body.title,
        description: body.description,
    };
    let link = state.links.update_details(&who, &parse_code(&code)?, patch)?;
    Ok((
        StatusCode::OK,
        Json(link_to_out(link, &headers, &state.shortlink_domain)),
    )
        .into_response())
}

async fn replace_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
    Json(body): Json<RulesReq>,
) -> ApiResult {
    let who = caller(&headers)?;
    let drafts = rule_drafts(body.rules)?;
    let link = state.links.set_rules(&who, &parse_code(&code)?, drafts)?;
    Ok((
        StatusCode::OK,
        Json(link_to_out(link, &headers, &state.shortlink_domain)),
    )
        .into_response())
}

// ============================================================================
// Operator routes
// ============================================================================

#[derive(Serialize)]
struct RatesOut {
    current_rate: String,
    source: &'static str,
    periods: Vec<PeriodOut>,
}

async fn list_rates(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    operator(&state, &headers)?;
    let current = state.engine.rates().current_rate()?;
    let periods = state
        .engine
        .rates()
        .history()?
        .into_iter()
        .map(period_to_out)
        .collect();
    Ok((
        StatusCode::OK,
        Json(RatesOut {
            current_rate: current.rate.to_string(),
            source: match current.source {
                RateSource::Period(_) => "period",
                RateSource::Fallback => "fallback",
            },
            periods,
        }),
    )
        .into_response())
}

#[derive(Deserialize)]
struct RateReq {
    rate: String,
}

async fn set_rate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RateReq>,
) -> ApiResult {
    let who = operator(&state, &headers)?;
    let period = state.engine.rates().set_new_rate(parse_amount(&body.rate)?)?;
    info!(operator = %who.as_str(), rate = %period.rate, "rate changed");
    Ok((StatusCode::CREATED, Json(period_to_out(period))).into_response())
}

async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    operator(&state, &headers)?;
    let user = state.accounts.get(&parse_user(&id)?)?;
    Ok((StatusCode::OK, Json(user_to_out(user))).into_response())
}

#[derive(Deserialize)]
struct CustomRateReq {
    /// `null` clears the override.
    #[serde(default)]
    rate: Option<String>,
}

async fn set_custom_rate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CustomRateReq>,
) -> ApiResult {
    operator(&state, &headers)?;
    let rate = body.rate.as_deref().map(parse_amount).transpose()?;
    let user = state.accounts.set_custom_rate(&parse_user(&id)?, rate)?;
    Ok((StatusCode::OK, Json(user_to_out(user))).into_response())
}

#[derive(Deserialize)]
struct StatusReq {
    status: String,
}

async fn set_user_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<StatusReq>,
) -> ApiResult {
    operator(&state, &headers)?;
    let status = AccountStatus::parse(&body.status).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "status must be active or suspended",
        )
    })?;
    let user = state.accounts.set_status(&parse_user(&id)?, status)?;
    Ok((StatusCode::OK, Json(user_to_out(user))).into_response())
}

#[derive(Deserialize)]
struct PayoutReq {
    amount: String,
}

async fn record_payout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PayoutReq>,
) -> ApiResult {
    operator(&state, &headers)?;
    let amount = parse_amount(&body.amount)?;
    let user = state.accounts.record_payout(&parse_user(&id)?, amount)?;
    Ok((StatusCode::CREATED, Json(user_to_out(user))).into_response())
}

#[derive(Serialize)]
struct ReconcileOut {
    processed_count: u64,
    total_earnings_settled: String,
    failed_count: u64,
}

async fn reconcile(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let who = operator(&state, &headers)?;
    let engine = state.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.reconcile())
        .await
        .map_err(|e| {
            error!(err = %e, "reconcile task failed");
            ApiError::internal()
        })??;
    info!(
        operator = %who.as_str(),
        processed = report.processed_count,
        failed = report.failed_count,
        "reconcile requested"
    );
    Ok((
        StatusCode::OK,
        Json(ReconcileOut {
            processed_count: report.processed_count,
            total_earnings_settled: report.total_earnings_settled.to_string(),
            failed_count: report.failed_count,
        }),
    )
        .into_response())
}

#[derive(Deserialize)]
struct SuspendReq {
    suspended: bool,
}

async fn set_link_suspended(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
    Json(body): Json<SuspendReq>,
) -> ApiResult {
    operator(&state, &headers)?;
    let link = state.links.set_suspended(&parse_code(&code)?, body.suspended)?;
    Ok((
        StatusCode::OK,
        Json(link_to_out(link, &headers, &state.shortlink_domain)),
    )
        .into_response())
}

async fn review_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> ApiResult {
    operator(&state, &headers)?;
    let code = parse_code(&code)?;
    let advisor = state.advisor.clone();
    let verdict = tokio::task::spawn_blocking(move || advisor.review(&code))
        .await
        .map_err(|e| {
            error!(err = %e, "anomaly review task failed");
            ApiError::internal()
        })??;
    Ok((StatusCode::OK, Json(verdict)).into_response())
}

#[derive(Deserialize)]
struct SponsorReq {
    code: String,
    sponsor_url: String,
    #[serde(default)]
    expires_at: Option<String>,
}

async fn create_sponsor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SponsorReq>,
) -> ApiResult {
    operator(&state, &headers)?;
    let expires_at = match body.expires_at.as_deref() {
        Some(raw) => Some(http_common::rfc3339_to_system_time(raw).map_err(|_| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "expires_at must be an RFC3339 timestamp",
            )
        })?),
        None => None,
    };
    let sponsor = state
        .links
        .add_sponsor(&parse_code(&body.code)?, body.sponsor_url, expires_at)?;
    Ok((StatusCode::CREATED, Json(sponsor_to_out(sponsor))).into_response())
}
