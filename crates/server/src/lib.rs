use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use zona_engine::Engine;
use zona_live::MapState;
use zona_protocol::{
    highlight_spans, routes, stream as sse, Area, AreaPatch, AreaWithFaction, ChangeNotification,
    Event, EventDraft, EventId, Faction, FactionId, ReputationUpdate,
};

pub mod config;
mod pages;

pub use config::Config;

/// Most change-log rows replayed to a reconnecting stream before going live.
const REPLAY_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub admin_password: String,
    pub allow_remote: bool,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            admin_password: zona_live::DEFAULT_ADMIN_PASSWORD.to_string(),
            allow_remote: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: Engine::with_feed_capacity(&config.db_path, config.feed_capacity),
            admin_password: config.admin_password.to_uppercase(),
            allow_remote: config.allow_remote,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let allow_remote = state.allow_remote;
    let api = Router::new()
        .route(routes::API_FACTIONS, get(list_factions))
        .route("/api/factions/{id}", patch(update_faction))
        .route(routes::API_AREAS, get(list_areas))
        .route("/api/areas/{slug}", patch(update_area))
        .route(routes::API_EVENTS, get(list_events).post(create_event))
        .route(
            "/api/events/{id}",
            get(get_event).patch(update_event).delete(delete_event),
        )
        .route(routes::API_REV, get(rev))
        .route(routes::API_UNLOCK, post(unlock))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let router = Router::new()
        .route(routes::LANDING, get(landing))
        .route(routes::MAP, get(map_page))
        .route(routes::ADMIN, get(admin_page))
        .route(routes::HEALTH, get(health))
        .route(routes::API_CHANGES, get(changes))
        .merge(api)
        .with_state(Arc::new(state));

    let router = if allow_remote {
        router
    } else {
        // Local by default: loopback + Tailscale only.
        router.layer(middleware::from_fn(ip_allowlist))
    };
    // Never `Access-Control-Allow-Origin: *`: a random site in the browser could drive
    // the admin API.
    router.layer(local_only_cors())
}

async fn health() -> &'static str {
    "ok"
}

async fn landing() -> Html<&'static str> {
    Html(pages::LANDING_HTML)
}

async fn map_page() -> Html<&'static str> {
    Html(pages::MAP_HTML)
}

async fn admin_page() -> Html<&'static str> {
    Html(pages::ADMIN_HTML)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn hex_color() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("valid color regex"))
}

fn validate_draft(draft: &EventDraft) -> Result<(), ApiError> {
    if draft.message.trim().is_empty() {
        return Err(ApiError::Invalid("message is empty".into()));
    }
    if !hex_color().is_match(&draft.color) {
        return Err(ApiError::Invalid(format!("color {:?} is not #rrggbb", draft.color)));
    }
    Ok(())
}

async fn list_factions(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Faction>> {
    Ok(Json(state.engine.list_factions()?))
}

async fn update_faction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FactionId>,
    Json(input): Json<ReputationUpdate>,
) -> ApiResult<Faction> {
    let faction = state
        .engine
        .update_faction_reputation(id, input.reputation)?
        .ok_or_else(|| ApiError::NotFound(format!("faction {id}")))?;
    tracing::info!(faction = %faction.slug, reputation = faction.reputation, "reputation set");
    Ok(Json(faction))
}

#[derive(Debug, Deserialize)]
struct AreasQuery {
    #[serde(default)]
    with: Option<String>,
}

async fn list_areas(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AreasQuery>,
) -> Result<Response, ApiError> {
    match query.with.as_deref() {
        Some("factions") => Ok(Json(state.engine.list_areas_with_factions()?).into_response()),
        Some(other) => Err(ApiError::Invalid(format!("unknown expansion {other:?}"))),
        None => Ok(Json(state.engine.list_areas()?).into_response()),
    }
}

async fn update_area(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(patch): Json<AreaPatch>,
) -> ApiResult<Area> {
    let area = state
        .engine
        .update_area(&slug, &patch)?
        .ok_or_else(|| ApiError::NotFound(format!("area {slug}")))?;
    tracing::info!(%slug, "area updated");
    Ok(Json(area))
}

async fn list_events(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Event>> {
    Ok(Json(state.engine.list_events()?))
}

async fn create_event(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<EventDraft>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    validate_draft(&draft)?;
    let event = state.engine.insert_event(&draft)?;
    tracing::info!(id = event.id, title = %event.title, "event created");
    Ok((StatusCode::CREATED, Json(event)))
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EventId>,
) -> ApiResult<Event> {
    let event = state
        .engine
        .get_event(id)?
        .ok_or_else(|| ApiError::NotFound(format!("event {id}")))?;
    Ok(Json(event))
}

async fn update_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EventId>,
    Json(draft): Json<EventDraft>,
) -> ApiResult<Event> {
    validate_draft(&draft)?;
    let event = state
        .engine
        .update_event(id, &draft)?
        .ok_or_else(|| ApiError::NotFound(format!("event {id}")))?;
    Ok(Json(event))
}

async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EventId>,
) -> Result<StatusCode, ApiError> {
    if state.engine.delete_event(id)? {
        tracing::info!(id, "event deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("event {id}")))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Rev {
    pub rev: i64,
}

async fn rev(State(state): State<Arc<AppState>>) -> ApiResult<Rev> {
    Ok(Json(Rev {
        rev: state.engine.get_rev()?,
    }))
}

#[derive(Debug, Deserialize)]
struct UnlockInput {
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlockOutput {
    pub ok: bool,
}

/// Same gate the admin page has always had: a shared word, no session, no secrecy.
async fn unlock(
    State(state): State<Arc<AppState>>,
    Json(input): Json<UnlockInput>,
) -> Json<UnlockOutput> {
    let ok = input.password.to_uppercase() == state.admin_password;
    if !ok {
        tracing::debug!("admin unlock refused");
    }
    Json(UnlockOutput { ok })
}

fn change_frame(change: &ChangeNotification) -> SseEvent {
    let frame = SseEvent::default()
        .event(sse::CHANGE)
        .id(change.seq.to_string());
    match serde_json::to_string(change) {
        Ok(json) => frame.data(json),
        Err(err) => {
            tracing::warn!(seq = change.seq, error = %err, "change did not encode");
            frame.comment("encode failed")
        }
    }
}

/// Live change stream. A client that reconnects with `Last-Event-ID` first gets the
/// changes it missed from the log; delivery is at-least-once, so the overlap between
/// replay and live is left for the client to discard.
async fn changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.engine.listen();
    let after = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());
    let replay = match after {
        Some(seq) => state
            .engine
            .changes_since(seq, REPLAY_LIMIT)
            .unwrap_or_else(|err| {
                tracing::warn!(seq, error = %format!("{err:#}"), "replay failed");
                Vec::new()
            }),
        None => Vec::new(),
    };
    tracing::debug!(replayed = replay.len(), "change stream opened");

    let replay = stream::iter(replay).map(|change| Ok(change_frame(&change)));
    let live = BroadcastStream::new(rx).map(|item| {
        Ok(match item {
            Ok(change) => change_frame(&change),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "change stream subscriber lagged");
                SseEvent::default()
                    .event(sse::LAGGED)
                    .data(missed.to_string())
            }
        })
    });
    Sse::new(replay.chain(live)).keep_alive(KeepAlive::default())
}

/// One line of the event log as plain text; `||x||` segments come out as `*x*`.
pub fn format_log_line(event: &Event) -> String {
    let title: String = highlight_spans(&event.title)
        .into_iter()
        .map(|span| {
            if span.highlighted {
                format!("*{}*", span.text)
            } else {
                span.text.to_string()
            }
        })
        .collect();
    let time = event.created_at.get(11..16).unwrap_or("--:--");
    match &event.location_name {
        Some(place) => format!("[{title}] {time} @ {place}: {}", event.message),
        None => format!("[{title}] {time}: {}", event.message),
    }
}

/// One area as a plain-text line: holder, reputation and standing.
pub fn format_area_line(entry: &AreaWithFaction) -> String {
    match &entry.factions {
        Some(faction) => format!(
            "{} [{}] {} {}% ({})",
            entry.area.name,
            entry.area.danger,
            faction.name,
            faction.reputation,
            faction.standing().as_str()
        ),
        None => format!("{} [{}] contested", entry.area.name, entry.area.danger),
    }
}

/// Lines `watch` prints for a published map state. The first state after mount yields
/// the areas and the existing log (oldest first), even when the log is empty; later
/// states yield nothing because arrivals are printed as they come. Arrivals already in
/// the first observed state sit on top of the log and are skipped.
#[derive(Debug, Default)]
pub struct LogBacklog {
    printed: bool,
}

impl LogBacklog {
    pub fn take(&mut self, state: &MapState) -> Vec<String> {
        if std::mem::replace(&mut self.printed, true) {
            return Vec::new();
        }
        let mut lines: Vec<String> = state.areas.iter().map(format_area_line).collect();
        let arrived = usize::try_from(state.arrivals).unwrap_or(usize::MAX);
        lines.extend(state.events.iter().skip(arrived).rev().map(format_log_line));
        lines
    }
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(&config);
    state.engine.open()?;
    if config.seed_demo {
        state.engine.seed_defaults()?;
    }
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!(addr = %listener.local_addr()?, db = %config.db_path.display(), "zona server listening");
    serve_listener(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    tracing::debug!(%ip, "peer refused");
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| is_allowed_peer_ip(IpAddr::V4(v4))),
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static("last-event-id")])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}
