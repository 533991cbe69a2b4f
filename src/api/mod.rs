// HTTP API routes (identity, challenges, tournaments, bot webhook).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Json, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{self, AuthUser};
use crate::bot;
use crate::challenge::{self, SelfReport, Submission};
use crate::config::Config;
use crate::db::{
    Challenge, ChallengeSummary, Database, Match, RatingHistoryEntry, Tournament,
    TournamentParticipant, TournamentSummary,
};
use crate::error::{AppError, Result};
use crate::identity::{self, LeaderboardEntry};
use crate::metrics;
use crate::tournament::{self, NewTournament};

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateChallengeRequest {
    pub challenged_username: String,
}

#[derive(Deserialize)]
pub struct SubmitResultRequest {
    pub result: String,
}

#[derive(Deserialize)]
pub struct CreateTournamentRequest {
    pub title: String,
    pub spot_id: i64,
    #[serde(alias = "scheduled_at")]
    pub datetime: String,
    pub description: Option<String>,
}

/// `Json` body extractor whose rejections use the `{"error": ...}` body.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<Config>,
}

/// Local wall-clock time; challenge limits use its calendar date.
fn local_now() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(db: Arc<Database>, config: Arc<Config>) -> Router {
    metrics::register_metrics();
    let state = AppState { db, config };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Auth
        .route("/api/auth/telegram", post(auth::telegram_auth))
        .route("/api/auth/me", get(auth::me))
        // Ratings
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/user/{id}/history", get(user_history))
        // Challenges
        .route(
            "/api/challenges",
            get(list_challenges).post(create_challenge),
        )
        .route("/api/challenges/{id}/accept", post(accept_challenge))
        .route("/api/challenges/{id}/decline", post(decline_challenge))
        .route("/api/challenges/{id}/result", post(submit_result))
        // Tournaments
        .route(
            "/api/tournaments",
            get(list_tournaments).post(create_tournament),
        )
        .route("/api/tournaments/{id}/join", post(join_tournament))
        .route("/api/tournaments/{id}/start", post(start_tournament))
        .route("/api/tournaments/{id}/matches", get(tournament_matches))
        // Telegram bot
        .route("/api/bot/webhook", post(bot::webhook))
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

/// Count and time every request, labelled by normalized path.
async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let started = Instant::now();

    let response = next.run(req).await;

    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(started.elapsed().as_secs_f64());
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), endpoint.as_str(), response.status().as_str()])
        .inc();
    response
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "pingpong-backend" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── Rating handlers ──────────────────────────────────────────────────

async fn leaderboard(State(state): State<AppState>) -> Result<Json<Vec<LeaderboardEntry>>> {
    Ok(Json(identity::leaderboard(&state.db).await?))
}

async fn user_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<RatingHistoryEntry>>> {
    Ok(Json(identity::rating_history(&state.db, id).await?))
}

// ── Challenge handlers ───────────────────────────────────────────────

async fn list_challenges(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<ChallengeSummary>>> {
    Ok(Json(
        challenge::list_for_user(&state.db, auth.id(), None).await?,
    ))
}

async fn create_challenge(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CreateChallengeRequest>,
) -> Result<(StatusCode, Json<Challenge>)> {
    let created =
        challenge::create(&state.db, auth.id(), &req.challenged_username, local_now()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn accept_challenge(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Challenge>> {
    Ok(Json(
        challenge::accept(&state.db, id, auth.id(), local_now()).await?,
    ))
}

async fn decline_challenge(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Challenge>> {
    Ok(Json(
        challenge::decline(&state.db, id, auth.id(), local_now()).await?,
    ))
}

async fn submit_result(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<SubmitResultRequest>,
) -> Result<Json<Submission>> {
    let result = SelfReport::from_str_name(req.result.trim())
        .ok_or_else(|| AppError::invalid_argument("Result must be 'won' or 'lost'"))?;
    Ok(Json(
        challenge::submit_result(&state.db, id, auth.id(), result, local_now()).await?,
    ))
}

// ── Tournament handlers ──────────────────────────────────────────────

async fn list_tournaments(State(state): State<AppState>) -> Result<Json<Vec<TournamentSummary>>> {
    Ok(Json(tournament::list(&state.db).await?))
}

async fn create_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(req): ApiJson<CreateTournamentRequest>,
) -> Result<(StatusCode, Json<Tournament>)> {
    let new = NewTournament {
        title: req.title,
        spot_id: req.spot_id,
        scheduled_at: tournament::parse_scheduled_at(&req.datetime)?,
        description: req.description,
    };
    let created = tournament::create(&state.db, auth.id(), new).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn join_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<TournamentParticipant>> {
    Ok(Json(tournament::join(&state.db, id, auth.id()).await?))
}

async fn start_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Match>>> {
    let mut rng = StdRng::from_entropy();
    Ok(Json(
        tournament::start(&state.db, id, auth.id(), &mut rng, local_now()).await?,
    ))
}

async fn tournament_matches(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Match>>> {
    Ok(Json(tournament::matches(&state.db, id).await?))
}
