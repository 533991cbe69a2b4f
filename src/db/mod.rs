// Database access layer (SQLite via sqlx).
//
// Query functions take a plain connection so the lifecycle modules can run
// them on a pooled connection or inside a transaction.

use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
};
use sqlx::pool::PoolConnection;
use sqlx::Transaction;

use crate::challenge::{ChallengeStatus, SelfReport, Side};
use crate::elo::{RatingChange, STARTING_RATING};
use crate::tournament::TournamentStatus;

/// Format used for every timestamp column; matches SQLite's `datetime()`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How long a writer waits for the SQLite write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

// ── Rows ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub rating: i32,
    pub is_admin: bool,
    pub created_at: String,
}

impl User {
    /// Name used in chat replies and listings.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.first_name.clone())
            .unwrap_or_else(|| format!("user{}", self.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Challenge {
    pub id: i64,
    pub challenger_id: i64,
    pub challenged_id: i64,
    pub status: ChallengeStatus,
    pub challenger_result: Option<SelfReport>,
    pub challenged_result: Option<SelfReport>,
    pub match_id: Option<i64>,
    pub created_at: String,
    pub accepted_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A challenge joined with both usernames, as shown in listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChallengeSummary {
    pub id: i64,
    pub challenger_id: i64,
    pub challenged_id: i64,
    pub challenger_username: Option<String>,
    pub challenged_username: Option<String>,
    pub status: ChallengeStatus,
    pub created_at: String,
    /// Whether the listing user created the challenge.
    pub is_challenger: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Match {
    pub id: i64,
    pub player1_id: i64,
    pub player2_id: i64,
    pub winner_id: Option<i64>,
    pub loser_id: Option<i64>,
    pub score: Option<String>,
    pub spot_id: Option<i64>,
    pub is_rated: bool,
    pub tournament_id: Option<i64>,
    pub created_at: String,
}

/// Fields for a match about to be inserted.
#[derive(Debug, Clone, Default)]
pub struct NewMatch {
    pub player1_id: i64,
    pub player2_id: i64,
    pub winner_id: Option<i64>,
    pub loser_id: Option<i64>,
    pub score: Option<String>,
    pub spot_id: Option<i64>,
    pub is_rated: bool,
    pub tournament_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RatingHistory {
    pub id: i64,
    pub user_id: i64,
    pub match_id: i64,
    pub rating_before: i32,
    pub rating_after: i32,
    pub change: i32,
    pub created_at: String,
}

/// A history row joined with its match, from one user's point of view.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RatingHistoryEntry {
    pub match_id: i64,
    pub date: String,
    pub opponent_id: i64,
    pub score: Option<String>,
    pub rating_before: i32,
    pub rating_after: i32,
    pub change: i32,
    pub is_win: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tournament {
    pub id: i64,
    pub title: String,
    pub spot_id: i64,
    pub scheduled_at: String,
    pub description: Option<String>,
    pub created_by: i64,
    pub status: TournamentStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TournamentSummary {
    pub id: i64,
    pub title: String,
    pub spot_id: i64,
    pub scheduled_at: String,
    pub description: Option<String>,
    pub status: TournamentStatus,
    pub created_at: String,
    pub participants_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TournamentParticipant {
    pub id: i64,
    pub tournament_id: i64,
    pub user_id: i64,
    pub result_place: Option<i32>,
    pub registered_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Location {
    pub id: i64,
    pub user_id: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
    pub description: String,
    pub tables_count: i32,
    pub net_type: Option<String>,
    pub has_roof: bool,
    pub created_at: String,
}

/// Mutable profile fields supplied by the chat platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
}

// ── Pool and schema ──────────────────────────────────────────────────

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        // Every connection to `sqlite::memory:` is a separate database, so
        // in-memory pools are pinned to one long-lived connection.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect_with(connect_options).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        self.pool.acquire().await
    }

    /// Start a write transaction. The write lock is taken up front, so
    /// overlapping transactions wait on the busy timeout in turn.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL UNIQUE,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                avatar_url TEXT,
                is_admin INTEGER NOT NULL DEFAULT 0,
                rating INTEGER NOT NULL DEFAULT 1200,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER REFERENCES users(id),
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                tables_count INTEGER NOT NULL DEFAULT 1,
                net_type TEXT,
                has_roof INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS photos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES locations(id),
                file_path TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ratings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                location_id INTEGER NOT NULL REFERENCES locations(id),
                score INTEGER NOT NULL CHECK (score BETWEEN 1 AND 5),
                comment TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournaments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                spot_id INTEGER NOT NULL REFERENCES locations(id),
                scheduled_at TEXT NOT NULL,
                description TEXT,
                created_by INTEGER NOT NULL REFERENCES users(id),
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tournament_participants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tournament_id INTEGER NOT NULL REFERENCES tournaments(id),
                user_id INTEGER NOT NULL REFERENCES users(id),
                result_place INTEGER,
                registered_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
                UNIQUE(tournament_id, user_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player1_id INTEGER NOT NULL REFERENCES users(id),
                player2_id INTEGER NOT NULL REFERENCES users(id),
                winner_id INTEGER REFERENCES users(id),
                loser_id INTEGER REFERENCES users(id),
                score TEXT,
                spot_id INTEGER REFERENCES locations(id),
                is_rated INTEGER NOT NULL DEFAULT 1,
                tournament_id INTEGER REFERENCES tournaments(id),
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_rating_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                match_id INTEGER NOT NULL REFERENCES matches(id),
                rating_before INTEGER NOT NULL,
                rating_after INTEGER NOT NULL,
                change INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS challenges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                challenger_id INTEGER NOT NULL REFERENCES users(id),
                challenged_id INTEGER NOT NULL REFERENCES users(id),
                status TEXT NOT NULL DEFAULT 'pending',
                challenger_result TEXT,
                challenged_result TEXT,
                match_id INTEGER REFERENCES matches(id),
                created_at TEXT NOT NULL,
                accepted_at TEXT,
                completed_at TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_challenges_challenger ON challenges (challenger_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ── Users ────────────────────────────────────────────────────────────

const USER_COLUMNS: &str =
    "id, telegram_id, username, first_name, last_name, avatar_url, rating, is_admin, created_at";

pub async fn get_user(conn: &mut SqliteConnection, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
}

pub async fn get_user_by_telegram_id(
    conn: &mut SqliteConnection,
    telegram_id: i64,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ?"
    ))
    .bind(telegram_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Usernames are matched case-insensitively, as chat platforms treat them.
pub async fn get_user_by_username(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = ? COLLATE NOCASE ORDER BY id LIMIT 1"
    ))
    .bind(username)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn insert_user(
    conn: &mut SqliteConnection,
    telegram_id: i64,
    profile: &Profile,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (telegram_id, username, first_name, last_name, avatar_url, rating, is_admin) \
         VALUES (?, ?, ?, ?, ?, ?, 0) RETURNING {USER_COLUMNS}"
    ))
    .bind(telegram_id)
    .bind(&profile.username)
    .bind(&profile.first_name)
    .bind(&profile.last_name)
    .bind(&profile.avatar_url)
    .bind(STARTING_RATING)
    .fetch_one(&mut *conn)
    .await
}

pub async fn update_user_profile(
    conn: &mut SqliteConnection,
    id: i64,
    profile: &Profile,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET username = ?, first_name = ?, last_name = ?, avatar_url = ? \
         WHERE id = ? RETURNING {USER_COLUMNS}"
    ))
    .bind(&profile.username)
    .bind(&profile.first_name)
    .bind(&profile.last_name)
    .bind(&profile.avatar_url)
    .bind(id)
    .fetch_one(&mut *conn)
    .await
}

pub async fn set_user_rating(
    conn: &mut SqliteConnection,
    id: i64,
    rating: i32,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET rating = ? WHERE id = ?")
        .bind(rating)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Flip the admin flag only if it differs from `is_admin`.
pub async fn set_user_admin(
    conn: &mut SqliteConnection,
    id: i64,
    is_admin: bool,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET is_admin = ? WHERE id = ? AND is_admin <> ?")
        .bind(is_admin)
        .bind(id)
        .bind(is_admin)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_users_by_rating(conn: &mut SqliteConnection) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY rating DESC, id"
    ))
    .fetch_all(&mut *conn)
    .await
}

// ── Challenges ───────────────────────────────────────────────────────

const CHALLENGE_COLUMNS: &str = "id, challenger_id, challenged_id, status, challenger_result, \
     challenged_result, match_id, created_at, accepted_at, completed_at";

pub async fn get_challenge(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Challenge>, sqlx::Error> {
    sqlx::query_as::<_, Challenge>(&format!(
        "SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn insert_challenge(
    conn: &mut SqliteConnection,
    challenger_id: i64,
    challenged_id: i64,
    now: NaiveDateTime,
) -> Result<Challenge, sqlx::Error> {
    sqlx::query_as::<_, Challenge>(&format!(
        "INSERT INTO challenges (challenger_id, challenged_id, status, created_at) \
         VALUES (?, ?, ?, ?) RETURNING {CHALLENGE_COLUMNS}"
    ))
    .bind(challenger_id)
    .bind(challenged_id)
    .bind(ChallengeStatus::Pending)
    .bind(timestamp(now))
    .fetch_one(&mut *conn)
    .await
}

/// Count challenges a user created in `[from, until)`.
pub async fn count_challenges_created_between(
    conn: &mut SqliteConnection,
    challenger_id: i64,
    from: NaiveDateTime,
    until: NaiveDateTime,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM challenges WHERE challenger_id = ? AND created_at >= ? AND created_at < ?",
    )
    .bind(challenger_id)
    .bind(timestamp(from))
    .bind(timestamp(until))
    .fetch_one(&mut *conn)
    .await
}

pub async fn find_active_challenge(
    conn: &mut SqliteConnection,
    challenger_id: i64,
    challenged_id: i64,
) -> Result<Option<Challenge>, sqlx::Error> {
    sqlx::query_as::<_, Challenge>(&format!(
        "SELECT {CHALLENGE_COLUMNS} FROM challenges \
         WHERE challenger_id = ? AND challenged_id = ? AND status IN (?, ?) LIMIT 1"
    ))
    .bind(challenger_id)
    .bind(challenged_id)
    .bind(ChallengeStatus::Pending)
    .bind(ChallengeStatus::Accepted)
    .fetch_optional(&mut *conn)
    .await
}

/// Move a challenge from `pending` to `accepted` or `declined`.
/// Returns false when the challenge was no longer pending.
pub async fn resolve_pending_challenge(
    conn: &mut SqliteConnection,
    id: i64,
    to: ChallengeStatus,
    now: NaiveDateTime,
) -> Result<bool, sqlx::Error> {
    let accepted_at = (to == ChallengeStatus::Accepted).then(|| timestamp(now));
    let result = sqlx::query(
        "UPDATE challenges SET status = ?, accepted_at = COALESCE(?, accepted_at) \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(accepted_at)
    .bind(id)
    .bind(ChallengeStatus::Pending)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Store one side's self-report while the challenge is `accepted`.
pub async fn record_challenge_result(
    conn: &mut SqliteConnection,
    id: i64,
    side: Side,
    result: SelfReport,
) -> Result<bool, sqlx::Error> {
    let sql = match side {
        Side::Challenger => {
            "UPDATE challenges SET challenger_result = ? WHERE id = ? AND status = ?"
        }
        Side::Challenged => {
            "UPDATE challenges SET challenged_result = ? WHERE id = ? AND status = ?"
        }
    };
    let result = sqlx::query(sql)
        .bind(result)
        .bind(id)
        .bind(ChallengeStatus::Accepted)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Test-and-set `accepted -> completed`. Only one caller can ever win.
pub async fn complete_challenge(
    conn: &mut SqliteConnection,
    id: i64,
    match_id: i64,
    now: NaiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE challenges SET status = ?, match_id = ?, completed_at = ? \
         WHERE id = ? AND status = ?",
    )
    .bind(ChallengeStatus::Completed)
    .bind(match_id)
    .bind(timestamp(now))
    .bind(id)
    .bind(ChallengeStatus::Accepted)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn list_challenges_for_user(
    conn: &mut SqliteConnection,
    user_id: i64,
    limit: Option<i64>,
) -> Result<Vec<ChallengeSummary>, sqlx::Error> {
    sqlx::query_as::<_, ChallengeSummary>(
        r#"
        SELECT c.id, c.challenger_id, c.challenged_id,
               a.username AS challenger_username,
               b.username AS challenged_username,
               c.status, c.created_at,
               (c.challenger_id = ?1) AS is_challenger
          FROM challenges c
          LEFT JOIN users a ON a.id = c.challenger_id
          LEFT JOIN users b ON b.id = c.challenged_id
         WHERE c.challenger_id = ?1 OR c.challenged_id = ?1
         ORDER BY c.created_at DESC, c.id DESC
         LIMIT ?2
        "#,
    )
    .bind(user_id)
    .bind(limit.unwrap_or(-1))
    .fetch_all(&mut *conn)
    .await
}

// ── Matches ──────────────────────────────────────────────────────────

const MATCH_COLUMNS: &str = "id, player1_id, player2_id, winner_id, loser_id, score, spot_id, \
     is_rated, tournament_id, created_at";

pub async fn insert_match(
    conn: &mut SqliteConnection,
    new: &NewMatch,
    now: NaiveDateTime,
) -> Result<Match, sqlx::Error> {
    sqlx::query_as::<_, Match>(&format!(
        "INSERT INTO matches (player1_id, player2_id, winner_id, loser_id, score, spot_id, is_rated, tournament_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {MATCH_COLUMNS}"
    ))
    .bind(new.player1_id)
    .bind(new.player2_id)
    .bind(new.winner_id)
    .bind(new.loser_id)
    .bind(&new.score)
    .bind(new.spot_id)
    .bind(new.is_rated)
    .bind(new.tournament_id)
    .bind(timestamp(now))
    .fetch_one(&mut *conn)
    .await
}

pub async fn list_tournament_matches(
    conn: &mut SqliteConnection,
    tournament_id: i64,
) -> Result<Vec<Match>, sqlx::Error> {
    sqlx::query_as::<_, Match>(&format!(
        "SELECT {MATCH_COLUMNS} FROM matches WHERE tournament_id = ? ORDER BY id"
    ))
    .bind(tournament_id)
    .fetch_all(&mut *conn)
    .await
}

pub async fn count_matches(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM matches")
        .fetch_one(&mut *conn)
        .await
}

// ── Rating history ───────────────────────────────────────────────────

pub async fn insert_rating_history(
    conn: &mut SqliteConnection,
    user_id: i64,
    match_id: i64,
    change: &RatingChange,
    now: NaiveDateTime,
) -> Result<RatingHistory, sqlx::Error> {
    sqlx::query_as::<_, RatingHistory>(
        "INSERT INTO user_rating_history (user_id, match_id, rating_before, rating_after, change, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING id, user_id, match_id, rating_before, rating_after, change, created_at",
    )
    .bind(user_id)
    .bind(match_id)
    .bind(change.before)
    .bind(change.after)
    .bind(change.change)
    .bind(timestamp(now))
    .fetch_one(&mut *conn)
    .await
}

pub async fn list_match_rating_history(
    conn: &mut SqliteConnection,
    match_id: i64,
) -> Result<Vec<RatingHistory>, sqlx::Error> {
    sqlx::query_as::<_, RatingHistory>(
        "SELECT id, user_id, match_id, rating_before, rating_after, change, created_at \
         FROM user_rating_history WHERE match_id = ? ORDER BY id",
    )
    .bind(match_id)
    .fetch_all(&mut *conn)
    .await
}

pub async fn list_user_rating_history(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<RatingHistoryEntry>, sqlx::Error> {
    sqlx::query_as::<_, RatingHistoryEntry>(
        r#"
        SELECT h.match_id,
               m.created_at AS date,
               CASE WHEN m.player1_id = ?1 THEN m.player2_id ELSE m.player1_id END AS opponent_id,
               m.score,
               h.rating_before, h.rating_after, h.change,
               COALESCE(m.winner_id = ?1, 0) AS is_win
          FROM user_rating_history h
          JOIN matches m ON m.id = h.match_id
         WHERE h.user_id = ?1
         ORDER BY h.created_at DESC, h.id DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await
}

// ── Tournaments ──────────────────────────────────────────────────────

const TOURNAMENT_COLUMNS: &str =
    "id, title, spot_id, scheduled_at, description, created_by, status, created_at";

pub async fn insert_tournament(
    conn: &mut SqliteConnection,
    title: &str,
    spot_id: i64,
    scheduled_at: NaiveDateTime,
    description: Option<&str>,
    created_by: i64,
) -> Result<Tournament, sqlx::Error> {
    sqlx::query_as::<_, Tournament>(&format!(
        "INSERT INTO tournaments (title, spot_id, scheduled_at, description, created_by, status) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {TOURNAMENT_COLUMNS}"
    ))
    .bind(title)
    .bind(spot_id)
    .bind(timestamp(scheduled_at))
    .bind(description)
    .bind(created_by)
    .bind(TournamentStatus::Open)
    .fetch_one(&mut *conn)
    .await
}

pub async fn get_tournament(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Tournament>, sqlx::Error> {
    sqlx::query_as::<_, Tournament>(&format!(
        "SELECT {TOURNAMENT_COLUMNS} FROM tournaments WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn list_tournament_summaries(
    conn: &mut SqliteConnection,
) -> Result<Vec<TournamentSummary>, sqlx::Error> {
    sqlx::query_as::<_, TournamentSummary>(
        r#"
        SELECT t.id, t.title, t.spot_id, t.scheduled_at, t.description, t.status, t.created_at,
               COUNT(p.id) AS participants_count
          FROM tournaments t
          LEFT JOIN tournament_participants p ON p.tournament_id = t.id
         GROUP BY t.id
         ORDER BY t.created_at DESC, t.id DESC
        "#,
    )
    .fetch_all(&mut *conn)
    .await
}

/// Test-and-set `open -> started`.
pub async fn mark_tournament_started(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE tournaments SET status = ? WHERE id = ? AND status = ?")
        .bind(TournamentStatus::Started)
        .bind(id)
        .bind(TournamentStatus::Open)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn insert_participant(
    conn: &mut SqliteConnection,
    tournament_id: i64,
    user_id: i64,
) -> Result<TournamentParticipant, sqlx::Error> {
    sqlx::query_as::<_, TournamentParticipant>(
        "INSERT INTO tournament_participants (tournament_id, user_id) VALUES (?, ?) \
         RETURNING id, tournament_id, user_id, result_place, registered_at",
    )
    .bind(tournament_id)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
}

pub async fn is_participant(
    conn: &mut SqliteConnection,
    tournament_id: i64,
    user_id: i64,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tournament_participants WHERE tournament_id = ? AND user_id = ?",
    )
    .bind(tournament_id)
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

pub async fn list_participant_ids(
    conn: &mut SqliteConnection,
    tournament_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT user_id FROM tournament_participants WHERE tournament_id = ? ORDER BY id",
    )
    .bind(tournament_id)
    .fetch_all(&mut *conn)
    .await
}

// ── Locations ────────────────────────────────────────────────────────

pub async fn get_location(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Location>, sqlx::Error> {
    sqlx::query_as::<_, Location>(
        "SELECT id, user_id, latitude, longitude, name, description, tables_count, net_type, has_roof, created_at \
         FROM locations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn insert_location(
    conn: &mut SqliteConnection,
    user_id: Option<i64>,
    name: &str,
    latitude: f64,
    longitude: f64,
) -> Result<Location, sqlx::Error> {
    sqlx::query_as::<_, Location>(
        "INSERT INTO locations (user_id, name, latitude, longitude) VALUES (?, ?, ?, ?) \
         RETURNING id, user_id, latitude, longitude, name, description, tables_count, net_type, has_roof, created_at",
    )
    .bind(user_id)
    .bind(name)
    .bind(latitude)
    .bind(longitude)
    .fetch_one(&mut *conn)
    .await
}
