// User identity: external chat id -> local user record, admin management,
// and the read-only rating views.

use serde::Serialize;
use sqlx::sqlite::SqliteConnection;

use crate::db::{self, Database, Profile, RatingHistoryEntry, User};
use crate::error::{AppError, Result};

/// Look up the user by chat id, creating them with the starting rating if
/// absent. Known users get their profile fields overwritten on every call.
pub async fn resolve(db: &Database, telegram_id: i64, profile: &Profile) -> Result<User> {
    let mut tx = db.begin().await?;

    let user = match db::get_user_by_telegram_id(&mut tx, telegram_id).await? {
        Some(existing) => db::update_user_profile(&mut tx, existing.id, profile).await?,
        None => {
            let user = db::insert_user(&mut tx, telegram_id, profile).await?;
            tracing::info!(
                "Registered user {} (telegram id {telegram_id})",
                user.id
            );
            user
        }
    };
    tx.commit().await?;
    Ok(user)
}

pub async fn get(db: &Database, user_id: i64) -> Result<User> {
    let mut conn = db.acquire().await?;
    db::get_user(&mut conn, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}

/// The actor as an admin, or Forbidden.
pub(crate) async fn require_admin(conn: &mut SqliteConnection, actor_id: i64) -> Result<User> {
    match db::get_user(conn, actor_id).await? {
        Some(user) if user.is_admin => Ok(user),
        _ => Err(AppError::forbidden("Admin rights required")),
    }
}

/// Grant or revoke admin rights on the user named `username`.
pub async fn set_admin(
    db: &Database,
    actor_id: i64,
    username: &str,
    is_admin: bool,
) -> Result<User> {
    let username = username.trim().trim_start_matches('@');
    let mut tx = db.begin().await?;

    require_admin(&mut tx, actor_id).await?;

    let target = db::get_user_by_username(&mut tx, username)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    if !db::set_user_admin(&mut tx, target.id, is_admin).await? {
        return Err(AppError::invalid_state(if is_admin {
            "User is already an admin"
        } else {
            "User is not an admin"
        }));
    }

    let target = db::get_user(&mut tx, target.id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;
    tx.commit().await?;

    tracing::info!(
        "User {actor_id} {} admin rights for user {}",
        if is_admin { "granted" } else { "revoked" },
        target.id
    );
    Ok(target)
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub place: usize,
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar_url: Option<String>,
    pub rating: i32,
}

pub async fn leaderboard(db: &Database) -> Result<Vec<LeaderboardEntry>> {
    let mut conn = db.acquire().await?;
    let users = db::list_users_by_rating(&mut conn).await?;
    Ok(users
        .into_iter()
        .enumerate()
        .map(|(i, u)| LeaderboardEntry {
            place: i + 1,
            id: u.id,
            username: u.username,
            first_name: u.first_name,
            last_name: u.last_name,
            avatar_url: u.avatar_url,
            rating: u.rating,
        })
        .collect())
}

pub async fn rating_history(db: &Database, user_id: i64) -> Result<Vec<RatingHistoryEntry>> {
    let mut conn = db.acquire().await?;
    if db::get_user(&mut conn, user_id).await?.is_none() {
        return Err(AppError::not_found("User not found"));
    }
    Ok(db::list_user_rating_history(&mut conn, user_id).await?)
}
