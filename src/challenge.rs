// Challenge lifecycle: pending -> {accepted, declined}, accepted -> completed.
//
// Every transition runs in one transaction and is guarded by a conditional
// UPDATE on the current status, so a challenge completes exactly once.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;

use crate::db::{self, Challenge, ChallengeSummary, Database, Match, NewMatch, User};
use crate::elo::{self, MatchRating};
use crate::error::{AppError, Result};
use crate::metrics;

/// Score stored on challenge matches until score entry exists.
pub const PLACEHOLDER_SCORE: &str = "21:19";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Accepted,
    Declined,
    Completed,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Completed => "completed",
        }
    }
}

/// A player's own report of how the match went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SelfReport {
    Won,
    Lost,
}

impl SelfReport {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }
}

/// Which end of a challenge a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Challenger,
    Challenged,
}

impl Challenge {
    pub fn side_of(&self, user_id: i64) -> Option<Side> {
        if user_id == self.challenger_id {
            Some(Side::Challenger)
        } else if user_id == self.challenged_id {
            Some(Side::Challenged)
        } else {
            None
        }
    }

    /// Winner and loser ids once both sides reported complementary results.
    pub fn decided_outcome(&self) -> Option<(i64, i64)> {
        match (self.challenger_result, self.challenged_result) {
            (Some(SelfReport::Won), Some(SelfReport::Lost)) => {
                Some((self.challenger_id, self.challenged_id))
            }
            (Some(SelfReport::Lost), Some(SelfReport::Won)) => {
                Some((self.challenged_id, self.challenger_id))
            }
            _ => None,
        }
    }
}

/// Outcome of a result submission.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Submission {
    /// The report was stored; the other side has not reported yet.
    Recorded { challenge: Challenge },
    /// Both sides agreed: the match is recorded and ratings moved.
    Completed(Box<Completion>),
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub challenge: Challenge,
    #[serde(rename = "match")]
    pub match_record: Match,
    pub winner: User,
    pub loser: User,
    pub rating: MatchRating,
}

fn day_bounds(now: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
    let start = now.date().and_time(NaiveTime::MIN);
    (start, start + Duration::days(1))
}

async fn load(conn: &mut SqliteConnection, challenge_id: i64) -> Result<Challenge> {
    db::get_challenge(conn, challenge_id)
        .await?
        .ok_or_else(|| AppError::not_found("Challenge not found"))
}

/// Create a pending challenge from `challenger_id` to the user named
/// `challenged_username`. `now` is local wall-clock time; the one-per-day
/// limit uses its calendar date.
pub async fn create(
    db: &Database,
    challenger_id: i64,
    challenged_username: &str,
    now: NaiveDateTime,
) -> Result<Challenge> {
    let username = challenged_username.trim().trim_start_matches('@');
    let mut tx = db.begin().await?;

    if db::get_user(&mut tx, challenger_id).await?.is_none() {
        return Err(AppError::not_found("Challenger not found"));
    }

    let challenged = db::get_user_by_username(&mut tx, username)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))?;

    if challenged.id == challenger_id {
        return Err(AppError::invalid_argument("Cannot challenge yourself"));
    }

    let (day_start, day_end) = day_bounds(now);
    let today = db::count_challenges_created_between(&mut tx, challenger_id, day_start, day_end)
        .await?;
    if today > 0 {
        tracing::debug!("User {challenger_id} already created a challenge on {}", now.date());
        return Err(AppError::rate_limited(
            "You can only create one challenge per day",
        ));
    }

    if db::find_active_challenge(&mut tx, challenger_id, challenged.id)
        .await?
        .is_some()
    {
        return Err(AppError::conflict(
            "You already have an active challenge with this user",
        ));
    }

    let challenge = db::insert_challenge(&mut tx, challenger_id, challenged.id, now).await?;
    tx.commit().await?;

    metrics::CHALLENGES_CREATED_TOTAL.inc();
    tracing::info!(
        "Challenge {} created: user {} -> user {}",
        challenge.id,
        challenger_id,
        challenged.id
    );
    Ok(challenge)
}

/// Accept a pending challenge. Only the challenged user may accept.
pub async fn accept(
    db: &Database,
    challenge_id: i64,
    actor_id: i64,
    now: NaiveDateTime,
) -> Result<Challenge> {
    resolve_pending(db, challenge_id, actor_id, ChallengeStatus::Accepted, now).await
}

/// Decline a pending challenge. Only the challenged user may decline.
pub async fn decline(
    db: &Database,
    challenge_id: i64,
    actor_id: i64,
    now: NaiveDateTime,
) -> Result<Challenge> {
    resolve_pending(db, challenge_id, actor_id, ChallengeStatus::Declined, now).await
}

async fn resolve_pending(
    db: &Database,
    challenge_id: i64,
    actor_id: i64,
    to: ChallengeStatus,
    now: NaiveDateTime,
) -> Result<Challenge> {
    let mut tx = db.begin().await?;
    let challenge = load(&mut tx, challenge_id).await?;

    if challenge.challenged_id != actor_id {
        return Err(AppError::forbidden(format!(
            "You can only {} challenges sent to you",
            if to == ChallengeStatus::Accepted {
                "accept"
            } else {
                "decline"
            }
        )));
    }

    if challenge.status != ChallengeStatus::Pending
        || !db::resolve_pending_challenge(&mut tx, challenge_id, to, now).await?
    {
        return Err(AppError::invalid_state("Challenge is not pending"));
    }

    let challenge = load(&mut tx, challenge_id).await?;
    tx.commit().await?;

    metrics::CHALLENGE_TRANSITIONS_TOTAL
        .with_label_values(&[to.as_str()])
        .inc();
    tracing::info!("Challenge {challenge_id} {} by user {actor_id}", to.as_str());
    Ok(challenge)
}

/// Record the actor's self-reported result. When both sides have reported
/// complementary results the challenge completes: a rated match is created
/// and both ratings are updated.
pub async fn submit_result(
    db: &Database,
    challenge_id: i64,
    actor_id: i64,
    result: SelfReport,
    now: NaiveDateTime,
) -> Result<Submission> {
    let mut tx = db.begin().await?;
    let challenge = load(&mut tx, challenge_id).await?;

    let side = challenge
        .side_of(actor_id)
        .ok_or_else(|| AppError::forbidden("You are not part of this challenge"))?;

    if challenge.status != ChallengeStatus::Accepted
        || !db::record_challenge_result(&mut tx, challenge_id, side, result).await?
    {
        return Err(AppError::invalid_state("Challenge is not accepted"));
    }

    let challenge = load(&mut tx, challenge_id).await?;
    let (Some(challenger_result), Some(challenged_result)) =
        (challenge.challenger_result, challenge.challenged_result)
    else {
        tx.commit().await?;
        tracing::info!(
            "Challenge {challenge_id}: user {actor_id} reported {}",
            result.as_str()
        );
        return Ok(Submission::Recorded { challenge });
    };

    // Dropping the transaction discards this report; the caller resubmits.
    if challenger_result == challenged_result {
        tracing::warn!(
            "Challenge {challenge_id}: both players reported {}",
            result.as_str()
        );
        return Err(AppError::conflict(
            "Both players cannot have the same result",
        ));
    }

    let (winner_id, loser_id) = challenge
        .decided_outcome()
        .ok_or_else(|| AppError::conflict("Both players cannot have the same result"))?;

    let match_record = db::insert_match(
        &mut tx,
        &NewMatch {
            player1_id: challenge.challenger_id,
            player2_id: challenge.challenged_id,
            winner_id: Some(winner_id),
            loser_id: Some(loser_id),
            score: Some(PLACEHOLDER_SCORE.to_string()),
            is_rated: true,
            ..NewMatch::default()
        },
        now,
    )
    .await?;

    if !db::complete_challenge(&mut tx, challenge_id, match_record.id, now).await? {
        return Err(AppError::invalid_state("Challenge is not accepted"));
    }

    let rating = apply_ratings(&mut tx, winner_id, loser_id, match_record.id, now).await?;

    let challenge = load(&mut tx, challenge_id).await?;
    let winner = load_user(&mut tx, winner_id).await?;
    let loser = load_user(&mut tx, loser_id).await?;
    tx.commit().await?;

    metrics::CHALLENGE_TRANSITIONS_TOTAL
        .with_label_values(&[ChallengeStatus::Completed.as_str()])
        .inc();
    tracing::info!(
        "Challenge {challenge_id} completed: match {}, winner {winner_id} ({:+}), loser {loser_id} ({:+})",
        match_record.id,
        rating.winner.change,
        rating.loser.change
    );

    Ok(Submission::Completed(Box::new(Completion {
        challenge,
        match_record,
        winner,
        loser,
        rating,
    })))
}

async fn load_user(conn: &mut SqliteConnection, user_id: i64) -> Result<User> {
    db::get_user(conn, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}

/// Run the rating engine on current ratings, persist the new ratings and
/// append one history row per player.
async fn apply_ratings(
    conn: &mut SqliteConnection,
    winner_id: i64,
    loser_id: i64,
    match_id: i64,
    now: NaiveDateTime,
) -> Result<MatchRating> {
    let winner = load_user(conn, winner_id).await?;
    let loser = load_user(conn, loser_id).await?;

    let rating = elo::rate_match(winner.rating, loser.rating);

    db::set_user_rating(conn, winner_id, rating.winner.after).await?;
    db::set_user_rating(conn, loser_id, rating.loser.after).await?;
    db::insert_rating_history(conn, winner_id, match_id, &rating.winner, now).await?;
    db::insert_rating_history(conn, loser_id, match_id, &rating.loser, now).await?;

    metrics::RATING_UPDATES_TOTAL.inc();
    Ok(rating)
}

pub async fn get(db: &Database, challenge_id: i64) -> Result<Challenge> {
    let mut conn = db.acquire().await?;
    load(&mut conn, challenge_id).await
}

/// The user's challenges on either side, newest first.
pub async fn list_for_user(
    db: &Database,
    user_id: i64,
    limit: Option<i64>,
) -> Result<Vec<ChallengeSummary>> {
    let mut conn = db.acquire().await?;
    Ok(db::list_challenges_for_user(&mut conn, user_id, limit).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Profile;
    use chrono::NaiveDate;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    async fn user(db: &Database, telegram_id: i64, username: &str) -> User {
        let mut conn = db.acquire().await.unwrap();
        db::insert_user(
            &mut conn,
            telegram_id,
            &Profile {
                username: Some(username.to_string()),
                ..Profile::default()
            },
        )
        .await
        .unwrap()
    }

    async fn accepted_challenge(db: &Database) -> (User, User, Challenge) {
        let alice = user(db, 1, "alice").await;
        let bob = user(db, 2, "bob").await;
        let c = create(db, alice.id, "bob", at(1, 10)).await.unwrap();
        accept(db, c.id, bob.id, at(1, 11)).await.unwrap();
        (alice, bob, c)
    }

    async fn match_count(db: &Database) -> i64 {
        let mut conn = db.acquire().await.unwrap();
        db::count_matches(&mut conn).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_pending_challenge() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        let bob = user(&db, 2, "bob").await;

        let c = create(&db, alice.id, "@bob", at(1, 10)).await.unwrap();
        assert_eq!(c.status, ChallengeStatus::Pending);
        assert_eq!(c.challenger_id, alice.id);
        assert_eq!(c.challenged_id, bob.id);
        assert!(c.challenger_result.is_none());
        assert!(c.match_id.is_none());
    }

    #[tokio::test]
    async fn test_create_unknown_user() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        let err = create(&db, alice.id, "nobody", at(1, 10)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_self_challenge() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        let err = create(&db, alice.id, "alice", at(1, 10)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_one_challenge_per_calendar_day() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        user(&db, 2, "bob").await;
        user(&db, 3, "carol").await;

        create(&db, alice.id, "bob", at(1, 9)).await.unwrap();
        let err = create(&db, alice.id, "carol", at(1, 23)).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimited(_)));

        // Next calendar day is fine.
        create(&db, alice.id, "carol", at(2, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_pair_conflict() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        let bob = user(&db, 2, "bob").await;

        create(&db, alice.id, "bob", at(1, 10)).await.unwrap();
        let err = create(&db, alice.id, "bob", at(2, 10)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // The reverse direction is a different ordered pair.
        create(&db, bob.id, "alice", at(2, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_declined_challenge_frees_the_pair() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        let bob = user(&db, 2, "bob").await;

        let c = create(&db, alice.id, "bob", at(1, 10)).await.unwrap();
        let c = decline(&db, c.id, bob.id, at(1, 11)).await.unwrap();
        assert_eq!(c.status, ChallengeStatus::Declined);
        assert!(c.accepted_at.is_none());

        create(&db, alice.id, "bob", at(2, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_guards() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        let bob = user(&db, 2, "bob").await;
        let c = create(&db, alice.id, "bob", at(1, 10)).await.unwrap();

        let err = accept(&db, 999, bob.id, at(1, 11)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = accept(&db, c.id, alice.id, at(1, 11)).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let accepted = accept(&db, c.id, bob.id, at(1, 11)).await.unwrap();
        assert_eq!(accepted.status, ChallengeStatus::Accepted);
        assert_eq!(accepted.accepted_at.as_deref(), Some("2024-06-01 11:00:00"));

        // Right actor, wrong state.
        let err = accept(&db, c.id, bob.id, at(1, 12)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        let err = decline(&db, c.id, bob.id, at(1, 12)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_submit_requires_accepted() {
        let db = test_db().await;
        let alice = user(&db, 1, "alice").await;
        user(&db, 2, "bob").await;
        let c = create(&db, alice.id, "bob", at(1, 10)).await.unwrap();

        let err = submit_result(&db, c.id, alice.id, SelfReport::Won, at(1, 11))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_submit_by_outsider_forbidden() {
        let db = test_db().await;
        let (_, _, c) = accepted_challenge(&db).await;
        let carol = user(&db, 3, "carol").await;

        let err = submit_result(&db, c.id, carol.id, SelfReport::Won, at(1, 12))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_first_report_is_recorded() {
        let db = test_db().await;
        let (alice, _, c) = accepted_challenge(&db).await;

        let submission = submit_result(&db, c.id, alice.id, SelfReport::Won, at(1, 12))
            .await
            .unwrap();
        match submission {
            Submission::Recorded { challenge } => {
                assert_eq!(challenge.status, ChallengeStatus::Accepted);
                assert_eq!(challenge.challenger_result, Some(SelfReport::Won));
                assert!(challenge.challenged_result.is_none());
            }
            other => panic!("expected Recorded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identical_reports_conflict_without_mutation() {
        let db = test_db().await;
        let (alice, bob, c) = accepted_challenge(&db).await;

        submit_result(&db, c.id, alice.id, SelfReport::Won, at(1, 12))
            .await
            .unwrap();
        let err = submit_result(&db, c.id, bob.id, SelfReport::Won, at(1, 13))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let c = get(&db, c.id).await.unwrap();
        assert_eq!(c.status, ChallengeStatus::Accepted);
        assert!(c.challenged_result.is_none());
        assert_eq!(match_count(&db).await, 0);

        let mut conn = db.acquire().await.unwrap();
        let alice = db::get_user(&mut conn, alice.id).await.unwrap().unwrap();
        assert_eq!(alice.rating, 1200);
    }

    #[tokio::test]
    async fn test_complementary_reports_complete_and_rate() {
        let db = test_db().await;
        let (alice, bob, c) = accepted_challenge(&db).await;

        submit_result(&db, c.id, bob.id, SelfReport::Lost, at(1, 12))
            .await
            .unwrap();
        let submission = submit_result(&db, c.id, alice.id, SelfReport::Won, at(1, 13))
            .await
            .unwrap();

        let Submission::Completed(done) = submission else {
            panic!("expected Completed");
        };
        assert_eq!(done.challenge.status, ChallengeStatus::Completed);
        assert_eq!(done.challenge.match_id, Some(done.match_record.id));
        assert_eq!(
            done.challenge.completed_at.as_deref(),
            Some("2024-06-01 13:00:00")
        );
        assert_eq!(done.match_record.winner_id, Some(alice.id));
        assert_eq!(done.match_record.loser_id, Some(bob.id));
        assert_eq!(done.match_record.score.as_deref(), Some(PLACEHOLDER_SCORE));
        assert!(done.match_record.is_rated);
        assert_eq!(done.winner.rating, 1216);
        assert_eq!(done.loser.rating, 1184);

        let mut conn = db.acquire().await.unwrap();
        let history = db::list_match_rating_history(&mut conn, done.match_record.id)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        for row in &history {
            assert_eq!(row.change, row.rating_after - row.rating_before);
        }
        assert_eq!(history[0].user_id, alice.id);
        assert_eq!(history[0].change, 16);
        assert_eq!(history[1].user_id, bob.id);
        assert_eq!(history[1].change, -16);
    }

    #[tokio::test]
    async fn test_completion_happens_once() {
        let db = test_db().await;
        let (alice, bob, c) = accepted_challenge(&db).await;

        submit_result(&db, c.id, alice.id, SelfReport::Lost, at(1, 12))
            .await
            .unwrap();
        submit_result(&db, c.id, bob.id, SelfReport::Won, at(1, 13))
            .await
            .unwrap();

        let err = submit_result(&db, c.id, bob.id, SelfReport::Won, at(1, 14))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(match_count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_list_for_user_marks_side() {
        let db = test_db().await;
        let (alice, bob, _) = accepted_challenge(&db).await;

        let mine = list_for_user(&db, alice.id, None).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert!(mine[0].is_challenger);

        let theirs = list_for_user(&db, bob.id, None).await.unwrap();
        assert!(!theirs[0].is_challenger);
    }

    #[test]
    fn test_self_report_parsing() {
        assert_eq!(SelfReport::from_str_name("won"), Some(SelfReport::Won));
        assert_eq!(SelfReport::from_str_name("lost"), Some(SelfReport::Lost));
        assert_eq!(SelfReport::from_str_name("draw"), None);
    }
}
