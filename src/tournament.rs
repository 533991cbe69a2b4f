// Tournaments: registration and single-elimination first-round pairing.

use chrono::NaiveDateTime;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::db::{
    self, Database, Match, NewMatch, Tournament, TournamentParticipant, TournamentSummary,
};
use crate::error::{AppError, Result};
use crate::identity;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TournamentStatus {
    Open,
    Started,
    Completed,
}

impl TournamentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

/// Fields supplied when an admin schedules a tournament.
#[derive(Debug, Clone)]
pub struct NewTournament {
    pub title: String,
    pub spot_id: i64,
    pub scheduled_at: NaiveDateTime,
    pub description: Option<String>,
}

/// Formats accepted for a tournament's scheduled time.
const SCHEDULE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub fn parse_scheduled_at(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    SCHEDULE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .ok_or_else(|| AppError::invalid_argument(format!("Invalid datetime: {value}")))
}

/// Generate single-elimination bracket pairings.
///
/// Participants are paired sequentially: (0 vs 1), (2 vs 3), etc.
/// If the number of participants is odd, the last one sits out this round
/// and is not recorded anywhere.
pub fn generate_single_elimination_bracket(participants: &[i64]) -> Vec<(i64, i64)> {
    participants
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .collect()
}

/// Uniformly shuffle the participants, then pair them up.
pub fn shuffle_and_pair<R: Rng + ?Sized>(participants: &[i64], rng: &mut R) -> Vec<(i64, i64)> {
    let mut order = participants.to_vec();
    order.shuffle(rng);
    generate_single_elimination_bracket(&order)
}

pub async fn create(db: &Database, actor_id: i64, new: NewTournament) -> Result<Tournament> {
    let title = new.title.trim();
    let mut tx = db.begin().await?;

    identity::require_admin(&mut tx, actor_id).await?;

    if title.is_empty() {
        return Err(AppError::invalid_argument("Title must not be empty"));
    }
    if db::get_location(&mut tx, new.spot_id).await?.is_none() {
        return Err(AppError::not_found("Spot not found"));
    }

    let description = new
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());
    let tournament = db::insert_tournament(
        &mut tx,
        title,
        new.spot_id,
        new.scheduled_at,
        description,
        actor_id,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        "Tournament {} '{}' created by user {actor_id}",
        tournament.id,
        tournament.title
    );
    Ok(tournament)
}

pub async fn join(
    db: &Database,
    tournament_id: i64,
    actor_id: i64,
) -> Result<TournamentParticipant> {
    let mut tx = db.begin().await?;

    let tournament = db::get_tournament(&mut tx, tournament_id)
        .await?
        .ok_or_else(|| AppError::not_found("Tournament not found"))?;
    if tournament.status != TournamentStatus::Open {
        return Err(AppError::invalid_state("Tournament registration is closed"));
    }
    if db::is_participant(&mut tx, tournament_id, actor_id).await? {
        return Err(AppError::conflict("Already registered for this tournament"));
    }

    let participant = db::insert_participant(&mut tx, tournament_id, actor_id).await?;
    tx.commit().await?;

    tracing::info!("User {actor_id} joined tournament {tournament_id}");
    Ok(participant)
}

/// Close registration and create the first round. The odd participant out,
/// if any, gets no match. Matches are unrated and tagged with the
/// tournament and its spot.
pub async fn start<R: Rng + ?Sized>(
    db: &Database,
    tournament_id: i64,
    actor_id: i64,
    rng: &mut R,
    now: NaiveDateTime,
) -> Result<Vec<Match>> {
    let mut tx = db.begin().await?;

    identity::require_admin(&mut tx, actor_id).await?;

    let tournament = db::get_tournament(&mut tx, tournament_id)
        .await?
        .ok_or_else(|| AppError::not_found("Tournament not found"))?;
    if tournament.status != TournamentStatus::Open {
        return Err(AppError::invalid_state("Tournament already started"));
    }

    let participants = db::list_participant_ids(&mut tx, tournament_id).await?;
    if participants.len() < 2 {
        return Err(AppError::invalid_argument(
            "Not enough participants to start the tournament",
        ));
    }

    let pairs = shuffle_and_pair(&participants, rng);
    let mut matches = Vec::with_capacity(pairs.len());
    for (player1_id, player2_id) in pairs {
        let m = db::insert_match(
            &mut tx,
            &NewMatch {
                player1_id,
                player2_id,
                spot_id: Some(tournament.spot_id),
                is_rated: false,
                tournament_id: Some(tournament_id),
                ..NewMatch::default()
            },
            now,
        )
        .await?;
        matches.push(m);
    }

    if !db::mark_tournament_started(&mut tx, tournament_id).await? {
        return Err(AppError::invalid_state("Tournament already started"));
    }
    tx.commit().await?;

    metrics::TOURNAMENTS_STARTED_TOTAL.inc();
    tracing::info!(
        "Tournament {tournament_id} started: {} participants, {} matches",
        participants.len(),
        matches.len()
    );
    Ok(matches)
}

pub async fn list(db: &Database) -> Result<Vec<TournamentSummary>> {
    let mut conn = db.acquire().await?;
    Ok(db::list_tournament_summaries(&mut conn).await?)
}

pub async fn matches(db: &Database, tournament_id: i64) -> Result<Vec<Match>> {
    let mut conn = db.acquire().await?;
    if db::get_tournament(&mut conn, tournament_id).await?.is_none() {
        return Err(AppError::not_found("Tournament not found"));
    }
    Ok(db::list_tournament_matches(&mut conn, tournament_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Profile, User};
    use chrono::NaiveDate;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    async fn user(db: &Database, telegram_id: i64, admin: bool) -> User {
        let mut conn = db.acquire().await.unwrap();
        let u = db::insert_user(
            &mut conn,
            telegram_id,
            &Profile {
                username: Some(format!("player{telegram_id}")),
                ..Profile::default()
            },
        )
        .await
        .unwrap();
        if admin {
            db::set_user_admin(&mut conn, u.id, true).await.unwrap();
        }
        u
    }

    /// An admin and an open tournament at a fresh spot.
    async fn setup() -> (Database, User, Tournament) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let admin = user(&db, 1, true).await;
        let spot = {
            let mut conn = db.acquire().await.unwrap();
            db::insert_location(&mut conn, Some(admin.id), "Gorky Park", 55.73, 37.60)
                .await
                .unwrap()
        };
        let t = create(
            &db,
            admin.id,
            NewTournament {
                title: "Summer Cup".to_string(),
                spot_id: spot.id,
                scheduled_at: noon(),
                description: None,
            },
        )
        .await
        .unwrap();
        (db, admin, t)
    }

    #[test]
    fn test_single_elimination_4_players() {
        let pairs = generate_single_elimination_bracket(&[1, 2, 3, 4]);
        assert_eq!(pairs, vec![(1, 2), (3, 4)]);
    }

    #[test]
    fn test_single_elimination_odd_players() {
        let pairs = generate_single_elimination_bracket(&[1, 2, 3]);
        // Player 3 sits out
        assert_eq!(pairs, vec![(1, 2)]);
    }

    #[test]
    fn test_single_elimination_empty() {
        assert!(generate_single_elimination_bracket(&[]).is_empty());
        assert!(generate_single_elimination_bracket(&[7]).is_empty());
    }

    #[test]
    fn test_shuffle_and_pair_uses_each_player_once() {
        let participants: Vec<i64> = (1..=9).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let pairs = shuffle_and_pair(&participants, &mut rng);
        assert_eq!(pairs.len(), 4);

        let mut seen: Vec<i64> = pairs.iter().flat_map(|&(a, b)| [a, b]).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|id| participants.contains(id)));
    }

    #[test]
    fn test_parse_scheduled_at() {
        let expected = NaiveDate::from_ymd_opt(2024, 7, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert_eq!(parse_scheduled_at("2024-07-01T12:30:00").unwrap(), expected);
        assert_eq!(parse_scheduled_at("2024-07-01T12:30").unwrap(), expected);
        assert_eq!(parse_scheduled_at("2024-07-01 12:30:00").unwrap(), expected);
        assert!(matches!(
            parse_scheduled_at("next tuesday"),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_requires_admin() {
        let (db, _, t) = setup().await;
        let player = user(&db, 2, false).await;
        let err = create(
            &db,
            player.id,
            NewTournament {
                title: "Rogue Cup".to_string(),
                spot_id: t.spot_id,
                scheduled_at: noon(),
                description: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_create_validates_title_and_spot() {
        let (db, admin, t) = setup().await;
        let blank = NewTournament {
            title: "   ".to_string(),
            spot_id: t.spot_id,
            scheduled_at: noon(),
            description: None,
        };
        let err = create(&db, admin.id, blank).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let nowhere = NewTournament {
            title: "Cup".to_string(),
            spot_id: 999,
            scheduled_at: noon(),
            description: None,
        };
        let err = create(&db, admin.id, nowhere).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_join_twice_conflicts() {
        let (db, _, t) = setup().await;
        let player = user(&db, 2, false).await;

        join(&db, t.id, player.id).await.unwrap();
        let err = join(&db, t.id, player.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let err = join(&db, 999, player.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_three_participants_creates_one_match() {
        let (db, admin, t) = setup().await;
        for tg in 2..=4 {
            let p = user(&db, tg, false).await;
            join(&db, t.id, p.id).await.unwrap();
        }

        let mut rng = StdRng::seed_from_u64(7);
        let created = start(&db, t.id, admin.id, &mut rng, noon()).await.unwrap();
        assert_eq!(created.len(), 1);

        let m = &created[0];
        assert!(!m.is_rated);
        assert_eq!(m.tournament_id, Some(t.id));
        assert_eq!(m.spot_id, Some(t.spot_id));
        assert!(m.winner_id.is_none());
        assert_ne!(m.player1_id, m.player2_id);

        let stored = matches(&db, t.id).await.unwrap();
        assert_eq!(stored.len(), 1);

        let summaries = list(&db).await.unwrap();
        assert_eq!(summaries[0].status, TournamentStatus::Started);
        assert_eq!(summaries[0].participants_count, 3);
    }

    #[tokio::test]
    async fn test_start_guards() {
        let (db, admin, t) = setup().await;
        let player = user(&db, 2, false).await;
        let mut rng = StdRng::seed_from_u64(1);

        let err = start(&db, t.id, player.id, &mut rng, noon()).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = start(&db, 999, admin.id, &mut rng, noon()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        join(&db, t.id, player.id).await.unwrap();
        let err = start(&db, t.id, admin.id, &mut rng, noon()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        join(&db, t.id, admin.id).await.unwrap();
        start(&db, t.id, admin.id, &mut rng, noon()).await.unwrap();

        let err = start(&db, t.id, admin.id, &mut rng, noon()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let late = user(&db, 3, false).await;
        let err = join(&db, t.id, late.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }
}
