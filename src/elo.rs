// Elo rating calculation for decided 1v1 matches.
//
// One engine serves both the HTTP flow and the chat bot.

use serde::Serialize;

pub const STARTING_RATING: i32 = 1200;
pub const K_FACTOR: f64 = 32.0;

/// Calculate expected score for player A against player B.
pub fn expected_score(rating_a: i32, rating_b: i32) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf((rating_b - rating_a) as f64 / 400.0))
}

/// Rating movement of one side of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatingChange {
    pub before: i32,
    pub after: i32,
    pub change: i32,
}

impl RatingChange {
    fn apply(before: i32, delta: i32) -> Self {
        let after = before + delta;
        Self {
            before,
            after,
            change: after - before,
        }
    }
}

/// Result of rating a decided match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchRating {
    pub winner: RatingChange,
    pub loser: RatingChange,
}

/// Point adjustment for one side: K * (actual - expected), truncated toward zero.
fn adjustment(actual: f64, expected: f64) -> i32 {
    (K_FACTOR * (actual - expected)).trunc() as i32
}

/// Rate a decided match. Each side is rounded independently, so the two
/// changes are not guaranteed to cancel out. No floor is applied.
pub fn rate_match(winner_rating: i32, loser_rating: i32) -> MatchRating {
    let expected_winner = expected_score(winner_rating, loser_rating);
    let expected_loser = 1.0 - expected_winner;

    MatchRating {
        winner: RatingChange::apply(winner_rating, adjustment(1.0, expected_winner)),
        loser: RatingChange::apply(loser_rating, adjustment(0.0, expected_loser)),
    }
}
