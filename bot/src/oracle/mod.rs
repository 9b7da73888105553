//! Search oracle: an external engine evaluating positions under a depth and
//! wall-clock budget.

pub mod pool;
pub mod uci;

use crate::config::ScorePerspective;
use crate::position::Position;
use crate::record::{EvalSource, EvaluationResult};
use shakmaty::Color;
use std::time::Duration;

pub use pool::{EnginePool, UciOracle};
pub use uci::{EngineLine, UciEngine};

/// Score given to a mate on the board; mate in `n` plies is `MATE_SCORE - n`
pub const MATE_SCORE: i32 = 10_000;

/// Longest mate distance kept apart; mates stay above any centipawn score
const MAX_MATE_PLIES: i32 = 999;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("search did not finish within its time budget")]
    Timeout,

    #[error("all engines are busy")]
    Busy,

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("engine io error: {0}")]
    Io(String),
}

impl OracleError {
    /// Whether retrying the same request later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OracleError::Timeout | OracleError::Busy)
    }
}

impl From<std::io::Error> for OracleError {
    fn from(error: std::io::Error) -> Self {
        OracleError::Io(error.to_string())
    }
}

/// Score of a position, as reported by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Score {
    /// Centipawn
    Cp(i32),

    /// Mate/Mated in n moves
    Mate(i32),
}

impl Score {
    /// Converts to centipawns. Mates are ranked by distance: a faster mate is
    /// worth more, a slower mate against us is worth more.
    pub fn to_cp(self) -> i32 {
        match self {
            Score::Cp(cp) => cp.clamp(-(MATE_SCORE - 1_000), MATE_SCORE - 1_000),
            // the side to move is mated
            Score::Mate(0) => -MATE_SCORE,
            Score::Mate(moves) if moves > 0 => {
                MATE_SCORE - moves.saturating_mul(2).saturating_sub(1).min(MAX_MATE_PLIES)
            }
            Score::Mate(moves) => {
                -MATE_SCORE + moves.saturating_neg().saturating_mul(2).min(MAX_MATE_PLIES)
            }
        }
    }
}

/// Converts an engine score into the side to move's perspective
pub fn normalize(score: Score, perspective: ScorePerspective, turn: Color) -> i32 {
    let cp = score.to_cp();
    match (perspective, turn) {
        (ScorePerspective::White, Color::Black) => -cp,
        _ => cp,
    }
}

pub trait SearchOracle: Send + Sync {
    /// Evaluates the best `lines` root moves, best first
    fn evaluate_lines(
        &self,
        position: &Position,
        depth: u32,
        time_budget: Duration,
        lines: usize,
    ) -> Result<Vec<EvaluationResult>, OracleError>;

    fn evaluate(
        &self,
        position: &Position,
        depth: u32,
        time_budget: Duration,
    ) -> Result<EvaluationResult, OracleError> {
        self.evaluate_lines(position, depth, time_budget, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| OracleError::Engine("search produced no evaluation".to_string()))
    }
}

pub(crate) fn line_to_result(
    line: &EngineLine,
    perspective: ScorePerspective,
    turn: Color,
) -> EvaluationResult {
    EvaluationResult {
        score_cp: normalize(line.score, perspective, turn),
        principal_variation: line.pv.clone(),
        depth_reached: line.depth,
        source: EvalSource::Engine,
        model_version: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mate_scores_are_ordered() {
        let mate_in_1 = Score::Mate(1).to_cp();
        let mate_in_3 = Score::Mate(3).to_cp();
        let mated_in_2 = Score::Mate(-2).to_cp();
        let mated_now = Score::Mate(0).to_cp();

        assert_eq!(mate_in_1, MATE_SCORE - 1);
        assert!(mate_in_1 > mate_in_3);
        assert!(mate_in_3 > Score::Cp(5_000).to_cp());
        assert_eq!(mated_in_2, -MATE_SCORE + 4);
        assert_eq!(mated_now, -MATE_SCORE);
        assert!(mated_now < mated_in_2);
        assert!(mated_in_2 < Score::Cp(-5_000).to_cp());
    }

    #[test]
    fn absurd_mate_distances_saturate() {
        assert_eq!(Score::Mate(i32::MAX).to_cp(), MATE_SCORE - 999);
        assert_eq!(Score::Mate(i32::MIN).to_cp(), -MATE_SCORE + 999);
        assert!(Score::Mate(5_000).to_cp() > Score::Cp(i32::MAX).to_cp());
        assert!(Score::Mate(-5_000).to_cp() < Score::Cp(i32::MIN).to_cp());
    }

    #[test]
    fn centipawns_never_reach_mate_range() {
        assert_eq!(Score::Cp(25_000).to_cp(), MATE_SCORE - 1_000);
        assert_eq!(Score::Cp(-120).to_cp(), -120);
    }

    #[test]
    fn white_perspective_is_flipped_for_black() {
        let score = Score::Cp(80);
        assert_eq!(normalize(score, ScorePerspective::White, Color::White), 80);
        assert_eq!(normalize(score, ScorePerspective::White, Color::Black), -80);
        assert_eq!(normalize(score, ScorePerspective::SideToMove, Color::Black), 80);
    }

    #[test]
    fn recoverable_errors() {
        assert!(OracleError::Timeout.is_recoverable());
        assert!(OracleError::Busy.is_recoverable());
        assert!(!OracleError::Engine("crash".into()).is_recoverable());
    }
}
