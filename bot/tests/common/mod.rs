#![allow(dead_code)]

use bot::config::{PolicyConfig, SessionConfig};
use bot::model_registry::ModelRegistry;
use bot::oracle::{OracleError, SearchOracle};
use bot::policy::to_uci;
use bot::position::{Position, Side};
use bot::record::{
    EvalSource, EvaluationResult, GameInfo, GameRecord, GameResult, MoveLabel, MoveRecord,
    Termination,
};
use chrono::Utc;
use nn::model::ValueModel;
use shakmaty::Position as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Scores every legal move 0, in move generation order. Times out on the
/// agent's turn of the given full move, if any.
pub struct LegalOracle {
    pub timeout_at_fullmove: Option<u32>,
    pub calls: AtomicU32,
}

impl LegalOracle {
    pub fn new() -> Self {
        LegalOracle {
            timeout_at_fullmove: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn timing_out_at(fullmove: u32) -> Self {
        LegalOracle {
            timeout_at_fullmove: Some(fullmove),
            calls: AtomicU32::new(0),
        }
    }
}

impl SearchOracle for LegalOracle {
    fn evaluate_lines(
        &self,
        position: &Position,
        depth: u32,
        _time_budget: Duration,
        lines: usize,
    ) -> Result<Vec<EvaluationResult>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if Some(position.setup().fullmoves.get()) == self.timeout_at_fullmove {
            return Err(OracleError::Timeout);
        }

        let chess = position
            .to_chess()
            .map_err(|e| OracleError::Engine(e.to_string()))?;
        let legal = chess.legal_moves();
        if legal.is_empty() {
            return Ok(vec![evaluation(0, None, depth)]);
        }
        Ok(legal
            .iter()
            .take(lines.max(1))
            .map(|m| evaluation(0, Some(to_uci(m)), depth))
            .collect())
    }
}

pub fn evaluation(score_cp: i32, best: Option<String>, depth: u32) -> EvaluationResult {
    EvaluationResult {
        score_cp,
        principal_variation: best.into_iter().collect(),
        depth_reached: depth,
        source: EvalSource::Engine,
        model_version: None,
    }
}

pub fn fast_session() -> SessionConfig {
    SessionConfig {
        retry_attempts: 3,
        backoff_initial_ms: 1,
        backoff_max_ms: 4,
        event_timeout_ms: 1,
    }
}

pub fn greedy_policy() -> PolicyConfig {
    PolicyConfig {
        blend_weight: 0.7,
        exploration_rate: 0.0,
        seed: Some(1),
    }
}

pub fn small_model() -> ValueModel {
    ModelRegistry::initial_model(8, 3).unwrap()
}

/// A one-move game from the initial position whose analysis scored the
/// position before the move `before` and the played move `played`
pub fn analyzed_game(id: &str, before: i32, played: i32) -> GameRecord {
    GameRecord {
        info: GameInfo {
            game_id: id.to_string(),
            opponent: "test".to_string(),
            opponent_rating: None,
            agent_color: Side::White,
            time_control: None,
            initial_fen: START.to_string(),
        },
        result: GameResult::Draw,
        termination: Termination::DrawAgreed,
        moves: vec![MoveRecord {
            ply: 0,
            fen_before: START.to_string(),
            move_played: "e2e4".to_string(),
            by_agent: true,
            exploratory: false,
            evaluation_before: None,
            evaluation_after_best: evaluation(before, Some("e2e4".to_string()), 16),
            evaluation_played: evaluation(played, None, 16),
            centipawn_loss: (before - played).max(0) as u32,
            label: MoveLabel::Best,
        }],
        started_at: Utc::now(),
        ended_at: Utc::now(),
    }
}
