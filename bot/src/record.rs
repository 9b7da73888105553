//! Records exchanged between the session controller, the analyzer, the
//! experience store and the trainer.

use crate::position::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced an evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalSource {
    Engine,
    Model,
    Blended,
}

/// Evaluation of a position in centipawns, from the perspective of the side
/// to move unless stated otherwise by the owner of the value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score_cp: i32,
    #[serde(default)]
    pub principal_variation: Vec<String>,
    #[serde(default)]
    pub depth_reached: u32,
    pub source: EvalSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<u64>,
}

impl EvaluationResult {
    /// The same evaluation seen by the other side
    pub fn negated(&self) -> Self {
        EvaluationResult {
            score_cp: -self.score_cp,
            ..self.clone()
        }
    }

    pub fn best_move(&self) -> Option<&str> {
        self.principal_variation.first().map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveLabel {
    Book,
    Best,
    Good,
    Inaccuracy,
    Mistake,
    Blunder,
}

impl MoveLabel {
    pub const ALL: [MoveLabel; 6] = [
        MoveLabel::Book,
        MoveLabel::Best,
        MoveLabel::Good,
        MoveLabel::Inaccuracy,
        MoveLabel::Mistake,
        MoveLabel::Blunder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MoveLabel::Book => "book",
            MoveLabel::Best => "best",
            MoveLabel::Good => "good",
            MoveLabel::Inaccuracy => "inaccuracy",
            MoveLabel::Mistake => "mistake",
            MoveLabel::Blunder => "blunder",
        }
    }
}

impl fmt::Display for MoveLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a game from the agent's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    Win,
    Loss,
    Draw,
}

impl GameResult {
    /// +1 / 0 / -1
    pub fn reward(&self) -> f32 {
        match self {
            GameResult::Win => 1.0,
            GameResult::Draw => 0.0,
            GameResult::Loss => -1.0,
        }
    }

    /// The result seen by the other player
    pub fn flipped(&self) -> Self {
        match self {
            GameResult::Win => GameResult::Loss,
            GameResult::Loss => GameResult::Win,
            GameResult::Draw => GameResult::Draw,
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GameResult::Win => "win",
            GameResult::Loss => "loss",
            GameResult::Draw => "draw",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Checkmate,
    Resignation,
    Stalemate,
    InsufficientMaterial,
    FiftyMoves,
    TimeForfeit,
    DrawAgreed,
    MoveLimit,
    Aborted,
    Unknown,
}

/// Live decision taken by the move policy for one agent move
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveDecision {
    pub evaluation: EvaluationResult,
    pub exploratory: bool,
}

/// A move as it was played, before analysis
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayedMove {
    pub ply: u32,
    pub uci: String,
    pub by_agent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<LiveDecision>,
}

/// Metadata shared by raw and analyzed games
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub game_id: String,
    pub opponent: String,
    #[serde(default)]
    pub opponent_rating: Option<u32>,
    pub agent_color: Side,
    #[serde(default)]
    pub time_control: Option<String>,
    pub initial_fen: String,
}

/// A finished game as observed by the session controller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGame {
    #[serde(flatten)]
    pub info: GameInfo,
    pub result: GameResult,
    pub termination: Termination,
    pub moves: Vec<PlayedMove>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One analyzed move
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub ply: u32,
    pub fen_before: String,
    pub move_played: String,
    pub by_agent: bool,
    #[serde(default)]
    pub exploratory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_before: Option<EvaluationResult>,
    pub evaluation_after_best: EvaluationResult,
    pub evaluation_played: EvaluationResult,
    pub centipawn_loss: u32,
    pub label: MoveLabel,
}

/// A finished and analyzed game
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    #[serde(flatten)]
    pub info: GameInfo,
    pub result: GameResult,
    pub termination: Termination,
    pub moves: Vec<MoveRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl GameRecord {
    pub fn game_id(&self) -> &str {
        &self.info.game_id
    }

    pub fn agent_moves(&self) -> impl Iterator<Item = &MoveRecord> {
        self.moves.iter().filter(|m| m.by_agent)
    }

    /// Result from the perspective of whoever played `record`
    pub fn result_for(&self, record: &MoveRecord) -> GameResult {
        if record.by_agent {
            self.result
        } else {
            self.result.flipped()
        }
    }
}
