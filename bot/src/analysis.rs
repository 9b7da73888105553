//! Post-game analysis: replays a finished game with a deeper search and
//! labels every move by how much evaluation it gave away.

use crate::config::AnalysisConfig;
use crate::oracle::{OracleError, SearchOracle, MATE_SCORE};
use crate::position::{Clock, Position};
use crate::record::{
    EvalSource, EvaluationResult, GameRecord, GameResult, MoveLabel, MoveRecord, RawGame,
};
use serde::Serialize;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Position as _};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("bad initial position {fen}: {reason}")]
    BadInitialPosition { fen: String, reason: String },

    #[error("illegal move {uci} at ply {ply}")]
    IllegalMove { ply: u32, uci: String },

    #[error("oracle failed at ply {ply}: {source}")]
    Oracle { ply: u32, source: OracleError },
}

/// Loss thresholds, most severe first
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThresholdTable {
    tiers: Vec<(u32, MoveLabel)>,
}

impl ThresholdTable {
    pub fn new(inaccuracy: u32, mistake: u32, blunder: u32) -> Self {
        let mut tiers = vec![
            (blunder, MoveLabel::Blunder),
            (mistake, MoveLabel::Mistake),
            (inaccuracy, MoveLabel::Inaccuracy),
        ];
        tiers.sort_by(|a, b| b.0.cmp(&a.0));
        ThresholdTable { tiers }
    }

    /// The most severe tier whose threshold `loss` reaches
    pub fn classify(&self, loss: u32) -> Option<MoveLabel> {
        self.tiers
            .iter()
            .find(|(threshold, _)| loss >= *threshold)
            .map(|(_, label)| *label)
    }
}

/// Centipawns given away by the played move, both scores from the mover's
/// perspective
pub fn centipawn_loss(best: i32, played: i32, max_loss: u32) -> u32 {
    let best = best.clamp(-MATE_SCORE, MATE_SCORE) as i64;
    let played = played.clamp(-MATE_SCORE, MATE_SCORE) as i64;
    (best - played).clamp(0, max_loss as i64) as u32
}

/// Per-game report of the agent's play
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GameSummary {
    pub game_id: String,
    pub result: GameResult,
    pub agent_moves: usize,
    pub average_centipawn_loss: f64,
    pub blunder_count: usize,
    pub mistake_count: usize,
    pub inaccuracy_count: usize,
    pub elapsed_secs: f64,
}

impl GameSummary {
    pub fn of(record: &GameRecord) -> Self {
        let scored: Vec<&MoveRecord> = record
            .agent_moves()
            .filter(|m| m.label != MoveLabel::Book)
            .collect();
        let count = |label| scored.iter().filter(|m| m.label == label).count();

        let average_centipawn_loss = if scored.is_empty() {
            0.0
        } else {
            scored.iter().map(|m| m.centipawn_loss as f64).sum::<f64>() / scored.len() as f64
        };

        GameSummary {
            game_id: record.info.game_id.clone(),
            result: record.result,
            agent_moves: record.agent_moves().count(),
            average_centipawn_loss,
            blunder_count: count(MoveLabel::Blunder),
            mistake_count: count(MoveLabel::Mistake),
            inaccuracy_count: count(MoveLabel::Inaccuracy),
            elapsed_secs: (record.ended_at - record.started_at).num_milliseconds() as f64 / 1000.0,
        }
    }
}

pub struct Analyzer {
    oracle: Arc<dyn SearchOracle>,
    thresholds: ThresholdTable,
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(oracle: Arc<dyn SearchOracle>, config: &AnalysisConfig) -> Self {
        Analyzer {
            oracle,
            thresholds: ThresholdTable::new(config.inaccuracy, config.mistake, config.blunder),
            config: config.clone(),
        }
    }

    pub fn classify(&self, ply: u32, loss: u32, top_choice: bool) -> MoveLabel {
        if ply < self.config.book_plies {
            return MoveLabel::Book;
        }
        match self.thresholds.classify(loss) {
            Some(label) => label,
            None if top_choice => MoveLabel::Best,
            None => MoveLabel::Good,
        }
    }

    pub fn analyze(&self, raw: &RawGame) -> Result<GameRecord, AnalysisError> {
        let started = Instant::now();
        let fen = &raw.info.initial_fen;
        let bad_initial = |reason: String| AnalysisError::BadInitialPosition {
            fen: fen.clone(),
            reason,
        };

        let mut chess: Chess = fen
            .parse::<Fen>()
            .map_err(|e| bad_initial(e.to_string()))?
            .into_position(CastlingMode::Standard)
            .map_err(|e| bad_initial(e.to_string()))?;

        // every position is searched once: the evaluation after a move is
        // the evaluation before the next one
        let mut before = self.evaluate(&chess, 0)?;
        let mut moves = Vec::with_capacity(raw.moves.len());

        for played in &raw.moves {
            let ply = played.ply;
            let fen_before = Fen::from_position(chess.clone(), EnPassantMode::Legal).to_string();

            let m = played
                .uci
                .parse::<UciMove>()
                .ok()
                .and_then(|uci| uci.to_move(&chess).ok())
                .ok_or_else(|| AnalysisError::IllegalMove {
                    ply,
                    uci: played.uci.clone(),
                })?;
            chess.play_unchecked(&m);

            let after = self.evaluate(&chess, ply + 1)?;
            let played_eval = after.negated();

            let loss = centipawn_loss(
                before.score_cp,
                played_eval.score_cp,
                self.config.max_loss,
            );
            let top_choice = before.best_move() == Some(played.uci.as_str());
            let label = self.classify(ply, loss, top_choice);

            let decision = played.decision.as_ref();
            moves.push(MoveRecord {
                ply,
                fen_before,
                move_played: played.uci.clone(),
                by_agent: played.by_agent,
                exploratory: decision.map_or(false, |d| d.exploratory),
                evaluation_before: decision.map(|d| d.evaluation.clone()),
                evaluation_after_best: before,
                evaluation_played: played_eval,
                centipawn_loss: loss,
                label,
            });

            before = after;
        }

        let record = GameRecord {
            info: raw.info.clone(),
            result: raw.result,
            termination: raw.termination,
            moves,
            started_at: raw.started_at,
            ended_at: raw.ended_at,
        };

        tracing::info!(
            game_id = %record.info.game_id,
            plies = record.moves.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "game analyzed"
        );
        Ok(record)
    }

    /// Evaluation of `chess` for its side to move. Finished positions are
    /// scored without asking the oracle.
    fn evaluate(&self, chess: &Chess, ply: u32) -> Result<EvaluationResult, AnalysisError> {
        let terminal = if chess.is_checkmate() {
            Some(-MATE_SCORE)
        } else if chess.is_stalemate() || chess.is_insufficient_material() {
            Some(0)
        } else {
            None
        };
        if let Some(score_cp) = terminal {
            return Ok(EvaluationResult {
                score_cp,
                principal_variation: Vec::new(),
                depth_reached: 0,
                source: EvalSource::Engine,
                model_version: None,
            });
        }

        let position = Position::from_chess(chess, Clock::default());
        let mut attempt = 0;
        loop {
            match self
                .oracle
                .evaluate(&position, self.config.depth, self.config.time_budget())
            {
                Ok(evaluation) => return Ok(evaluation),
                Err(error) if error.is_recoverable() && attempt < self.config.retries => {
                    attempt += 1;
                    tracing::debug!(%error, ply, attempt, "oracle busy during analysis, retrying");
                    thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                Err(source) => return Err(AnalysisError::Oracle { ply, source }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Side;
    use crate::record::{GameInfo, LiveDecision, PlayedMove, Termination};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Oracle answering from a table keyed by FEN, 0 and no pv otherwise
    struct TableOracle {
        scores: HashMap<String, (i32, &'static str)>,
        failures: Mutex<u32>,
    }

    impl SearchOracle for TableOracle {
        fn evaluate_lines(
            &self,
            position: &Position,
            depth: u32,
            _time_budget: Duration,
            _lines: usize,
        ) -> Result<Vec<EvaluationResult>, OracleError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(OracleError::Busy);
                }
            }
            let (score_cp, pv) = self
                .scores
                .get(&position.fen())
                .copied()
                .unwrap_or((0, ""));
            Ok(vec![EvaluationResult {
                score_cp,
                principal_variation: if pv.is_empty() { vec![] } else { vec![pv.to_string()] },
                depth_reached: depth,
                source: EvalSource::Engine,
                model_version: None,
            }])
        }
    }

    fn config(book_plies: u32) -> AnalysisConfig {
        AnalysisConfig {
            book_plies,
            ..AnalysisConfig::default()
        }
    }

    fn raw_game(moves: &[&str]) -> RawGame {
        RawGame {
            info: GameInfo {
                game_id: "test".to_string(),
                opponent: "random".to_string(),
                opponent_rating: None,
                agent_color: Side::White,
                time_control: None,
                initial_fen: "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string(),
            },
            result: GameResult::Draw,
            termination: Termination::MoveLimit,
            moves: moves
                .iter()
                .enumerate()
                .map(|(ply, uci)| PlayedMove {
                    ply: ply as u32,
                    uci: uci.to_string(),
                    by_agent: ply % 2 == 0,
                    decision: None,
                })
                .collect(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn loss_is_clamped() {
        assert_eq!(centipawn_loss(50, 20, 1000), 30);
        // a move better than the best line
        assert_eq!(centipawn_loss(50, 80, 1000), 0);
        assert_eq!(centipawn_loss(MATE_SCORE - 3, -200, 1000), 1000);
        // already lost: mate distances never exceed the ceiling
        assert_eq!(centipawn_loss(-1500, -MATE_SCORE, 1000), 1000);
        assert_eq!(centipawn_loss(-MATE_SCORE + 4, -MATE_SCORE + 2, 1000), 2);
        assert_eq!(centipawn_loss(-1500, -1500, 1000), 0);
    }

    #[test]
    fn thresholds_most_severe_first() {
        let table = ThresholdTable::new(50, 100, 300);
        assert_eq!(table.classify(0), None);
        assert_eq!(table.classify(49), None);
        assert_eq!(table.classify(50), Some(MoveLabel::Inaccuracy));
        assert_eq!(table.classify(100), Some(MoveLabel::Mistake));
        assert_eq!(table.classify(299), Some(MoveLabel::Mistake));
        assert_eq!(table.classify(300), Some(MoveLabel::Blunder));
        assert_eq!(table.classify(5000), Some(MoveLabel::Blunder));
    }

    #[test]
    fn book_window_and_best_moves() {
        let analyzer = Analyzer::new(
            Arc::new(TableOracle {
                scores: HashMap::new(),
                failures: Mutex::new(0),
            }),
            &config(2),
        );
        assert_eq!(analyzer.classify(0, 900, false), MoveLabel::Book);
        assert_eq!(analyzer.classify(1, 0, true), MoveLabel::Book);
        assert_eq!(analyzer.classify(2, 0, true), MoveLabel::Best);
        assert_eq!(analyzer.classify(2, 0, false), MoveLabel::Good);
        assert_eq!(analyzer.classify(2, 120, true), MoveLabel::Mistake);
    }

    #[test]
    fn labels_a_blunder() {
        // after 1. e4 e5 2. Qh5 Nc6 3. Bc4, black plays Nf6?? allowing Qxf7#
        let before_nf6 = "r1bqkbnr/pppp1ppp/2n5/4p2Q/2B1P3/8/PPPP1PPP/RNB1K1NR b KQkq - 3 3";
        let after_nf6 = "r1bqkb1r/pppp1ppp/2n2n2/4p2Q/2B1P3/8/PPPP1PPP/RNB1K1NR w KQkq - 4 4";

        let mut scores = HashMap::new();
        scores.insert(before_nf6.to_string(), (-30, "g7g6"));
        scores.insert(after_nf6.to_string(), (MATE_SCORE - 1, "h5f7"));

        let analyzer = Analyzer::new(
            Arc::new(TableOracle {
                scores,
                failures: Mutex::new(0),
            }),
            &config(0),
        );
        let mut raw = raw_game(&["e2e4", "e7e5", "d1h5", "b8c6", "f1c4", "g8f6", "h5f7"]);
        raw.moves[5].decision = Some(LiveDecision {
            evaluation: EvaluationResult {
                score_cp: 10,
                principal_variation: vec![],
                depth_reached: 0,
                source: EvalSource::Model,
                model_version: Some(2),
            },
            exploratory: true,
        });

        let record = analyzer.analyze(&raw).unwrap();
        assert_eq!(record.moves.len(), 7);

        let nf6 = &record.moves[5];
        assert_eq!(nf6.fen_before, before_nf6);
        assert_eq!(nf6.evaluation_after_best.score_cp, -30);
        assert_eq!(nf6.evaluation_played.score_cp, -(MATE_SCORE - 1));
        assert_eq!(nf6.centipawn_loss, 1000);
        assert_eq!(nf6.label, MoveLabel::Blunder);
        assert!(nf6.exploratory);
        assert_eq!(nf6.evaluation_before.as_ref().unwrap().source, EvalSource::Model);

        // the mating move is the top choice and the game ends in mate
        let qxf7 = &record.moves[6];
        assert_eq!(qxf7.evaluation_played.score_cp, MATE_SCORE);
        assert_eq!(qxf7.centipawn_loss, 0);
        assert_eq!(qxf7.label, MoveLabel::Best);

        for m in &record.moves {
            assert!(m.centipawn_loss <= 1000);
        }
    }

    #[test]
    fn analysis_is_idempotent() {
        let oracle = Arc::new(TableOracle {
            scores: HashMap::new(),
            failures: Mutex::new(0),
        });
        let analyzer = Analyzer::new(oracle, &config(1));
        let raw = raw_game(&["d2d4", "d7d5", "c2c4", "e7e6"]);

        let first = serde_json::to_string(&analyzer.analyze(&raw).unwrap().moves).unwrap();
        let second = serde_json::to_string(&analyzer.analyze(&raw).unwrap().moves).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn busy_oracle_is_retried() {
        let oracle = Arc::new(TableOracle {
            scores: HashMap::new(),
            failures: Mutex::new(2),
        });
        let analyzer = Analyzer::new(oracle, &config(0));
        assert!(analyzer.analyze(&raw_game(&["e2e4"])).is_ok());
    }

    #[test]
    fn persistent_failures_surface() {
        let oracle = Arc::new(TableOracle {
            scores: HashMap::new(),
            failures: Mutex::new(100),
        });
        let analyzer = Analyzer::new(oracle, &config(0));
        assert!(matches!(
            analyzer.analyze(&raw_game(&["e2e4"])),
            Err(AnalysisError::Oracle { ply: 0, .. })
        ));
    }

    #[test]
    fn illegal_moves_are_reported() {
        let oracle = Arc::new(TableOracle {
            scores: HashMap::new(),
            failures: Mutex::new(0),
        });
        let analyzer = Analyzer::new(oracle, &config(0));
        assert!(matches!(
            analyzer.analyze(&raw_game(&["e2e4", "e2e4"])),
            Err(AnalysisError::IllegalMove { ply: 1, .. })
        ));
    }

    #[test]
    fn summary_counts_agent_moves() {
        let oracle = Arc::new(TableOracle {
            scores: HashMap::new(),
            failures: Mutex::new(0),
        });
        let analyzer = Analyzer::new(oracle, &config(2));
        let record = analyzer
            .analyze(&raw_game(&["e2e4", "e7e5", "g1f3", "b8c6"]))
            .unwrap();
        let summary = GameSummary::of(&record);

        assert_eq!(summary.agent_moves, 2);
        assert_eq!(summary.average_centipawn_loss, 0.0);
        assert_eq!(summary.blunder_count, 0);
        assert_eq!(summary.result, GameResult::Draw);
    }
}
