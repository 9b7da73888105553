use crate::config::{OracleConfig, PolicyConfig};
use crate::model_registry::{ModelHandle, Predict};
use crate::oracle::SearchOracle;
use crate::position::{EncodingCache, Position};
use crate::record::{EvalSource, EvaluationResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shakmaty::{CastlingMode, EnPassantMode, Move, Position as _};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("no legal moves")]
    NoLegalMoves,

    #[error("neither the engine nor the model could evaluate the position: {0}")]
    PolicyUnavailable(String),
}

/// Weights used to combine the engine and model scores
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Blend {
    pub engine_weight: f32,
    pub source: EvalSource,
}

impl Blend {
    pub fn uses_engine(&self) -> bool {
        self.engine_weight > 0.0
    }

    pub fn uses_model(&self) -> bool {
        self.engine_weight < 1.0
    }

    /// Weighted score. A missing side falls back to the other one, `None`
    /// only when the blend needs a score that is absent on both sides.
    pub fn combine(&self, engine: Option<i32>, model: Option<i32>) -> Option<i32> {
        let engine = engine.filter(|_| self.uses_engine());
        let model = model.filter(|_| self.uses_model());
        match (engine, model) {
            (Some(e), Some(m)) => {
                let w = self.engine_weight;
                Some((w * e as f32 + (1.0 - w) * m as f32).round() as i32)
            }
            (Some(e), None) => Some(e),
            (None, Some(m)) => Some(m),
            (None, None) => None,
        }
    }
}

/// Decision table mapping the availability of each evaluator to a blend
#[derive(Clone, Copy, Debug)]
pub struct BlendTable {
    weight: f32,
}

impl BlendTable {
    pub fn new(weight: f32) -> Self {
        BlendTable {
            weight: weight.clamp(0.0, 1.0),
        }
    }

    ///| engine | model | engine weight |
    ///|--------|-------|---------------|
    ///| ok     | ok    | `w`           |
    ///| failed | ok    | 0             |
    ///| ok     | failed| 1             |
    ///| failed | failed| unavailable   |
    pub fn resolve(&self, engine_ok: bool, model_ok: bool) -> Option<Blend> {
        let engine_weight = match (engine_ok, model_ok) {
            (true, true) => self.weight,
            (false, true) => 0.0,
            (true, false) => 1.0,
            (false, false) => return None,
        };
        let source = if engine_weight >= 1.0 {
            EvalSource::Engine
        } else if engine_weight <= 0.0 {
            EvalSource::Model
        } else {
            EvalSource::Blended
        };
        Some(Blend {
            engine_weight,
            source,
        })
    }
}

/// Move chosen by the policy and how it was evaluated
#[derive(Clone, Debug)]
pub struct Decision {
    pub chosen: Move,
    pub uci: String,
    /// Blended evaluation of the position, side to move's perspective
    pub evaluation: EvaluationResult,
    pub exploratory: bool,
    pub model_version: u64,
}

pub struct MovePolicy {
    oracle: Arc<dyn SearchOracle>,
    table: BlendTable,

    depth: u32,
    time_budget: Duration,
    multipv: usize,
    exploration_rate: f64,

    rng: Mutex<StdRng>,
}

impl MovePolicy {
    pub fn new(oracle: Arc<dyn SearchOracle>, oracle_config: &OracleConfig, config: &PolicyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        MovePolicy {
            oracle,
            table: BlendTable::new(config.blend_weight),
            depth: oracle_config.depth,
            time_budget: oracle_config.time_budget(),
            multipv: oracle_config.multipv,
            exploration_rate: config.exploration_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }

    pub fn choose_move(
        &self,
        position: &Position,
        legal_moves: &[Move],
        active_model: &ModelHandle,
        cache: &mut EncodingCache,
    ) -> Result<Decision, PolicyError> {
        if legal_moves.is_empty() {
            return Err(PolicyError::NoLegalMoves);
        }

        // one read per decision, a concurrent swap does not affect it
        let model = active_model.snapshot();

        let lines = match self
            .oracle
            .evaluate_lines(position, self.depth, self.time_budget, self.multipv)
        {
            Ok(lines) if !lines.is_empty() => Some(lines),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, fen = %position, "oracle unavailable, deciding without it");
                None
            }
        };

        let model_eval = match cache.encode(&model, position.setup()) {
            Ok(features) => Some(model.predict(&features)),
            Err(error) => {
                tracing::warn!(%error, fen = %position, "model cannot evaluate the position");
                None
            }
        };

        let blend = self
            .table
            .resolve(lines.is_some(), model_eval.is_some())
            .ok_or_else(|| PolicyError::PolicyUnavailable(position.fen()))?;

        let engine_best = lines.as_ref().and_then(|lines| lines.first());
        let score = blend
            .combine(
                engine_best.map(|e| e.score_cp),
                model_eval.as_ref().map(|m| m.score_cp),
            )
            .ok_or_else(|| PolicyError::PolicyUnavailable(position.fen()))?;
        let evaluation = EvaluationResult {
            score_cp: score,
            principal_variation: engine_best
                .map(|e| e.principal_variation.clone())
                .unwrap_or_default(),
            depth_reached: engine_best.map_or(0, |e| e.depth_reached),
            source: blend.source,
            model_version: blend.uses_model().then(|| model.version()),
        };

        let explore = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            if rng.gen_bool(self.exploration_rate) {
                Some(rng.gen_range(0..legal_moves.len()))
            } else {
                None
            }
        };

        let (index, exploratory) = match explore {
            Some(index) => (index, true),
            None => (
                self.lookahead(position, legal_moves, &model, lines.as_deref(), blend, cache)?,
                false,
            ),
        };

        let chosen = legal_moves[index].clone();
        let uci = to_uci(&chosen);
        tracing::debug!(
            uci = %uci,
            score,
            source = ?blend.source,
            exploratory,
            model_version = model.version(),
            "move chosen"
        );

        Ok(Decision {
            chosen,
            uci,
            evaluation,
            exploratory,
            model_version: model.version(),
        })
    }

    /// Index of the best legal move after one ply
    fn lookahead(
        &self,
        position: &Position,
        legal_moves: &[Move],
        model: &nn::model::ValueModel,
        lines: Option<&[EvaluationResult]>,
        blend: Blend,
        cache: &mut EncodingCache,
    ) -> Result<usize, PolicyError> {
        let (chess, blend) = match position.to_chess() {
            Ok(chess) if blend.uses_model() => (Some(chess), blend),
            Ok(_) => (None, blend),
            Err(error) if blend.uses_engine() => {
                // children cannot be generated, rank by the engine lines alone
                tracing::warn!(%error, fen = %position, "lookahead without the model");
                let engine_only = self
                    .table
                    .resolve(true, false)
                    .ok_or_else(|| PolicyError::PolicyUnavailable(position.fen()))?;
                (None, engine_only)
            }
            Err(error) => {
                return Err(PolicyError::PolicyUnavailable(format!(
                    "{}: {}",
                    position.fen(),
                    error
                )))
            }
        };

        let lines = lines.unwrap_or_default();
        let pv_move = lines.first().and_then(|l| l.best_move());
        // moves the engine did not report are at most as good as its worst line
        let floor = lines.iter().map(|l| l.score_cp).min();

        let mut best: Option<(i32, bool, usize)> = None;
        for (index, m) in legal_moves.iter().enumerate() {
            let uci = to_uci(m);

            let engine_score = if blend.uses_engine() {
                lines
                    .iter()
                    .find(|l| l.best_move() == Some(uci.as_str()))
                    .map(|l| l.score_cp)
                    .or(floor)
            } else {
                None
            };

            let model_score = chess.as_ref().and_then(|chess| {
                let mut child = chess.clone();
                child.play_unchecked(m);
                let setup = child.into_setup(EnPassantMode::Legal);
                cache
                    .encode(model, &setup)
                    .ok()
                    .map(|features| -model.predict(&features).score_cp)
            });

            let Some(score) = blend.combine(engine_score, model_score) else {
                continue;
            };
            let is_pv = pv_move == Some(uci.as_str());

            let better = match best {
                None => true,
                Some((best_score, best_is_pv, _)) => {
                    score > best_score || (score == best_score && is_pv && !best_is_pv)
                }
            };
            if better {
                best = Some((score, is_pv, index));
            }
        }

        best.map(|(_, _, index)| index)
            .ok_or_else(|| PolicyError::PolicyUnavailable(position.fen()))
    }
}

pub fn to_uci(m: &Move) -> String {
    m.to_uci(CastlingMode::Standard).to_string()
}
