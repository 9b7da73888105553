use super::{PlatformClient, PlatformError, PlatformEvent};
use crate::config::{LocalConfig, OpponentKind};
use crate::oracle::SearchOracle;
use crate::policy::to_uci;
use crate::position::{Clock, Position, Side};
use crate::record::{GameInfo, GameResult, Termination};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Move, Position as _};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Who the agent plays against on the local platform
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opponent {
    /// Best move of the search oracle at a fixed depth
    Engine { depth: u32 },
    /// Uniformly random legal move
    Random,
}

impl Opponent {
    pub fn from_config(config: &LocalConfig) -> Self {
        match config.opponent {
            OpponentKind::Engine => Opponent::Engine {
                depth: config.opponent_depth,
            },
            OpponentKind::Random => Opponent::Random,
        }
    }

    fn name(&self) -> String {
        match self {
            Opponent::Engine { depth } => format!("engine-depth-{}", depth),
            Opponent::Random => "random".to_string(),
        }
    }
}

struct LocalGame {
    info: GameInfo,
    chess: Chess,
    moves: Vec<String>,
    agent: Color,
    clock: Clock,

    started: bool,
    turn_signaled: bool,
    turn_started: Instant,
    outcome: Option<(GameResult, Termination)>,
    end_reported: bool,

    rng: StdRng,
}

/// Hosts a single game in-process between the agent and an opponent
pub struct LocalPlatform {
    game: Mutex<LocalGame>,
    opponent: Opponent,
    oracle: Option<Arc<dyn SearchOracle>>,
    opponent_budget: Duration,
    max_plies: u32,
    increment_ms: u64,
}

impl LocalPlatform {
    pub fn new(
        game_id: impl Into<String>,
        agent: Color,
        opponent: Opponent,
        oracle: Option<Arc<dyn SearchOracle>>,
        config: &LocalConfig,
        seed: u64,
    ) -> Self {
        Self::from_position(game_id, Chess::default(), agent, opponent, oracle, config, seed)
    }

    pub fn from_fen(
        game_id: impl Into<String>,
        fen: &str,
        agent: Color,
        opponent: Opponent,
        oracle: Option<Arc<dyn SearchOracle>>,
        config: &LocalConfig,
        seed: u64,
    ) -> Result<Self, PlatformError> {
        let chess: Chess = fen
            .parse::<Fen>()
            .map_err(|e| PlatformError::Rejected(format!("bad fen {}: {}", fen, e)))?
            .into_position(CastlingMode::Standard)
            .map_err(|e| PlatformError::Rejected(format!("illegal position {}: {}", fen, e)))?;
        Ok(Self::from_position(game_id, chess, agent, opponent, oracle, config, seed))
    }

    fn from_position(
        game_id: impl Into<String>,
        chess: Chess,
        agent: Color,
        opponent: Opponent,
        oracle: Option<Arc<dyn SearchOracle>>,
        config: &LocalConfig,
        seed: u64,
    ) -> Self {
        let initial_fen = Fen::from_position(chess.clone(), EnPassantMode::Legal).to_string();
        let time_control = format!(
            "{}+{}",
            config.base_time_ms / 1_000,
            config.increment_ms / 1_000
        );

        LocalPlatform {
            game: Mutex::new(LocalGame {
                info: GameInfo {
                    game_id: game_id.into(),
                    opponent: opponent.name(),
                    opponent_rating: None,
                    agent_color: Side::from(agent),
                    time_control: Some(time_control),
                    initial_fen,
                },
                chess,
                moves: Vec::new(),
                agent,
                clock: Clock::new(config.base_time_ms, config.base_time_ms),
                started: false,
                turn_signaled: false,
                turn_started: Instant::now(),
                outcome: None,
                end_reported: false,
                rng: StdRng::seed_from_u64(seed),
            }),
            opponent,
            oracle,
            opponent_budget: Duration::from_secs(10),
            max_plies: config.max_plies,
            increment_ms: config.increment_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalGame> {
        self.game.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn opponent_move(&self, game: &mut LocalGame) -> Option<Move> {
        let legal = game.chess.legal_moves();

        if let (Opponent::Engine { depth }, Some(oracle)) = (self.opponent, &self.oracle) {
            let position = Position::from_chess(&game.chess, game.clock);
            match oracle.evaluate(&position, depth, self.opponent_budget) {
                Ok(evaluation) => {
                    let found = evaluation
                        .best_move()
                        .and_then(|uci| uci.parse::<UciMove>().ok())
                        .and_then(|uci| uci.to_move(&game.chess).ok());
                    if found.is_some() {
                        return found;
                    }
                    tracing::warn!(fen = %position, "engine opponent gave no legal move");
                }
                Err(error) => {
                    tracing::warn!(%error, "engine opponent failed, playing a random move");
                }
            }
        }

        legal.choose(&mut game.rng).cloned()
    }

    /// Plays `m` for the side to move, unless its flag fell first
    fn play(&self, game: &mut LocalGame, m: &Move) -> Result<(), PlatformError> {
        let mover = game.chess.turn();
        let elapsed = game.turn_started.elapsed().as_millis() as u64;

        let remaining = game.clock.remaining_mut(mover);
        if elapsed >= *remaining {
            *remaining = 0;
            game.outcome = Some((
                result_for(game.agent, Some(!mover)),
                Termination::TimeForfeit,
            ));
            return Err(PlatformError::GameOver(format!("{:?} lost on time", mover)));
        }
        *remaining = *remaining - elapsed + self.increment_ms;

        game.moves.push(to_uci(m));
        game.chess.play_unchecked(m);
        game.turn_started = Instant::now();
        game.turn_signaled = false;

        self.check_end(game);
        Ok(())
    }

    fn check_end(&self, game: &mut LocalGame) {
        let chess = &game.chess;
        let outcome = if chess.is_checkmate() {
            Some((result_for(game.agent, Some(!chess.turn())), Termination::Checkmate))
        } else if chess.is_stalemate() {
            Some((GameResult::Draw, Termination::Stalemate))
        } else if chess.is_insufficient_material() {
            Some((GameResult::Draw, Termination::InsufficientMaterial))
        } else if chess.halfmoves() >= 100 {
            Some((GameResult::Draw, Termination::FiftyMoves))
        } else if game.moves.len() as u32 >= self.max_plies {
            Some((GameResult::Draw, Termination::MoveLimit))
        } else {
            None
        };

        if let Some((result, termination)) = outcome {
            tracing::debug!(game_id = %game.info.game_id, %result, ?termination, "local game over");
            game.outcome = Some((result, termination));
        }
    }
}

fn result_for(agent: Color, winner: Option<Color>) -> GameResult {
    match winner {
        Some(winner) if winner == agent => GameResult::Win,
        Some(_) => GameResult::Loss,
        None => GameResult::Draw,
    }
}

impl PlatformClient for LocalPlatform {
    fn next_event(&self, _timeout: Duration) -> Result<Option<PlatformEvent>, PlatformError> {
        let mut game = self.lock();

        if !game.started {
            game.started = true;
            game.turn_started = Instant::now();
            return Ok(Some(PlatformEvent::GameStart));
        }

        if game.outcome.is_none() && game.chess.turn() != game.agent {
            self.check_end(&mut game);
            if game.outcome.is_none() {
                match self.opponent_move(&mut game) {
                    Some(m) => {
                        if let Err(error) = self.play(&mut game, &m) {
                            tracing::debug!(%error, "opponent move not played");
                        }
                    }
                    None => self.check_end(&mut game),
                }
            }
        }

        if let Some((result, termination)) = game.outcome {
            if game.end_reported {
                return Ok(None);
            }
            game.end_reported = true;
            return Ok(Some(PlatformEvent::GameEnded {
                result,
                termination,
            }));
        }

        if game.chess.turn() == game.agent && !game.turn_signaled {
            game.turn_signaled = true;
            return Ok(Some(PlatformEvent::TurnReady));
        }
        Ok(None)
    }

    fn game_info(&self) -> Result<GameInfo, PlatformError> {
        Ok(self.lock().info.clone())
    }

    fn current_position(&self) -> Result<Option<Position>, PlatformError> {
        let game = self.lock();
        if !game.started {
            return Ok(None);
        }
        Ok(Some(Position::from_chess(&game.chess, game.clock)))
    }

    fn moves(&self) -> Result<Vec<String>, PlatformError> {
        Ok(self.lock().moves.clone())
    }

    fn submit_move(&self, uci: &str) -> Result<(), PlatformError> {
        let mut game = self.lock();
        if game.outcome.is_some() {
            return Err(PlatformError::GameOver("game is over".to_string()));
        }
        if game.chess.turn() != game.agent {
            return Err(PlatformError::Rejected("not the agent's turn".to_string()));
        }

        let m = uci
            .parse::<UciMove>()
            .map_err(|e| PlatformError::Rejected(format!("{}: {}", uci, e)))?
            .to_move(&game.chess)
            .map_err(|e| PlatformError::Rejected(format!("{}: {}", uci, e)))?;

        self.play(&mut game, &m)
    }

    fn resign(&self) -> Result<(), PlatformError> {
        let mut game = self.lock();
        if game.outcome.is_none() {
            game.outcome = Some((GameResult::Loss, Termination::Resignation));
        }
        Ok(())
    }

    fn offer_draw(&self) -> Result<(), PlatformError> {
        let mut game = self.lock();
        if game.outcome.is_some() {
            return Ok(());
        }

        let accepted = match (self.opponent, &self.oracle) {
            (Opponent::Engine { depth }, Some(oracle)) => {
                let position = Position::from_chess(&game.chess, game.clock);
                match oracle.evaluate(&position, depth, self.opponent_budget) {
                    Ok(evaluation) => {
                        let for_opponent = if game.chess.turn() == game.agent {
                            -evaluation.score_cp
                        } else {
                            evaluation.score_cp
                        };
                        for_opponent <= 0
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        };

        tracing::info!(accepted, "draw offered");
        if accepted {
            game.outcome = Some((GameResult::Draw, Termination::DrawAgreed));
        }
        Ok(())
    }
}
