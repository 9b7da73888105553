//! Drives one game from the start signal to its end.

use crate::config::SessionConfig;
use crate::model_registry::ModelHandle;
use crate::platform::{PlatformClient, PlatformError, PlatformEvent};
use crate::policy::{Decision, MovePolicy, PolicyError};
use crate::position::EncodingCache;
use crate::record::{GameInfo, GameResult, LiveDecision, PlayedMove, RawGame, Termination};
use chrono::{DateTime, Utc};
use shakmaty::fen::Fen;
use shakmaty::{Color, Move, Position as _};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingTurn,
    Deciding,
    Submitting,
    Finished,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Aborted)
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub final_state: SessionState,
    /// Present when the game finished and its moves could be retrieved
    pub raw_game: Option<RawGame>,
    /// Every state visited, starting with `Idle`
    pub transitions: Vec<SessionState>,
}

pub struct GameSession<'a> {
    platform: &'a dyn PlatformClient,
    policy: &'a MovePolicy,
    model: &'a ModelHandle,
    config: SessionConfig,
    abort: Arc<AtomicBool>,

    state: SessionState,
    transitions: Vec<SessionState>,
    connect_polls: u32,

    info: Option<GameInfo>,
    started_at: Option<DateTime<Utc>>,
    pending: Option<(u32, Decision)>,
    decisions: HashMap<u32, LiveDecision>,
    ending: Option<(GameResult, Termination)>,
    cache: EncodingCache,
}

impl<'a> GameSession<'a> {
    pub fn new(
        platform: &'a dyn PlatformClient,
        policy: &'a MovePolicy,
        model: &'a ModelHandle,
        config: SessionConfig,
        abort: Arc<AtomicBool>,
    ) -> Self {
        GameSession {
            platform,
            policy,
            model,
            config,
            abort,
            state: SessionState::Idle,
            transitions: vec![SessionState::Idle],
            connect_polls: 0,
            info: None,
            started_at: None,
            pending: None,
            decisions: HashMap::new(),
            ending: None,
            cache: EncodingCache::new(),
        }
    }

    pub fn run(mut self) -> SessionOutcome {
        while !self.state.is_terminal() {
            let step = if self.abort.load(Ordering::SeqCst) {
                self.on_abort()
            } else {
                match self.state {
                    SessionState::Idle => self.wait_for_start(),
                    SessionState::Connecting => self.connect(),
                    SessionState::AwaitingTurn => self.await_turn(),
                    SessionState::Deciding => self.decide(),
                    SessionState::Submitting => self.submit(),
                    SessionState::Finished | SessionState::Aborted => break,
                }
            };

            match step {
                Ok(next) => self.transition(next),
                Err(error) => {
                    tracing::error!(%error, state = ?self.state, "platform unavailable, aborting game");
                    self.transition(SessionState::Aborted);
                }
            }
        }

        let raw_game = match self.state {
            SessionState::Finished => self.raw_game(),
            _ => None,
        };

        tracing::info!(
            final_state = ?self.state,
            game_id = self.info.as_ref().map_or("-", |i| i.game_id.as_str()),
            result = ?raw_game.as_ref().map(|g| g.result),
            "session over"
        );

        SessionOutcome {
            final_state: self.state,
            raw_game,
            transitions: self.transitions,
        }
    }

    fn transition(&mut self, next: SessionState) {
        if next == self.state {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
        self.transitions.push(next);
    }

    fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.config.event_timeout_ms)
    }

    /// Runs `op`, retrying retryable errors with exponential backoff
    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, PlatformError>,
    ) -> Result<T, PlatformError> {
        let mut backoff = Duration::from_millis(self.config.backoff_initial_ms);
        let max_backoff = Duration::from_millis(self.config.backoff_max_ms);
        let mut attempt = 0;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(error)
                    if error.is_retryable()
                        && attempt < self.config.retry_attempts
                        && !self.abort.load(Ordering::SeqCst) =>
                {
                    attempt += 1;
                    tracing::warn!(%error, attempt, what, "platform call failed, retrying");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn wait_for_start(&mut self) -> Result<SessionState, PlatformError> {
        let timeout = self.event_timeout();
        let event = self.with_retry("next_event", || self.platform.next_event(timeout))?;
        Ok(match event {
            Some(PlatformEvent::GameStart) => SessionState::Connecting,
            _ => SessionState::Idle,
        })
    }

    fn connect(&mut self) -> Result<SessionState, PlatformError> {
        let position = self.with_retry("current_position", || self.platform.current_position())?;
        if position.is_none() {
            self.connect_polls += 1;
            if self.connect_polls > self.config.retry_attempts {
                return Err(PlatformError::Disconnected(
                    "game started but no position is available".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(self.config.backoff_initial_ms));
            return Ok(SessionState::Connecting);
        }

        let info = self.with_retry("game_info", || self.platform.game_info())?;
        tracing::info!(
            game_id = %info.game_id,
            opponent = %info.opponent,
            color = %info.agent_color,
            "game started"
        );
        self.info = Some(info);
        self.started_at = Some(Utc::now());
        Ok(SessionState::AwaitingTurn)
    }

    fn await_turn(&mut self) -> Result<SessionState, PlatformError> {
        let timeout = self.event_timeout();
        let event = self.with_retry("next_event", || self.platform.next_event(timeout))?;
        Ok(match event {
            Some(PlatformEvent::TurnReady) => SessionState::Deciding,
            Some(PlatformEvent::GameEnded {
                result,
                termination,
            }) => {
                self.ending = Some((result, termination));
                SessionState::Finished
            }
            Some(PlatformEvent::GameStart) | None => SessionState::AwaitingTurn,
        })
    }

    fn decide(&mut self) -> Result<SessionState, PlatformError> {
        let position = self
            .with_retry("current_position", || self.platform.current_position())?
            .ok_or_else(|| PlatformError::Disconnected("game disappeared".to_string()))?;
        let ply = self.with_retry("moves", || self.platform.moves())?.len() as u32;

        let chess = match position.to_chess() {
            Ok(chess) => chess,
            Err(error) => {
                tracing::error!(%error, fen = %position, "platform sent an illegal position");
                return self.resign();
            }
        };
        let legal: Vec<Move> = chess.legal_moves().into_iter().collect();

        match self
            .policy
            .choose_move(&position, &legal, self.model, &mut self.cache)
        {
            Ok(decision) => {
                self.pending = Some((ply, decision));
                Ok(SessionState::Submitting)
            }
            Err(PolicyError::NoLegalMoves) => {
                self.ending = Some(if chess.is_checkmate() {
                    (GameResult::Loss, Termination::Checkmate)
                } else {
                    (GameResult::Draw, Termination::Stalemate)
                });
                tracing::info!(fen = %position, "no legal moves");
                Ok(SessionState::Finished)
            }
            Err(error @ PolicyError::PolicyUnavailable(_)) => {
                tracing::error!(%error, "cannot decide a move, resigning");
                self.resign()
            }
        }
    }

    fn submit(&mut self) -> Result<SessionState, PlatformError> {
        let Some((ply, decision)) = self.pending.take() else {
            return Ok(SessionState::AwaitingTurn);
        };

        // a retry after a lost acknowledgement must not play the move twice
        let submitted = self.with_retry("submit_move", || {
            if self.platform.moves()?.len() as u32 > ply {
                return Ok(());
            }
            self.platform.submit_move(&decision.uci)
        });

        match submitted {
            Ok(()) => {
                self.decisions.insert(
                    ply,
                    LiveDecision {
                        evaluation: decision.evaluation,
                        exploratory: decision.exploratory,
                    },
                );
                Ok(SessionState::AwaitingTurn)
            }
            Err(PlatformError::Rejected(reason)) => {
                tracing::error!(uci = %decision.uci, %reason, "move rejected, resigning");
                self.resign()
            }
            Err(PlatformError::GameOver(reason)) => {
                // the ending arrives as the next event
                tracing::info!(uci = %decision.uci, %reason, "move not played, game over");
                Ok(SessionState::AwaitingTurn)
            }
            Err(error) => Err(error),
        }
    }

    fn resign(&mut self) -> Result<SessionState, PlatformError> {
        self.with_retry("resign", || self.platform.resign())?;
        self.ending = Some((GameResult::Loss, Termination::Resignation));
        Ok(SessionState::Finished)
    }

    fn on_abort(&mut self) -> Result<SessionState, PlatformError> {
        if self.info.is_none() {
            tracing::info!("abort requested before the game started");
            return Ok(SessionState::Aborted);
        }

        tracing::info!("abort requested, resigning");
        match self.platform.resign() {
            Ok(()) => {
                self.ending = Some((GameResult::Loss, Termination::Resignation));
                Ok(SessionState::Finished)
            }
            Err(error) => {
                tracing::warn!(%error, "could not resign");
                Ok(SessionState::Aborted)
            }
        }
    }

    fn raw_game(&mut self) -> Option<RawGame> {
        let info = self.info.clone()?;
        let (result, termination) = self.ending?;

        let moves = match self.with_retry("moves", || self.platform.moves()) {
            Ok(moves) => moves,
            Err(error) => {
                tracing::error!(%error, game_id = %info.game_id, "moves of the finished game are lost");
                return None;
            }
        };

        let first_mover = info
            .initial_fen
            .parse::<Fen>()
            .map(|fen| fen.into_setup().turn)
            .unwrap_or(Color::White);
        let agent = Color::from(info.agent_color);

        let moves = moves
            .into_iter()
            .enumerate()
            .map(|(ply, uci)| {
                let ply = ply as u32;
                let mover = if ply % 2 == 0 { first_mover } else { !first_mover };
                PlayedMove {
                    ply,
                    uci,
                    by_agent: mover == agent,
                    decision: self.decisions.remove(&ply),
                }
            })
            .collect();

        Some(RawGame {
            info,
            result,
            termination,
            moves,
            started_at: self.started_at.unwrap_or_else(Utc::now),
            ended_at: Utc::now(),
        })
    }
}

