//! Interface to the place where games are played.

pub mod local;

use crate::position::Position;
use crate::record::{GameInfo, GameResult, Termination};
use std::time::Duration;

pub use local::{LocalPlatform, Opponent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    GameStart,
    /// It is the agent's turn
    TurnReady,
    GameEnded {
        result: GameResult,
        termination: Termination,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// Worth retrying
    #[error("transient platform error: {0}")]
    Transient(String),

    #[error("disconnected from the platform: {0}")]
    Disconnected(String),

    /// The platform refused a move; the game state is not what we think it is
    #[error("move rejected: {0}")]
    Rejected(String),

    /// The game ended before the call took effect
    #[error("game over: {0}")]
    GameOver(String),
}

impl PlatformError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::Transient(_) | PlatformError::Disconnected(_)
        )
    }
}

pub trait PlatformClient: Send + Sync {
    /// Waits up to `timeout` for the next event; `None` if nothing happened
    fn next_event(&self, timeout: Duration) -> Result<Option<PlatformEvent>, PlatformError>;

    fn game_info(&self) -> Result<GameInfo, PlatformError>;

    /// `None` while no game is in progress
    fn current_position(&self) -> Result<Option<Position>, PlatformError>;

    /// Moves of the current game in UCI notation, from the initial position
    fn moves(&self) -> Result<Vec<String>, PlatformError>;

    fn submit_move(&self, uci: &str) -> Result<(), PlatformError>;

    fn resign(&self) -> Result<(), PlatformError>;

    fn offer_draw(&self) -> Result<(), PlatformError>;
}
