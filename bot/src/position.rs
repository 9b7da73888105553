use nn::feature_set::{EncodedFeatures, EncodingError};
use nn::model::ValueModel;
use serde::{Deserialize, Serialize};
use shakmaty::fen::{Fen, ParseFenError};
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, FromSetup, Position as _, PositionError, Setup};
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Time remaining for each side, in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    pub white_ms: u64,
    pub black_ms: u64,
}

impl Clock {
    pub fn new(white_ms: u64, black_ms: u64) -> Self {
        Clock { white_ms, black_ms }
    }

    pub fn remaining(&self, color: Color) -> Duration {
        Duration::from_millis(match color {
            Color::White => self.white_ms,
            Color::Black => self.black_ms,
        })
    }

    pub fn remaining_mut(&mut self, color: Color) -> &mut u64 {
        match color {
            Color::White => &mut self.white_ms,
            Color::Black => &mut self.black_ms,
        }
    }
}

/// Side of the board, serializable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    White,
    Black,
}

impl From<Color> for Side {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

impl From<Side> for Color {
    fn from(side: Side) -> Self {
        match side {
            Side::White => Color::White,
            Side::Black => Color::Black,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::White => "white",
            Side::Black => "black",
        })
    }
}

/// Immutable snapshot of a game: the board setup plus the clock.
///
/// Built from a FEN or from a `shakmaty::Chess`. Legality questions are
/// answered by converting into a validated `Chess` with [`Position::to_chess`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Position {
    setup: Setup,
    clock: Clock,
}

impl Position {
    pub fn from_fen(fen: &str, clock: Clock) -> Result<Self, ParseFenError> {
        let fen: Fen = fen.parse()?;
        Ok(Position {
            setup: fen.into_setup(),
            clock,
        })
    }

    pub fn from_chess(chess: &Chess, clock: Clock) -> Self {
        Position {
            setup: chess.clone().into_setup(EnPassantMode::Legal),
            clock,
        }
    }

    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn turn(&self) -> Color {
        self.setup.turn
    }

    pub fn fen(&self) -> String {
        Fen::from_setup(self.setup.clone()).to_string()
    }

    pub fn to_chess(&self) -> Result<Chess, PositionError<Chess>> {
        Chess::from_setup(self.setup.clone(), CastlingMode::Standard)
    }

    /// Zobrist key identifying the position for caching purposes. Clocks and
    /// move counters do not take part in it. `None` for illegal setups.
    pub fn key(&self) -> Option<u64> {
        setup_key(&self.setup)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fen())
    }
}

pub type HashKey = Zobrist64;

/// Zobrist hash of the setup, only defined for legal positions
pub fn setup_key(setup: &Setup) -> Option<u64> {
    let chess = Chess::from_setup(setup.clone(), CastlingMode::Standard).ok()?;
    let hash: HashKey = chess.zobrist_hash(EnPassantMode::Legal);
    Some(hash.0)
}

/// Memoizes encodings for the positions seen during one game
#[derive(Default)]
pub struct EncodingCache {
    feature_set: Option<&'static str>,
    entries: HashMap<u64, EncodedFeatures>,
    hits: u64,
}

impl EncodingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(
        &mut self,
        model: &ValueModel,
        setup: &Setup,
    ) -> Result<EncodedFeatures, EncodingError> {
        let name = model.feature_set().name();
        if self.feature_set != Some(name) {
            self.entries.clear();
            self.feature_set = Some(name);
        }

        let Some(key) = setup_key(setup) else {
            return model.encode(setup);
        };
        if let Some(features) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(features.clone());
        }

        let features = model.encode(setup)?;
        self.entries.insert(key, features.clone());
        Ok(features)
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nn::feature_set::basic::Basic;
    use nn::model::ModelMeta;
    use shakmaty::uci::UciMove;
    use std::sync::Arc;

    fn model() -> ValueModel {
        let meta = ModelMeta {
            version: 0,
            trained_at: 0,
            training_game_count: 0,
        };
        ValueModel::constant(meta, Arc::new(Basic::new()), 0)
    }

    #[test]
    fn key_ignores_move_counters() {
        let a = Position::from_fen(
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1",
            Clock::default(),
        )
        .unwrap();
        let b = Position::from_fen(
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 7 30",
            Clock::new(1000, 2000),
        )
        .unwrap();
        let c = Position::from_fen(
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 1",
            Clock::default(),
        )
        .unwrap();

        assert!(a.key().is_some());
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn transpositions_share_a_cache_entry() {
        fn play(moves: &[&str]) -> Setup {
            let mut chess = Chess::default();
            for uci in moves {
                let m = uci.parse::<UciMove>().unwrap().to_move(&chess).unwrap();
                chess.play_unchecked(&m);
            }
            chess.into_setup(EnPassantMode::Legal)
        }

        let model = model();
        let mut cache = EncodingCache::new();
        let knights_first = play(&["g1f3", "g8f6", "b1c3", "b8c6"]);
        let queen_side_first = play(&["b1c3", "b8c6", "g1f3", "g8f6"]);

        assert_eq!(setup_key(&knights_first), setup_key(&queen_side_first));
        cache.encode(&model, &knights_first).unwrap();
        cache.encode(&model, &queen_side_first).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn fen_round_trip() {
        let fen = "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 3 20";
        let position = Position::from_fen(fen, Clock::default()).unwrap();
        assert_eq!(position.fen(), fen);
        assert_eq!(position.turn(), Color::White);
        assert!(position.to_chess().is_ok());
    }

    #[test]
    fn cache_hits_on_repeated_positions() {
        let model = model();
        let mut cache = EncodingCache::new();
        let setup = Setup::initial();

        let first = cache.encode(&model, &setup).unwrap();
        let second = cache.encode(&model, &setup).unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_does_not_store_failures() {
        let model = model();
        let mut cache = EncodingCache::new();
        let setup = Fen::from_ascii(b"8/8/8/8/8/8/8/4K3 w - - 0 1")
            .unwrap()
            .into_setup();

        assert!(cache.encode(&model, &setup).is_err());
        assert!(cache.is_empty());
    }
}
