use clap::Args;
use pgn_reader::{RawHeader, SanPlus, Skip, Visitor};
use shakmaty::fen::Fen;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Outcome, Position};

#[derive(Args, Clone)]
pub struct VisitorConfig {
    /// Only accept games with at least this many plies
    #[arg(long, value_name = "min-plies", default_value = "20")]
    pub min_plies: usize,

    /// Only accept games where both player have at least this elo
    #[arg(long, value_name = "min-elo")]
    pub min_elo: Option<u32>,
}

/// How a finished PGN game ended on the board
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalState {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    Other,
}

/// A game read from a PGN file, moves in UCI notation
#[derive(Clone, Debug)]
pub struct PgnGame {
    pub site: String,
    pub white: String,
    pub black: String,
    pub white_elo: Option<u32>,
    pub black_elo: Option<u32>,
    pub time_control: Option<String>,
    pub termination: String,
    pub initial_fen: String,
    /// `None` when the game is unfinished
    pub winner: Option<Option<Color>>,
    pub final_state: FinalState,
    pub moves: Vec<String>,
}

pub struct GameVisitor {
    config: VisitorConfig,

    position: Chess,
    game: PgnGame,
    /// Set when a move could not be replayed
    broken: bool,
}

impl GameVisitor {
    pub fn new(config: VisitorConfig) -> Self {
        GameVisitor {
            config,
            position: Chess::default(),
            game: empty_game(),
            broken: false,
        }
    }
}

fn empty_game() -> PgnGame {
    PgnGame {
        site: String::new(),
        white: String::new(),
        black: String::new(),
        white_elo: None,
        black_elo: None,
        time_control: None,
        termination: String::new(),
        initial_fen: Fen::from_position(Chess::default(), EnPassantMode::Legal).to_string(),
        winner: None,
        final_state: FinalState::Other,
        moves: Vec::new(),
    }
}

impl Visitor for GameVisitor {
    type Result = Option<PgnGame>;

    fn begin_game(&mut self) {
        self.position = Chess::default();
        self.game = empty_game();
        self.broken = false;
    }

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        let value = value.decode_utf8_lossy().to_string();

        match key {
            b"Site" => self.game.site = value,
            b"White" => self.game.white = value,
            b"Black" => self.game.black = value,
            b"WhiteElo" => self.game.white_elo = value.parse().ok(),
            b"BlackElo" => self.game.black_elo = value.parse().ok(),
            b"TimeControl" => self.game.time_control = Some(value),
            b"Termination" => self.game.termination = value,
            b"FEN" => {
                let position = value
                    .parse::<Fen>()
                    .ok()
                    .and_then(|fen| fen.into_position(CastlingMode::Standard).ok());
                match position {
                    Some(position) => {
                        self.position = position;
                        self.game.initial_fen = value;
                    }
                    None => self.broken = true,
                }
            }
            _ => {}
        }
    }

    fn end_headers(&mut self) -> Skip {
        let min_elo = self.config.min_elo.unwrap_or(0);

        let keep =
            // keep normal terminations (excl. Abandoned, Rules infraction)
            matches!(self.game.termination.as_str(), "" | "Normal" | "Time forfeit") &&
            self.game.white_elo.unwrap_or(0) >= min_elo &&
            self.game.black_elo.unwrap_or(0) >= min_elo &&
            !self.broken;

        Skip(!keep)
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn san(&mut self, san_plus: SanPlus) {
        if self.broken {
            return;
        }
        match san_plus.san.to_move(&self.position) {
            Ok(m) => {
                self.game
                    .moves
                    .push(m.to_uci(CastlingMode::Standard).to_string());
                self.position.play_unchecked(&m);
            }
            Err(_) => self.broken = true,
        }
    }

    fn outcome(&mut self, outcome: Option<Outcome>) {
        self.game.winner = outcome.map(|o| o.winner());
    }

    fn end_game(&mut self) -> Self::Result {
        // note: skipped games go through here too
        if self.broken || self.game.winner.is_none() || self.game.moves.len() < self.config.min_plies {
            return None;
        }

        self.game.final_state = if self.position.is_checkmate() {
            FinalState::Checkmate
        } else if self.position.is_stalemate() {
            FinalState::Stalemate
        } else if self.position.is_insufficient_material() {
            FinalState::InsufficientMaterial
        } else {
            FinalState::Other
        };

        Some(std::mem::replace(&mut self.game, empty_game()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgn_reader::BufferedReader;

    const PGN: &str = r#"[Event "Rated Blitz game"]
[Site "https://lichess.org/abcdEFGH"]
[White "alice"]
[Black "bob"]
[Result "0-1"]
[WhiteElo "1850"]
[BlackElo "1900"]
[TimeControl "180+2"]
[Termination "Normal"]

1. f3 e5 2. g4 Qh4# 0-1

[Event "Rated Blitz game"]
[White "carol"]
[Black "dave"]
[Result "1-0"]
[WhiteElo "1200"]
[BlackElo "1300"]
[Termination "Normal"]

1. e4 e5 2. Qh5 Nc6 3. Bc4 Nf6 4. Qxf7# 1-0
"#;

    fn config(min_plies: usize, min_elo: Option<u32>) -> VisitorConfig {
        VisitorConfig { min_plies, min_elo }
    }

    fn read(config: VisitorConfig) -> Vec<PgnGame> {
        let mut reader = BufferedReader::new_cursor(PGN.as_bytes());
        let mut visitor = GameVisitor::new(config);
        let mut games = Vec::new();
        while let Ok(Some(game)) = reader.read_game(&mut visitor) {
            games.extend(game);
        }
        games
    }

    #[test]
    fn reads_moves_and_headers() {
        let games = read(config(1, None));
        assert_eq!(games.len(), 2);

        let fools = &games[0];
        assert_eq!(fools.moves, vec!["f2f3", "e7e5", "g2g4", "d8h4"]);
        assert_eq!(fools.winner, Some(Some(Color::Black)));
        assert_eq!(fools.final_state, FinalState::Checkmate);
        assert_eq!(fools.black_elo, Some(1900));
        assert_eq!(fools.time_control.as_deref(), Some("180+2"));
    }

    #[test]
    fn filters_by_elo_and_length() {
        let games = read(config(1, Some(1500)));
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].white, "alice");

        assert!(read(config(5, None)).iter().all(|g| g.moves.len() >= 5));
        assert_eq!(read(config(5, None)).len(), 1);
    }
}
