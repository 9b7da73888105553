use anyhow::{anyhow, Context, Result};
use bot::config::Config;
use bot::position::Side;
use bot::record::{GameRecord, GameResult, MoveLabel, Termination};
use bot::store::ExperienceStore;
use clap::Args;
use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position, Setup};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};

#[derive(Args)]
pub struct ExportPgnCommand {
    /// Output .pgn file
    #[arg(long, value_name = "output")]
    output: String,

    /// Only export this game
    #[arg(long, value_name = "game-id")]
    game: Option<String>,

    /// Name of the agent in the White/Black headers
    #[arg(long, default_value = "bot")]
    name: String,
}

pub fn export_pgn(cmd: ExportPgnCommand, config: Config) -> Result<()> {
    let store = ExperienceStore::open(&config.store.dir)?;
    let games = match &cmd.game {
        Some(id) => vec![store
            .game(id)
            .ok_or_else(|| anyhow!("game {} is not in the store", id))?],
        None => store.games(),
    };

    let mut writer = BufWriter::new(File::create(&cmd.output)?);
    let mut written = 0;
    for game in &games {
        match game_pgn(game, &cmd.name) {
            Ok(pgn) => {
                writer.write_all(pgn.as_bytes())?;
                written += 1;
            }
            Err(error) => tracing::warn!(%error, game_id = %game.game_id(), "skipping game"),
        }
    }
    writer.flush()?;

    println!("Done. Written games: {} of {}", written, games.len());
    Ok(())
}

/// `1-0`, `0-1` or `1/2-1/2` for the game
fn result_tag(game: &GameRecord) -> &'static str {
    match (game.result, game.info.agent_color) {
        (GameResult::Draw, _) => "1/2-1/2",
        (GameResult::Win, Side::White) | (GameResult::Loss, Side::Black) => "1-0",
        (GameResult::Win, Side::Black) | (GameResult::Loss, Side::White) => "0-1",
    }
}

/// Renders a stored game as PGN with SAN moves. Agent moves labeled as
/// inaccuracies or worse get a comment with their centipawn loss.
pub fn game_pgn(game: &GameRecord, agent_name: &str) -> Result<String> {
    let info = &game.info;
    let fen: Fen = info
        .initial_fen
        .parse()
        .with_context(|| format!("initial position {}", info.initial_fen))?;
    let mut chess: Chess = fen
        .into_position(CastlingMode::Standard)
        .map_err(|e| anyhow!("initial position {}: {}", info.initial_fen, e))?;
    let standard_start = chess.clone().into_setup(EnPassantMode::Legal) == Setup::initial();

    let (white, black) = match info.agent_color {
        Side::White => (agent_name, info.opponent.as_str()),
        Side::Black => (info.opponent.as_str(), agent_name),
    };
    let result = result_tag(game);

    let mut pgn = String::new();
    let mut header = |key: &str, value: &str| {
        let _ = writeln!(pgn, "[{} \"{}\"]", key, value.replace('\\', "\\\\").replace('"', "\\\""));
    };
    header("Event", "Agent game");
    header("Site", &info.game_id);
    header("Date", &game.started_at.format("%Y.%m.%d").to_string());
    header("White", white);
    header("Black", black);
    header("Result", result);
    if let Some(rating) = info.opponent_rating {
        let key = match info.agent_color {
            Side::White => "BlackElo",
            Side::Black => "WhiteElo",
        };
        header(key, &rating.to_string());
    }
    if let Some(time_control) = &info.time_control {
        header("TimeControl", time_control);
    }
    header(
        "Termination",
        match game.termination {
            Termination::TimeForfeit => "Time forfeit",
            _ => "Normal",
        },
    );
    if !standard_start {
        header("SetUp", "1");
        header("FEN", &info.initial_fen);
    }
    pgn.push('\n');

    let mut movetext = Vec::with_capacity(game.moves.len() * 2 + 1);
    for (i, record) in game.moves.iter().enumerate() {
        let number = chess.fullmoves().get();
        match chess.turn() {
            Color::White => movetext.push(format!("{}.", number)),
            Color::Black if i == 0 => movetext.push(format!("{}...", number)),
            Color::Black => {}
        }

        let m = record
            .move_played
            .parse::<UciMove>()
            .ok()
            .and_then(|uci| uci.to_move(&chess).ok())
            .ok_or_else(|| anyhow!("illegal move {} at ply {}", record.move_played, record.ply))?;
        movetext.push(SanPlus::from_move_and_play_unchecked(&mut chess, &m).to_string());

        if record.by_agent && record.label >= MoveLabel::Inaccuracy {
            movetext.push(format!("{{ {}, {} cp }}", record.label, record.centipawn_loss));
        }
    }
    movetext.push(result.to_string());

    // 80 column lines
    let mut line_len = 0;
    for token in movetext {
        if line_len > 0 && line_len + 1 + token.len() > 80 {
            pgn.push('\n');
            line_len = 0;
        } else if line_len > 0 {
            pgn.push(' ');
            line_len += 1;
        }
        line_len += token.len();
        pgn.push_str(&token);
    }
    pgn.push_str("\n\n");

    Ok(pgn)
}
