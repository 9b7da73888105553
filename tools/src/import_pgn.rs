use crate::game_visitor::{FinalState, GameVisitor, PgnGame, VisitorConfig};
use anyhow::{Context, Result};
use bot::analysis::Analyzer;
use bot::config::Config;
use bot::oracle::{SearchOracle, UciOracle};
use bot::pipeline::PipelineError;
use bot::position::Side;
use bot::record::{GameInfo, GameResult, PlayedMove, RawGame, Termination};
use bot::store::{ExperienceStore, StoreError};
use chrono::Utc;
use clap::{Args, ValueEnum};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use pgn_reader::BufferedReader;
use rayon::prelude::*;
use shakmaty::Color;
use std::fs::File;
use std::io;
use std::sync::Arc;

#[derive(Clone, Copy, ValueEnum)]
pub enum PlayAs {
    White,
    Black,
    /// The winner's side, white for draws
    Winner,
}

#[derive(Args)]
pub struct ImportPgnCommand {
    /// Path or URL of a .pgn or .pgn.zst file to read games
    #[arg(long, value_name = "input")]
    input: String,

    /// Side whose moves are stored as the agent's
    #[arg(long, value_enum, default_value = "winner")]
    play_as: PlayAs,

    /// Stop after this many accepted games
    #[arg(long)]
    limit: Option<usize>,

    /// Games analyzed in parallel, one engine each
    #[arg(long, default_value = "4")]
    jobs: usize,

    /// Game visitor configuration
    #[clap(flatten)]
    visitor_config: VisitorConfig,
}

pub fn import_pgn(cmd: ImportPgnCommand, mut config: Config) -> Result<()> {
    // raw data stream (may be compressed)
    let raw_reader: Box<dyn io::Read> = if cmd.input.starts_with("http") {
        Box::new(reqwest::blocking::get(cmd.input.clone())?)
    } else {
        Box::new(File::open(&cmd.input).with_context(|| format!("opening {}", cmd.input))?)
    };

    // decompress if necessary
    let reader: Box<dyn io::Read> = if cmd.input.ends_with(".zst") {
        Box::new(zstd::Decoder::new(raw_reader)?)
    } else {
        raw_reader
    };

    let jobs = cmd.jobs.max(1);
    config.oracle.pool_size = jobs;
    config.oracle.max_pending = jobs;
    let oracle: Arc<dyn SearchOracle> = Arc::new(UciOracle::uci(&config.oracle));
    let analyzer = Analyzer::new(oracle, &config.analysis);
    let store = ExperienceStore::open(&config.store.dir)?;
    let threads = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;

    println!("Input: {}", cmd.input);
    println!("Store: {}", config.store.dir.display());

    let mut visitor = GameVisitor::new(cmd.visitor_config.clone());
    let mut game_reader = BufferedReader::new(reader);

    let bar = ProgressBar::new_spinner().with_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [Elapsed {elapsed_precise}] [Games {human_pos} @ {per_sec}] {msg}")?,
    );

    let limit = cmd.limit.unwrap_or(usize::MAX);
    let mut index = 0;
    let mut stored = 0;
    let mut failed = 0;
    let mut pending = Vec::with_capacity(jobs * 4);

    loop {
        let next = game_reader.read_game(&mut visitor)?;
        bar.inc(1);

        if let Some(Some(game)) = &next {
            if index < limit {
                pending.push(to_raw_game(game, cmd.play_as, index));
                index += 1;
            }
        }

        let done = next.is_none() || index >= limit;
        if pending.len() >= jobs * 4 || (done && !pending.is_empty()) {
            let analyzed: Vec<_> = threads.install(|| {
                pending
                    .par_iter()
                    .map(|raw| analyzer.analyze(raw))
                    .collect()
            });

            for (raw, analysis) in pending.drain(..).zip(analyzed) {
                let outcome = analysis
                    .map_err(PipelineError::from)
                    .and_then(|record| Ok(store.append(record)?));
                match outcome {
                    Ok(_) => stored += 1,
                    Err(PipelineError::Store(StoreError::Duplicate(_))) => {}
                    Err(error) => {
                        tracing::warn!(%error, game_id = %raw.info.game_id, "import failed, parking game");
                        store.park_unanalyzed(&raw)?;
                        failed += 1;
                    }
                }
            }
            bar.set_message(format!(
                "[Stored {}] [Parked {}]",
                HumanCount(stored as u64),
                failed
            ));
        }

        if done {
            break;
        }
    }
    bar.finish();

    println!("Done. Stored games: {}, parked: {}", stored, failed);
    if failed > 0 {
        println!("Run `bot reanalyze` to retry the parked games");
    }
    Ok(())
}

fn to_raw_game(game: &PgnGame, play_as: PlayAs, index: usize) -> RawGame {
    let winner = game.winner.flatten();
    let agent = match play_as {
        PlayAs::White => Color::White,
        PlayAs::Black => Color::Black,
        PlayAs::Winner => winner.unwrap_or(Color::White),
    };

    let result = match winner {
        Some(color) if color == agent => GameResult::Win,
        Some(_) => GameResult::Loss,
        None => GameResult::Draw,
    };
    let termination = match (game.final_state, game.termination.as_str(), winner) {
        (FinalState::Checkmate, _, _) => Termination::Checkmate,
        (FinalState::Stalemate, _, _) => Termination::Stalemate,
        (FinalState::InsufficientMaterial, _, _) => Termination::InsufficientMaterial,
        (_, "Time forfeit", _) => Termination::TimeForfeit,
        (_, _, Some(_)) => Termination::Resignation,
        (_, _, None) => Termination::DrawAgreed,
    };

    let first_mover = game
        .initial_fen
        .split_whitespace()
        .nth(1)
        .map_or(Color::White, |turn| if turn == "b" { Color::Black } else { Color::White });
    let (opponent, opponent_rating) = match agent {
        Color::White => (&game.black, game.black_elo),
        Color::Black => (&game.white, game.white_elo),
    };

    // lichess game urls end with the game id
    let game_id = match game.site.rsplit('/').next() {
        Some(id) if !id.is_empty() && game.site.contains('/') => format!("pgn-{}", id),
        _ => format!("pgn-{}-{}", Utc::now().format("%Y%m%d"), index),
    };

    RawGame {
        info: GameInfo {
            game_id,
            opponent: opponent.clone(),
            opponent_rating,
            agent_color: Side::from(agent),
            time_control: game.time_control.clone(),
            initial_fen: game.initial_fen.clone(),
        },
        result,
        termination,
        moves: game
            .moves
            .iter()
            .enumerate()
            .map(|(ply, uci)| {
                let mover = if ply % 2 == 0 { first_mover } else { !first_mover };
                PlayedMove {
                    ply: ply as u32,
                    uci: uci.clone(),
                    by_agent: mover == agent,
                    decision: None,
                }
            })
            .collect(),
        started_at: Utc::now(),
        ended_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(winner: Option<Option<Color>>, final_state: FinalState) -> PgnGame {
        PgnGame {
            site: "https://lichess.org/abcdEFGH".to_string(),
            white: "alice".to_string(),
            black: "bob".to_string(),
            white_elo: Some(1850),
            black_elo: Some(1900),
            time_control: None,
            termination: "Normal".to_string(),
            initial_fen: "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string(),
            winner,
            final_state,
            moves: vec!["f2f3".into(), "e7e5".into(), "g2g4".into(), "d8h4".into()],
        }
    }

    #[test]
    fn winner_is_the_agent() {
        let raw = to_raw_game(&game(Some(Some(Color::Black)), FinalState::Checkmate), PlayAs::Winner, 0);
        assert_eq!(raw.info.game_id, "pgn-abcdEFGH");
        assert_eq!(raw.info.agent_color, Side::Black);
        assert_eq!(raw.info.opponent, "alice");
        assert_eq!(raw.info.opponent_rating, Some(1850));
        assert_eq!(raw.result, GameResult::Win);
        assert_eq!(raw.termination, Termination::Checkmate);
        let agent: Vec<bool> = raw.moves.iter().map(|m| m.by_agent).collect();
        assert_eq!(agent, vec![false, true, false, true]);
    }

    #[test]
    fn losing_side_and_draws() {
        let raw = to_raw_game(&game(Some(Some(Color::Black)), FinalState::Other), PlayAs::White, 0);
        assert_eq!(raw.result, GameResult::Loss);
        assert_eq!(raw.termination, Termination::Resignation);

        let raw = to_raw_game(&game(Some(None), FinalState::Other), PlayAs::Winner, 0);
        assert_eq!(raw.result, GameResult::Draw);
        assert_eq!(raw.info.agent_color, Side::White);
        assert_eq!(raw.termination, Termination::DrawAgreed);
    }
}
