use anyhow::Result;
use bot::config::Config;
use bot::record::GameRecord;
use bot::store::ExperienceStore;
use clap::Args;
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use zstd::Encoder;

#[derive(Args)]
pub struct ExportDatasetCommand {
    /// Output .csv (or csv.zst) file to write the samples
    #[arg(long, value_name = "output")]
    output: String,

    /// Whether to compress the output CSV with the ZSTD algorithm
    #[arg(long, default_value = "false")]
    compress: bool,

    /// Only export positions where the agent was to move
    #[arg(long, default_value = "false")]
    agent_only: bool,
}

pub fn export_dataset(cmd: ExportDatasetCommand, config: Config) -> Result<()> {
    let store = ExperienceStore::open(&config.store.dir)?;
    let games = store.games();

    // compress output if asked
    let output_file = File::create(&cmd.output)?;
    let mut writer: Box<dyn io::Write> = if cmd.compress {
        // the encoder is buffered internally
        Box::new(Encoder::new(output_file, 3)?.auto_finish())
    } else {
        Box::new(BufWriter::new(output_file))
    };

    println!("Store: {} ({} games)", config.store.dir.display(), games.len());
    println!("Output: {}", cmd.output);
    println!("Write compressed: {}", cmd.compress);

    let bar = ProgressBar::new(games.len() as u64).with_style(
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?,
    );

    let mut count = 0;
    for game in &games {
        count += write_samples(&mut writer, game, cmd.agent_only)?;
        bar.inc(1);
        bar.set_message(format!("[Samples {}]", HumanCount(count as u64)));
    }
    writer.flush()?;
    bar.finish();

    println!("Done. Written positions: {}", count);
    Ok(())
}

/// Writes one `fen,score,bestmove` line per move whose best move is known
fn write_samples(writer: &mut dyn Write, game: &GameRecord, agent_only: bool) -> io::Result<usize> {
    let mut count = 0;
    for m in game.moves.iter().filter(|m| !agent_only || m.by_agent) {
        let Some(best) = m.evaluation_after_best.best_move() else {
            continue;
        };
        writeln!(writer, "{},{},{}", m.fen_before, m.evaluation_after_best.score_cp, best)?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bot::position::Side;
    use bot::record::{
        EvalSource, EvaluationResult, GameInfo, GameResult, MoveLabel, MoveRecord, Termination,
    };
    use chrono::Utc;

    fn evaluation(score_cp: i32, pv: &[&str]) -> EvaluationResult {
        EvaluationResult {
            score_cp,
            principal_variation: pv.iter().map(|s| s.to_string()).collect(),
            depth_reached: 16,
            source: EvalSource::Engine,
            model_version: None,
        }
    }

    fn record(ply: u32, by_agent: bool, pv: &[&str]) -> MoveRecord {
        MoveRecord {
            ply,
            fen_before: format!("fen{}", ply),
            move_played: "e2e4".to_string(),
            by_agent,
            exploratory: false,
            evaluation_before: None,
            evaluation_after_best: evaluation(25, pv),
            evaluation_played: evaluation(20, &[]),
            centipawn_loss: 5,
            label: MoveLabel::Good,
        }
    }

    #[test]
    fn writes_csv_lines() {
        let game = GameRecord {
            info: GameInfo {
                game_id: "g".to_string(),
                opponent: "o".to_string(),
                opponent_rating: None,
                agent_color: Side::White,
                time_control: None,
                initial_fen: "fen0".to_string(),
            },
            result: GameResult::Draw,
            termination: Termination::Stalemate,
            moves: vec![
                record(0, true, &["e2e4", "e7e5"]),
                record(1, false, &["g8f6"]),
                record(2, true, &[]),
            ],
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };

        let mut out = Vec::new();
        assert_eq!(write_samples(&mut out, &game, false).unwrap(), 2);
        assert_eq!(String::from_utf8(out).unwrap(), "fen0,25,e2e4\nfen1,25,g8f6\n");

        let mut out = Vec::new();
        assert_eq!(write_samples(&mut out, &game, true).unwrap(), 1);
    }
}
