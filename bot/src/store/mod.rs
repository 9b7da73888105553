//! Durable, append-only log of analyzed games.
//!
//! The store is a directory of JSON-lines files. Every line carries a
//! `schema_version`; unknown fields are ignored and missing optional fields
//! take their default, so older readers and writers interoperate.

pub mod sampling;

use crate::record::{GameRecord, GameResult, MoveLabel, RawGame};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub use sampling::{SampleCriteria, TrainingBatch, TrainingSample};

pub const SCHEMA_VERSION: u32 = 1;

const GAMES_FILE: &str = "games.jsonl";
const CHECKPOINTS_FILE: &str = "checkpoints.jsonl";
const UNANALYZED_FILE: &str = "unanalyzed.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt line {line} in {file}: {reason}")]
    Corrupt {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("line {line} in {file} has schema version {found}, this build reads up to {SCHEMA_VERSION}")]
    UnsupportedSchema { file: String, line: usize, found: u32 },

    #[error("game {0} is already stored")]
    Duplicate(String),
}

#[derive(Deserialize)]
struct VersionTag {
    schema_version: u32,
}

#[derive(Serialize)]
struct GameLineRef<'a> {
    schema_version: u32,
    seq: u64,
    game: &'a GameRecord,
}

#[derive(Deserialize)]
struct GameLine {
    seq: u64,
    game: GameRecord,
}

#[derive(Serialize, Deserialize)]
struct CheckpointLine {
    schema_version: u32,
    model_version: u64,
    game_seq: u64,
    at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct UnanalyzedLine {
    schema_version: u32,
    game: RawGame,
}

/// Aggregate statistics over every stored game
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub games: usize,
    pub wins: usize,
    pub losses: usize,
    pub draws: usize,
    pub win_rate: f64,
    pub average_centipawn_loss: f64,
    pub blunders: usize,
    pub mistakes: usize,
}

struct Inner {
    games_file: File,
    checkpoints_file: File,

    games: Vec<Arc<GameRecord>>,
    by_id: HashMap<String, usize>,
    /// Latest checkpoint mark of every model version
    marks: HashMap<u64, u64>,
}

pub struct ExperienceStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl ExperienceStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let game_lines: Vec<GameLine> = read_lines(&dir.join(GAMES_FILE))?;
        let mut games = Vec::with_capacity(game_lines.len());
        let mut by_id = HashMap::new();
        for (i, line) in game_lines.into_iter().enumerate() {
            if line.seq != i as u64 + 1 {
                tracing::warn!(expected = i + 1, found = line.seq, "games out of sequence");
            }
            by_id.insert(line.game.info.game_id.clone(), i);
            games.push(Arc::new(line.game));
        }

        let mut marks = HashMap::new();
        for line in read_lines::<CheckpointLine>(&dir.join(CHECKPOINTS_FILE))? {
            let mark = marks.entry(line.model_version).or_insert(0);
            *mark = line.game_seq.max(*mark);
        }

        tracing::info!(dir = %dir.display(), games = games.len(), checkpoints = marks.len(), "experience store opened");

        Ok(ExperienceStore {
            inner: Mutex::new(Inner {
                games_file: open_append(&dir.join(GAMES_FILE))?,
                checkpoints_file: open_append(&dir.join(CHECKPOINTS_FILE))?,
                games,
                by_id,
                marks,
            }),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Durably appends `record`, returning its sequence number (1-based)
    pub fn append(&self, record: GameRecord) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        if inner.by_id.contains_key(&record.info.game_id) {
            return Err(StoreError::Duplicate(record.info.game_id));
        }

        let seq = inner.games.len() as u64 + 1;
        let line = GameLineRef {
            schema_version: SCHEMA_VERSION,
            seq,
            game: &record,
        };
        let mut buffer = serde_json::to_vec(&line)?;
        buffer.push(b'\n');

        append_line(&mut inner.games_file, &buffer)?;

        tracing::info!(seq, game_id = %record.info.game_id, moves = record.moves.len(), "game stored");
        let index = inner.games.len();
        inner.by_id.insert(record.info.game_id.clone(), index);
        inner.games.push(Arc::new(record));
        Ok(seq)
    }

    pub fn len(&self) -> u64 {
        self.lock().games.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn games(&self) -> Vec<Arc<GameRecord>> {
        self.lock().games.clone()
    }

    /// The first `count` games
    pub fn games_upto(&self, count: u64) -> Vec<Arc<GameRecord>> {
        let inner = self.lock();
        let end = (count as usize).min(inner.games.len());
        inner.games[..end].to_vec()
    }

    pub fn game(&self, game_id: &str) -> Option<Arc<GameRecord>> {
        let inner = self.lock();
        inner.by_id.get(game_id).map(|&i| inner.games[i].clone())
    }

    pub fn sample_batch<R: Rng>(&self, criteria: &SampleCriteria, rng: &mut R) -> TrainingBatch {
        let games = self.games();
        sampling::sample(&games, criteria, rng)
    }

    /// Games appended after the latest mark of `model_version`
    pub fn count_games_since(&self, model_version: u64) -> u64 {
        let inner = self.lock();
        let mark = inner.marks.get(&model_version).copied().unwrap_or(0);
        (inner.games.len() as u64).saturating_sub(mark)
    }

    pub fn mark_checkpoint(&self, model_version: u64, game_seq: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let line = CheckpointLine {
            schema_version: SCHEMA_VERSION,
            model_version,
            game_seq,
            at: Utc::now(),
        };
        let mut buffer = serde_json::to_vec(&line)?;
        buffer.push(b'\n');
        append_line(&mut inner.checkpoints_file, &buffer)?;

        let mark = inner.marks.entry(model_version).or_insert(0);
        *mark = game_seq.max(*mark);
        tracing::debug!(model_version, game_seq, "checkpoint marked");
        Ok(())
    }

    pub fn statistics(&self) -> StoreStatistics {
        let inner = self.lock();
        let mut stats = StoreStatistics {
            games: inner.games.len(),
            ..StoreStatistics::default()
        };

        let mut loss_sum = 0u64;
        let mut scored = 0u64;
        for game in &inner.games {
            match game.result {
                GameResult::Win => stats.wins += 1,
                GameResult::Loss => stats.losses += 1,
                GameResult::Draw => stats.draws += 1,
            }
            for m in game.agent_moves().filter(|m| m.label != MoveLabel::Book) {
                loss_sum += m.centipawn_loss as u64;
                scored += 1;
                match m.label {
                    MoveLabel::Blunder => stats.blunders += 1,
                    MoveLabel::Mistake => stats.mistakes += 1,
                    _ => {}
                }
            }
        }

        if stats.games > 0 {
            stats.win_rate = stats.wins as f64 / stats.games as f64;
        }
        if scored > 0 {
            stats.average_centipawn_loss = loss_sum as f64 / scored as f64;
        }
        stats
    }

    /// Keeps a game whose analysis failed so it can be analyzed later
    pub fn park_unanalyzed(&self, game: &RawGame) -> Result<(), StoreError> {
        let _inner = self.lock();
        let line = UnanalyzedLine {
            schema_version: SCHEMA_VERSION,
            game: game.clone(),
        };
        let mut buffer = serde_json::to_vec(&line)?;
        buffer.push(b'\n');

        let mut file = open_append(&self.dir.join(UNANALYZED_FILE))?;
        append_line(&mut file, &buffer)?;
        tracing::warn!(game_id = %game.info.game_id, "game parked for later analysis");
        Ok(())
    }

    /// Removes and returns every parked game
    pub fn take_unanalyzed(&self) -> Result<Vec<RawGame>, StoreError> {
        let _inner = self.lock();
        let path = self.dir.join(UNANALYZED_FILE);
        let games = read_lines::<UnanalyzedLine>(&path)?
            .into_iter()
            .map(|line| line.game)
            .collect();

        let tmp_path = path.with_extension("jsonl.tmp");
        File::create(&tmp_path)?.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(games)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writes `buffer` with a single `write_all` and syncs it. On failure the
/// file is cut back so no partial line is left behind.
fn append_line(file: &mut File, buffer: &[u8]) -> io::Result<()> {
    let len = file.metadata()?.len();
    let written = file.write_all(buffer).and_then(|_| file.sync_data());
    if let Err(error) = written {
        let _ = file.set_len(len);
        return Err(error);
    }
    Ok(())
}

/// Parses every line of `path` (missing file: no lines). A trailing line
/// without its newline is the remnant of an interrupted append and is cut
/// off; any other unreadable line is an error.
fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };

    let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    if complete < bytes.len() {
        tracing::warn!(
            file = %file_name,
            bytes = bytes.len() - complete,
            "truncating torn trailing line"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(complete as u64)?;
        file.sync_all()?;
    }

    let mut out = Vec::new();
    for (i, line) in bytes[..complete].split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let corrupt = |error: serde_json::Error| StoreError::Corrupt {
            file: file_name.clone(),
            line: i + 1,
            reason: error.to_string(),
        };

        let tag: VersionTag = serde_json::from_slice(line).map_err(corrupt)?;
        if tag.schema_version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                file: file_name,
                line: i + 1,
                found: tag.schema_version,
            });
        }
        out.push(serde_json::from_slice(line).map_err(corrupt)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelWeights;
    use crate::position::Side;
    use crate::record::{EvalSource, EvaluationResult, GameInfo, MoveRecord, Termination};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::thread;

    fn evaluation(score_cp: i32) -> EvaluationResult {
        EvaluationResult {
            score_cp,
            principal_variation: vec![],
            depth_reached: 10,
            source: EvalSource::Engine,
            model_version: None,
        }
    }

    fn record(id: &str, labels: &[MoveLabel]) -> GameRecord {
        GameRecord {
            info: GameInfo {
                game_id: id.to_string(),
                opponent: "engine".to_string(),
                opponent_rating: Some(1500),
                agent_color: Side::White,
                time_control: None,
                initial_fen: "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string(),
            },
            result: GameResult::Win,
            termination: Termination::Checkmate,
            moves: labels
                .iter()
                .enumerate()
                .map(|(ply, &label)| MoveRecord {
                    ply: ply as u32,
                    fen_before: String::new(),
                    move_played: "e2e4".to_string(),
                    by_agent: ply % 2 == 0,
                    exploratory: false,
                    evaluation_before: None,
                    evaluation_after_best: evaluation(30),
                    evaluation_played: evaluation(0),
                    centipawn_loss: 30,
                    label,
                })
                .collect(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    fn criteria(size: usize) -> SampleCriteria {
        SampleCriteria {
            size,
            recency_games: None,
            label_weights: LabelWeights::default(),
            agent_moves_only: false,
            exclude_last_games: 0,
        }
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ExperienceStore::open(dir.path()).unwrap();
            assert_eq!(store.append(record("a", &[MoveLabel::Best])).unwrap(), 1);
            assert_eq!(store.append(record("b", &[MoveLabel::Good])).unwrap(), 2);
            store.mark_checkpoint(0, 1).unwrap();
        }

        let store = ExperienceStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.game("b").unwrap().moves[0].label, MoveLabel::Good);
        assert_eq!(store.count_games_since(0), 1);
        // never marked: everything counts
        assert_eq!(store.count_games_since(7), 2);
        assert!(matches!(
            store.append(record("a", &[])),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn torn_trailing_line_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = ExperienceStore::open(dir.path()).unwrap();
            store.append(record("a", &[MoveLabel::Best])).unwrap();
        }
        let path = dir.path().join(GAMES_FILE);
        let intact = fs::read(&path).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"schema_version\":1,\"seq\":2,\"game\":{\"ga").unwrap();
        }

        let store = ExperienceStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(fs::read(&path).unwrap(), intact);

        // appends continue on a clean line
        store.append(record("b", &[])).unwrap();
        drop(store);
        assert_eq!(ExperienceStore::open(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(GAMES_FILE),
            "not json\n{\"schema_version\":1}\n",
        )
        .unwrap();
        assert!(matches!(
            ExperienceStore::open(dir.path()),
            Err(StoreError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CHECKPOINTS_FILE),
            "{\"schema_version\":99,\"model_version\":1,\"game_seq\":1,\"at\":\"2024-01-01T00:00:00Z\"}\n",
        )
        .unwrap();
        assert!(matches!(
            ExperienceStore::open(dir.path()),
            Err(StoreError::UnsupportedSchema { found: 99, .. })
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CHECKPOINTS_FILE),
            "{\"schema_version\":1,\"model_version\":3,\"game_seq\":4,\"at\":\"2024-01-01T00:00:00Z\",\"note\":\"x\"}\n",
        )
        .unwrap();
        let store = ExperienceStore::open(dir.path()).unwrap();
        assert_eq!(store.count_games_since(3), 0);
    }

    #[test]
    fn concurrent_appends_are_not_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ExperienceStore::open(dir.path()).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        let labels = vec![MoveLabel::Good; 20];
                        store.append(record(&format!("{}-{}", t, i), &labels)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        drop(store);

        let store = ExperienceStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 40);
        assert_eq!(store.games().iter().map(|g| g.moves.len()).sum::<usize>(), 800);
    }

    #[test]
    fn sampling_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperienceStore::open(dir.path()).unwrap();
        store.append(record("old", &[MoveLabel::Blunder, MoveLabel::Blunder])).unwrap();
        store.append(record("recent", &[MoveLabel::Good, MoveLabel::Best])).unwrap();
        store.append(record("validation", &[MoveLabel::Mistake])).unwrap();

        let mut rng = StdRng::seed_from_u64(3);

        let mut recent_only = criteria(50);
        recent_only.recency_games = Some(1);
        recent_only.exclude_last_games = 1;
        let batch = store.sample_batch(&recent_only, &mut rng);
        assert_eq!(batch.len(), 50);
        assert!(batch.samples.iter().all(|s| s.game.game_id() == "recent"));

        let mut agent_only = criteria(50);
        agent_only.agent_moves_only = true;
        let batch = store.sample_batch(&agent_only, &mut rng);
        assert!(batch.samples.iter().all(|s| s.record().by_agent));

        let mut nothing = criteria(10);
        nothing.label_weights = LabelWeights {
            book: 0.0,
            best: 0.0,
            good: 0.0,
            inaccuracy: 0.0,
            mistake: 0.0,
            blunder: 0.0,
        };
        assert!(store.sample_batch(&nothing, &mut rng).is_empty());
    }

    #[test]
    fn label_weights_oversample_blunders() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperienceStore::open(dir.path()).unwrap();
        store.append(record("g", &[MoveLabel::Good, MoveLabel::Blunder])).unwrap();

        let mut weights = criteria(4_000);
        weights.label_weights.good = 1.0;
        weights.label_weights.blunder = 3.0;
        let batch = store.sample_batch(&weights, &mut StdRng::seed_from_u64(11));

        let blunders = batch
            .samples
            .iter()
            .filter(|s| s.record().label == MoveLabel::Blunder)
            .count();
        // expected 3000
        assert!((2_700..3_300).contains(&blunders), "{}", blunders);
    }

    #[test]
    fn statistics() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperienceStore::open(dir.path()).unwrap();
        store.append(record("w", &[MoveLabel::Book, MoveLabel::Good, MoveLabel::Blunder])).unwrap();
        let mut lost = record("l", &[MoveLabel::Mistake]);
        lost.result = GameResult::Loss;
        store.append(lost).unwrap();

        let stats = store.statistics();
        assert_eq!(stats.games, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.win_rate, 0.5);
        assert_eq!(stats.blunders, 1);
        assert_eq!(stats.mistakes, 1);
        assert_eq!(stats.average_centipawn_loss, 30.0);
    }

    #[test]
    fn parked_games_are_taken_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExperienceStore::open(dir.path()).unwrap();
        let raw = RawGame {
            info: record("p", &[]).info,
            result: GameResult::Draw,
            termination: Termination::Stalemate,
            moves: vec![],
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };

        store.park_unanalyzed(&raw).unwrap();
        store.park_unanalyzed(&raw).unwrap();
        assert_eq!(store.take_unanalyzed().unwrap().len(), 2);
        assert!(store.take_unanalyzed().unwrap().is_empty());
    }
}
