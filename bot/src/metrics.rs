//! Per-game and per-training-cycle summaries for the external dashboard.
//!
//! Every summary is emitted as a `tracing` event with target `metrics` and
//! appended to `metrics.jsonl` in the store directory.

use crate::analysis::GameSummary;
use crate::store::SCHEMA_VERSION;
use crate::trainer::TrainingSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Serialize)]
struct MetricLine<'a, T> {
    schema_version: u32,
    kind: &'a str,
    at: DateTime<Utc>,
    #[serde(flatten)]
    data: &'a T,
}

pub struct MetricsSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl MetricsSink {
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(METRICS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(MetricsSink {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_game(&self, summary: &GameSummary) {
        tracing::info!(
            target: "metrics",
            game_id = %summary.game_id,
            result = %summary.result,
            agent_moves = summary.agent_moves,
            acpl = summary.average_centipawn_loss,
            blunders = summary.blunder_count,
            mistakes = summary.mistake_count,
            inaccuracies = summary.inaccuracy_count,
            "game summary"
        );
        self.write("game", summary);
    }

    pub fn record_training(&self, summary: &TrainingSummary) {
        tracing::info!(
            target: "metrics",
            old_version = summary.old_version,
            new_version = ?summary.new_version,
            accepted = summary.accepted,
            delta = summary.validation_score_delta,
            samples = summary.samples,
            "training summary"
        );
        self.write("training", summary);
    }

    // metrics are best effort: a failed write is logged and dropped
    fn write<T: Serialize>(&self, kind: &str, data: &T) {
        let line = MetricLine {
            schema_version: SCHEMA_VERSION,
            kind,
            at: Utc::now(),
            data,
        };
        let result = serde_json::to_vec(&line)
            .map_err(io::Error::from)
            .and_then(|mut buffer| {
                buffer.push(b'\n');
                let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
                file.write_all(&buffer)
            });
        if let Err(error) = result {
            tracing::warn!(%error, kind, path = %self.path.display(), "could not write metrics");
        }
    }
}
