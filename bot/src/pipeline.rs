//! What happens to a game after it ends: analysis, storage, metrics.
//! A game that cannot be analyzed or stored is parked, never dropped.

use crate::analysis::{AnalysisError, Analyzer, GameSummary};
use crate::metrics::MetricsSink;
use crate::record::RawGame;
use crate::store::{ExperienceStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Analyzes `raw` and appends the record; returns the sequence number and
/// the game's summary
pub fn record_game(
    raw: &RawGame,
    analyzer: &Analyzer,
    store: &ExperienceStore,
    metrics: Option<&MetricsSink>,
) -> Result<(u64, GameSummary), PipelineError> {
    let outcome = analyzer
        .analyze(raw)
        .map_err(PipelineError::from)
        .and_then(|record| {
            let summary = GameSummary::of(&record);
            let seq = store.append(record)?;
            Ok((seq, summary))
        });

    match outcome {
        Ok((seq, summary)) => {
            if let Some(metrics) = metrics {
                metrics.record_game(&summary);
            }
            Ok((seq, summary))
        }
        Err(PipelineError::Store(StoreError::Duplicate(game_id))) => {
            tracing::warn!(%game_id, "game already stored, skipped");
            Err(StoreError::Duplicate(game_id).into())
        }
        Err(error) => {
            tracing::error!(%error, game_id = %raw.info.game_id, "game not stored");
            park(raw, store);
            Err(error)
        }
    }
}

fn park(raw: &RawGame, store: &ExperienceStore) {
    if let Err(error) = store.park_unanalyzed(raw) {
        let dump = serde_json::to_string(raw).unwrap_or_default();
        tracing::error!(%error, game = %dump, "could not park game");
    }
}

/// Retries every parked game; returns how many were stored
pub fn reanalyze(
    analyzer: &Analyzer,
    store: &ExperienceStore,
    metrics: Option<&MetricsSink>,
) -> Result<usize, StoreError> {
    let parked = store.take_unanalyzed()?;
    let total = parked.len();
    let mut stored = 0;

    for raw in &parked {
        if record_game(raw, analyzer, store, metrics).is_ok() {
            stored += 1;
        }
    }

    tracing::info!(total, stored, "parked games reanalyzed");
    Ok(stored)
}
