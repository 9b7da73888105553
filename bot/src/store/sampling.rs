use crate::config::LabelWeights;
use crate::record::{GameRecord, MoveLabel, MoveRecord};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct SampleCriteria {
    /// Number of samples drawn, with replacement
    pub size: usize,
    /// Only the moves of the most recent games are eligible; all when `None`
    pub recency_games: Option<usize>,
    pub label_weights: LabelWeights,
    pub agent_moves_only: bool,
    /// Most recent games left out, e.g. a validation slice
    pub exclude_last_games: usize,
}

impl SampleCriteria {
    fn weight(&self, label: MoveLabel) -> f32 {
        let w = &self.label_weights;
        match label {
            MoveLabel::Book => w.book,
            MoveLabel::Best => w.best,
            MoveLabel::Good => w.good,
            MoveLabel::Inaccuracy => w.inaccuracy,
            MoveLabel::Mistake => w.mistake,
            MoveLabel::Blunder => w.blunder,
        }
    }
}

/// One sampled move, with the game it belongs to
#[derive(Clone, Debug)]
pub struct TrainingSample {
    pub game: Arc<GameRecord>,
    pub index: usize,
}

impl TrainingSample {
    pub fn record(&self) -> &MoveRecord {
        &self.game.moves[self.index]
    }
}

#[derive(Clone, Debug, Default)]
pub struct TrainingBatch {
    pub samples: Vec<TrainingSample>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The slice of `games` eligible under `criteria`, oldest first
pub fn eligible_games<'a>(games: &'a [Arc<GameRecord>], criteria: &SampleCriteria) -> &'a [Arc<GameRecord>] {
    let end = games.len().saturating_sub(criteria.exclude_last_games);
    let start = match criteria.recency_games {
        Some(n) => end.saturating_sub(n),
        None => 0,
    };
    &games[start..end]
}

pub fn sample<R: Rng>(games: &[Arc<GameRecord>], criteria: &SampleCriteria, rng: &mut R) -> TrainingBatch {
    let mut candidates = Vec::new();
    let mut weights = Vec::new();

    for game in eligible_games(games, criteria) {
        for (index, record) in game.moves.iter().enumerate() {
            if criteria.agent_moves_only && !record.by_agent {
                continue;
            }
            let weight = criteria.weight(record.label);
            if weight > 0.0 {
                candidates.push((game, index));
                weights.push(weight);
            }
        }
    }

    let Ok(distribution) = WeightedIndex::new(&weights) else {
        return TrainingBatch::default();
    };

    let samples = (0..criteria.size)
        .map(|_| {
            let (game, index) = candidates[distribution.sample(rng)];
            TrainingSample {
                game: game.clone(),
                index,
            }
        })
        .collect();

    TrainingBatch { samples }
}
