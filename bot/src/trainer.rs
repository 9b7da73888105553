//! Background retraining of the value model from stored experience.

use crate::config::{RlAlgorithm, TrainerConfig};
use crate::metrics::MetricsSink;
use crate::model_registry::{ModelHandle, ModelRegistry, RegistryError};
use crate::oracle::MATE_SCORE;
use crate::record::{GameRecord, MoveRecord};
use crate::store::sampling::{self, SampleCriteria, TrainingBatch};
use crate::store::{ExperienceStore, StoreError};
use chrono::Utc;
use crossbeam::channel::{self, Sender};
use nn::feature_set::EncodedFeatures;
use nn::model::{win_probability, Activations, ModelMeta, ValueModel, OUTPUT_SCALE, WDL_SCALE};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, EnPassantMode, Move, Position as _};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("candidate scored {candidate_score:.5} on validation, active model {active_score:.5}")]
    Regression {
        candidate_score: f64,
        active_score: f64,
    },

    #[error("training cancelled")]
    Cancelled,

    #[error("no trainable positions in the store")]
    NotEnoughData,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrainingSummary {
    pub old_version: u64,
    pub new_version: Option<u64>,
    pub accepted: bool,
    /// Candidate validation score minus the active model's
    pub validation_score_delta: f64,
    pub samples: usize,
    pub games: usize,
    pub elapsed_secs: f64,
}

/// One supervised target: win probability of the side to move
struct Example {
    features: EncodedFeatures,
    target: f32,
    weight: f32,
}

/// One agent decision replayed by the reinforcement phase
struct PolicyStep {
    children: Vec<EncodedFeatures>,
    chosen: usize,
    reward: f32,
}

struct Cycle {
    summary: TrainingSummary,
    candidate_score: f64,
    active_score: f64,
}

pub struct ContinualTrainer {
    config: TrainerConfig,
    registry: Arc<ModelRegistry>,
    handle: ModelHandle,
    metrics: Option<Arc<MetricsSink>>,
    rng: StdRng,
}

impl ContinualTrainer {
    pub fn new(
        config: TrainerConfig,
        registry: Arc<ModelRegistry>,
        handle: ModelHandle,
        metrics: Option<Arc<MetricsSink>>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        ContinualTrainer {
            config,
            registry,
            handle,
            metrics,
            rng,
        }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// Trains a candidate once `save_interval` games have been stored since
    /// `active_version` was last marked. Returns the newly active version,
    /// `None` when below the threshold.
    pub fn maybe_train(
        &mut self,
        store: &ExperienceStore,
        active_version: u64,
        cancel: &AtomicBool,
    ) -> Result<Option<u64>, TrainError> {
        let pending = store.count_games_since(active_version);
        if pending < self.config.save_interval {
            tracing::debug!(pending, save_interval = self.config.save_interval, "not training yet");
            return Ok(None);
        }
        self.train_upto(store, active_version, store.len(), cancel)
    }

    /// Trains on everything stored so far, regardless of the threshold
    pub fn train_now(
        &mut self,
        store: &ExperienceStore,
        cancel: &AtomicBool,
    ) -> Result<Option<u64>, TrainError> {
        let active_version = self.handle.version();
        self.train_upto(store, active_version, store.len(), cancel)
    }

    fn train_upto(
        &mut self,
        store: &ExperienceStore,
        active_version: u64,
        trigger_seq: u64,
        cancel: &AtomicBool,
    ) -> Result<Option<u64>, TrainError> {
        tracing::info!(active_version, trigger_seq, "training cycle started");

        let cycle = match self.cycle(store, active_version, trigger_seq, cancel) {
            Ok(cycle) => cycle,
            Err(TrainError::NotEnoughData) => {
                store.mark_checkpoint(active_version, trigger_seq)?;
                tracing::warn!(trigger_seq, "nothing to train on");
                return Err(TrainError::NotEnoughData);
            }
            Err(TrainError::Cancelled) => {
                tracing::info!("training cancelled, candidate discarded");
                return Err(TrainError::Cancelled);
            }
            Err(error) => return Err(error),
        };

        // games stored while training count toward the next cycle
        store.mark_checkpoint(active_version, trigger_seq)?;
        if let Some(version) = cycle.summary.new_version {
            store.mark_checkpoint(version, trigger_seq)?;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_training(&cycle.summary);
        }

        if cycle.summary.accepted {
            Ok(cycle.summary.new_version)
        } else {
            Err(TrainError::Regression {
                candidate_score: cycle.candidate_score,
                active_score: cycle.active_score,
            })
        }
    }

    fn cycle(
        &mut self,
        store: &ExperienceStore,
        active_version: u64,
        trigger_seq: u64,
        cancel: &AtomicBool,
    ) -> Result<Cycle, TrainError> {
        let started = Instant::now();
        if cancel.load(Ordering::SeqCst) {
            return Err(TrainError::Cancelled);
        }

        let games = store.games_upto(trigger_seq);
        let validation_len = self
            .config
            .validation_games
            .min(games.len().saturating_sub(1));
        let (training, validation) = games.split_at(games.len() - validation_len);

        let criteria = SampleCriteria {
            size: self.config.batch_size,
            recency_games: Some(self.config.recency_games),
            label_weights: self.config.label_weights.clone(),
            agent_moves_only: false,
            exclude_last_games: 0,
        };
        let batch = sampling::sample(training, &criteria, &mut self.rng);

        let active = self.handle.snapshot();
        // without held out games a candidate cannot be compared
        let Some(active_score) = validation_score(&active, validation) else {
            return Err(TrainError::NotEnoughData);
        };
        let mut candidate = ValueModel::clone(&active);

        let examples = self.examples(&candidate, &batch);
        if examples.is_empty() {
            return Err(TrainError::NotEnoughData);
        }
        let samples = examples.len();
        self.fit(&mut candidate, examples);
        if cancel.load(Ordering::SeqCst) {
            return Err(TrainError::Cancelled);
        }

        if self.config.reinforcement.algorithm == RlAlgorithm::Reinforce {
            let recent = &training[training.len().saturating_sub(self.config.reinforcement.games)..];
            self.reinforce(&mut candidate, recent);
            if cancel.load(Ordering::SeqCst) {
                return Err(TrainError::Cancelled);
            }
        }

        let candidate_score =
            validation_score(&candidate, validation).ok_or(TrainError::NotEnoughData)?;
        let delta = candidate_score - active_score;

        let mut summary = TrainingSummary {
            old_version: active_version,
            new_version: None,
            accepted: false,
            validation_score_delta: delta,
            samples,
            games: training.len(),
            elapsed_secs: 0.0,
        };

        if candidate_score < active_score {
            tracing::warn!(
                active_version,
                candidate_score,
                active_score,
                "candidate regressed on validation, discarded"
            );
        } else {
            let version = self.registry.next_version()?;
            let candidate = candidate.with_meta(ModelMeta {
                version,
                trained_at: Utc::now().timestamp(),
                training_game_count: trigger_seq,
            });
            self.registry.install(&candidate)?;
            self.handle.publish(candidate);

            tracing::info!(old_version = active_version, new_version = version, delta, "candidate accepted");
            summary.new_version = Some(version);
            summary.accepted = true;
        }

        summary.elapsed_secs = started.elapsed().as_secs_f64();
        Ok(Cycle {
            summary,
            candidate_score,
            active_score,
        })
    }

    fn examples(&self, model: &ValueModel, batch: &TrainingBatch) -> Vec<Example> {
        let mut out = Vec::with_capacity(batch.len() * 2);
        for sample in &batch.samples {
            let record = sample.record();
            let weight = if record.exploratory {
                self.config.exploratory_weight
            } else {
                1.0
            };
            push_examples(model, record, weight, &mut out);
        }
        out
    }

    /// Mini-batch SGD on squared error in win-probability space
    fn fit(&mut self, model: &mut ValueModel, mut examples: Vec<Example>) {
        let mut grads = model.zero_gradients();
        let mini_batch = self.config.mini_batch.max(1);

        for epoch in 0..self.config.epochs {
            examples.shuffle(&mut self.rng);
            let mut total = 0.0f64;

            for chunk in examples.chunks(mini_batch) {
                grads.clear();
                for example in chunk {
                    let act = model.forward(&example.features);
                    let p = win_probability(act.output * OUTPUT_SCALE);
                    let error = p - example.target;
                    total += (example.weight * error * error) as f64;

                    let d_output =
                        example.weight * 2.0 * error * p * (1.0 - p) * OUTPUT_SCALE / WDL_SCALE;
                    model.backward(&example.features, &act, d_output, &mut grads);
                }
                model.apply_gradients(&grads, self.config.learning_rate);
            }

            tracing::debug!(epoch, loss = total / examples.len() as f64, "supervised epoch");
        }
    }

    /// REINFORCE over the agent's moves: the policy is a softmax over the
    /// model's scores of every child position, the return is the game result
    /// for the mover minus the batch mean.
    fn reinforce(&self, model: &mut ValueModel, games: &[Arc<GameRecord>]) -> usize {
        let rl = &self.config.reinforcement;
        let temperature = rl.temperature;

        let mut steps = Vec::new();
        for game in games {
            for record in game.agent_moves() {
                if let Some(step) = policy_step(model, game, record) {
                    steps.push(step);
                }
            }
        }
        if steps.is_empty() {
            return 0;
        }

        let baseline = steps.iter().map(|s| s.reward).sum::<f32>() / steps.len() as f32;
        let mut grads = model.zero_gradients();

        for step in &steps {
            let advantage = step.reward - baseline;
            if advantage == 0.0 {
                continue;
            }

            let acts: Vec<Activations> = step.children.iter().map(|f| model.forward(f)).collect();
            // children are scored by the opponent, negate for the mover
            let logits: Vec<f32> = acts
                .iter()
                .map(|a| -a.output * OUTPUT_SCALE / temperature)
                .collect();
            let probs = softmax(&logits);

            for (i, (features, act)) in step.children.iter().zip(&acts).enumerate() {
                let chosen = if i == step.chosen { 1.0 } else { 0.0 };
                let d_output = advantage * (chosen - probs[i]) * OUTPUT_SCALE / temperature;
                model.backward(features, act, d_output, &mut grads);
            }
        }

        model.apply_gradients(&grads, rl.learning_rate);
        tracing::debug!(steps = steps.len(), baseline, "reinforcement phase");
        steps.len()
    }
}

/// The position before `record` and the move played in it
fn replay(record: &MoveRecord) -> Option<(Chess, Move)> {
    let chess: Chess = record
        .fen_before
        .parse::<Fen>()
        .ok()?
        .into_position(CastlingMode::Standard)
        .ok()?;
    let m = record.move_played.parse::<UciMove>().ok()?.to_move(&chess).ok()?;
    Some((chess, m))
}

fn target(score_cp: i32) -> f32 {
    win_probability(score_cp.clamp(-MATE_SCORE, MATE_SCORE) as f32)
}

/// Targets for the position before the move (its best line) and after it
/// (the played move's score, seen by the opponent)
fn push_examples(model: &ValueModel, record: &MoveRecord, weight: f32, out: &mut Vec<Example>) {
    let Some((chess, m)) = replay(record) else {
        tracing::trace!(ply = record.ply, fen = %record.fen_before, "unreplayable move skipped");
        return;
    };

    if let Ok(features) = model.encode(&chess.clone().into_setup(EnPassantMode::Legal)) {
        out.push(Example {
            features,
            target: target(record.evaluation_after_best.score_cp),
            weight,
        });
    }

    let mut after = chess;
    after.play_unchecked(&m);
    if let Ok(features) = model.encode(&after.into_setup(EnPassantMode::Legal)) {
        out.push(Example {
            features,
            target: target(-record.evaluation_played.score_cp),
            weight,
        });
    }
}

fn policy_step(model: &ValueModel, game: &GameRecord, record: &MoveRecord) -> Option<PolicyStep> {
    let (chess, played) = replay(record)?;
    let legal = chess.legal_moves();

    let mut children = Vec::with_capacity(legal.len());
    let mut chosen = None;
    for m in &legal {
        if *m == played {
            chosen = Some(children.len());
        }
        let mut child = chess.clone();
        child.play_unchecked(m);
        children.push(model.encode(&child.into_setup(EnPassantMode::Legal)).ok()?);
    }

    Some(PolicyStep {
        children,
        chosen: chosen?,
        reward: game.result_for(record).reward(),
    })
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&z| (z - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// `1 - mean squared error` in win-probability space over every move of
/// `games`; `None` when there is nothing to validate on
pub fn validation_score(model: &ValueModel, games: &[Arc<GameRecord>]) -> Option<f64> {
    let mut examples = Vec::new();
    for game in games {
        for record in &game.moves {
            push_examples(model, record, 1.0, &mut examples);
        }
    }
    if examples.is_empty() {
        return None;
    }

    let total: f64 = examples
        .iter()
        .map(|e| {
            let p = win_probability(model.forward(&e.features).output * OUTPUT_SCALE);
            ((p - e.target) as f64).powi(2)
        })
        .sum();
    Some(1.0 - total / examples.len() as f64)
}

/// Runs the trainer on its own thread, woken up after every stored game
pub struct TrainerService {
    notify: Option<Sender<()>>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TrainerService {
    pub fn spawn(mut trainer: ContinualTrainer, store: Arc<ExperienceStore>) -> io::Result<Self> {
        // one pending wakeup is enough, the trainer re-reads the store
        let (notify, wakeups) = channel::bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = thread::Builder::new().name("trainer".to_string()).spawn({
            let cancel = cancel.clone();
            move || {
                while wakeups.recv().is_ok() {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let active = trainer.handle().version();
                    match trainer.maybe_train(&store, active, &cancel) {
                        Ok(Some(version)) => tracing::info!(version, "new model active"),
                        Ok(None) => {}
                        Err(TrainError::Cancelled) => break,
                        Err(error @ TrainError::Regression { .. }) => {
                            tracing::warn!(%error, "training regression, active model kept")
                        }
                        Err(error) => tracing::error!(%error, "training failed"),
                    }
                }
                tracing::debug!("trainer stopped");
            }
        })?;

        Ok(TrainerService {
            notify: Some(notify),
            cancel,
            worker: Some(worker),
        })
    }

    /// Never blocks
    pub fn notify_game_appended(&self) {
        if let Some(notify) = &self.notify {
            let _ = notify.try_send(());
        }
    }

    /// Cancels a running cycle and waits for the thread to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.notify.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("trainer thread panicked");
            }
        }
    }
}

impl Drop for TrainerService {
    fn drop(&mut self) {
        self.stop();
    }
}
