mod common;

use bot::analysis::Analyzer;
use bot::config::{AnalysisConfig, LocalConfig, OracleConfig, RlAlgorithm, TrainerConfig};
use bot::model_registry::{ModelHandle, ModelRegistry};
use bot::oracle::SearchOracle;
use bot::pipeline;
use bot::platform::{LocalPlatform, Opponent};
use bot::policy::MovePolicy;
use bot::record::{EvalSource, RawGame};
use bot::session::{GameSession, SessionState};
use bot::store::ExperienceStore;
use bot::trainer::ContinualTrainer;
use common::{fast_session, greedy_policy, small_model, LegalOracle};
use shakmaty::Color;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn local_config(max_plies: u32) -> LocalConfig {
    LocalConfig {
        max_plies,
        ..LocalConfig::default()
    }
}

fn play(policy_oracle: Arc<dyn SearchOracle>, model: &ModelHandle, id: &str, max_plies: u32) -> RawGame {
    let platform = LocalPlatform::new(id, Color::White, Opponent::Random, None, &local_config(max_plies), 11);
    let policy = MovePolicy::new(policy_oracle, &OracleConfig::default(), &greedy_policy());

    let outcome = GameSession::new(
        &platform,
        &policy,
        model,
        fast_session(),
        Arc::new(AtomicBool::new(false)),
    )
    .run();
    assert_eq!(outcome.final_state, SessionState::Finished);
    outcome.raw_game.unwrap()
}

#[test]
fn oracle_timeout_falls_back_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperienceStore::open(dir.path()).unwrap();
    let model = ModelHandle::new(small_model());

    // white's 7th move is ply 12
    let raw = play(Arc::new(LegalOracle::timing_out_at(7)), &model, "timeout", 30);
    assert!(raw.moves.len() > 12, "game ended after {} plies", raw.moves.len());

    let analyzer = Analyzer::new(Arc::new(LegalOracle::new()), &AnalysisConfig::default());
    let (seq, _) = pipeline::record_game(&raw, &analyzer, &store, None).unwrap();
    assert_eq!(seq, 1);

    let record = store.game("timeout").unwrap();
    for m in record.agent_moves() {
        let live = m.evaluation_before.as_ref().unwrap();
        if m.ply == 12 {
            assert_eq!(live.source, EvalSource::Model);
            assert_eq!(live.model_version, Some(0));
        } else {
            assert_eq!(live.source, EvalSource::Blended);
        }
    }
    // the analysis itself is always the engine's
    assert!(record
        .moves
        .iter()
        .all(|m| m.evaluation_after_best.source == EvalSource::Engine));
}

#[test]
fn play_store_train_and_play_again() {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperienceStore::open(dir.path().join("experience")).unwrap();
    let registry = Arc::new(ModelRegistry::open(dir.path().join("models")).unwrap());
    let model = ModelHandle::new(registry.load_or_init(8, 3).unwrap());
    let oracle: Arc<dyn SearchOracle> = Arc::new(LegalOracle::new());
    let analyzer = Analyzer::new(oracle.clone(), &AnalysisConfig::default());

    for i in 0..2 {
        let raw = play(oracle.clone(), &model, &format!("game-{}", i), 20);
        assert!(raw.moves.len() <= 20);
        pipeline::record_game(&raw, &analyzer, &store, None).unwrap();
    }
    assert_eq!(store.len(), 2);
    assert_eq!(store.statistics().games, 2);

    let mut config = TrainerConfig {
        save_interval: 2,
        validation_games: 1,
        seed: Some(5),
        ..TrainerConfig::default()
    };
    config.reinforcement.algorithm = RlAlgorithm::None;
    let mut trainer = ContinualTrainer::new(config, registry.clone(), model.clone(), None);

    // either outcome is fine here, only the bookkeeping around it is checked
    match trainer.maybe_train(&store, 0, &AtomicBool::new(false)) {
        Ok(Some(version)) => {
            assert_eq!(model.version(), version);
            assert_eq!(registry.active_version().unwrap(), Some(version));
        }
        Err(bot::trainer::TrainError::Regression { .. }) => {
            assert_eq!(model.version(), 0);
        }
        other => panic!("unexpected training outcome {:?}", other),
    }
    assert_eq!(store.count_games_since(0), 0);

    let active = model.version();
    let raw = play(oracle, &model, "after-training", 10);
    assert!(raw
        .moves
        .iter()
        .filter_map(|m| m.decision.as_ref())
        .all(|d| d.evaluation.model_version == Some(active)));
}
