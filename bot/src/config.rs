//! TOML configuration. Every field has a default so an empty file (or no
//! file at all) is a valid configuration.

use crate::logging::LoggingConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub oracle: OracleConfig,
    pub policy: PolicyConfig,
    pub session: SessionConfig,
    pub analysis: AnalysisConfig,
    pub store: StoreConfig,
    pub models: ModelsConfig,
    pub trainer: TrainerConfig,
    pub local: LocalConfig,
    pub logging: LoggingConfig,
}

/// Which side the engine's scores are reported for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorePerspective {
    #[default]
    SideToMove,
    White,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OracleConfig {
    /// Path or name of a UCI engine binary
    pub binary: String,
    pub depth: u32,
    pub time_budget_ms: u64,
    pub multipv: usize,
    pub pool_size: usize,
    pub max_pending: usize,
    pub threads: u32,
    pub hash_mb: u32,
    pub score_perspective: ScorePerspective,
    pub deterministic: bool,
    pub handshake_timeout_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            binary: "stockfish".to_string(),
            depth: 12,
            time_budget_ms: 2_000,
            multipv: 4,
            pool_size: 1,
            max_pending: 4,
            threads: 1,
            hash_mb: 64,
            score_perspective: ScorePerspective::SideToMove,
            deterministic: true,
            handshake_timeout_ms: 10_000,
            stop_grace_ms: 500,
        }
    }
}

impl OracleConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Weight of the engine score in the blend, the model gets the rest
    pub blend_weight: f32,
    pub exploration_rate: f64,
    /// Fixed seed for exploration, random when absent
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            blend_weight: 0.7,
            exploration_rate: 0.05,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub retry_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub event_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            retry_attempts: 5,
            backoff_initial_ms: 200,
            backoff_max_ms: 5_000,
            event_timeout_ms: 1_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub depth: u32,
    pub time_budget_ms: u64,
    /// Plies labelled `book` regardless of their loss
    pub book_plies: u32,
    pub inaccuracy: u32,
    pub mistake: u32,
    pub blunder: u32,
    /// Ceiling of the centipawn loss
    pub max_loss: u32,
    /// Retries of a busy or timed out oracle request
    pub retries: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            depth: 16,
            time_budget_ms: 5_000,
            book_plies: 8,
            inaccuracy: 50,
            mistake: 100,
            blunder: 300,
            max_loss: 1_000,
            retries: 3,
        }
    }
}

impl AnalysisConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            dir: PathBuf::from("data/experience"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelsConfig {
    pub dir: PathBuf,
    pub hidden_size: usize,
    /// Seed of the initial weights
    pub seed: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        ModelsConfig {
            dir: PathBuf::from("data/models"),
            hidden_size: 64,
            seed: 0,
        }
    }
}

/// Sampling weight of each move label
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabelWeights {
    pub book: f32,
    pub best: f32,
    pub good: f32,
    pub inaccuracy: f32,
    pub mistake: f32,
    pub blunder: f32,
}

impl Default for LabelWeights {
    fn default() -> Self {
        LabelWeights {
            book: 0.25,
            best: 1.0,
            good: 1.0,
            inaccuracy: 1.5,
            mistake: 2.0,
            blunder: 3.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlAlgorithm {
    None,
    #[default]
    Reinforce,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReinforcementConfig {
    pub algorithm: RlAlgorithm,
    /// Most recent games replayed by the reinforcement phase
    pub games: usize,
    /// Softmax temperature, in centipawns
    pub temperature: f32,
    pub learning_rate: f32,
}

impl Default for ReinforcementConfig {
    fn default() -> Self {
        ReinforcementConfig {
            algorithm: RlAlgorithm::Reinforce,
            games: 20,
            temperature: 100.0,
            learning_rate: 0.001,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
    /// New games needed before a training cycle starts
    pub save_interval: u64,
    pub batch_size: usize,
    pub mini_batch: usize,
    pub epochs: usize,
    pub learning_rate: f32,
    pub recency_games: usize,
    pub validation_games: usize,
    pub exploratory_weight: f32,
    pub label_weights: LabelWeights,
    pub seed: Option<u64>,
    pub reinforcement: ReinforcementConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            save_interval: 10,
            batch_size: 2_048,
            mini_batch: 64,
            epochs: 3,
            learning_rate: 0.05,
            recency_games: 200,
            validation_games: 2,
            exploratory_weight: 0.5,
            label_weights: LabelWeights::default(),
            seed: None,
            reinforcement: ReinforcementConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpponentKind {
    #[default]
    Engine,
    Random,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorChoice {
    White,
    Black,
    #[default]
    Alternate,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    pub opponent: OpponentKind,
    pub opponent_depth: u32,
    /// Games reaching this many plies are adjudicated as draws
    pub max_plies: u32,
    pub base_time_ms: u64,
    pub increment_ms: u64,
    pub agent_color: ColorChoice,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            opponent: OpponentKind::Engine,
            opponent_depth: 4,
            max_plies: 300,
            base_time_ms: 300_000,
            increment_ms: 2_000,
            agent_color: ColorChoice::Alternate,
        }
    }
}

impl Config {
    /// Reads and validates `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(condition: bool, message: &str) -> Result<(), ConfigError> {
            if condition {
                Ok(())
            } else {
                Err(ConfigError::Invalid(message.to_string()))
            }
        }

        let oracle = &self.oracle;
        check(oracle.depth > 0, "oracle.depth must be positive")?;
        check(oracle.multipv > 0, "oracle.multipv must be positive")?;
        check(oracle.pool_size > 0, "oracle.pool_size must be positive")?;
        check(oracle.time_budget_ms > 0, "oracle.time_budget_ms must be positive")?;

        let policy = &self.policy;
        check(
            (0.0..=1.0).contains(&policy.blend_weight),
            "policy.blend_weight must be within [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&policy.exploration_rate),
            "policy.exploration_rate must be within [0, 1]",
        )?;

        let analysis = &self.analysis;
        check(
            analysis.depth > oracle.depth,
            "analysis.depth must be greater than oracle.depth",
        )?;
        check(
            0 < analysis.inaccuracy
                && analysis.inaccuracy < analysis.mistake
                && analysis.mistake < analysis.blunder,
            "analysis thresholds must satisfy 0 < inaccuracy < mistake < blunder",
        )?;
        check(
            analysis.max_loss >= analysis.blunder,
            "analysis.max_loss must be at least analysis.blunder",
        )?;

        let session = &self.session;
        check(
            session.backoff_initial_ms <= session.backoff_max_ms,
            "session.backoff_initial_ms must not exceed session.backoff_max_ms",
        )?;

        let trainer = &self.trainer;
        check(trainer.save_interval > 0, "trainer.save_interval must be positive")?;
        check(trainer.mini_batch > 0, "trainer.mini_batch must be positive")?;
        check(trainer.batch_size > 0, "trainer.batch_size must be positive")?;
        check(trainer.validation_games > 0, "trainer.validation_games must be positive")?;
        check(trainer.learning_rate > 0.0, "trainer.learning_rate must be positive")?;
        check(
            (0.0..=1.0).contains(&trainer.exploratory_weight),
            "trainer.exploratory_weight must be within [0, 1]",
        )?;
        let weights = &trainer.label_weights;
        check(
            [
                weights.book,
                weights.best,
                weights.good,
                weights.inaccuracy,
                weights.mistake,
                weights.blunder,
            ]
            .iter()
            .all(|w| *w >= 0.0 && w.is_finite()),
            "trainer.label_weights must be finite and non negative",
        )?;
        check(
            trainer.reinforcement.temperature >= 1.0,
            "trainer.reinforcement.temperature must be at least 1 centipawn",
        )?;

        check(self.models.hidden_size > 0, "models.hidden_size must be positive")?;
        check(self.local.max_plies > 0, "local.max_plies must be positive")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.oracle.depth, OracleConfig::default().depth);
        assert_eq!(config.oracle.score_perspective, ScorePerspective::SideToMove);
        assert_eq!(config.trainer.reinforcement.algorithm, RlAlgorithm::Reinforce);
    }

    #[test]
    fn partial_sections() {
        let config = Config::from_toml(
            r#"
            [oracle]
            binary = "/usr/bin/stockfish"
            depth = 8
            score_perspective = "white"

            [analysis]
            depth = 14

            [trainer.label_weights]
            blunder = 5.0

            [local]
            opponent = "random"
            "#,
        )
        .unwrap();

        assert_eq!(config.oracle.binary, "/usr/bin/stockfish");
        assert_eq!(config.oracle.score_perspective, ScorePerspective::White);
        assert_eq!(config.oracle.multipv, 4);
        assert_eq!(config.trainer.label_weights.blunder, 5.0);
        assert_eq!(config.trainer.label_weights.mistake, 2.0);
        assert_eq!(config.local.opponent, OpponentKind::Random);
    }

    #[test]
    fn analysis_must_search_deeper_than_live_play() {
        let error = Config::from_toml(
            r#"
            [oracle]
            depth = 16
            [analysis]
            depth = 16
            "#,
        )
        .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let error = Config::from_toml(
            r#"
            [analysis]
            inaccuracy = 150
            mistake = 100
            "#,
        )
        .unwrap_err();
        assert!(error.to_string().contains("thresholds"));
    }

    #[test]
    fn blend_weight_range() {
        assert!(Config::from_toml("[policy]\nblend_weight = 1.5").is_err());
        assert!(Config::from_toml("[policy]\nblend_weight = 0.0").is_ok());
    }

    #[test]
    fn temperature_is_at_least_one_centipawn() {
        let error = Config::from_toml("[trainer.reinforcement]\ntemperature = 0.5").unwrap_err();
        assert!(error.to_string().contains("temperature"));
        assert!(Config::from_toml("[trainer.reinforcement]\ntemperature = 1.0").is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::from_toml("[oracle]\ndeepth = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.store.dir, PathBuf::from("data/experience"));
    }
}
