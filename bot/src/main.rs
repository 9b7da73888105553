use anyhow::{bail, Context, Result};
use bot::analysis::Analyzer;
use bot::config::{ColorChoice, Config, OpponentKind};
use bot::logging;
use bot::metrics::MetricsSink;
use bot::model_registry::{ModelHandle, ModelRegistry};
use bot::oracle::{SearchOracle, UciOracle};
use bot::pipeline;
use bot::platform::local::{LocalPlatform, Opponent};
use bot::policy::MovePolicy;
use bot::session::{GameSession, SessionState};
use bot::store::ExperienceStore;
use bot::trainer::{ContinualTrainer, TrainError, TrainerService};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nn::model::ModelMeta;
use shakmaty::Color;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(about = "Chess agent that learns from the games it plays")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, default_value = "bot.toml")]
    config: PathBuf,

    /// Log at debug level, ignoring the configured filter
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plays games on the local platform, learning between them
    Play(PlayCommand),
    /// Prints the analysis of a stored game
    Analyze(AnalyzeCommand),
    /// Retries the analysis of parked games
    Reanalyze,
    /// Runs a training cycle now
    Train(TrainCommand),
    /// Creates a fresh model and makes it active
    InitModel(InitModelCommand),
    /// Displays statistics of the stored games and the active model
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum OpponentArg {
    Engine,
    Random,
}

#[derive(Args)]
struct PlayCommand {
    /// Number of games to play
    #[arg(long, default_value = "1")]
    games: u32,

    /// Overrides `local.opponent`
    #[arg(long)]
    opponent: Option<OpponentArg>,
}

#[derive(Args)]
struct AnalyzeCommand {
    game_id: String,
}

#[derive(Args)]
struct TrainCommand {
    /// Train even if fewer than `trainer.save_interval` new games are stored
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct InitModelCommand {
    /// Replace the active model even if one exists
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&config.logging, cli.verbose);

    match cli.command {
        Commands::Play(cmd) => {
            if let Some(opponent) = cmd.opponent {
                config.local.opponent = match opponent {
                    OpponentArg::Engine => OpponentKind::Engine,
                    OpponentArg::Random => OpponentKind::Random,
                };
            }
            play(&config, cmd.games)
        }
        Commands::Analyze(cmd) => analyze(&config, &cmd.game_id),
        Commands::Reanalyze => reanalyze(&config),
        Commands::Train(cmd) => train(&config, cmd.force),
        Commands::InitModel(cmd) => init_model(&config, cmd.force),
        Commands::Stats => stats(&config),
    }
}

fn open_store(config: &Config) -> Result<Arc<ExperienceStore>> {
    let store = ExperienceStore::open(&config.store.dir)
        .with_context(|| format!("opening store {}", config.store.dir.display()))?;
    Ok(Arc::new(store))
}

fn open_model(config: &Config) -> Result<(Arc<ModelRegistry>, ModelHandle)> {
    let registry = ModelRegistry::open(&config.models.dir)?;
    let model = registry
        .load_or_init(config.models.hidden_size, config.models.seed)
        .context("loading the active model")?;
    Ok((Arc::new(registry), ModelHandle::new(model)))
}

/// Raised on Ctrl-C: the running game is resigned and no new one starts
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let abort = Arc::new(AtomicBool::new(false));
    let flag = abort.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, stopping after the current game");
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing the Ctrl-C handler")?;
    Ok(abort)
}

fn play(config: &Config, games: u32) -> Result<()> {
    let store = open_store(config)?;
    let metrics = Arc::new(MetricsSink::open(&config.store.dir)?);
    let (registry, handle) = open_model(config)?;

    let oracle: Arc<dyn SearchOracle> = Arc::new(UciOracle::uci(&config.oracle));
    let policy = MovePolicy::new(oracle.clone(), &config.oracle, &config.policy);
    let analyzer = Analyzer::new(oracle.clone(), &config.analysis);

    let trainer = ContinualTrainer::new(
        config.trainer.clone(),
        registry,
        handle.clone(),
        Some(metrics.clone()),
    );
    let trainer = TrainerService::spawn(trainer, store.clone())?;
    // first wakeup picks up games stored by earlier runs
    trainer.notify_game_appended();

    let abort = interrupt_flag()?;
    let opponent = Opponent::from_config(&config.local);
    let seed = config.policy.seed.unwrap_or(0);

    for i in 0..games {
        if abort.load(Ordering::SeqCst) {
            println!("interrupted, {} of {} games played", i, games);
            break;
        }
        let agent = match config.local.agent_color {
            ColorChoice::White => Color::White,
            ColorChoice::Black => Color::Black,
            ColorChoice::Alternate if i % 2 == 0 => Color::White,
            ColorChoice::Alternate => Color::Black,
        };
        let game_id = format!("local-{}-{}", chrono::Utc::now().format("%Y%m%d%H%M%S"), i);

        let platform = LocalPlatform::new(
            game_id.clone(),
            agent,
            opponent,
            Some(oracle.clone()),
            &config.local,
            seed.wrapping_add(i as u64),
        );
        let outcome = GameSession::new(
            &platform,
            &policy,
            &handle,
            config.session.clone(),
            abort.clone(),
        )
        .run();

        match (outcome.final_state, outcome.raw_game) {
            (SessionState::Finished, Some(raw)) => {
                match pipeline::record_game(&raw, &analyzer, &store, Some(&metrics)) {
                    Ok((seq, summary)) => {
                        println!(
                            "game {} ({}): {} | acpl {:.1}, {} blunders",
                            seq,
                            game_id,
                            summary.result,
                            summary.average_centipawn_loss,
                            summary.blunder_count
                        );
                        trainer.notify_game_appended();
                    }
                    Err(error) => println!("game {}: not stored ({})", game_id, error),
                }
            }
            (state, _) => println!("game {}: ended {:?}", game_id, state),
        }
    }

    trainer.shutdown();
    Ok(())
}

fn analyze(config: &Config, game_id: &str) -> Result<()> {
    let store = open_store(config)?;
    let Some(record) = store.game(game_id) else {
        bail!("no stored game {}", game_id);
    };

    println!(
        "{} vs {} ({}) as {}: {} by {:?}",
        record.game_id(),
        record.info.opponent,
        record.info.time_control.as_deref().unwrap_or("-"),
        record.info.agent_color,
        record.result,
        record.termination
    );
    for m in &record.moves {
        println!(
            "{:>4} {:<6} {:>1} {:>7} {:>7} {:>5} {}",
            m.ply,
            m.move_played,
            if m.by_agent { "*" } else { "" },
            m.evaluation_after_best.score_cp,
            m.evaluation_played.score_cp,
            m.centipawn_loss,
            m.label
        );
    }
    let summary = bot::analysis::GameSummary::of(&record);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn reanalyze(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let metrics = MetricsSink::open(&config.store.dir)?;
    let oracle: Arc<dyn SearchOracle> = Arc::new(UciOracle::uci(&config.oracle));
    let analyzer = Analyzer::new(oracle, &config.analysis);

    let stored = pipeline::reanalyze(&analyzer, &store, Some(&metrics))?;
    println!("{} parked games stored", stored);
    Ok(())
}

fn train(config: &Config, force: bool) -> Result<()> {
    let store = open_store(config)?;
    let metrics = Arc::new(MetricsSink::open(&config.store.dir)?);
    let (registry, handle) = open_model(config)?;
    let active = handle.version();

    let mut trainer = ContinualTrainer::new(config.trainer.clone(), registry, handle, Some(metrics));
    let cancel = AtomicBool::new(false);
    let result = if force {
        trainer.train_now(&store, &cancel)
    } else {
        trainer.maybe_train(&store, active, &cancel)
    };

    match result {
        Ok(Some(version)) => println!("model v{} is now active (was v{})", version, active),
        Ok(None) => println!(
            "{} new games since v{}, training starts at {}",
            store.count_games_since(active),
            active,
            config.trainer.save_interval
        ),
        Err(error @ TrainError::Regression { .. }) => println!("v{} kept: {}", active, error),
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

fn init_model(config: &Config, force: bool) -> Result<()> {
    let registry = ModelRegistry::open(&config.models.dir)?;
    if let Some(active) = registry.active_version()? {
        if !force {
            bail!("model v{} is already active, use --force to replace it", active);
        }
    }

    let version = match registry.active_version()? {
        Some(_) => registry.next_version()?,
        None => 0,
    };
    let model = ModelRegistry::initial_model(config.models.hidden_size, config.models.seed)?;
    let model = model.with_meta(ModelMeta {
        version,
        ..model.meta().clone()
    });
    registry.install(&model)?;

    println!(
        "model v{} ({}, {} hidden, {} params) written to {}",
        version,
        model.feature_set().name(),
        model.hidden_size(),
        model.params(),
        registry.path_for(version).display()
    );
    Ok(())
}

fn stats(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let registry = ModelRegistry::open(&config.models.dir)?;
    let active = registry.active_version()?;

    let stats = store.statistics();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    match active {
        Some(version) => println!(
            "active model: v{} ({} games since its last training mark)",
            version,
            store.count_games_since(version)
        ),
        None => println!("active model: none"),
    }
    println!("model versions on disk: {:?}", registry.versions()?);
    Ok(())
}
