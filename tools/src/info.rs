use anyhow::{anyhow, Result};
use bot::config::Config;
use bot::model_registry::ModelRegistry;
use clap::Args;
use nn::feature_set::build::build_feature_set;
use nn::model::ValueModel;
use shakmaty::fen::Fen;

#[derive(Args)]
pub struct InfoCommand {
    /// If provided, it will print the number of features of the given feature set
    #[arg(long, value_name = "feature-set")]
    feature_set: Option<String>,

    /// If provided, it will print the active features of the given FEN
    #[arg(long, value_name = "fen")]
    fen: Option<String>,

    /// Model checkpoint to describe, the active model when absent
    #[arg(long, value_name = "model")]
    model: Option<String>,
}

pub fn info(cmd: InfoCommand, config: Config) -> Result<()> {
    let setup = match &cmd.fen {
        Some(fen) => Some(fen.parse::<Fen>()?.into_setup()),
        None => None,
    };

    if let Some(name) = &cmd.feature_set {
        let feature_set =
            build_feature_set(name).ok_or_else(|| anyhow!("unknown feature set {}", name))?;

        // print number of features
        println!("{}", feature_set.num_features());

        if let Some(setup) = &setup {
            let features = nn::feature_set::encode(feature_set.as_ref(), setup)?;
            let active: Vec<String> = features.active().iter().map(|x| x.to_string()).collect();
            println!("{}", active.join(" "));
        }
        return Ok(());
    }

    let model = match &cmd.model {
        Some(path) => ValueModel::load(path)?,
        None => ModelRegistry::open(&config.models.dir)?
            .load_active()?
            .ok_or_else(|| anyhow!("no active model in {}", config.models.dir.display()))?,
    };

    let meta = model.meta();
    println!("version: {}", meta.version);
    let trained_at = chrono::DateTime::from_timestamp(meta.trained_at, 0)
        .map_or_else(|| meta.trained_at.to_string(), |t| t.to_rfc3339());
    println!("trained at: {}", trained_at);
    println!("training games: {}", meta.training_game_count);
    println!(
        "feature set: {} ({} features)",
        model.feature_set().name(),
        model.feature_set().num_features()
    );
    println!("hidden: {}, params: {}", model.hidden_size(), model.params());

    if let Some(setup) = &setup {
        let features = model.encode(setup)?;
        // print evaluation
        println!("eval: {}", model.evaluate(&features));
    }
    Ok(())
}
