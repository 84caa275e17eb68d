use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use capsnet_nodule::model::ExperimentConfig;
use capsnet_nodule::run_experiment;
use capsnet_nodule::train_data::ScanArchive;

#[derive(Parser)]
#[command(name = "capsnet-train")]
#[command(about = "CapsNet: classification bénin / malin de nodules pulmonaires", long_about = None)]
struct Cli {
    /// Archive de scans (manifest.json + volumes .npy)
    #[arg(short, long)]
    data: PathBuf,

    /// Configuration JSON de l'expérience
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dossier des artefacts (checkpoint, historique, figures)
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Nombre maximal de scans à traiter
    #[arg(long)]
    max_scans: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Nombre maximal d'époques
    #[arg(long)]
    epochs: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    info!("🚀 CAPSNET - NODULES PULMONAIRES");

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::from_json_file(path)
            .with_context(|| format!("lecture de la configuration {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    if let Some(max_scans) = cli.max_scans {
        config.sampler.max_scans = max_scans;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(epochs) = cli.epochs {
        config.training.num_epochs = epochs;
    }

    let archive = ScanArchive::open(&cli.data)
        .with_context(|| format!("ouverture de l'archive {}", cli.data.display()))?;
    let outcome = run_experiment(&config, &archive, &cli.output).context("expérience interrompue")?;

    println!("\n🎉 ENTRAÎNEMENT TERMINÉ !");
    match outcome.best_epoch {
        Some(epoch) => println!("   Meilleure époque: {}", epoch + 1),
        None => println!("   Aucune amélioration de la perte de validation"),
    }
    if outcome.stopped_early {
        println!("   Arrêt anticipé après {} époques", outcome.history.len());
    }
    println!("   Checkpoint: {}", outcome.checkpoint.display());
    println!("   AUC: {:.4}\n", outcome.evaluation.roc.auc);
    println!("{}", outcome.report_text);

    Ok(())
}
