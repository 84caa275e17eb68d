use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::{CapsError, CapsResult};
use crate::evaluation::{classification_report, EvaluationReport, Evaluator, CLASS_NAMES};
use crate::model::config::ExperimentConfig;
use crate::model::core::{TrainingHistory, CHECKPOINT_FILE};
use crate::model::{CapsNetTrainer, ModelBuilder};
use crate::report::{write_reports, ReportPaths};
use crate::train_data::data_loader::SplitDataset;
use crate::train_data::sampler::{SamplerStats, ScanSource, VolumeSampler};
use crate::train_data::training_strategy::TrainingStrategy;

/// Historique d'entraînement sérialisé à côté du checkpoint
pub const HISTORY_FILE: &str = "training_history.json";

/// Bilan d'une expérience complète
#[derive(Debug)]
pub struct ExperimentOutcome {
    pub stats: SamplerStats,
    pub checkpoint: PathBuf,
    pub history_path: PathBuf,
    pub history: TrainingHistory,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
    pub evaluation: EvaluationReport,
    pub reports: ReportPaths,
    /// Rapport de classification textuel
    pub report_text: String,
}

/// Extraction → split → entraînement → checkpoint → évaluation → figures
pub fn run_experiment<S>(config: &ExperimentConfig, source: &S, output_dir: &Path) -> CapsResult<ExperimentOutcome>
where
    S: ScanSource + ?Sized,
{
    config.validate()?;
    fs::create_dir_all(output_dir)?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let patches = VolumeSampler::new(config.sampler.clone())?.sample(source, &mut rng)?;
    if patches.images.is_empty() {
        return Err(CapsError::EmptyDataset("aucun nodule exploitable".into()));
    }
    let stats = patches.stats.clone();
    let split = SplitDataset::from_patches(
        patches,
        config.training.validation_split,
        &config.augment,
        &mut rng,
    )?;

    let model = ModelBuilder::new()
        .with_network_config(config.network.clone())
        .with_seed(config.seed)
        .build()?;
    model.diagnostic()?;

    let mut trainer = CapsNetTrainer::new(model, split, &config.training, config.seed)?;
    let outcome = TrainingStrategy::new(config.training.clone())?.fit(&mut trainer)?;
    let best = outcome.best;

    let checkpoint = output_dir.join(CHECKPOINT_FILE);
    best.save(&checkpoint)?;
    info!("💾 Meilleur modèle sauvegardé: {}", checkpoint.display());

    let history_path = output_dir.join(HISTORY_FILE);
    serde_json::to_writer_pretty(BufWriter::new(File::create(&history_path)?), &outcome.history)?;

    let evaluation = Evaluator::new(config.training.batch_size).evaluate(&best, trainer.validation())?;
    let reports = write_reports(output_dir, &outcome.history, &evaluation)?;
    let report_text = classification_report(&evaluation.metrics, &CLASS_NAMES);

    Ok(ExperimentOutcome {
        stats,
        checkpoint,
        history_path,
        history: outcome.history,
        best_epoch: outcome.best_epoch,
        stopped_early: outcome.stopped_early,
        evaluation,
        reports,
        report_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::core::tests::tiny_config;
    use crate::model::core::CapsNet;
    use crate::train_data::sampler::tests::four_scan_source;
    use crate::train_data::sampler::InMemorySource;
    use tempfile::TempDir;

    fn tiny_experiment() -> ExperimentConfig {
        let mut config = ExperimentConfig {
            seed: 17,
            network: tiny_config(),
            ..ExperimentConfig::default()
        };
        config.sampler.patch_size = 12;
        config.augment.image_size = 12;
        config.training.batch_size = 2;
        config.training.num_epochs = 2;
        config
    }

    #[test]
    fn test_run_experiment_writes_artifacts() {
        let tmp = TempDir::new().unwrap();
        let outcome = run_experiment(&tiny_experiment(), &four_scan_source(), tmp.path()).unwrap();

        assert_eq!(outcome.stats.benign, 2);
        assert_eq!(outcome.stats.malignant, 2);
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.evaluation.predictions.len(), 2);
        assert!(outcome.report_text.contains("malignant"));

        assert!(outcome.checkpoint.ends_with(CHECKPOINT_FILE));
        let restored = CapsNet::load(&outcome.checkpoint).unwrap();
        assert_eq!(restored.config.input_size, 12);

        let history: TrainingHistory =
            serde_json::from_str(&fs::read_to_string(&outcome.history_path).unwrap()).unwrap();
        assert_eq!(history.len(), 2);
        for path in [
            &outcome.reports.training_metrics,
            &outcome.reports.confusion_matrix,
            &outcome.reports.roc_curve,
        ] {
            assert!(path.exists());
        }
    }

    #[test]
    fn test_empty_source_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let result = run_experiment(&tiny_experiment(), &InMemorySource::default(), tmp.path());
        assert!(matches!(result, Err(CapsError::EmptyDataset(_))));
    }

    #[test]
    fn test_inconsistent_sizes_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = tiny_experiment();
        config.augment.image_size = 32;
        let result = run_experiment(&config, &four_scan_source(), tmp.path());
        assert!(matches!(result, Err(CapsError::Config(_))));
    }
}
