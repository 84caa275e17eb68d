use log::info;
use std::time::Instant;

use crate::error::CapsResult;
use crate::model::config::TrainingConfig;
use crate::model::core::{EpochRecord, TrainingHistory};
use crate::model::optimizer::CosineWarmRestarts;

/// Perte et exactitude moyennes d'une passe sur un jeu
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// Ce que la boucle d'entraînement pilote
pub trait Trainable {
    /// Copie des poids conservée pour le meilleur modèle
    type Snapshot: Clone;

    fn train_epoch(&mut self, epoch: usize, learning_rate: f32) -> CapsResult<EpochMetrics>;
    fn validate_epoch(&mut self, epoch: usize) -> CapsResult<EpochMetrics>;
    fn snapshot(&self) -> Self::Snapshot;
}

/// Arrêt anticipé sur la perte de validation ; patience 0 = désactivé
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: f32,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f32::INFINITY,
            counter: 0,
        }
    }

    /// Vrai si la perte améliore strictement le meilleur score
    pub fn observe(&mut self, loss: f32) -> bool {
        if loss < self.best_loss {
            self.best_loss = loss;
            self.counter = 0;
            true
        } else {
            self.counter += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.patience > 0 && self.counter >= self.patience
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn counter(&self) -> usize {
        self.counter
    }
}

/// Résultat d'un entraînement complet
#[derive(Debug, Clone)]
pub struct TrainingOutcome<S> {
    /// Poids de la meilleure époque (poids initiaux si aucune n'a amélioré)
    pub best: S,
    pub best_epoch: Option<usize>,
    pub best_val_loss: f32,
    pub history: TrainingHistory,
    pub epochs_run: usize,
    pub stopped_early: bool,
}

/// Boucle par époques : cosine à redémarrages, meilleur modèle, arrêt
/// anticipé
pub struct TrainingStrategy {
    config: TrainingConfig,
}

impl TrainingStrategy {
    pub fn new(config: TrainingConfig) -> CapsResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn fit<T: Trainable>(&self, model: &mut T) -> CapsResult<TrainingOutcome<T::Snapshot>> {
        info!("🎯 Début de l'entraînement: {} époques max", self.config.num_epochs);
        let start = Instant::now();

        let mut scheduler = CosineWarmRestarts::new(self.config.learning_rate, &self.config.lr_schedule);
        let mut stopper = EarlyStopping::new(self.config.early_stopping_patience);
        let mut history = TrainingHistory::new();
        let mut best = model.snapshot();
        let mut best_epoch = None;
        let mut stopped_early = false;

        for epoch in 0..self.config.num_epochs {
            let learning_rate = scheduler.learning_rate();
            let train = model.train_epoch(epoch, learning_rate)?;
            let val = model.validate_epoch(epoch)?;
            scheduler.step_epoch();

            history.push(EpochRecord {
                epoch,
                train_loss: train.loss,
                val_loss: val.loss,
                train_accuracy: train.accuracy,
                val_accuracy: val.accuracy,
                learning_rate,
            });
            info!(
                "📈 Époque {}/{}: train loss {:.4} acc {:.2}% | val loss {:.4} acc {:.2}% | lr {:.2e}",
                epoch + 1,
                self.config.num_epochs,
                train.loss,
                train.accuracy * 100.0,
                val.loss,
                val.accuracy * 100.0,
                learning_rate
            );

            if stopper.observe(val.loss) {
                best = model.snapshot();
                best_epoch = Some(epoch);
                info!("💾 Nouveau meilleur modèle (val loss {:.4})", val.loss);
            } else if stopper.should_stop() {
                info!(
                    "⏹️  Arrêt anticipé: {} époques sans amélioration",
                    stopper.counter()
                );
                stopped_early = true;
                break;
            }
        }

        let epochs_run = history.len();
        info!(
            "🎉 Entraînement terminé en {:?}: {} époques, meilleure val loss {:.4}",
            start.elapsed(),
            epochs_run,
            stopper.best_loss()
        );

        Ok(TrainingOutcome {
            best,
            best_epoch,
            best_val_loss: stopper.best_loss(),
            history,
            epochs_run,
            stopped_early,
        })
    }
}
