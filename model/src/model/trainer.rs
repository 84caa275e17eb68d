use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::config::TrainingConfig;
use super::core::{argmax_rows, CapsNet};
use super::layers::Mode;
use super::loss::{CombinedLoss, LossBreakdown};
use super::optimizer::{build_optimizer, Optimizer};
use crate::error::{CapsError, CapsResult};
use crate::train_data::data_loader::{
    class_weights, item_seed, sample_weights, AugmentingDataset, Batch, BatchLoader, SplitDataset,
    WeightedSampler,
};
use crate::train_data::training_strategy::{EpochMetrics, Trainable};

/// Session d'entraînement du CapsNet : poids vivants, optimiseur et données
pub struct CapsNetTrainer {
    model: CapsNet,
    optimizer: Box<dyn Optimizer>,
    loss: CombinedLoss,
    train: AugmentingDataset,
    validation: AugmentingDataset,
    loader: BatchLoader,
    sampler: Option<WeightedSampler>,
    class_weights: Option<Vec<f32>>,
    momentum: f32,
    seed: u64,
    rng: StdRng,
}

impl CapsNetTrainer {
    pub fn new(model: CapsNet, data: SplitDataset, config: &TrainingConfig, seed: u64) -> CapsResult<Self> {
        config.validate()?;
        if data.train.is_empty() || data.validation.is_empty() {
            return Err(CapsError::EmptyDataset("entraînement ou validation vide".into()));
        }
        let num_classes = model.config.num_classes;

        let class_weights = config
            .weighted_loss
            .then(|| class_weights(data.train.labels(), num_classes));
        if let Some(weights) = &class_weights {
            info!("⚖️  Poids de classe: {weights:?}");
        }
        let sampler = if config.balanced_sampling {
            Some(WeightedSampler::new(&sample_weights(data.train.labels(), num_classes))?)
        } else {
            None
        };

        Ok(Self {
            model,
            optimizer: build_optimizer(config),
            loss: CombinedLoss::new(&config.loss_config),
            train: data.train,
            validation: data.validation,
            loader: BatchLoader::new(config.batch_size),
            sampler,
            class_weights,
            momentum: config.batch_norm_momentum,
            seed,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn model(&self) -> &CapsNet {
        &self.model
    }

    pub fn into_model(self) -> CapsNet {
        self.model
    }

    pub fn validation(&self) -> &AugmentingDataset {
        &self.validation
    }

    /// Ordre des éléments pour une époque : tirage pondéré ou permutation
    fn epoch_order(&mut self) -> Vec<usize> {
        match &self.sampler {
            Some(sampler) => sampler.epoch_indices(&mut self.rng),
            None => {
                let mut order: Vec<usize> = (0..self.train.len()).collect();
                order.shuffle(&mut self.rng);
                order
            }
        }
    }

    /// Passe avant, perte, rétropropagation et pas d'optimisation
    pub fn train_step(&mut self, batch: &Batch, learning_rate: f32) -> CapsResult<(LossBreakdown, usize)> {
        let images = batch.images.view();
        let pass = self.model.forward(&images, Mode::Train, &mut self.rng)?;
        let weights = self.class_weights.as_deref();

        let breakdown = self.loss.compute_total(
            &pass.logits.view(),
            &batch.labels,
            weights,
            &pass.reconstruction.view(),
            &images,
        )?;
        let (grad_logits, grad_reconstruction) = self.loss.gradients(
            &pass.logits.view(),
            &batch.labels,
            weights,
            &pass.reconstruction.view(),
            &images,
        )?;
        let grads = self
            .model
            .backward(&pass, &grad_logits.view(), &grad_reconstruction.view())?;

        self.optimizer.set_lr(learning_rate);
        self.optimizer.step(&mut self.model, &grads)?;
        self.model.update_running_stats(&pass, self.momentum);

        Ok((breakdown, count_correct(&pass.logits.view(), &batch.labels)))
    }

    fn evaluate_batch(&mut self, batch: &Batch) -> CapsResult<(LossBreakdown, usize)> {
        let images = batch.images.view();
        let pass = self.model.forward(&images, Mode::Eval, &mut self.rng)?;
        let breakdown = self.loss.compute_total(
            &pass.logits.view(),
            &batch.labels,
            self.class_weights.as_deref(),
            &pass.reconstruction.view(),
            &images,
        )?;
        Ok((breakdown, count_correct(&pass.logits.view(), &batch.labels)))
    }
}

fn count_correct(logits: &ndarray::ArrayView2<f32>, labels: &[usize]) -> usize {
    argmax_rows(logits)
        .iter()
        .zip(labels)
        .filter(|(predicted, label)| predicted == label)
        .count()
}

/// Moyennes pondérées par la taille des batchs
#[derive(Default)]
struct Running {
    loss: f32,
    correct: usize,
    seen: usize,
}

impl Running {
    fn add(&mut self, breakdown: LossBreakdown, correct: usize, size: usize) {
        self.loss += breakdown.total * size as f32;
        self.correct += correct;
        self.seen += size;
    }

    fn metrics(&self) -> EpochMetrics {
        let n = self.seen.max(1) as f32;
        EpochMetrics {
            loss: self.loss / n,
            accuracy: self.correct as f32 / n,
        }
    }
}

impl Trainable for CapsNetTrainer {
    type Snapshot = CapsNet;

    fn train_epoch(&mut self, epoch: usize, learning_rate: f32) -> CapsResult<EpochMetrics> {
        let order = self.epoch_order();
        let epoch_seed = item_seed(self.seed, epoch);
        let loader = self.loader;
        let mut running = Running::default();

        for (i, chunk) in order.chunks(loader.batch_size()).enumerate() {
            let batch = self.train.batch(chunk, item_seed(epoch_seed, i))?;
            let (breakdown, correct) = self.train_step(&batch, learning_rate)?;
            debug!(
                "Batch {i}: marge {:.4}, reconstruction {:.6}",
                breakdown.margin, breakdown.reconstruction
            );
            running.add(breakdown, correct, batch.len());
        }
        Ok(running.metrics())
    }

    fn validate_epoch(&mut self, _epoch: usize) -> CapsResult<EpochMetrics> {
        let order: Vec<usize> = (0..self.validation.len()).collect();
        let batches: Vec<Batch> = self
            .loader
            .iter(&self.validation, &order, self.seed)
            .collect::<CapsResult<_>>()?;
        let mut running = Running::default();
        for batch in &batches {
            let (breakdown, correct) = self.evaluate_batch(batch)?;
            running.add(breakdown, correct, batch.len());
        }
        Ok(running.metrics())
    }

    fn snapshot(&self) -> CapsNet {
        self.model.clone()
    }
}
