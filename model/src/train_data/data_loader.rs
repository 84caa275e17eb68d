use log::info;
use ndarray::{s, Array2, Array3, Array4};
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::augment::{Augmenter, TransformMode};
use super::sampler::SampledPatches;
use crate::error::{CapsError, CapsResult};
use crate::model::config::AugmentConfig;

/// Graine propre à un élément, indépendante de l'ordre de calcul
pub fn item_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Mini-batch prêt pour le réseau
#[derive(Debug, Clone)]
pub struct Batch {
    /// [B, 1, S, S]
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Patchs et étiquettes, augmentés à la lecture
#[derive(Debug, Clone)]
pub struct AugmentingDataset {
    images: Vec<Array2<f32>>,
    labels: Vec<usize>,
    augmenter: Augmenter,
    mode: TransformMode,
}

impl AugmentingDataset {
    pub fn new(
        images: Vec<Array2<f32>>,
        labels: Vec<usize>,
        augment: AugmentConfig,
        mode: TransformMode,
    ) -> CapsResult<Self> {
        if images.len() != labels.len() {
            return Err(CapsError::Numerical(format!(
                "{} images pour {} étiquettes",
                images.len(),
                labels.len()
            )));
        }
        Ok(Self {
            images,
            labels,
            augmenter: Augmenter::new(augment)?,
            mode,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    /// Élément `index` : tenseur [1, S, S] et étiquette
    pub fn get<R: Rng>(&self, index: usize, rng: &mut R) -> CapsResult<(Array3<f32>, usize)> {
        let image = self.images.get(index).ok_or_else(|| {
            CapsError::Numerical(format!("indice {index} hors du jeu ({})", self.len()))
        })?;
        let tensor = self.augmenter.apply(&image.view(), self.mode, rng)?;
        Ok((tensor, self.labels[index]))
    }

    /// Assemble un batch en parallèle ; chaque élément a sa propre graine
    pub fn batch(&self, indices: &[usize], seed: u64) -> CapsResult<Batch> {
        if indices.is_empty() {
            return Err(CapsError::EmptyDataset("batch sans élément".into()));
        }
        let items: Vec<(Array3<f32>, usize)> = indices
            .par_iter()
            .enumerate()
            .map(|(position, &index)| {
                let mut rng = StdRng::seed_from_u64(item_seed(seed, position));
                self.get(index, &mut rng)
            })
            .collect::<CapsResult<_>>()?;

        let size = self.augmenter.config().image_size;
        let mut images = Array4::zeros((items.len(), 1, size, size));
        let mut labels = Vec::with_capacity(items.len());
        for (i, (tensor, label)) in items.into_iter().enumerate() {
            images.slice_mut(s![i, .., .., ..]).assign(&tensor);
            labels.push(label);
        }
        Ok(Batch { images, labels })
    }
}

/// Découpe un ordre d'indices en batchs consécutifs
#[derive(Debug, Clone, Copy)]
pub struct BatchLoader {
    batch_size: usize,
}

impl BatchLoader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self, len: usize) -> usize {
        len.div_ceil(self.batch_size)
    }

    /// Le dernier batch peut être incomplet
    pub fn iter<'a>(
        &self,
        dataset: &'a AugmentingDataset,
        order: &'a [usize],
        seed: u64,
    ) -> impl Iterator<Item = CapsResult<Batch>> + 'a {
        order
            .chunks(self.batch_size)
            .enumerate()
            .map(move |(i, chunk)| dataset.batch(chunk, item_seed(seed, i)))
    }
}

/// Jeux d'entraînement (augmenté) et de validation (déterministe)
#[derive(Debug, Clone)]
pub struct SplitDataset {
    pub train: AugmentingDataset,
    pub validation: AugmentingDataset,
}

impl SplitDataset {
    pub fn from_patches<R: Rng>(
        patches: SampledPatches,
        validation_fraction: f32,
        augment: &AugmentConfig,
        rng: &mut R,
    ) -> CapsResult<Self> {
        let (train_idx, val_idx) = stratified_split(&patches.labels, validation_fraction, rng);
        if train_idx.is_empty() || val_idx.is_empty() {
            return Err(CapsError::EmptyDataset(format!(
                "découpage impossible: {} entraînement, {} validation",
                train_idx.len(),
                val_idx.len()
            )));
        }

        let pick = |indices: &[usize]| -> (Vec<Array2<f32>>, Vec<usize>) {
            indices
                .iter()
                .map(|&i| (patches.images[i].clone(), patches.labels[i]))
                .unzip()
        };
        let (train_images, train_labels) = pick(&train_idx);
        let (val_images, val_labels) = pick(&val_idx);

        info!(
            "🎯 Split stratifié: Train={}, Validation={}",
            train_labels.len(),
            val_labels.len()
        );

        Ok(Self {
            train: AugmentingDataset::new(train_images, train_labels, augment.clone(), TransformMode::Train)?,
            validation: AugmentingDataset::new(val_images, val_labels, augment.clone(), TransformMode::Eval)?,
        })
    }
}

/// Découpage stratifié : round(effectif × fraction) par classe en
/// validation, au moins un élément dès que la classe en compte deux
pub fn stratified_split<R: Rng>(
    labels: &[usize],
    validation_fraction: f32,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let num_classes = labels.iter().max().map_or(0, |&m| m + 1);
    let mut train = Vec::new();
    let mut validation = Vec::new();

    for class in 0..num_classes {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(rng);
        let mut n_val = (members.len() as f32 * validation_fraction).round() as usize;
        if n_val == 0 && members.len() >= 2 {
            n_val = 1;
        }
        let n_val = n_val.min(members.len().saturating_sub(1));
        validation.extend_from_slice(&members[..n_val]);
        train.extend_from_slice(&members[n_val..]);
    }

    train.shuffle(rng);
    validation.sort_unstable();
    (train, validation)
}

pub fn class_counts(labels: &[usize], num_classes: usize) -> Vec<usize> {
    let mut counts = vec![0; num_classes];
    for &label in labels {
        if label < num_classes {
            counts[label] += 1;
        }
    }
    counts
}

/// Poids équilibrés n / (k · n_c), k étant le nombre de classes configuré ;
/// une classe absente reçoit 0
pub fn class_weights(labels: &[usize], num_classes: usize) -> Vec<f32> {
    let total = labels.len() as f32;
    class_counts(labels, num_classes)
        .into_iter()
        .map(|count| {
            if count == 0 {
                0.0
            } else {
                total / (num_classes as f32 * count as f32)
            }
        })
        .collect()
}

/// Poids de tirage par élément : 1 / effectif de sa classe
pub fn sample_weights(labels: &[usize], num_classes: usize) -> Vec<f32> {
    let counts = class_counts(labels, num_classes);
    labels.iter().map(|&label| 1.0 / counts[label].max(1) as f32).collect()
}

/// Tirage avec remise proportionnel aux poids, une époque = len tirages
#[derive(Debug, Clone)]
pub struct WeightedSampler {
    distribution: WeightedIndex<f32>,
    len: usize,
}

impl WeightedSampler {
    pub fn new(weights: &[f32]) -> CapsResult<Self> {
        let distribution = WeightedIndex::new(weights)
            .map_err(|e| CapsError::Numerical(format!("poids de tirage invalides: {e}")))?;
        Ok(Self {
            distribution,
            len: weights.len(),
        })
    }

    pub fn epoch_indices<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        (0..self.len).map(|_| rng.sample(&self.distribution)).collect()
    }
}
