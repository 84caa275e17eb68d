use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{CapsError, CapsResult};

/// Architecture du CapsNet (entrée 1×32×32, 2 classes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub input_size: usize,
    pub in_channels: usize,
    pub stem_channels: usize,
    pub kernel_size: usize,
    pub primary_stride: usize,
    pub capsule_config: CapsuleConfig,
    pub routing_iterations: usize,
    /// Dropout par canal après le stem et les capsules primaires
    pub conv_dropout: f32,
    pub head_hidden: Vec<usize>,
    pub head_dropout: Vec<f32>,
    pub num_classes: usize,
    pub decoder_hidden: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleConfig {
    pub num_capsules: usize,
    pub capsule_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f32,
    pub num_epochs: usize,
    pub validation_split: f32,
    pub early_stopping_patience: usize,
    pub optimizer_type: OptimizerType,
    pub loss_config: LossConfig,
    pub lr_schedule: SchedulerConfig,
    /// Rééchantillonnage pondéré des mini-batchs
    pub balanced_sampling: bool,
    /// Pondération de la perte par classe
    pub weighted_loss: bool,
    pub batch_norm_momentum: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
    },
    SGD {
        momentum: f32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub positive_margin: f32,
    pub negative_margin: f32,
    pub down_weighting: f32,
    pub reconstruction_weight: f32,
}

/// Cosine annealing avec redémarrages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub restart_period: usize,
    pub period_mult: usize,
    pub min_lr: f32,
}

/// Extraction des patchs de nodules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub max_scans: usize,
    pub min_cube_size: usize,
    pub max_cube_size: usize,
    pub patch_size: usize,
    pub malignancy_threshold: f32,
}

/// Augmentations du mode entraînement (probabilités indépendantes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    pub image_size: usize,
    pub rotate_prob: f32,
    pub rotate_limit: f32,
    pub hflip_prob: f32,
    pub vflip_prob: f32,
    pub affine_prob: f32,
    pub shift_limit: f32,
    pub scale_limit: f32,
    pub affine_rotate_limit: f32,
    pub noise_prob: f32,
    /// Variance du bruit gaussien, en niveaux de gris 8 bits
    pub noise_var: (f32, f32),
    pub brightness_contrast_prob: f32,
    pub brightness_limit: f32,
    pub contrast_limit: f32,
    pub elastic_prob: f32,
    pub elastic_alpha: f32,
    pub elastic_sigma: f32,
    pub mean: f32,
    pub std: f32,
}

/// Configuration complète d'une expérience
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub seed: u64,
    pub sampler: SamplerConfig,
    pub network: NetworkConfig,
    pub augment: AugmentConfig,
    pub training: TrainingConfig,
}

impl NetworkConfig {
    /// Côté de la carte après le stem
    pub fn stem_output_size(&self) -> usize {
        self.input_size + 1 - self.kernel_size
    }

    /// Côté de la grille de capsules primaires
    pub fn primary_grid_size(&self) -> usize {
        (self.stem_output_size() - self.kernel_size) / self.primary_stride + 1
    }

    /// Nombre de capsules d'entrée du routage (positions spatiales)
    pub fn input_capsules(&self) -> usize {
        let grid = self.primary_grid_size();
        grid * grid
    }

    pub fn primary_channels(&self) -> usize {
        self.capsule_config.num_capsules * self.capsule_config.capsule_dim
    }

    /// Taille du vecteur de capsules aplati
    pub fn flat_capsule_len(&self) -> usize {
        self.primary_channels()
    }

    pub fn reconstruction_len(&self) -> usize {
        self.input_size * self.input_size * self.in_channels
    }

    pub fn validate(&self) -> CapsResult<()> {
        if self.input_size < self.kernel_size {
            return Err(CapsError::config("entrée plus petite que le noyau du stem"));
        }
        if self.primary_stride == 0 {
            return Err(CapsError::config("le stride des capsules primaires doit être > 0"));
        }
        if self.stem_output_size() < self.kernel_size {
            return Err(CapsError::config("carte du stem plus petite que le noyau primaire"));
        }
        if self.capsule_config.num_capsules == 0 || self.capsule_config.capsule_dim == 0 {
            return Err(CapsError::config("capsules vides"));
        }
        if self.routing_iterations == 0 {
            return Err(CapsError::config("au moins une itération de routage est requise"));
        }
        if self.head_hidden.len() != self.head_dropout.len() {
            return Err(CapsError::config(format!(
                "{} couches cachées mais {} taux de dropout",
                self.head_hidden.len(),
                self.head_dropout.len()
            )));
        }
        let rates = self.head_dropout.iter().chain(std::iter::once(&self.conv_dropout));
        for &rate in rates {
            if !(0.0..1.0).contains(&rate) {
                return Err(CapsError::config(format!("taux de dropout invalide: {rate}")));
            }
        }
        if self.num_classes < 2 {
            return Err(CapsError::config("au moins deux classes"));
        }
        Ok(())
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> CapsResult<()> {
        if self.batch_size == 0 {
            return Err(CapsError::config("batch_size doit être > 0"));
        }
        if self.num_epochs == 0 {
            return Err(CapsError::config("num_epochs doit être > 0"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(CapsError::config("learning_rate doit être > 0"));
        }
        if !(0.0..1.0).contains(&self.validation_split) || self.validation_split == 0.0 {
            return Err(CapsError::config("validation_split doit être dans ]0, 1["));
        }
        if self.lr_schedule.restart_period == 0 || self.lr_schedule.period_mult == 0 {
            return Err(CapsError::config("période de redémarrage invalide"));
        }
        let loss = &self.loss_config;
        if loss.negative_margin >= loss.positive_margin {
            return Err(CapsError::config("la marge basse doit être < marge haute"));
        }
        Ok(())
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> CapsResult<()> {
        if self.min_cube_size == 0 || self.min_cube_size >= self.max_cube_size {
            return Err(CapsError::config(format!(
                "intervalle de taille de cube invalide: [{}, {})",
                self.min_cube_size, self.max_cube_size
            )));
        }
        if self.patch_size == 0 {
            return Err(CapsError::config("patch_size doit être > 0"));
        }
        Ok(())
    }
}

impl AugmentConfig {
    pub fn validate(&self) -> CapsResult<()> {
        let probs = [
            self.rotate_prob,
            self.hflip_prob,
            self.vflip_prob,
            self.affine_prob,
            self.noise_prob,
            self.brightness_contrast_prob,
            self.elastic_prob,
        ];
        if probs.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(CapsError::config("probabilité d'augmentation hors de [0, 1]"));
        }
        if self.std <= 0.0 {
            return Err(CapsError::config("std de normalisation doit être > 0"));
        }
        if self.noise_var.0 > self.noise_var.1 || self.noise_var.0 < 0.0 {
            return Err(CapsError::config("intervalle de variance du bruit invalide"));
        }
        Ok(())
    }
}

impl ExperimentConfig {
    pub fn from_json_file(path: &Path) -> CapsResult<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CapsResult<()> {
        self.sampler.validate()?;
        self.network.validate()?;
        self.augment.validate()?;
        self.training.validate()?;
        if self.augment.image_size != self.network.input_size
            || self.sampler.patch_size != self.network.input_size
        {
            return Err(CapsError::config(
                "patch_size, image_size et input_size doivent coïncider",
            ));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_size: 32,
            in_channels: 1,
            stem_channels: 256,
            kernel_size: 9,
            primary_stride: 2,
            capsule_config: CapsuleConfig::default(),
            routing_iterations: 3,
            conv_dropout: 0.3,
            head_hidden: vec![256, 128],
            head_dropout: vec![0.5, 0.4],
            num_classes: 2,
            decoder_hidden: vec![512, 1024],
        }
    }
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            num_capsules: 12,
            capsule_dim: 16,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            learning_rate: 0.001,
            num_epochs: 100,
            validation_split: 0.2,
            early_stopping_patience: 15,
            optimizer_type: OptimizerType::default(),
            loss_config: LossConfig::default(),
            lr_schedule: SchedulerConfig::default(),
            balanced_sampling: true,
            weighted_loss: true,
            batch_norm_momentum: 0.1,
        }
    }
}

impl Default for OptimizerType {
    fn default() -> Self {
        OptimizerType::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 1e-4,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            positive_margin: 0.9,
            negative_margin: 0.1,
            down_weighting: 0.5,
            reconstruction_weight: 0.0005,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            restart_period: 10,
            period_mult: 1,
            min_lr: 1e-6,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_scans: 100,
            min_cube_size: 10,
            max_cube_size: 50,
            patch_size: 32,
            malignancy_threshold: 3.0,
        }
    }
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            image_size: 32,
            rotate_prob: 0.5,
            rotate_limit: 15.0,
            hflip_prob: 0.5,
            vflip_prob: 0.5,
            affine_prob: 0.5,
            shift_limit: 0.0625,
            scale_limit: 0.1,
            affine_rotate_limit: 15.0,
            noise_prob: 0.3,
            noise_var: (10.0, 50.0),
            brightness_contrast_prob: 0.3,
            brightness_limit: 0.2,
            contrast_limit: 0.2,
            elastic_prob: 0.2,
            elastic_alpha: 34.0,
            elastic_sigma: 4.0,
            mean: 0.5,
            std: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let config = NetworkConfig::default();
        assert_eq!(config.stem_output_size(), 24);
        assert_eq!(config.primary_grid_size(), 8);
        assert_eq!(config.input_capsules(), 64);
        assert_eq!(config.flat_capsule_len(), 192);
        assert_eq!(config.reconstruction_len(), 1024);
        assert!(ExperimentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_mismatched_dropout() {
        let config = NetworkConfig {
            head_dropout: vec![0.5],
            ..NetworkConfig::default()
        };
        assert!(matches!(config.validate(), Err(CapsError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let raw = r#"{ "seed": 7, "training": { "num_epochs": 3 } }"#;
        let config: ExperimentConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.early_stopping_patience, 15);
        assert_eq!(config.network.routing_iterations, 3);
    }
}
