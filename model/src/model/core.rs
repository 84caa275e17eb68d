use super::{
    capsule::{ConvBlock, ConvBlockCache, PrimaryCapsules},
    config::NetworkConfig,
    heads::{ClassifierCache, ClassifierHead, Decoder, DecoderCache},
    layers::{Mode, Parameterized},
    routing::{DynamicRouting, RoutingTrace},
};
use crate::error::{CapsError, CapsResult};
use log::info;
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView4, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Nom fixe de l'artefact des meilleurs poids
pub const CHECKPOINT_FILE: &str = "best_capsule_model.json";

/// Paramètres du CapsNet. Le réseau lui-même est sans état : `forward`
/// et `backward` prennent `&self` et renvoient caches et gradients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsNet {
    pub config: NetworkConfig,
    pub stem: ConvBlock,
    pub primary: PrimaryCapsules,
    pub classifier: ClassifierHead,
    pub decoder: Decoder,
}

/// Résultat d'une passe avant et intermédiaires pour la rétropropagation
#[derive(Debug)]
pub struct ForwardPass {
    /// Logits bruts [B, classes]
    pub logits: Array2<f32>,
    /// Reconstruction [B, 1, H, W]
    pub reconstruction: Array4<f32>,
    /// Capsules de sortie [B, capsules, dim]
    pub capsules: Array3<f32>,
    stem: ConvBlockCache,
    primary: ConvBlockCache,
    predictions: Array4<f32>,
    traces: Vec<RoutingTrace>,
    classifier: ClassifierCache,
    decoder: DecoderCache,
}

/// Une ligne de l'historique d'entraînement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub train_accuracy: f32,
    pub val_accuracy: f32,
    pub learning_rate: f32,
}

/// Historique ordonné, en ajout seul
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    records: Vec<EpochRecord>,
}

impl CapsNet {
    pub fn new<R: Rng>(config: NetworkConfig, rng: &mut R) -> Self {
        let caps = &config.capsule_config;
        let stem = ConvBlock::new(
            config.in_channels,
            config.stem_channels,
            config.kernel_size,
            1,
            config.conv_dropout,
            rng,
        );
        let primary = PrimaryCapsules::new(
            config.stem_channels,
            caps.num_capsules,
            caps.capsule_dim,
            config.kernel_size,
            config.primary_stride,
            config.conv_dropout,
            rng,
        );
        let classifier = ClassifierHead::new(
            config.flat_capsule_len(),
            &config.head_hidden,
            &config.head_dropout,
            config.num_classes,
            rng,
        );
        let decoder = Decoder::new(
            config.flat_capsule_len(),
            &config.decoder_hidden,
            config.reconstruction_len(),
            rng,
        );
        Self {
            config,
            stem,
            primary,
            classifier,
            decoder,
        }
    }

    /// Gradients : même structure, tout à zéro
    pub fn zeros_like(&self) -> Self {
        Self {
            config: self.config.clone(),
            stem: self.stem.zeros_like(),
            primary: self.primary.zeros_like(),
            classifier: self.classifier.zeros_like(),
            decoder: self.decoder.zeros_like(),
        }
    }

    fn routing(&self) -> DynamicRouting {
        DynamicRouting::new(self.config.routing_iterations)
    }

    /// Passe avant : stem → capsules primaires → routage → tête + décodeur
    pub fn forward<R: Rng>(
        &self,
        input: &ArrayView4<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> CapsResult<ForwardPass> {
        let (batch_size, channels, height, width) = input.dim();
        if channels != self.config.in_channels
            || height != self.config.input_size
            || width != self.config.input_size
        {
            return Err(CapsError::Numerical(format!(
                "entrée {:?} incompatible avec le réseau ({} × {}²)",
                input.dim(),
                self.config.in_channels,
                self.config.input_size
            )));
        }

        let (features, stem) = self.stem.forward(input, mode, rng)?;
        let (predictions, primary) = self.primary.forward(&features.view(), mode, rng)?;
        let (capsules, traces) = self.routing().route(&predictions.view());

        let flat = capsules
            .clone()
            .into_shape_with_order((batch_size, self.config.flat_capsule_len()))?;
        let (logits, classifier) = self.classifier.forward(&flat.view(), mode, rng)?;
        let (reconstruction, decoder) = self.decoder.forward(&flat.view());
        let reconstruction =
            reconstruction.into_shape_with_order((batch_size, channels, height, width))?;

        Ok(ForwardPass {
            logits,
            reconstruction,
            capsules,
            stem,
            primary,
            predictions,
            traces,
            classifier,
            decoder,
        })
    }

    /// Rétropropagation complète, renvoie les gradients des paramètres
    pub fn backward(
        &self,
        pass: &ForwardPass,
        grad_logits: &ArrayView2<f32>,
        grad_reconstruction: &ArrayView4<f32>,
    ) -> CapsResult<CapsNet> {
        let mut grads = self.zeros_like();
        let batch_size = grad_logits.nrows();

        let grad_recon_flat = grad_reconstruction
            .to_owned()
            .into_shape_with_order((batch_size, self.config.reconstruction_len()))?;
        let mut grad_flat =
            self.classifier
                .backward(&pass.classifier, grad_logits, &mut grads.classifier);
        grad_flat += &self
            .decoder
            .backward(&pass.decoder, &grad_recon_flat.view(), &mut grads.decoder);

        let caps = &self.config.capsule_config;
        let grad_capsules =
            grad_flat.into_shape_with_order((batch_size, caps.num_capsules, caps.capsule_dim))?;
        let grad_predictions =
            self.routing()
                .backward(&pass.predictions.view(), &pass.traces, &grad_capsules.view());
        let grad_features =
            self.primary
                .backward(&pass.primary, &grad_predictions.view(), &mut grads.primary)?;
        self.stem
            .backward(&pass.stem, &grad_features.view(), &mut grads.stem)?;

        Ok(grads)
    }

    /// Met à jour les statistiques glissantes des normalisations
    pub fn update_running_stats(&mut self, pass: &ForwardPass, momentum: f32) {
        if let Some(cache) = pass.stem.norm_cache() {
            self.stem.norm.update_running(cache, momentum);
        }
        if let Some(cache) = pass.primary.norm_cache() {
            self.primary.block.norm.update_running(cache, momentum);
        }
        for (block, cache) in self
            .classifier
            .blocks
            .iter_mut()
            .zip(pass.classifier.norm_caches())
        {
            if let Some(cache) = cache {
                block.norm.update_running(cache, momentum);
            }
        }
    }

    /// Probabilités par classe (softmax des logits), mode évaluation
    pub fn predict_proba(&self, input: &ArrayView4<f32>) -> CapsResult<Array2<f32>> {
        // Aucune source d'aléa n'est consommée en évaluation
        let mut rng = StdRng::seed_from_u64(0);
        let pass = self.forward(input, Mode::Eval, &mut rng)?;
        Ok(softmax_rows(&pass.logits.view()))
    }

    pub fn predict(&self, input: &ArrayView4<f32>) -> CapsResult<Vec<usize>> {
        let probabilities = self.predict_proba(input)?;
        Ok(argmax_rows(&probabilities.view()))
    }

    pub fn save(&self, path: &Path) -> CapsResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> CapsResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let model: Self = serde_json::from_reader(reader)?;
        model.config.validate()?;
        Ok(model)
    }

    /// Diagnostic rapide : nombre de paramètres et formes de sortie
    pub fn diagnostic(&self) -> CapsResult<()> {
        info!("🔍 DIAGNOSTIC RAPIDE");
        info!("   Paramètres: {}", self.parameter_count());
        info!(
            "   Capsules: {} entrées → {} sorties × {}",
            self.config.input_capsules(),
            self.config.capsule_config.num_capsules,
            self.config.capsule_config.capsule_dim
        );
        let size = self.config.input_size;
        let probe = Array4::zeros((2, self.config.in_channels, size, size));
        let mut rng = StdRng::seed_from_u64(0);
        let pass = self.forward(&probe.view(), Mode::Eval, &mut rng)?;
        info!("   Logits: {:?}", pass.logits.dim());
        info!("   Reconstruction: {:?}", pass.reconstruction.dim());
        info!("✅ Modèle opérationnel");
        Ok(())
    }
}

impl Parameterized for CapsNet {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = self.stem.parameters();
        params.extend(self.primary.parameters());
        params.extend(self.classifier.parameters());
        params.extend(self.decoder.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params = self.stem.parameters_mut();
        params.extend(self.primary.parameters_mut());
        params.extend(self.classifier.parameters_mut());
        params.extend(self.decoder.parameters_mut());
        params
    }
}

pub fn softmax_rows(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = logits.to_owned();
    for mut row in result.axis_iter_mut(Axis(0)) {
        let max_val = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    result
}

pub fn argmax_rows(scores: &ArrayView2<f32>) -> Vec<usize> {
    scores
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_val), (i, &v)| {
                    if v > best_val {
                        (i, v)
                    } else {
                        (best, best_val)
                    }
                })
                .0
        })
        .collect()
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn train_loss(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.train_loss).collect()
    }

    pub fn val_loss(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.val_loss).collect()
    }

    pub fn train_accuracy(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.train_accuracy).collect()
    }

    pub fn val_accuracy(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.val_accuracy).collect()
    }

    pub fn learning_rate(&self) -> Vec<f32> {
        self.records.iter().map(|r| r.learning_rate).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::config::CapsuleConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    /// Réseau réduit : 12×12, noyau 5, 4 capsules de 4
    pub(crate) fn tiny_config() -> NetworkConfig {
        NetworkConfig {
            input_size: 12,
            in_channels: 1,
            stem_channels: 8,
            kernel_size: 5,
            primary_stride: 2,
            capsule_config: CapsuleConfig {
                num_capsules: 4,
                capsule_dim: 4,
            },
            routing_iterations: 3,
            conv_dropout: 0.3,
            head_hidden: vec![16, 8],
            head_dropout: vec![0.5, 0.4],
            num_classes: 2,
            decoder_hidden: vec![16, 32],
        }
    }

    fn tiny_input(batch: usize) -> Array4<f32> {
        Array::from_shape_fn((batch, 1, 12, 12), |(b, _, h, w)| {
            ((b * 7 + h * 3 + w) as f32 * 0.37).sin()
        })
    }

    #[test]
    fn test_forward_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = CapsNet::new(tiny_config(), &mut rng);
        let input = tiny_input(3);
        let pass = model.forward(&input.view(), Mode::Train, &mut rng).unwrap();
        assert_eq!(pass.logits.dim(), (3, 2));
        assert_eq!(pass.reconstruction.dim(), (3, 1, 12, 12));
        assert_eq!(pass.capsules.dim(), (3, 4, 4));
        for sample in pass.capsules.outer_iter() {
            for capsule in sample.outer_iter() {
                assert!(capsule.dot(&capsule).sqrt() < 1.0);
            }
        }
    }

    #[test]
    fn test_default_network_shapes() {
        let mut rng = StdRng::seed_from_u64(2);
        let model = CapsNet::new(NetworkConfig::default(), &mut rng);
        let input = Array4::from_elem((1, 1, 32, 32), 0.1);
        let pass = model.forward(&input.view(), Mode::Eval, &mut rng).unwrap();
        assert_eq!(pass.logits.dim(), (1, 2));
        assert_eq!(pass.reconstruction.dim(), (1, 1, 32, 32));
        assert_eq!(pass.capsules.dim(), (1, 12, 16));
    }

    #[test]
    fn test_rejects_wrong_input_size() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = CapsNet::new(tiny_config(), &mut rng);
        let input = Array4::zeros((1, 1, 10, 10));
        assert!(model.forward(&input.view(), Mode::Eval, &mut rng).is_err());
    }

    #[test]
    fn test_eval_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(4);
        let model = CapsNet::new(tiny_config(), &mut rng);
        let input = tiny_input(2);
        let a = model.predict_proba(&input.view()).unwrap();
        let b = model.predict_proba(&input.view()).unwrap();
        assert_eq!(a, b);
        for row in a.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let model = CapsNet::new(tiny_config(), &mut rng);
        let input = tiny_input(2);
        let logit_weights = array![[1.0, -0.5], [0.25, 0.75]];

        // Objectif linéaire des logits ; mode évaluation pour un gradient déterministe
        let objective = |m: &CapsNet| -> f32 {
            let mut rng = StdRng::seed_from_u64(0);
            let pass = m.forward(&input.view(), Mode::Eval, &mut rng).unwrap();
            (&pass.logits * &logit_weights).sum()
        };

        let pass = model.forward(&input.view(), Mode::Eval, &mut rng).unwrap();
        let zero_recon = Array4::zeros(pass.reconstruction.raw_dim());
        let grads = model
            .backward(&pass, &logit_weights.view(), &zero_recon.view())
            .unwrap();

        let h = 5e-3;
        let mut plus = model.clone();
        plus.classifier.output.weight[[1, 3]] += h;
        let mut minus = model.clone();
        minus.classifier.output.weight[[1, 3]] -= h;
        let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
        assert_abs_diff_eq!(grads.classifier.output.weight[[1, 3]], numeric, epsilon = 1e-2);

        let mut plus = model.clone();
        plus.stem.conv.bias[2] += h;
        let mut minus = model.clone();
        minus.stem.conv.bias[2] -= h;
        let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
        assert_abs_diff_eq!(grads.stem.conv.bias[2], numeric, epsilon = 2e-2);
    }

    #[test]
    fn test_running_stats_move_after_train_pass() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut model = CapsNet::new(tiny_config(), &mut rng);
        let before = model.stem.norm.running_mean.clone();
        let input = tiny_input(4);
        let pass = model.forward(&input.view(), Mode::Train, &mut rng).unwrap();
        model.update_running_stats(&pass, 0.1);
        assert_ne!(before, model.stem.norm.running_mean);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let model = CapsNet::new(tiny_config(), &mut rng);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        model.save(&path).unwrap();
        let restored = CapsNet::load(&path).unwrap();
        let input = tiny_input(2);
        let expected = model.predict_proba(&input.view()).unwrap();
        let actual = restored.predict_proba(&input.view()).unwrap();
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_predict_matches_probabilities() {
        let mut rng = StdRng::seed_from_u64(8);
        let model = CapsNet::new(tiny_config(), &mut rng);
        let input = tiny_input(3);
        let probabilities = model.predict_proba(&input.view()).unwrap();
        let predictions = model.predict(&input.view()).unwrap();
        assert_eq!(predictions, argmax_rows(&probabilities.view()));
        assert!(predictions.iter().all(|&p| p < 2));
    }

    #[test]
    fn test_argmax_rows() {
        let scores = array![[0.2, 0.8], [0.9, 0.1], [0.5, 0.5]];
        assert_eq!(argmax_rows(&scores.view()), vec![1, 0, 0]);
    }
}
