use ndarray::{Array1, Array2, Array4, ArrayView2, ArrayView4};

use super::config::LossConfig;
use crate::error::{CapsError, CapsResult};

/// Margin Loss pour CapsNet (Sabour et al., 2017)
///
/// Les prédictions sont bornées à [0, 1] avant le calcul des marges, même si
/// le réseau fournit des logits bruts.
#[derive(Debug, Clone)]
pub struct MarginLoss {
    pub positive_margin: f32, // m+ = 0.9
    pub negative_margin: f32, // m- = 0.1
    pub down_weighting: f32,  // λ = 0.5
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }

    /// Terme de marge pour une prédiction bornée et sa dérivée
    fn term(&self, prediction: f32, present: bool) -> (f32, f32) {
        if present {
            // L_k = T_k * max(0, m+ - p)^2
            let gap = (self.positive_margin - prediction).max(0.0);
            (gap * gap, -2.0 * gap)
        } else {
            // L_k = λ * (1 - T_k) * max(0, p - m-)^2
            let gap = (prediction - self.negative_margin).max(0.0);
            (
                self.down_weighting * gap * gap,
                2.0 * self.down_weighting * gap,
            )
        }
    }

    fn check(
        predictions: &ArrayView2<f32>,
        labels: &[usize],
        class_weights: Option<&[f32]>,
    ) -> CapsResult<()> {
        let (batch_size, num_classes) = predictions.dim();
        if batch_size != labels.len() || batch_size == 0 {
            return Err(CapsError::Numerical(format!(
                "{} prédictions pour {} étiquettes",
                batch_size,
                labels.len()
            )));
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(CapsError::Numerical(format!("étiquette {label} hors limites")));
        }
        if let Some(weights) = class_weights {
            if weights.len() != num_classes {
                return Err(CapsError::Numerical(format!(
                    "{} poids pour {} classes",
                    weights.len(),
                    num_classes
                )));
            }
        }
        Ok(())
    }

    /// Perte moyenne sur les classes, par échantillon
    pub fn per_sample(&self, predictions: &ArrayView2<f32>, labels: &[usize]) -> Array1<f32> {
        let num_classes = predictions.ncols();
        let mut losses = Array1::zeros(labels.len());
        for (b, row) in predictions.outer_iter().enumerate() {
            let total: f32 = row
                .iter()
                .enumerate()
                .map(|(c, &x)| self.term(x.clamp(0.0, 1.0), c == labels[b]).0)
                .sum();
            losses[b] = total / num_classes as f32;
        }
        losses
    }

    /// Facteur appliqué à la perte de chaque échantillon avant la moyenne
    fn sample_scale(labels: &[usize], class_weights: Option<&[f32]>) -> Vec<f32> {
        labels
            .iter()
            .map(|&label| class_weights.map_or(1.0, |w| w[label]))
            .collect()
    }

    pub fn compute(
        &self,
        predictions: &ArrayView2<f32>,
        labels: &[usize],
        class_weights: Option<&[f32]>,
    ) -> CapsResult<f32> {
        Self::check(predictions, labels, class_weights)?;
        let per_sample = self.per_sample(predictions, labels);
        let scales = Self::sample_scale(labels, class_weights);
        let total: f32 = per_sample.iter().zip(&scales).map(|(l, s)| l * s).sum();
        Ok(total / labels.len() as f32)
    }

    pub fn gradient(
        &self,
        predictions: &ArrayView2<f32>,
        labels: &[usize],
        class_weights: Option<&[f32]>,
    ) -> CapsResult<Array2<f32>> {
        Self::check(predictions, labels, class_weights)?;
        let (batch_size, num_classes) = predictions.dim();
        let scales = Self::sample_scale(labels, class_weights);
        let norm = (batch_size * num_classes) as f32;

        let mut grad = Array2::zeros(predictions.raw_dim());
        for ((b, c), &x) in predictions.indexed_iter() {
            // Gradient nul hors de l'intervalle de bornage
            if !(0.0..=1.0).contains(&x) {
                continue;
            }
            let (_, derivative) = self.term(x, c == labels[b]);
            grad[[b, c]] = derivative * scales[b] / norm;
        }
        Ok(grad)
    }
}

/// Perte de reconstruction (MSE pondérée)
#[derive(Debug, Clone)]
pub struct ReconstructionLoss {
    pub weight: f32, // Facteur de pondération (α)
}

impl ReconstructionLoss {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }

    pub fn compute(&self, reconstruction: &ArrayView4<f32>, originals: &ArrayView4<f32>) -> f32 {
        let diff = reconstruction - originals;
        let mse = diff.mapv(|x| x * x).mean().unwrap_or(0.0);
        self.weight * mse
    }

    pub fn gradient(
        &self,
        reconstruction: &ArrayView4<f32>,
        originals: &ArrayView4<f32>,
    ) -> Array4<f32> {
        let diff = reconstruction - originals;
        let n = diff.len().max(1) as f32;
        diff * (2.0 * self.weight / n)
    }
}

/// Décomposition de la perte d'un batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub margin: f32,
    pub reconstruction: f32,
    pub total: f32,
}

/// Perte combinée: Margin Loss + Reconstruction Loss
#[derive(Debug, Clone)]
pub struct CombinedLoss {
    margin_loss: MarginLoss,
    reconstruction_loss: ReconstructionLoss,
}

impl CombinedLoss {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            margin_loss: MarginLoss::new(
                config.positive_margin,
                config.negative_margin,
                config.down_weighting,
            ),
            reconstruction_loss: ReconstructionLoss::new(config.reconstruction_weight),
        }
    }

    pub fn margin(&self) -> &MarginLoss {
        &self.margin_loss
    }

    pub fn compute_total(
        &self,
        logits: &ArrayView2<f32>,
        labels: &[usize],
        class_weights: Option<&[f32]>,
        reconstruction: &ArrayView4<f32>,
        originals: &ArrayView4<f32>,
    ) -> CapsResult<LossBreakdown> {
        let margin = self.margin_loss.compute(logits, labels, class_weights)?;
        let reconstruction = self.reconstruction_loss.compute(reconstruction, originals);
        let total = margin + reconstruction;
        if !total.is_finite() {
            return Err(CapsError::Numerical(format!("perte non finie: {total}")));
        }
        Ok(LossBreakdown {
            margin,
            reconstruction,
            total,
        })
    }

    /// Gradients par rapport aux logits et à la reconstruction
    pub fn gradients(
        &self,
        logits: &ArrayView2<f32>,
        labels: &[usize],
        class_weights: Option<&[f32]>,
        reconstruction: &ArrayView4<f32>,
        originals: &ArrayView4<f32>,
    ) -> CapsResult<(Array2<f32>, Array4<f32>)> {
        let grad_logits = self.margin_loss.gradient(logits, labels, class_weights)?;
        let grad_reconstruction = self.reconstruction_loss.gradient(reconstruction, originals);
        Ok((grad_logits, grad_reconstruction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn loss_fn() -> MarginLoss {
        MarginLoss::new(0.9, 0.1, 0.5)
    }

    #[test]
    fn test_margin_loss_values() {
        let predictions = array![[0.5, 0.5], [0.5, 0.5]];
        let loss = loss_fn().compute(&predictions.view(), &[0, 1], None).unwrap();
        // (0.4² + 0.5 · 0.4²) / 2
        assert_abs_diff_eq!(loss, 0.12, epsilon = 1e-6);
    }

    #[test]
    fn test_perfect_predictions_have_zero_loss() {
        let predictions = array![[0.95, 0.05], [0.0, 1.0]];
        let loss = loss_fn().compute(&predictions.view(), &[0, 1], None).unwrap();
        assert_abs_diff_eq!(loss, 0.0);
    }

    #[test]
    fn test_predictions_are_clamped() {
        let raw = array![[7.0, -3.0]];
        let clamped = array![[1.0, 0.0]];
        let a = loss_fn().compute(&raw.view(), &[1], None).unwrap();
        let b = loss_fn().compute(&clamped.view(), &[1], None).unwrap();
        assert_abs_diff_eq!(a, b);
        // 0.9² + 0.5 · 0.9², moyenne sur 2 classes
        assert_abs_diff_eq!(a, 0.6075, epsilon = 1e-6);

        let grad = loss_fn().gradient(&raw.view(), &[1], None).unwrap();
        assert_eq!(grad, array![[0.0, 0.0]]);
    }

    #[test]
    fn test_unit_weights_match_uniform_loss() {
        let predictions = array![[0.3, 0.8], [0.6, 0.2], [0.1, 0.4], [0.7, 0.95]];
        let labels = [0, 1, 0, 1];
        let uniform = loss_fn().compute(&predictions.view(), &labels, None).unwrap();
        let ones = loss_fn()
            .compute(&predictions.view(), &labels, Some(&[1.0, 1.0]))
            .unwrap();
        assert_abs_diff_eq!(uniform, ones, epsilon = 1e-7);

        let g_uniform = loss_fn().gradient(&predictions.view(), &labels, None).unwrap();
        let g_ones = loss_fn()
            .gradient(&predictions.view(), &labels, Some(&[1.0, 1.0]))
            .unwrap();
        assert_eq!(g_uniform, g_ones);
    }

    #[test]
    fn test_class_weights_scale_per_sample() {
        let predictions = array![[0.5, 0.5], [0.5, 0.5]];
        let weighted = loss_fn()
            .compute(&predictions.view(), &[0, 1], Some(&[2.0, 0.0]))
            .unwrap();
        let per_sample = loss_fn().per_sample(&predictions.view(), &[0, 1]);
        assert_abs_diff_eq!(weighted, per_sample[0] * 2.0 / 2.0, epsilon = 1e-7);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let predictions = array![[0.3, 0.8], [0.6, 0.2]];
        let labels = [0, 1];
        let weights = [1.5, 0.5];
        let grad = loss_fn()
            .gradient(&predictions.view(), &labels, Some(&weights))
            .unwrap();
        let h = 1e-3;
        for (b, c) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let mut plus = predictions.clone();
            plus[[b, c]] += h;
            let mut minus = predictions.clone();
            minus[[b, c]] -= h;
            let numeric = (loss_fn().compute(&plus.view(), &labels, Some(&weights)).unwrap()
                - loss_fn().compute(&minus.view(), &labels, Some(&weights)).unwrap())
                / (2.0 * h);
            assert_abs_diff_eq!(grad[[b, c]], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_rejects_label_mismatch() {
        let predictions = array![[0.5, 0.5]];
        assert!(loss_fn().compute(&predictions.view(), &[0, 1], None).is_err());
        assert!(loss_fn().compute(&predictions.view(), &[2], None).is_err());
    }

    #[test]
    fn test_reconstruction_loss() {
        let recon = Array4::from_elem((1, 1, 2, 2), 0.5);
        let original = Array4::zeros((1, 1, 2, 2));
        let loss = ReconstructionLoss::new(0.0005);
        assert_abs_diff_eq!(loss.compute(&recon.view(), &original.view()), 0.000125, epsilon = 1e-9);
        let grad = loss.gradient(&recon.view(), &original.view());
        assert_abs_diff_eq!(grad[[0, 0, 0, 0]], 2.0 * 0.0005 * 0.5 / 4.0, epsilon = 1e-9);
    }
}
