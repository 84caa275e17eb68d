use ndarray::{Array4, ArrayView4, ArrayViewD, ArrayViewMutD, ErrorKind, ShapeError};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::layers::{
    channel_dropout_mask, BatchNorm, BatchNormCache, Conv2d, Mode, PRelu, Parameterized,
};
use crate::error::CapsResult;

/// Convolution → BatchNorm2d → PReLU → Dropout2d
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvBlock {
    pub conv: Conv2d,
    pub norm: BatchNorm,
    pub activation: PRelu,
    pub dropout: f32,
}

#[derive(Debug, Clone)]
pub struct ConvBlockCache {
    input: Array4<f32>,
    normalized: Array4<f32>,
    norm_cache: Option<BatchNormCache>,
    mask: Option<Array4<f32>>,
    /// Grille de sortie (hauteur, largeur)
    grid: (usize, usize),
}

impl ConvBlockCache {
    pub fn norm_cache(&self) -> Option<&BatchNormCache> {
        self.norm_cache.as_ref()
    }

    pub fn grid(&self) -> (usize, usize) {
        self.grid
    }
}

impl ConvBlock {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            conv: Conv2d::new(in_channels, out_channels, kernel_size, stride, rng),
            norm: BatchNorm::new(out_channels),
            activation: PRelu::new(),
            dropout,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            conv: self.conv.zeros_like(),
            norm: self.norm.zeros_like(),
            activation: self.activation.zeros_like(),
            dropout: self.dropout,
        }
    }

    pub fn forward<R: Rng>(
        &self,
        input: &ArrayView4<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> CapsResult<(Array4<f32>, ConvBlockCache)> {
        let convolved = self.conv.forward(input)?;
        let (normalized, norm_cache) = self.norm.forward_4d(&convolved.view(), mode)?;
        let activated = self.activation.forward(&normalized.view());

        let (output, mask) = match mode {
            Mode::Train if self.dropout > 0.0 => {
                let (batch_size, channels, _, _) = activated.dim();
                let mask = channel_dropout_mask(batch_size, channels, self.dropout, rng);
                (&activated * &mask, Some(mask))
            }
            _ => (activated, None),
        };

        let (_, _, height, width) = output.dim();
        let cache = ConvBlockCache {
            input: input.to_owned(),
            normalized,
            norm_cache,
            mask,
            grid: (height, width),
        };
        Ok((output, cache))
    }

    pub fn backward(
        &self,
        cache: &ConvBlockCache,
        grad_output: &ArrayView4<f32>,
        grads: &mut ConvBlock,
    ) -> CapsResult<Array4<f32>> {
        let grad = match &cache.mask {
            Some(mask) => grad_output * mask,
            None => grad_output.to_owned(),
        };
        let grad = self
            .activation
            .backward(&cache.normalized.view(), &grad.view(), &mut grads.activation);
        let grad = match &cache.norm_cache {
            Some(norm_cache) => self.norm.backward_4d(norm_cache, &grad.view(), &mut grads.norm)?,
            // Mode évaluation : normalisation affine figée
            None => {
                let scale = self
                    .norm
                    .running_var
                    .mapv(|v| 1.0 / (v + super::layers::BATCH_NORM_EPS).sqrt())
                    * &self.norm.gamma;
                let scale = scale.into_shape_with_order((1, self.norm.gamma.len(), 1, 1))?;
                grad * &scale
            }
        };
        self.conv.backward(&cache.input.view(), &grad.view(), &mut grads.conv)
    }
}

impl Parameterized for ConvBlock {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = self.conv.parameters();
        params.extend(self.norm.parameters());
        params.extend(self.activation.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params = self.conv.parameters_mut();
        params.extend(self.norm.parameters_mut());
        params.extend(self.activation.parameters_mut());
        params
    }
}

/// Capsules primaires : un bloc convolutif dont les canaux sont regroupés
/// en `num_capsules` vecteurs de `capsule_dim` composantes par position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryCapsules {
    pub block: ConvBlock,
    pub num_capsules: usize,
    pub capsule_dim: usize,
}

impl PrimaryCapsules {
    pub fn new<R: Rng>(
        in_channels: usize,
        num_capsules: usize,
        capsule_dim: usize,
        kernel_size: usize,
        stride: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            block: ConvBlock::new(
                in_channels,
                num_capsules * capsule_dim,
                kernel_size,
                stride,
                dropout,
                rng,
            ),
            num_capsules,
            capsule_dim,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            block: self.block.zeros_like(),
            num_capsules: self.num_capsules,
            capsule_dim: self.capsule_dim,
        }
    }

    /// Renvoie les prédictions brutes [B, positions, capsules, dim]
    pub fn forward<R: Rng>(
        &self,
        input: &ArrayView4<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> CapsResult<(Array4<f32>, ConvBlockCache)> {
        let (features, cache) = self.block.forward(input, mode, rng)?;
        Ok((self.to_capsules(features)?, cache))
    }

    pub fn backward(
        &self,
        cache: &ConvBlockCache,
        grad_capsules: &ArrayView4<f32>,
        grads: &mut PrimaryCapsules,
    ) -> CapsResult<Array4<f32>> {
        let grad_features = self.from_capsules(grad_capsules, cache.grid())?;
        self.block.backward(cache, &grad_features.view(), &mut grads.block)
    }

    /// Canal c = capsule · dim + composante
    fn to_capsules(&self, features: Array4<f32>) -> CapsResult<Array4<f32>> {
        let (batch_size, _, height, width) = features.dim();
        let grouped = features.into_shape_with_order((
            batch_size,
            self.num_capsules,
            self.capsule_dim,
            height * width,
        ))?;
        Ok(grouped
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned())
    }

    fn from_capsules(
        &self,
        capsules: &ArrayView4<f32>,
        (height, width): (usize, usize),
    ) -> CapsResult<Array4<f32>> {
        let (batch_size, positions, _, _) = capsules.dim();
        if positions != height * width {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
        }
        let grouped = capsules
            .view()
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned();
        Ok(grouped.into_shape_with_order((
            batch_size,
            self.num_capsules * self.capsule_dim,
            height,
            width,
        ))?)
    }
}

impl Parameterized for PrimaryCapsules {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        self.block.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.block.parameters_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapsError;
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_primary_capsule_layout() {
        let mut rng = StdRng::seed_from_u64(0);
        let primary = PrimaryCapsules::new(4, 3, 2, 3, 2, 0.0, &mut rng);
        let input = Array::from_shape_fn((2, 4, 9, 9), |(b, c, h, w)| {
            (b + c) as f32 * 0.1 + (h * w) as f32 * 0.01
        });
        let (capsules, cache) = primary.forward(&input.view(), Mode::Eval, &mut rng).unwrap();
        // 9 -> (9 - 3) / 2 + 1 = 4, soit 16 positions
        assert_eq!(capsules.dim(), (2, 16, 3, 2));
        assert_eq!(cache.grid(), (4, 4));

        let back = primary.from_capsules(&capsules.view(), cache.grid()).unwrap();
        assert_eq!(back.dim(), (2, 6, 4, 4));
        let again = primary.to_capsules(back).unwrap();
        assert_eq!(again, capsules);
    }

    #[test]
    fn test_rectangular_grid_round_trip() {
        let mut rng = StdRng::seed_from_u64(1);
        let primary = PrimaryCapsules::new(2, 2, 3, 3, 1, 0.0, &mut rng);
        let input = Array::from_shape_fn((1, 2, 5, 8), |(_, c, h, w)| (c + h * 8 + w) as f32 * 0.05);
        let (capsules, cache) = primary.forward(&input.view(), Mode::Eval, &mut rng).unwrap();
        // 5 × 8 -> 3 × 6 : 18 positions, carte non carrée
        assert_eq!(cache.grid(), (3, 6));
        assert_eq!(capsules.dim(), (1, 18, 2, 3));

        let back = primary.from_capsules(&capsules.view(), cache.grid()).unwrap();
        assert_eq!(back.dim(), (1, 6, 3, 6));
        assert_eq!(primary.to_capsules(back).unwrap(), capsules);

        let grads = primary
            .backward(&cache, &capsules.view(), &mut primary.zeros_like())
            .unwrap();
        assert_eq!(grads.dim(), input.dim());

        assert!(matches!(
            primary.from_capsules(&capsules.view(), (4, 4)),
            Err(CapsError::Shape(_))
        ));
    }

    #[test]
    fn test_channel_grouping() {
        let mut rng = StdRng::seed_from_u64(0);
        let primary = PrimaryCapsules::new(1, 2, 3, 1, 1, 0.0, &mut rng);
        let features = Array::from_shape_fn((1, 6, 2, 2), |(_, c, h, w)| (c * 100 + h * 2 + w) as f32);
        let capsules = primary.to_capsules(features).unwrap();
        // position (1, 0) -> 2 ; capsule 1, composante 2 -> canal 5
        assert_eq!(capsules[[0, 2, 1, 2]], 502.0);
    }

    #[test]
    fn test_dropout_only_in_train_mode() {
        let mut rng = StdRng::seed_from_u64(9);
        let block = ConvBlock::new(1, 8, 3, 1, 0.5, &mut rng);
        let input = Array::from_shape_fn((4, 1, 6, 6), |(b, _, h, w)| (b + h + w) as f32);
        let (_, eval_cache) = block.forward(&input.view(), Mode::Eval, &mut rng).unwrap();
        assert!(eval_cache.mask.is_none());
        let (_, train_cache) = block.forward(&input.view(), Mode::Train, &mut rng).unwrap();
        let mask = train_cache.mask.unwrap();
        assert!(mask.iter().all(|&m| m == 0.0 || m == 2.0));
    }
}
