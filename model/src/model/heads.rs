use ndarray::{Array2, ArrayView2, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::layers::{
    dropout_mask, relu, relu_backward, sigmoid, BatchNorm, BatchNormCache, Linear, Mode, PRelu,
    Parameterized,
};
use crate::error::CapsResult;

/// Linear → BatchNorm1d → PReLU → Dropout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseBlock {
    pub linear: Linear,
    pub norm: BatchNorm,
    pub activation: PRelu,
    pub dropout: f32,
}

#[derive(Debug, Clone)]
pub struct DenseBlockCache {
    input: Array2<f32>,
    normalized: Array2<f32>,
    norm_cache: Option<BatchNormCache>,
    mask: Option<Array2<f32>>,
}

impl DenseBlock {
    pub fn new<R: Rng>(in_features: usize, out_features: usize, dropout: f32, rng: &mut R) -> Self {
        Self {
            linear: Linear::new(in_features, out_features, rng),
            norm: BatchNorm::new(out_features),
            activation: PRelu::new(),
            dropout,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            linear: self.linear.zeros_like(),
            norm: self.norm.zeros_like(),
            activation: self.activation.zeros_like(),
            dropout: self.dropout,
        }
    }

    pub fn forward<R: Rng>(
        &self,
        input: &ArrayView2<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> CapsResult<(Array2<f32>, DenseBlockCache)> {
        let projected = self.linear.forward(input);
        let (normalized, norm_cache) = self.norm.forward_rows(&projected.view(), mode)?;
        let activated = self.activation.forward(&normalized.view());
        let (output, mask) = match mode {
            Mode::Train if self.dropout > 0.0 => {
                let mask = dropout_mask(activated.dim(), self.dropout, rng);
                (&activated * &mask, Some(mask))
            }
            _ => (activated, None),
        };
        let cache = DenseBlockCache {
            input: input.to_owned(),
            normalized,
            norm_cache,
            mask,
        };
        Ok((output, cache))
    }

    pub fn backward(
        &self,
        cache: &DenseBlockCache,
        grad_output: &ArrayView2<f32>,
        grads: &mut DenseBlock,
    ) -> Array2<f32> {
        let grad = match &cache.mask {
            Some(mask) => grad_output * mask,
            None => grad_output.to_owned(),
        };
        let grad = self
            .activation
            .backward(&cache.normalized.view(), &grad.view(), &mut grads.activation);
        let grad = match &cache.norm_cache {
            Some(norm_cache) => self.norm.backward_rows(norm_cache, &grad.view(), &mut grads.norm),
            None => {
                let scale = self
                    .norm
                    .running_var
                    .mapv(|v| 1.0 / (v + super::layers::BATCH_NORM_EPS).sqrt())
                    * &self.norm.gamma;
                grad * &scale
            }
        };
        self.linear.backward(&cache.input.view(), &grad.view(), &mut grads.linear)
    }
}

impl Parameterized for DenseBlock {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = self.linear.parameters();
        params.extend(self.norm.parameters());
        params.extend(self.activation.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params = self.linear.parameters_mut();
        params.extend(self.norm.parameters_mut());
        params.extend(self.activation.parameters_mut());
        params
    }
}

/// Tête de classification : blocs denses puis logits bruts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierHead {
    pub blocks: Vec<DenseBlock>,
    pub output: Linear,
}

#[derive(Debug, Clone)]
pub struct ClassifierCache {
    blocks: Vec<DenseBlockCache>,
    last_hidden: Array2<f32>,
}

impl ClassifierCache {
    pub fn norm_caches(&self) -> impl Iterator<Item = Option<&BatchNormCache>> {
        self.blocks.iter().map(|block| block.norm_cache.as_ref())
    }
}

impl ClassifierHead {
    pub fn new<R: Rng>(
        in_features: usize,
        hidden: &[usize],
        dropout: &[f32],
        num_classes: usize,
        rng: &mut R,
    ) -> Self {
        let mut blocks = Vec::with_capacity(hidden.len());
        let mut width = in_features;
        for (&units, &rate) in hidden.iter().zip(dropout) {
            blocks.push(DenseBlock::new(width, units, rate, rng));
            width = units;
        }
        Self {
            blocks,
            output: Linear::new(width, num_classes, rng),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            blocks: self.blocks.iter().map(DenseBlock::zeros_like).collect(),
            output: self.output.zeros_like(),
        }
    }

    pub fn forward<R: Rng>(
        &self,
        input: &ArrayView2<f32>,
        mode: Mode,
        rng: &mut R,
    ) -> CapsResult<(Array2<f32>, ClassifierCache)> {
        let mut hidden = input.to_owned();
        let mut caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, cache) = block.forward(&hidden.view(), mode, rng)?;
            caches.push(cache);
            hidden = next;
        }
        let logits = self.output.forward(&hidden.view());
        Ok((
            logits,
            ClassifierCache {
                blocks: caches,
                last_hidden: hidden,
            },
        ))
    }

    pub fn backward(
        &self,
        cache: &ClassifierCache,
        grad_logits: &ArrayView2<f32>,
        grads: &mut ClassifierHead,
    ) -> Array2<f32> {
        let mut grad = self
            .output
            .backward(&cache.last_hidden.view(), grad_logits, &mut grads.output);
        for ((block, block_cache), block_grads) in self
            .blocks
            .iter()
            .zip(&cache.blocks)
            .zip(grads.blocks.iter_mut())
            .rev()
        {
            grad = block.backward(block_cache, &grad.view(), block_grads);
        }
        grad
    }
}

impl Parameterized for ClassifierHead {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params: Vec<_> = self.blocks.iter().flat_map(|b| b.parameters()).collect();
        params.extend(self.output.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params: Vec<_> = self
            .blocks
            .iter_mut()
            .flat_map(|b| b.parameters_mut())
            .collect();
        params.extend(self.output.parameters_mut());
        params
    }
}

/// Décodeur de reconstruction : couches ReLU puis sigmoïde
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decoder {
    pub hidden: Vec<Linear>,
    pub output: Linear,
}

#[derive(Debug, Clone)]
pub struct DecoderCache {
    inputs: Vec<Array2<f32>>,
    pre_activations: Vec<Array2<f32>>,
    last_hidden: Array2<f32>,
    reconstruction: Array2<f32>,
}

impl Decoder {
    pub fn new<R: Rng>(in_features: usize, hidden: &[usize], out_features: usize, rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(hidden.len());
        let mut width = in_features;
        for &units in hidden {
            layers.push(Linear::new(width, units, rng));
            width = units;
        }
        Self {
            hidden: layers,
            output: Linear::new(width, out_features, rng),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            hidden: self.hidden.iter().map(Linear::zeros_like).collect(),
            output: self.output.zeros_like(),
        }
    }

    /// Reconstruction aplatie [B, H·W], valeurs dans ]0, 1[
    pub fn forward(&self, input: &ArrayView2<f32>) -> (Array2<f32>, DecoderCache) {
        let mut activation = input.to_owned();
        let mut inputs = Vec::with_capacity(self.hidden.len());
        let mut pre_activations = Vec::with_capacity(self.hidden.len());
        for layer in &self.hidden {
            let pre = layer.forward(&activation.view());
            inputs.push(activation);
            activation = relu(&pre);
            pre_activations.push(pre);
        }
        let reconstruction = sigmoid(&self.output.forward(&activation.view()));
        let cache = DecoderCache {
            inputs,
            pre_activations,
            last_hidden: activation,
            reconstruction: reconstruction.clone(),
        };
        (reconstruction, cache)
    }

    pub fn backward(
        &self,
        cache: &DecoderCache,
        grad_reconstruction: &ArrayView2<f32>,
        grads: &mut Decoder,
    ) -> Array2<f32> {
        let sigmoid_grad = cache.reconstruction.mapv(|y| y * (1.0 - y));
        let grad_pre = grad_reconstruction * &sigmoid_grad;
        let mut grad = self
            .output
            .backward(&cache.last_hidden.view(), &grad_pre.view(), &mut grads.output);
        for (i, layer) in self.hidden.iter().enumerate().rev() {
            let grad_pre = relu_backward(&cache.pre_activations[i], &grad);
            grad = layer.backward(&cache.inputs[i].view(), &grad_pre.view(), &mut grads.hidden[i]);
        }
        grad
    }
}

impl Parameterized for Decoder {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params: Vec<_> = self.hidden.iter().flat_map(|l| l.parameters()).collect();
        params.extend(self.output.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params: Vec<_> = self
            .hidden
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect();
        params.extend(self.output.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_classifier_shapes() {
        let mut rng = StdRng::seed_from_u64(4);
        let head = ClassifierHead::new(192, &[256, 128], &[0.5, 0.4], 2, &mut rng);
        let input = Array::from_shape_fn((5, 192), |(b, i)| ((b * 192 + i) as f32).cos());
        let (logits, _) = head.forward(&input.view(), Mode::Train, &mut rng).unwrap();
        assert_eq!(logits.dim(), (5, 2));
        assert_eq!(head.parameters().len(), 2 * 5 + 2);
    }

    #[test]
    fn test_decoder_range() {
        let mut rng = StdRng::seed_from_u64(5);
        let decoder = Decoder::new(192, &[512, 1024], 1024, &mut rng);
        let input = Array::from_shape_fn((3, 192), |(b, i)| (b as f32 - i as f32) * 0.01);
        let (reconstruction, _) = decoder.forward(&input.view());
        assert_eq!(reconstruction.dim(), (3, 1024));
        assert!(reconstruction.iter().all(|&v| v > 0.0 && v < 1.0));
    }

    #[test]
    fn test_decoder_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(6);
        let decoder = Decoder::new(4, &[6], 3, &mut rng);
        let input = Array::from_shape_fn((2, 4), |(b, i)| (b * 4 + i) as f32 * 0.1 - 0.3);
        let (reconstruction, cache) = decoder.forward(&input.view());
        let ones = Array2::ones(reconstruction.raw_dim());
        let mut grads = decoder.zeros_like();
        decoder.backward(&cache, &ones.view(), &mut grads);

        let h = 1e-3;
        let mut plus = decoder.clone();
        plus.hidden[0].weight[[2, 1]] += h;
        let mut minus = decoder.clone();
        minus.hidden[0].weight[[2, 1]] -= h;
        let numeric = (plus.forward(&input.view()).0.sum() - minus.forward(&input.view()).0.sum()) / (2.0 * h);
        assert_abs_diff_eq!(grads.hidden[0].weight[[2, 1]], numeric, epsilon = 1e-3);
    }
}
