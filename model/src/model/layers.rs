use ndarray::{
    Array, Array1, Array2, Array3, Array4, ArrayView, ArrayView1, ArrayView2, ArrayView3,
    ArrayView4, ArrayViewD, ArrayViewMutD, Axis, Dimension, Zip,
};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CapsError, CapsResult};

/// Epsilon du squash (évite la division par zéro pour un vecteur nul)
pub const SQUASH_EPS: f32 = 1e-8;
pub const BATCH_NORM_EPS: f32 = 1e-5;
/// Pente initiale des PReLU
pub const PRELU_INIT: f32 = 0.25;

/// Mode d'exécution du réseau
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Initialisation Kaiming normale (fan_out, gain ReLU)
fn kaiming_normal<D: Dimension, R: Rng>(
    shape: D,
    fan_out: usize,
    rng: &mut R,
) -> Array<f32, D> {
    let std = (2.0 / fan_out.max(1) as f32).sqrt();
    Array::from_shape_simple_fn(shape, || {
        let z: f32 = rng.sample(StandardNormal);
        z * std
    })
}

/// Tenseurs entraînables, énumérés dans un ordre stable
pub trait Parameterized {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>>;
    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>>;

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

/// Convolution 2D sans padding, calculée par im2col + produit matriciel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    /// [sorties, entrées, k, k]
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub stride: usize,
}

impl Conv2d {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        rng: &mut R,
    ) -> Self {
        let fan_out = out_channels * kernel_size * kernel_size;
        Self {
            weight: kaiming_normal(
                ndarray::Ix4(out_channels, in_channels, kernel_size, kernel_size),
                fan_out,
                rng,
            ),
            bias: Array1::zeros(out_channels),
            stride,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            weight: Array4::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
            stride: self.stride,
        }
    }

    fn kernel_size(&self) -> usize {
        self.weight.dim().2
    }

    pub fn output_size(&self, input_size: usize) -> usize {
        (input_size - self.kernel_size()) / self.stride + 1
    }

    fn weight_matrix(&self) -> CapsResult<ArrayView2<'_, f32>> {
        let (out_c, in_c, k, _) = self.weight.dim();
        Ok(self.weight.view().into_shape_with_order((out_c, in_c * k * k))?)
    }

    pub fn forward(&self, input: &ArrayView4<f32>) -> CapsResult<Array4<f32>> {
        let (batch_size, in_channels, in_height, in_width) = input.dim();
        let (out_channels, w_in, k, _) = self.weight.dim();
        if in_channels != w_in || in_height < k || in_width < k {
            return Err(CapsError::Numerical(format!(
                "entrée {:?} incompatible avec un noyau {:?}",
                input.dim(),
                self.weight.dim()
            )));
        }
        let out_height = self.output_size(in_height);
        let out_width = self.output_size(in_width);
        let wmat = self.weight_matrix()?;
        let mut output = Array4::zeros((batch_size, out_channels, out_height, out_width));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(input.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(mut out_sample, in_sample)| {
                let cols = im2col(&in_sample, k, self.stride, out_height, out_width);
                let product = wmat.dot(&cols);
                for oc in 0..out_channels {
                    let bias = self.bias[oc];
                    for (p, value) in product.row(oc).iter().enumerate() {
                        out_sample[[oc, p / out_width, p % out_width]] = value + bias;
                    }
                }
            });

        Ok(output)
    }

    /// Rétropropagation : accumule dW, db dans `grads` et renvoie dL/dx
    pub fn backward(
        &self,
        input: &ArrayView4<f32>,
        grad_output: &ArrayView4<f32>,
        grads: &mut Conv2d,
    ) -> CapsResult<Array4<f32>> {
        let (batch_size, in_channels, in_height, in_width) = input.dim();
        let (_, out_channels, out_height, out_width) = grad_output.dim();
        let k = self.kernel_size();
        let stride = self.stride;
        let wmat = self.weight_matrix()?;

        let per_sample: Vec<(Array2<f32>, Array1<f32>, Array3<f32>)> = (0..batch_size)
            .into_par_iter()
            .map(|b| {
                let in_sample = input.index_axis(Axis(0), b);
                let cols = im2col(&in_sample, k, stride, out_height, out_width);
                let mut grad = Array2::zeros((out_channels, out_height * out_width));
                for oc in 0..out_channels {
                    for oh in 0..out_height {
                        for ow in 0..out_width {
                            grad[[oc, oh * out_width + ow]] = grad_output[[b, oc, oh, ow]];
                        }
                    }
                }
                let weight_grad = grad.dot(&cols.t());
                let bias_grad = grad.sum_axis(Axis(1));
                let grad_cols = wmat.t().dot(&grad);
                let grad_input = col2im(
                    &grad_cols.view(),
                    (in_channels, in_height, in_width),
                    k,
                    stride,
                    out_height,
                    out_width,
                );
                (weight_grad, bias_grad, grad_input)
            })
            .collect();

        let mut grad_input = Array4::zeros(input.raw_dim());
        {
            let (out_c, in_c, _, _) = grads.weight.dim();
            let mut weight_grad = grads.weight.view_mut().into_shape_with_order((out_c, in_c * k * k))?;
            for (b, (w_grad, b_grad, x_grad)) in per_sample.into_iter().enumerate() {
                weight_grad += &w_grad;
                grads.bias += &b_grad;
                grad_input.index_axis_mut(Axis(0), b).assign(&x_grad);
            }
        }

        Ok(grad_input)
    }
}

fn im2col(
    input: &ArrayView3<f32>,
    k: usize,
    stride: usize,
    out_height: usize,
    out_width: usize,
) -> Array2<f32> {
    let channels = input.dim().0;
    let mut cols = Array2::zeros((channels * k * k, out_height * out_width));
    for c in 0..channels {
        for kh in 0..k {
            for kw in 0..k {
                let mut row = cols.row_mut((c * k + kh) * k + kw);
                for oh in 0..out_height {
                    for ow in 0..out_width {
                        row[oh * out_width + ow] = input[[c, oh * stride + kh, ow * stride + kw]];
                    }
                }
            }
        }
    }
    cols
}

fn col2im(
    cols: &ArrayView2<f32>,
    (channels, height, width): (usize, usize, usize),
    k: usize,
    stride: usize,
    out_height: usize,
    out_width: usize,
) -> Array3<f32> {
    let mut image = Array3::zeros((channels, height, width));
    for c in 0..channels {
        for kh in 0..k {
            for kw in 0..k {
                let row = cols.row((c * k + kh) * k + kw);
                for oh in 0..out_height {
                    for ow in 0..out_width {
                        image[[c, oh * stride + kh, ow * stride + kw]] += row[oh * out_width + ow];
                    }
                }
            }
        }
    }
    image
}

/// Couche dense, poids [sorties, entrées]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: kaiming_normal(ndarray::Ix2(out_features, in_features), out_features, rng),
            bias: Array1::zeros(out_features),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            weight: Array2::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }

    pub fn forward(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        input.dot(&self.weight.t()) + &self.bias
    }

    pub fn backward(
        &self,
        input: &ArrayView2<f32>,
        grad_output: &ArrayView2<f32>,
        grads: &mut Linear,
    ) -> Array2<f32> {
        grads.weight += &grad_output.t().dot(input);
        grads.bias += &grad_output.sum_axis(Axis(0));
        grad_output.dot(&self.weight)
    }
}

/// Normalisation par batch sur des lignes [N, C]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
}

/// Statistiques du batch conservées pour la rétropropagation
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    x_hat: Array2<f32>,
    inv_std: Array1<f32>,
    batch_mean: Array1<f32>,
    batch_var: Array1<f32>,
    rows: usize,
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
        }
    }

    pub fn zeros_like(&self) -> Self {
        let channels = self.gamma.len();
        Self {
            gamma: Array1::zeros(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::zeros(channels),
        }
    }

    pub fn forward_rows(
        &self,
        input: &ArrayView2<f32>,
        mode: Mode,
    ) -> CapsResult<(Array2<f32>, Option<BatchNormCache>)> {
        match mode {
            Mode::Eval => {
                let inv_std = self.running_var.mapv(|v| 1.0 / (v + BATCH_NORM_EPS).sqrt());
                let x_hat = (input - &self.running_mean) * &inv_std;
                Ok((&x_hat * &self.gamma + &self.beta, None))
            }
            Mode::Train => {
                let rows = input.nrows();
                let batch_mean = input
                    .mean_axis(Axis(0))
                    .ok_or_else(|| CapsError::EmptyDataset("batch vide en normalisation".into()))?;
                let centered = input - &batch_mean;
                let batch_var = centered
                    .mapv(|v| v * v)
                    .mean_axis(Axis(0))
                    .ok_or_else(|| CapsError::EmptyDataset("batch vide en normalisation".into()))?;
                let inv_std = batch_var.mapv(|v| 1.0 / (v + BATCH_NORM_EPS).sqrt());
                let x_hat = centered * &inv_std;
                let output = &x_hat * &self.gamma + &self.beta;
                let cache = BatchNormCache {
                    x_hat,
                    inv_std,
                    batch_mean,
                    batch_var,
                    rows,
                };
                Ok((output, Some(cache)))
            }
        }
    }

    pub fn backward_rows(
        &self,
        cache: &BatchNormCache,
        grad_output: &ArrayView2<f32>,
        grads: &mut BatchNorm,
    ) -> Array2<f32> {
        let n = cache.rows as f32;
        let grad_gamma = (grad_output * &cache.x_hat).sum_axis(Axis(0));
        let grad_beta = grad_output.sum_axis(Axis(0));
        let scale = &self.gamma * &cache.inv_std / n;
        let grad_input = (grad_output * n - &grad_beta - &cache.x_hat * &grad_gamma) * &scale;
        grads.gamma += &grad_gamma;
        grads.beta += &grad_beta;
        grad_input
    }

    /// Mise à jour des moyennes glissantes (variance non biaisée)
    pub fn update_running(&mut self, cache: &BatchNormCache, momentum: f32) {
        let correction = if cache.rows > 1 {
            cache.rows as f32 / (cache.rows - 1) as f32
        } else {
            1.0
        };
        self.running_mean = &self.running_mean * (1.0 - momentum) + &cache.batch_mean * momentum;
        self.running_var =
            &self.running_var * (1.0 - momentum) + &cache.batch_var * (momentum * correction);
    }

    /// Normalisation par canal d'une carte [B, C, H, W]
    pub fn forward_4d(
        &self,
        input: &ArrayView4<f32>,
        mode: Mode,
    ) -> CapsResult<(Array4<f32>, Option<BatchNormCache>)> {
        let dims = input.dim();
        let rows = channels_to_rows(input)?;
        let (output, cache) = self.forward_rows(&rows.view(), mode)?;
        Ok((rows_to_channels(output, dims)?, cache))
    }

    pub fn backward_4d(
        &self,
        cache: &BatchNormCache,
        grad_output: &ArrayView4<f32>,
        grads: &mut BatchNorm,
    ) -> CapsResult<Array4<f32>> {
        let dims = grad_output.dim();
        let rows = channels_to_rows(grad_output)?;
        let grad = self.backward_rows(cache, &rows.view(), grads);
        rows_to_channels(grad, dims)
    }
}

/// [B, C, H, W] -> [B·H·W, C]
fn channels_to_rows(input: &ArrayView4<f32>) -> CapsResult<Array2<f32>> {
    let (b, c, h, w) = input.dim();
    let permuted = input.view().permuted_axes([0, 2, 3, 1]);
    let standard = permuted.as_standard_layout().into_owned();
    Ok(standard.into_shape_with_order((b * h * w, c))?)
}

fn rows_to_channels(
    rows: Array2<f32>,
    (b, c, h, w): (usize, usize, usize, usize),
) -> CapsResult<Array4<f32>> {
    let nhwc = rows.into_shape_with_order((b, h, w, c))?;
    Ok(nhwc.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned())
}

/// PReLU à pente unique apprise
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PRelu {
    pub alpha: Array1<f32>,
}

impl PRelu {
    pub fn new() -> Self {
        Self {
            alpha: Array1::from_elem(1, PRELU_INIT),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            alpha: Array1::zeros(self.alpha.raw_dim()),
        }
    }

    pub fn forward<D: Dimension>(&self, input: &ArrayView<f32, D>) -> Array<f32, D> {
        let alpha = self.alpha[0];
        input.mapv(|v| if v > 0.0 { v } else { alpha * v })
    }

    pub fn backward<D: Dimension>(
        &self,
        input: &ArrayView<f32, D>,
        grad_output: &ArrayView<f32, D>,
        grads: &mut PRelu,
    ) -> Array<f32, D> {
        let alpha = self.alpha[0];
        let mut grad_alpha = 0.0;
        let mut grad_input = Array::zeros(input.raw_dim());
        Zip::from(&mut grad_input)
            .and(input)
            .and(grad_output)
            .for_each(|gx, &x, &gy| {
                if x > 0.0 {
                    *gx = gy;
                } else {
                    *gx = alpha * gy;
                    grad_alpha += gy * x;
                }
            });
        grads.alpha[0] += grad_alpha;
        grad_input
    }
}

impl Default for PRelu {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameterized for Conv2d {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.weight.view().into_dyn(), self.bias.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![self.weight.view_mut().into_dyn(), self.bias.view_mut().into_dyn()]
    }
}

impl Parameterized for Linear {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.weight.view().into_dyn(), self.bias.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![self.weight.view_mut().into_dyn(), self.bias.view_mut().into_dyn()]
    }
}

// Les statistiques glissantes ne sont pas des paramètres appris
impl Parameterized for BatchNorm {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.gamma.view().into_dyn(), self.beta.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![self.gamma.view_mut().into_dyn(), self.beta.view_mut().into_dyn()]
    }
}

impl Parameterized for PRelu {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.alpha.view().into_dyn()]
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![self.alpha.view_mut().into_dyn()]
    }
}

/// Masque de dropout par canal (Dropout2d), [B, C, 1, 1]
pub fn channel_dropout_mask<R: Rng>(
    batch_size: usize,
    channels: usize,
    rate: f32,
    rng: &mut R,
) -> Array4<f32> {
    let keep = 1.0 / (1.0 - rate);
    Array4::from_shape_simple_fn((batch_size, channels, 1, 1), || {
        if rng.random::<f32>() < rate {
            0.0
        } else {
            keep
        }
    })
}

/// Masque de dropout élément par élément
pub fn dropout_mask<R: Rng>(shape: (usize, usize), rate: f32, rng: &mut R) -> Array2<f32> {
    let keep = 1.0 / (1.0 - rate);
    Array2::from_shape_simple_fn(shape, || {
        if rng.random::<f32>() < rate {
            0.0
        } else {
            keep
        }
    })
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

pub fn relu_backward(pre_activation: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
    let mut grad = grad_output.clone();
    Zip::from(&mut grad)
        .and(pre_activation)
        .for_each(|g, &x| {
            if x <= 0.0 {
                *g = 0.0;
            }
        });
    grad
}

pub fn sigmoid(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// Facteur de squash f(q) = q / ((1 + q) sqrt(q + ε)) pour q = ||s||²
fn squash_factor(norm_squared: f32) -> f32 {
    norm_squared / ((1.0 + norm_squared) * (norm_squared + SQUASH_EPS).sqrt())
}

/// Squash : direction conservée, norme ramenée dans [0, 1[
pub fn squash(vector: &ArrayView1<f32>) -> Array1<f32> {
    let norm_squared = vector.dot(vector);
    vector.mapv(|v| v * squash_factor(norm_squared))
}

/// Gradient du squash : J = f·I + 2 f'(q) s sᵀ
pub fn squash_backward(vector: &ArrayView1<f32>, grad_output: &ArrayView1<f32>) -> Array1<f32> {
    let q = vector.dot(vector);
    let f = squash_factor(q);
    let root = (q + SQUASH_EPS).sqrt();
    let one_plus = 1.0 + q;
    let derivative = 1.0 / (one_plus * root)
        - q / (one_plus * one_plus * root)
        - 0.5 * q / (one_plus * root * (q + SQUASH_EPS));
    let projection = vector.dot(grad_output);
    grad_output * f + &(vector * (2.0 * derivative * projection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_conv_output_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2d::new(1, 4, 9, 1, &mut rng);
        let input = Array4::ones((2, 1, 32, 32));
        let output = conv.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (2, 4, 24, 24));

        let strided = Conv2d::new(4, 6, 9, 2, &mut rng);
        let output = strided.forward(&output.view()).unwrap();
        assert_eq!(output.dim(), (2, 6, 8, 8));
    }

    #[test]
    fn test_conv_matches_direct_sum() {
        let mut rng = StdRng::seed_from_u64(2);
        let conv = Conv2d::new(2, 3, 3, 2, &mut rng);
        let input = Array::from_shape_fn((1, 2, 7, 7), |(_, c, h, w)| (c * 49 + h * 7 + w) as f32 * 0.01);
        let output = conv.forward(&input.view()).unwrap();
        let mut expected = conv.bias[1];
        for c in 0..2 {
            for kh in 0..3 {
                for kw in 0..3 {
                    expected += conv.weight[[1, c, kh, kw]] * input[[0, c, 2 + kh, 4 + kw]];
                }
            }
        }
        assert_abs_diff_eq!(output[[0, 1, 1, 2]], expected, epsilon = 1e-5);
    }

    #[test]
    fn test_conv_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let conv = Conv2d::new(1, 2, 3, 1, &mut rng);
        let input = Array::from_shape_fn((1, 1, 5, 5), |(_, _, h, w)| ((h * 5 + w) as f32).sin());
        // L = somme des sorties
        let output = conv.forward(&input.view()).unwrap();
        let ones = Array4::ones(output.raw_dim());
        let mut grads = conv.zeros_like();
        let grad_input = conv.backward(&input.view(), &ones.view(), &mut grads).unwrap();

        let h = 1e-2;
        let mut shifted = conv.clone();
        shifted.weight[[1, 0, 1, 2]] += h;
        let numeric = (shifted.forward(&input.view()).unwrap().sum() - output.sum()) / h;
        assert_abs_diff_eq!(grads.weight[[1, 0, 1, 2]], numeric, epsilon = 1e-2);

        let mut bumped = input.clone();
        bumped[[0, 0, 2, 2]] += h;
        let numeric = (conv.forward(&bumped.view()).unwrap().sum() - output.sum()) / h;
        assert_abs_diff_eq!(grad_input[[0, 0, 2, 2]], numeric, epsilon = 1e-2);
    }

    #[test]
    fn test_batch_norm_train_normalises() {
        let norm = BatchNorm::new(2);
        let input = array![[1.0, 10.0], [3.0, 20.0], [5.0, 30.0]];
        let (output, cache) = norm.forward_rows(&input.view(), Mode::Train).unwrap();
        assert!(cache.is_some());
        for column in output.columns() {
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_batch_norm_backward_sums_to_zero() {
        let norm = BatchNorm::new(1);
        let input = array![[1.0], [2.0], [4.0]];
        let (_, cache) = norm.forward_rows(&input.view(), Mode::Train).unwrap();
        let mut grads = norm.zeros_like();
        let grad = norm.backward_rows(&cache.unwrap(), &array![[1.0], [0.0], [-2.0]].view(), &mut grads);
        assert_abs_diff_eq!(grad.sum(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_prelu_slope() {
        let prelu = PRelu::new();
        let input = array![[-2.0, 3.0]];
        let output = prelu.forward(&input.view());
        assert_eq!(output, array![[-0.5, 3.0]]);
        let mut grads = prelu.zeros_like();
        let grad = prelu.backward(&input.view(), &array![[1.0, 1.0]].view(), &mut grads);
        assert_eq!(grad, array![[0.25, 1.0]]);
        assert_abs_diff_eq!(grads.alpha[0], -2.0);
    }

    #[test]
    fn test_squash_zero_vector() {
        let zero = Array1::<f32>::zeros(16);
        let output = squash(&zero.view());
        assert!(output.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_squash_gradient_matches_finite_difference() {
        let vector = array![0.3_f32, -1.2, 0.7];
        let grad_output = array![1.0_f32, 0.5, -0.25];
        let analytic = squash_backward(&vector.view(), &grad_output.view());
        let h = 1e-3;
        for i in 0..3 {
            let mut plus = vector.clone();
            plus[i] += h;
            let mut minus = vector.clone();
            minus[i] -= h;
            let numeric = (squash(&plus.view()).dot(&grad_output)
                - squash(&minus.view()).dot(&grad_output))
                / (2.0 * h);
            assert_abs_diff_eq!(analytic[i], numeric, epsilon = 1e-3);
        }
    }

    proptest! {
        #[test]
        fn squash_is_collinear_and_bounded(values in prop::collection::vec(-50.0f32..50.0, 16)) {
            let vector = Array1::from(values);
            let norm = vector.dot(&vector).sqrt();
            prop_assume!(norm > 1e-3);
            let output = squash(&vector.view());
            let out_norm = output.dot(&output).sqrt();
            prop_assert!(out_norm < 1.0);
            // cos = 1 pour deux vecteurs colinéaires de même sens
            let cosine = output.dot(&vector) / (out_norm * norm);
            prop_assert!((cosine - 1.0).abs() < 1e-4);
        }
    }
}
