use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use ndarray::{Array3, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{CapsError, CapsResult};
use crate::model::config::AugmentConfig;

/// Epsilon du passage en niveaux de gris 8 bits
pub const RESCALE_EPS: f32 = 1e-8;

/// Entraînement : augmentations aléatoires ; évaluation : déterministe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Train,
    Eval,
}

/// Étire un patch sur [0, 255] d'après son propre min/max
pub fn to_gray_u8(patch: &ArrayView2<f32>) -> GrayImage {
    let (rows, cols) = patch.dim();
    let min = patch.fold(f32::INFINITY, |acc, &v| acc.min(v));
    let max = patch.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let scale = 255.0 / (max - min + RESCALE_EPS);
    GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        let v = (patch[[y as usize, x as usize]] - min) * scale;
        Luma([v.clamp(0.0, 255.0) as u8])
    })
}

/// Indice réfléchi sans répétition du bord (…2 1 | 0 1 2 … n-1 | n-2…)
fn reflect_101(index: i64, len: usize) -> usize {
    let len = len as i64;
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let mut i = index.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as usize
}

/// Interpolation bilinéaire avec bords réfléchis
fn sample_bilinear(image: &GrayImage, x: f32, y: f32) -> f32 {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let pixel = |xi: i64, yi: i64| -> f32 {
        let px = reflect_101(xi, width) as u32;
        let py = reflect_101(yi, height) as u32;
        f32::from(image.get_pixel(px, py)[0])
    };
    let (x0, y0) = (x0 as i64, y0 as i64);
    let top = pixel(x0, y0) * (1.0 - fx) + pixel(x0 + 1, y0) * fx;
    let bottom = pixel(x0, y0 + 1) * (1.0 - fx) + pixel(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Applique `source_of(x, y)` : coordonnée source de chaque pixel de sortie
fn remap<F>(image: &GrayImage, source_of: F) -> GrayImage
where
    F: Fn(f32, f32) -> (f32, f32),
{
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let (sx, sy) = source_of(x as f32, y as f32);
        Luma([sample_bilinear(image, sx, sy).round().clamp(0.0, 255.0) as u8])
    })
}

/// Translation (fraction de la taille), mise à l'échelle et rotation
/// (degrés) autour du centre
pub fn shift_scale_rotate(image: &GrayImage, dx: f32, dy: f32, scale: f32, degrees: f32) -> GrayImage {
    let cx = (image.width() as f32 - 1.0) / 2.0;
    let cy = (image.height() as f32 - 1.0) / 2.0;
    let tx = dx * image.width() as f32;
    let ty = dy * image.height() as f32;
    let (sin, cos) = degrees.to_radians().sin_cos();

    // Transformation inverse : p = c + R(-θ)(p' - c - t) / s
    remap(image, |x, y| {
        let u = x - cx - tx;
        let v = y - cy - ty;
        let sx = (cos * u + sin * v) / scale;
        let sy = (-sin * u + cos * v) / scale;
        (cx + sx, cy + sy)
    })
}

pub fn rotate(image: &GrayImage, degrees: f32) -> GrayImage {
    shift_scale_rotate(image, 0.0, 0.0, 1.0, degrees)
}

/// Bruit gaussien additif de variance `variance` (niveaux 8 bits)
pub fn add_gaussian_noise<R: Rng>(image: &mut GrayImage, variance: f32, rng: &mut R) -> CapsResult<()> {
    let normal = Normal::new(0.0f32, variance.sqrt())
        .map_err(|e| CapsError::Numerical(format!("bruit gaussien: {e}")))?;
    for pixel in image.pixels_mut() {
        let noisy = f32::from(pixel[0]) + normal.sample(rng);
        pixel[0] = noisy.round().clamp(0.0, 255.0) as u8;
    }
    Ok(())
}

/// p ← α·p + β·255
pub fn brightness_contrast(image: &mut GrayImage, alpha: f32, beta: f32) {
    for pixel in image.pixels_mut() {
        let v = f32::from(pixel[0]) * alpha + beta * 255.0;
        pixel[0] = v.round().clamp(0.0, 255.0) as u8;
    }
}

/// Champ de déplacement lissé par une gaussienne de largeur σ, amplitude α
fn displacement_field<R: Rng>(width: u32, height: u32, sigma: f32, rng: &mut R) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    // Tirage sur [0, 1] : le flou borne les pixels flottants à cet intervalle
    let field = ImageBuffer::from_fn(width, height, |_, _| Luma([rng.random::<f32>()]));
    imageops::blur(&field, sigma)
}

pub fn elastic<R: Rng>(image: &GrayImage, alpha: f32, sigma: f32, rng: &mut R) -> GrayImage {
    let (width, height) = image.dimensions();
    let field_x = displacement_field(width, height, sigma, rng);
    let field_y = displacement_field(width, height, sigma, rng);
    remap(image, |x, y| {
        let dx = (field_x.get_pixel(x as u32, y as u32)[0] * 2.0 - 1.0) * alpha;
        let dy = (field_y.get_pixel(x as u32, y as u32)[0] * 2.0 - 1.0) * alpha;
        (x + dx, y + dy)
    })
}

/// Chaîne d'augmentation et de normalisation des patchs
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentConfig,
}

impl Augmenter {
    pub fn new(config: AugmentConfig) -> CapsResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AugmentConfig {
        &self.config
    }

    /// Patch [H, W] → tenseur [1, S, S]
    pub fn apply<R: Rng>(
        &self,
        patch: &ArrayView2<f32>,
        mode: TransformMode,
        rng: &mut R,
    ) -> CapsResult<Array3<f32>> {
        let mut image = self.resize(to_gray_u8(patch));
        if mode == TransformMode::Train {
            image = self.augment(image, rng)?;
        }
        Ok(self.normalize(&image))
    }

    fn resize(&self, image: GrayImage) -> GrayImage {
        let size = self.config.image_size as u32;
        if image.dimensions() == (size, size) {
            image
        } else {
            imageops::resize(&image, size, size, FilterType::Triangle)
        }
    }

    fn augment<R: Rng>(&self, mut image: GrayImage, rng: &mut R) -> CapsResult<GrayImage> {
        let c = &self.config;

        if rng.random::<f32>() < c.rotate_prob {
            let angle = symmetric(rng, c.rotate_limit);
            image = rotate(&image, angle);
        }
        if rng.random::<f32>() < c.hflip_prob {
            imageops::flip_horizontal_in_place(&mut image);
        }
        if rng.random::<f32>() < c.vflip_prob {
            imageops::flip_vertical_in_place(&mut image);
        }
        if rng.random::<f32>() < c.affine_prob {
            let dx = symmetric(rng, c.shift_limit);
            let dy = symmetric(rng, c.shift_limit);
            let scale = 1.0 + symmetric(rng, c.scale_limit);
            let angle = symmetric(rng, c.affine_rotate_limit);
            image = shift_scale_rotate(&image, dx, dy, scale, angle);
        }
        if rng.random::<f32>() < c.noise_prob {
            let (low, high) = c.noise_var;
            let variance = if high > low { rng.random_range(low..high) } else { low };
            add_gaussian_noise(&mut image, variance, rng)?;
        }
        if rng.random::<f32>() < c.brightness_contrast_prob {
            let alpha = 1.0 + symmetric(rng, c.contrast_limit);
            let beta = symmetric(rng, c.brightness_limit);
            brightness_contrast(&mut image, alpha, beta);
        }
        if rng.random::<f32>() < c.elastic_prob {
            image = elastic(&image, c.elastic_alpha, c.elastic_sigma, rng);
        }
        Ok(image)
    }

    /// (p/255 - moyenne) / écart-type
    fn normalize(&self, image: &GrayImage) -> Array3<f32> {
        let (width, height) = image.dimensions();
        let (mean, std) = (self.config.mean, self.config.std);
        Array3::from_shape_fn((1, height as usize, width as usize), |(_, y, x)| {
            let v = f32::from(image.get_pixel(x as u32, y as u32)[0]) / 255.0;
            (v - mean) / std
        })
    }
}

/// Tirage uniforme dans [-limit, limit]
fn symmetric<R: Rng>(rng: &mut R, limit: f32) -> f32 {
    if limit <= 0.0 {
        0.0
    } else {
        rng.random_range(-limit..=limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_patch(size: usize) -> Array2<f32> {
        Array2::from_shape_fn((size, size), |(r, c)| (r * size + c) as f32 * 3.0 - 500.0)
    }

    fn always() -> AugmentConfig {
        AugmentConfig {
            rotate_prob: 1.0,
            hflip_prob: 1.0,
            vflip_prob: 1.0,
            affine_prob: 1.0,
            noise_prob: 1.0,
            brightness_contrast_prob: 1.0,
            elastic_prob: 1.0,
            ..AugmentConfig::default()
        }
    }

    #[test]
    fn test_gray_rescale_spans_full_range() {
        let image = to_gray_u8(&gradient_patch(8).view());
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(7, 7)[0], 255);

        let flat = to_gray_u8(&Array2::from_elem((4, 4), 3.0).view());
        assert!(flat.pixels().all(|p| p[0] == 0));

        // 0.3 · 255 = 76.5 : troncature, pas d'arrondi
        let halves = to_gray_u8(&ndarray::array![[0.0, 0.3], [0.7, 1.0]].view());
        assert_eq!(halves.get_pixel(1, 0)[0], 76);
        assert_eq!(halves.get_pixel(0, 1)[0], 178);
        assert_eq!(halves.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn test_eval_is_deterministic() {
        let augmenter = Augmenter::new(always()).unwrap();
        let patch = gradient_patch(32);
        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(2);
        let a = augmenter.apply(&patch.view(), TransformMode::Eval, &mut rng_a).unwrap();
        let b = augmenter.apply(&patch.view(), TransformMode::Eval, &mut rng_b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (1, 32, 32));
        assert_abs_diff_eq!(a[[0, 0, 0]], -1.0);
        assert_abs_diff_eq!(a[[0, 31, 31]], 1.0);
    }

    #[test]
    fn test_train_output_range_and_shape() {
        let augmenter = Augmenter::new(always()).unwrap();
        let patch = gradient_patch(20);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..5 {
            let out = augmenter.apply(&patch.view(), TransformMode::Train, &mut rng).unwrap();
            assert_eq!(out.dim(), (1, 32, 32));
            assert!(out.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_train_is_reproducible_with_seed() {
        let augmenter = Augmenter::new(always()).unwrap();
        let patch = gradient_patch(32);
        let a = augmenter
            .apply(&patch.view(), TransformMode::Train, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = augmenter
            .apply(&patch.view(), TransformMode::Train, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_transform() {
        let image = to_gray_u8(&gradient_patch(16).view());
        let same = shift_scale_rotate(&image, 0.0, 0.0, 1.0, 0.0);
        assert_eq!(image, same);
    }

    #[test]
    fn test_quarter_turn() {
        let mut image = GrayImage::new(5, 5);
        image.put_pixel(4, 2, Luma([200]));
        let turned = rotate(&image, 90.0);
        // Rotation de 90° autour du centre (2, 2)
        assert_eq!(turned.get_pixel(2, 4)[0], 200);
    }

    #[test]
    fn test_reflect_101() {
        let indices: Vec<usize> = (-3..7).map(|i| reflect_101(i, 4)).collect();
        assert_eq!(indices, vec![3, 2, 1, 0, 1, 2, 3, 2, 1, 0]);
        assert_eq!(reflect_101(-5, 1), 0);
    }

    #[test]
    fn test_brightness_contrast_clips() {
        let mut image = GrayImage::from_pixel(2, 2, Luma([200]));
        brightness_contrast(&mut image, 1.2, 0.2);
        assert!(image.pixels().all(|p| p[0] == 255));
    }
}
