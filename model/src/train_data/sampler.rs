use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use log::{debug, info, warn};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::error::CapsResult;
use crate::model::config::SamplerConfig;

/// Epsilon de la standardisation des patchs
pub const PATCH_STD_EPS: f32 = 1e-8;

/// Annotation d'un radiologue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Score ordinal 1..5, absent si non coté
    pub malignancy: Option<f32>,
    /// Centroïde en voxels (ligne, colonne, coupe)
    pub centroid: [f64; 3],
}

/// Un scan : volume [ligne, colonne, coupe] et groupes d'annotations
#[derive(Debug, Clone)]
pub struct Scan {
    pub id: String,
    pub volume: Array3<f32>,
    pub nodules: Vec<Vec<Annotation>>,
}

/// Collection interrogeable de scans
pub trait ScanSource {
    /// Identifiants dans l'ordre de la requête, doublons possibles
    fn scan_ids(&self) -> CapsResult<Vec<String>>;
    fn load_scan(&self, id: &str) -> CapsResult<Scan>;
}

/// Source en mémoire
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    scans: Vec<Scan>,
}

impl InMemorySource {
    pub fn new(scans: Vec<Scan>) -> Self {
        Self { scans }
    }
}

impl ScanSource for InMemorySource {
    fn scan_ids(&self) -> CapsResult<Vec<String>> {
        Ok(self.scans.iter().map(|scan| scan.id.clone()).collect())
    }

    fn load_scan(&self, id: &str) -> CapsResult<Scan> {
        self.scans
            .iter()
            .find(|scan| scan.id == id)
            .cloned()
            .ok_or_else(|| crate::error::CapsError::UnknownScan(id.to_string()))
    }
}

/// Raison de l'abandon d'un nodule
#[derive(Debug, Error, PartialEq)]
pub enum ExtractionError {
    #[error("aucune annotation ne porte de score de malignité")]
    MissingMalignancy,
    #[error("centroïde non fini: {0:?}")]
    NonFiniteCentroid([f64; 3]),
    #[error("découpe dégénérée: {0:?}")]
    DegenerateCrop([usize; 3]),
    #[error("redimensionnement impossible: {0}")]
    Resize(String),
}

/// Compteurs agrégés de l'extraction
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SamplerStats {
    pub scans_processed: usize,
    pub nodules_total: usize,
    pub benign: usize,
    pub malignant: usize,
    pub discarded: usize,
}

/// Patchs alignés avec leurs étiquettes (0 = bénin, 1 = malin)
#[derive(Debug, Clone)]
pub struct SampledPatches {
    pub images: Vec<Array2<f32>>,
    pub labels: Vec<usize>,
    pub stats: SamplerStats,
}

/// Extraction de patchs 2D centrés sur les nodules
pub struct VolumeSampler {
    config: SamplerConfig,
}

impl VolumeSampler {
    pub fn new(config: SamplerConfig) -> CapsResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn sample<S, R>(&self, source: &S, rng: &mut R) -> CapsResult<SampledPatches>
    where
        S: ScanSource + ?Sized,
        R: Rng,
    {
        let mut seen = HashSet::new();
        let mut stats = SamplerStats::default();
        let mut images = Vec::new();
        let mut labels = Vec::new();

        for id in source.scan_ids()? {
            if stats.scans_processed >= self.config.max_scans {
                break;
            }
            if !seen.insert(id.clone()) {
                debug!("Scan {id} déjà traité, ignoré");
                continue;
            }
            let scan = match source.load_scan(&id) {
                Ok(scan) => scan,
                Err(err) => {
                    warn!("⚠️  Scan {id} illisible: {err}");
                    continue;
                }
            };
            stats.scans_processed += 1;

            for cluster in &scan.nodules {
                stats.nodules_total += 1;
                match self.extract_nodule(&scan.volume, cluster, rng) {
                    Ok((patch, label)) => {
                        if label == 1 {
                            stats.malignant += 1;
                        } else {
                            stats.benign += 1;
                        }
                        images.push(patch);
                        labels.push(label);
                    }
                    Err(err) => {
                        debug!("Nodule écarté ({id}): {err}");
                        stats.discarded += 1;
                    }
                }
            }
        }

        info!(
            "📊 Extraction: {} scans, {} nodules ({} bénins, {} malins, {} écartés)",
            stats.scans_processed, stats.nodules_total, stats.benign, stats.malignant, stats.discarded
        );

        Ok(SampledPatches {
            images,
            labels,
            stats,
        })
    }

    /// Patch standardisé et étiquette pour un groupe d'annotations
    pub fn extract_nodule<R: Rng>(
        &self,
        volume: &Array3<f32>,
        cluster: &[Annotation],
        rng: &mut R,
    ) -> Result<(Array2<f32>, usize), ExtractionError> {
        let (malignancy, centroid) = consensus(cluster)?;
        let label = usize::from(malignancy >= self.config.malignancy_threshold);

        let cube_size = rng.random_range(self.config.min_cube_size..self.config.max_cube_size);
        let slice = crop_central_slice(volume, centroid, cube_size)?;
        let resized = resize_patch(&slice.view(), self.config.patch_size)?;
        Ok((standardize(resized), label))
    }
}

/// Score moyen des annotations cotées et centroïde moyen
pub fn consensus(cluster: &[Annotation]) -> Result<(f32, [f64; 3]), ExtractionError> {
    let scores: Vec<f32> = cluster.iter().filter_map(|a| a.malignancy).collect();
    if scores.is_empty() {
        return Err(ExtractionError::MissingMalignancy);
    }
    let malignancy = scores.iter().sum::<f32>() / scores.len() as f32;

    let mut centroid = [0.0f64; 3];
    for annotation in cluster {
        for (acc, value) in centroid.iter_mut().zip(annotation.centroid) {
            *acc += value;
        }
    }
    for value in centroid.iter_mut() {
        *value /= cluster.len() as f64;
    }
    if centroid.iter().any(|v| !v.is_finite()) {
        return Err(ExtractionError::NonFiniteCentroid(centroid));
    }
    Ok((malignancy, centroid))
}

/// Cube de côté `cube_size` centré sur le centroïde, borné au volume,
/// dont on garde la coupe centrale.
/// `cube_size` est le côté complet, la demi-étendue vaut `cube_size / 2`.
pub fn crop_central_slice(
    volume: &Array3<f32>,
    centroid: [f64; 3],
    cube_size: usize,
) -> Result<Array2<f32>, ExtractionError> {
    let half = (cube_size / 2) as i64;
    let dims = volume.shape();
    let mut bounds = [(0usize, 0usize); 3];
    let mut extent = [0usize; 3];

    for axis in 0..3 {
        // Centre ramené près du volume avant toute arithmétique entière
        let reach = (dims[axis] as i64 + half) as f64;
        let center = centroid[axis].floor().clamp(-reach, reach) as i64;
        let lo = (center - half).max(0);
        let hi = (center + half).min(dims[axis] as i64);
        let len = (hi - lo).max(0) as usize;
        extent[axis] = len;
        bounds[axis] = (lo.max(0) as usize, lo.max(0) as usize + len);
    }
    if extent.iter().any(|&len| len == 0) {
        return Err(ExtractionError::DegenerateCrop(extent));
    }

    let cube = volume.slice(s![
        bounds[0].0..bounds[0].1,
        bounds[1].0..bounds[1].1,
        bounds[2].0..bounds[2].1
    ]);
    Ok(cube.index_axis(Axis(2), extent[2] / 2).to_owned())
}

/// Redimensionnement anti-crénelé (filtre triangle)
pub fn resize_patch(slice: &ArrayView2<f32>, size: usize) -> Result<Array2<f32>, ExtractionError> {
    let (rows, cols) = slice.dim();
    // Le rééchantillonnage borne les pixels flottants à [0, 1]
    let min = slice.fold(f32::INFINITY, |acc, &v| acc.min(v));
    let max = slice.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let range = if max > min { max - min } else { 1.0 };

    let unit: Vec<f32> = slice.iter().map(|&v| (v - min) / range).collect();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(cols as u32, rows as u32, unit)
            .ok_or_else(|| ExtractionError::Resize(format!("tampon {rows}×{cols} invalide")))?;
    let resized = imageops::resize(&buffer, size as u32, size as u32, FilterType::Triangle);

    let values = resized.into_raw().into_iter().map(|v| v * range + min).collect();
    Array2::from_shape_vec((size, size), values).map_err(|e| ExtractionError::Resize(e.to_string()))
}

/// Centrage-réduction : (x - μ) / (σ + ε)
pub fn standardize(patch: Array2<f32>) -> Array2<f32> {
    let mean = patch.mean().unwrap_or(0.0);
    let std = patch.std(0.0);
    patch.mapv(|v| (v - mean) / (std + PATCH_STD_EPS))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn synthetic_volume(seed: usize) -> Array3<f32> {
        Array::from_shape_fn((64, 64, 40), |(r, c, z)| {
            ((r * 13 + c * 7 + z * 3 + seed * 11) % 97) as f32 * 10.0 - 400.0
        })
    }

    pub(crate) fn annotation(malignancy: Option<f32>, centroid: [f64; 3]) -> Annotation {
        Annotation {
            malignancy,
            centroid,
        }
    }

    /// 4 scans, 1 nodule chacun : 2 bénins puis 2 malins
    pub(crate) fn four_scan_source() -> InMemorySource {
        let scores = [1.0, 2.0, 4.0, 5.0];
        let scans = scores
            .iter()
            .enumerate()
            .map(|(i, &score)| Scan {
                id: format!("LIDC-{i:04}"),
                volume: synthetic_volume(i),
                nodules: vec![vec![
                    annotation(Some(score), [30.0, 31.0, 20.0]),
                    annotation(Some(score), [32.0, 33.0, 20.0]),
                ]],
            })
            .collect();
        InMemorySource::new(scans)
    }

    #[test]
    fn test_four_scans_four_patches() {
        let sampler = VolumeSampler::new(SamplerConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let patches = sampler.sample(&four_scan_source(), &mut rng).unwrap();

        assert_eq!(patches.images.len(), 4);
        assert_eq!(patches.labels, vec![0, 0, 1, 1]);
        assert_eq!(
            patches.stats,
            SamplerStats {
                scans_processed: 4,
                nodules_total: 4,
                benign: 2,
                malignant: 2,
                discarded: 0,
            }
        );
        for image in &patches.images {
            assert_eq!(image.dim(), (32, 32));
            assert_abs_diff_eq!(image.mean().unwrap(), 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(image.std(0.0), 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_duplicate_scans_are_skipped() {
        let source = four_scan_source();
        let mut scans = Vec::new();
        for id in ["LIDC-0000", "LIDC-0000", "LIDC-0001"] {
            scans.push(source.load_scan(id).unwrap());
        }
        let sampler = VolumeSampler::new(SamplerConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let patches = sampler.sample(&InMemorySource::new(scans), &mut rng).unwrap();
        assert_eq!(patches.stats.scans_processed, 2);
        assert_eq!(patches.images.len(), 2);
    }

    #[test]
    fn test_max_scans_bound() {
        let config = SamplerConfig {
            max_scans: 3,
            ..SamplerConfig::default()
        };
        let sampler = VolumeSampler::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let patches = sampler.sample(&four_scan_source(), &mut rng).unwrap();
        assert_eq!(patches.stats.scans_processed, 3);
        assert_eq!(patches.labels, vec![0, 0, 1]);
    }

    #[test]
    fn test_discards_are_counted() {
        let scan = Scan {
            id: "bad".into(),
            volume: synthetic_volume(0),
            nodules: vec![
                vec![annotation(None, [10.0, 10.0, 10.0])],
                vec![annotation(Some(4.0), [f64::NAN, 10.0, 10.0])],
                vec![annotation(Some(4.0), [500.0, 10.0, 10.0])],
                vec![
                    annotation(None, [20.0, 20.0, 20.0]),
                    annotation(Some(2.0), [22.0, 20.0, 20.0]),
                ],
            ],
        };
        let sampler = VolumeSampler::new(SamplerConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let patches = sampler.sample(&InMemorySource::new(vec![scan]), &mut rng).unwrap();
        assert_eq!(patches.stats.nodules_total, 4);
        assert_eq!(patches.stats.discarded, 3);
        assert_eq!(patches.stats.benign, 1);
        assert_eq!(patches.labels, vec![0]);
    }

    #[test]
    fn test_far_centroid_is_discarded() {
        let scan = Scan {
            id: "far".into(),
            volume: synthetic_volume(1),
            nodules: vec![
                vec![annotation(Some(4.0), [1e30, 10.0, 10.0])],
                vec![annotation(Some(4.0), [-1e30, 10.0, 10.0])],
                vec![annotation(Some(1.0), [10.0, 10.0, f64::MAX])],
            ],
        };
        let sampler = VolumeSampler::new(SamplerConfig::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let patches = sampler.sample(&InMemorySource::new(vec![scan]), &mut rng).unwrap();
        assert_eq!(patches.stats.nodules_total, 3);
        assert_eq!(patches.stats.discarded, 3);
        assert!(patches.labels.is_empty());

        let volume = synthetic_volume(1);
        for centroid in [[1e30, 10.0, 10.0], [-1e30, 10.0, 10.0]] {
            assert!(matches!(
                crop_central_slice(&volume, centroid, 20),
                Err(ExtractionError::DegenerateCrop(_))
            ));
        }
    }

    #[test]
    fn test_consensus_averages() {
        let cluster = [
            annotation(Some(2.0), [1.0, 2.0, 3.0]),
            annotation(Some(4.0), [3.0, 4.0, 5.0]),
            annotation(None, [5.0, 6.0, 7.0]),
        ];
        let (score, centroid) = consensus(&cluster).unwrap();
        assert_abs_diff_eq!(score, 3.0);
        assert_eq!(centroid, [3.0, 4.0, 5.0]);
        assert_eq!(consensus(&[]), Err(ExtractionError::MissingMalignancy));
    }

    #[test]
    fn test_crop_is_clipped_to_volume() {
        let volume = Array::from_shape_fn((20, 20, 10), |(r, c, z)| (r * 1000 + c * 10 + z) as f32);
        // Centroïde près du coin : moitié de cube = 5
        let slice = crop_central_slice(&volume, [2.0, 18.0, 1.0], 10).unwrap();
        // lignes 0..7, colonnes 13..20, coupes 0..6 -> coupe centrale 3
        assert_eq!(slice.dim(), (7, 7));
        assert_eq!(slice[[0, 0]], 13.0 * 10.0 + 3.0);
        assert!(matches!(
            crop_central_slice(&volume, [50.0, 5.0, 5.0], 10),
            Err(ExtractionError::DegenerateCrop(_))
        ));
    }

    #[test]
    fn test_standardize_constant_patch() {
        let patch = Array2::from_elem((4, 4), 7.0);
        let out = standardize(patch);
        assert!(out.iter().all(|v| v.is_finite() && *v == 0.0));
    }

    #[test]
    fn test_resize_keeps_value_range() {
        let slice = Array::from_shape_fn((12, 12), |(r, c)| (r as f32 - c as f32) * 100.0);
        let resized = resize_patch(&slice.view(), 32).unwrap();
        assert_eq!(resized.dim(), (32, 32));
        let max = resized.fold(f32::NEG_INFINITY, |a, &v| a.max(v));
        let min = resized.fold(f32::INFINITY, |a, &v| a.min(v));
        assert!(max <= 1100.0 + 1e-2 && min >= -1100.0 - 1e-2);
        assert!(max - min > 1000.0);
    }
}
