use log::{debug, info};
use ndarray::Array3;
use ndarray_npy::read_npy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::sampler::{Annotation, Scan, ScanSource};
use crate::error::{CapsError, CapsResult};

/// Nom du manifeste à la racine d'une archive
pub const MANIFEST_FILE: &str = "manifest.json";

/// Entrée du manifeste : un scan, son volume et ses groupes d'annotations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEntry {
    pub id: String,
    /// Chemin du volume .npy, relatif à la racine de l'archive
    pub volume: PathBuf,
    #[serde(default)]
    pub nodules: Vec<Vec<Annotation>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub scans: Vec<ScanEntry>,
}

/// Archive de scans sur disque : `manifest.json` + volumes `.npy`
pub struct ScanArchive {
    root: PathBuf,
    manifest: Manifest,
}

impl ScanArchive {
    pub fn open(root: impl AsRef<Path>) -> CapsResult<Self> {
        let root = root.as_ref().to_path_buf();
        let raw = fs::read_to_string(root.join(MANIFEST_FILE))?;
        let manifest: Manifest = serde_json::from_str(&raw)?;
        info!(
            "📁 Archive {}: {} scans référencés",
            root.display(),
            manifest.scans.len()
        );
        Ok(Self { root, manifest })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Volumes enregistrés en f32, ou en i16 (unités Hounsfield brutes)
    fn read_volume(path: &Path) -> CapsResult<Array3<f32>> {
        match read_npy::<_, Array3<f32>>(path) {
            Ok(volume) => Ok(volume),
            Err(first) => {
                debug!("{} n'est pas en f32 ({first}), essai en i16", path.display());
                let volume: Array3<i16> = read_npy(path)?;
                Ok(volume.mapv(f32::from))
            }
        }
    }
}

impl ScanSource for ScanArchive {
    fn scan_ids(&self) -> CapsResult<Vec<String>> {
        Ok(self.manifest.scans.iter().map(|s| s.id.clone()).collect())
    }

    fn load_scan(&self, id: &str) -> CapsResult<Scan> {
        let entry = self
            .manifest
            .scans
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CapsError::UnknownScan(id.to_string()))?;
        let volume = Self::read_volume(&self.root.join(&entry.volume))?;
        Ok(Scan {
            id: entry.id.clone(),
            volume,
            nodules: entry.nodules.clone(),
        })
    }
}
