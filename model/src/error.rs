use thiserror::Error;

/// Erreur unifiée du pipeline CapsNet.
#[derive(Error, Debug)]
pub enum CapsError {
    /// Configuration incohérente
    #[error("Erreur de configuration: {0}")]
    Config(String),

    /// Incompatibilité de dimensions entre tenseurs
    #[error("Erreur de forme: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Erreur d'E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("Erreur de sérialisation: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Volume .npy illisible
    #[error("Volume illisible: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("Scan inconnu: {0}")]
    UnknownScan(String),

    #[error("Jeu de données vide: {0}")]
    EmptyDataset(String),

    /// Erreur numérique (NaN, perte infinie)
    #[error("Erreur numérique: {0}")]
    Numerical(String),

    #[error("Erreur de rendu: {0}")]
    Plot(String),
}

impl CapsError {
    pub fn config(message: impl Into<String>) -> Self {
        CapsError::Config(message.into())
    }

    pub fn plot(err: impl std::fmt::Display) -> Self {
        CapsError::Plot(err.to_string())
    }
}

pub type CapsResult<T> = Result<T, CapsError>;
