//! Classification bénin / malin de nodules pulmonaires par réseau de capsules
//!
//! `train_data` extrait et augmente les patchs, `model` porte le CapsNet et
//! son entraînement, `evaluation` et `report` produisent les métriques et
//! les figures.

pub mod error;
pub mod evaluation;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod train_data;

pub use error::{CapsError, CapsResult};
pub use pipeline::{run_experiment, ExperimentOutcome};
