pub mod config;
pub mod layers;
pub mod capsule;
pub mod routing;
pub mod heads;
pub mod optimizer;
pub mod loss;
pub mod builder;
pub mod core;
pub mod trainer;

// Réexportations principales
pub use config::{ExperimentConfig, NetworkConfig, TrainingConfig};
pub use core::{CapsNet, EpochRecord, TrainingHistory, CHECKPOINT_FILE};
pub use builder::ModelBuilder;
pub use layers::Mode;
pub use optimizer::{build_optimizer, Adam, CosineWarmRestarts, Optimizer, SGD};
pub use loss::{CombinedLoss, MarginLoss, ReconstructionLoss};
pub use trainer::CapsNetTrainer;
