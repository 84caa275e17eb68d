pub mod sampler;
pub mod archive;
pub mod augment;
pub mod data_loader;
pub mod training_strategy;

pub use archive::ScanArchive;
pub use augment::{Augmenter, TransformMode};
pub use data_loader::{AugmentingDataset, Batch, BatchLoader, SplitDataset, WeightedSampler};
pub use sampler::{Annotation, InMemorySource, Scan, ScanSource, VolumeSampler};
pub use training_strategy::{EarlyStopping, Trainable, TrainingStrategy};
