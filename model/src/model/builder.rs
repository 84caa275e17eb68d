use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{config::NetworkConfig, core::CapsNet, layers::Parameterized};
use crate::error::{CapsError, CapsResult};

/// Constructeur de modèle
pub struct ModelBuilder {
    network_config: Option<NetworkConfig>,
    seed: u64,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            network_config: None,
            seed: 0,
        }
    }

    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.network_config = Some(config);
        self
    }

    /// Graine de l'initialisation des poids
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> CapsResult<CapsNet> {
        let network_config = self
            .network_config
            .ok_or_else(|| CapsError::config("Configuration réseau requise"))?;

        // Validation
        network_config.validate()?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let model = CapsNet::new(network_config, &mut rng);
        info!(
            "🏗️  CapsNet construit: {} paramètres, {} itérations de routage",
            model.parameter_count(),
            model.config.routing_iterations
        );
        Ok(model)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_network_config() {
        assert!(matches!(ModelBuilder::new().build(), Err(CapsError::Config(_))));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let config = NetworkConfig {
            stem_channels: 8,
            ..NetworkConfig::default()
        };
        let a = ModelBuilder::new()
            .with_network_config(config.clone())
            .with_seed(42)
            .build()
            .unwrap();
        let b = ModelBuilder::new()
            .with_network_config(config)
            .with_seed(42)
            .build()
            .unwrap();
        assert_eq!(a.stem.conv.weight, b.stem.conv.weight);
        assert_eq!(a.decoder.output.weight, b.decoder.output.weight);
    }

    #[test]
    fn test_initialisation_statistics() {
        let model = ModelBuilder::new()
            .with_network_config(NetworkConfig::default())
            .with_seed(3)
            .build()
            .unwrap();
        // Normalisation : γ = 1, β = 0 ; biais nuls
        assert!(model.stem.norm.gamma.iter().all(|&g| g == 1.0));
        assert!(model.stem.norm.beta.iter().all(|&b| b == 0.0));
        assert!(model.classifier.output.bias.iter().all(|&b| b == 0.0));

        // Kaiming fan_out : std = sqrt(2 / (256 · 81))
        let weights = &model.stem.conv.weight;
        let mean = weights.mean().unwrap();
        let var = weights.mapv(|w| (w - mean) * (w - mean)).mean().unwrap();
        let expected = 2.0 / (256.0 * 81.0);
        assert!((var - expected).abs() < expected * 0.25);
    }
}
