use log::debug;
use ndarray::{ArrayD, Zip};
use std::collections::HashMap;
use std::f32::consts::PI;

use super::config::{OptimizerType, SchedulerConfig, TrainingConfig};
use super::layers::Parameterized;
use crate::error::{CapsError, CapsResult};

/// Trait pour les optimiseurs
pub trait Optimizer: Send + Sync {
    /// Un pas de mise à jour : `grads` a la même structure que `params`
    fn step(&mut self, params: &mut dyn Parameterized, grads: &dyn Parameterized) -> CapsResult<()>;
    fn get_lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
}

fn check_alignment(expected: usize, actual: usize) -> CapsResult<()> {
    if expected != actual {
        return Err(CapsError::Numerical(format!(
            "{expected} tenseurs de paramètres pour {actual} gradients"
        )));
    }
    Ok(())
}

/// Optimiseur SGD avec momentum
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<usize, ArrayD<f32>>,
}

impl SGD {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut dyn Parameterized, grads: &dyn Parameterized) -> CapsResult<()> {
        let grads = grads.parameters();
        let mut params = params.parameters_mut();
        check_alignment(params.len(), grads.len())?;

        for (param_id, (param, grad)) in params.iter_mut().zip(&grads).enumerate() {
            let velocity = self
                .velocity
                .entry(param_id)
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

            // v = momentum * v - lr * grad ; param += v
            Zip::from(param.view_mut())
                .and(velocity)
                .and(grad)
                .for_each(|p, v, &g| {
                    *v = self.momentum * *v - self.learning_rate * g;
                    *p += *v;
                });
        }
        Ok(())
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

/// Optimiseur Adam, décroissance des poids découplée
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    timestep: usize,

    // Moments du premier ordre (mean)
    m: HashMap<usize, ArrayD<f32>>,

    // Moments du second ordre (variance)
    v: HashMap<usize, ArrayD<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            timestep: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut dyn Parameterized, grads: &dyn Parameterized) -> CapsResult<()> {
        let grads = grads.parameters();
        let mut params = params.parameters_mut();
        check_alignment(params.len(), grads.len())?;

        self.timestep += 1;
        let bias1 = 1.0 - self.beta1.powi(self.timestep as i32);
        let bias2 = 1.0 - self.beta2.powi(self.timestep as i32);
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let (lr, decay) = (self.learning_rate, self.weight_decay);

        for (param_id, (param, grad)) in params.iter_mut().zip(&grads).enumerate() {
            let m = self
                .m
                .entry(param_id)
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            let v = self
                .v
                .entry(param_id)
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

            Zip::from(param.view_mut())
                .and(m)
                .and(v)
                .and(grad)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * (m_hat / (v_hat.sqrt() + epsilon) + decay * *p);
                });
        }
        Ok(())
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

pub fn build_optimizer(config: &TrainingConfig) -> Box<dyn Optimizer> {
    match &config.optimizer_type {
        OptimizerType::Adam {
            beta1,
            beta2,
            epsilon,
            weight_decay,
        } => Box::new(Adam::new(
            config.learning_rate,
            *beta1,
            *beta2,
            *epsilon,
            *weight_decay,
        )),
        OptimizerType::SGD { momentum } => Box::new(SGD::new(config.learning_rate, *momentum)),
    }
}

/// Cosine annealing avec redémarrages à chaud, avancé une fois par époque
#[derive(Debug, Clone)]
pub struct CosineWarmRestarts {
    base_lr: f32,
    min_lr: f32,
    period: usize,
    period_mult: usize,
    epoch_in_cycle: usize,
}

impl CosineWarmRestarts {
    pub fn new(base_lr: f32, config: &SchedulerConfig) -> Self {
        Self {
            base_lr,
            min_lr: config.min_lr,
            period: config.restart_period.max(1),
            period_mult: config.period_mult.max(1),
            epoch_in_cycle: 0,
        }
    }

    /// Taux courant : η_min + (η_0 - η_min)(1 + cos(π T_cur / T_i)) / 2
    pub fn learning_rate(&self) -> f32 {
        let progress = self.epoch_in_cycle as f32 / self.period as f32;
        self.min_lr + (self.base_lr - self.min_lr) * (1.0 + (PI * progress).cos()) / 2.0
    }

    pub fn step_epoch(&mut self) {
        self.epoch_in_cycle += 1;
        if self.epoch_in_cycle >= self.period {
            self.epoch_in_cycle -= self.period;
            self.period *= self.period_mult;
            debug!("🔄 Redémarrage du cycle, période {}", self.period);
        }
    }
}
