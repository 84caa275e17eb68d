use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use super::layers::{squash, squash_backward};

/// Routage dynamique par accord (routing-by-agreement)
#[derive(Debug, Clone)]
pub struct DynamicRouting {
    pub num_iterations: usize,
}

/// Intermédiaires d'un échantillon, un élément par itération
#[derive(Debug, Clone)]
pub struct RoutingTrace {
    /// c_ij, [entrées, sorties]
    pub coupling: Vec<Array2<f32>>,
    /// s_j, [sorties, dim]
    pub pre_activations: Vec<Array2<f32>>,
    /// v_j = squash(s_j), [sorties, dim]
    pub outputs: Vec<Array2<f32>>,
}

impl RoutingTrace {
    /// Capsules de sortie finales
    pub fn final_output(&self) -> Option<&Array2<f32>> {
        self.outputs.last()
    }
}

impl DynamicRouting {
    pub fn new(num_iterations: usize) -> Self {
        Self { num_iterations }
    }

    /// Route un batch de prédictions [B, entrées, sorties, dim] vers [B, sorties, dim]
    pub fn route(&self, predictions: &ArrayView4<f32>) -> (Array3<f32>, Vec<RoutingTrace>) {
        let (batch_size, _, output_caps, dim) = predictions.dim();

        let traces: Vec<RoutingTrace> = predictions
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|sample| self.route_sample(&sample))
            .collect();

        let mut outputs = Array3::zeros((batch_size, output_caps, dim));
        for (b, trace) in traces.iter().enumerate() {
            if let Some(final_output) = trace.final_output() {
                outputs.index_axis_mut(Axis(0), b).assign(final_output);
            }
        }

        (outputs, traces)
    }

    /// Routage d'un seul échantillon, u : [entrées, sorties, dim]
    pub fn route_sample(&self, predictions: &ArrayView3<f32>) -> RoutingTrace {
        let (input_caps, output_caps, _) = predictions.dim();
        let mut logits = Array2::zeros((input_caps, output_caps));
        let mut trace = RoutingTrace {
            coupling: Vec::with_capacity(self.num_iterations),
            pre_activations: Vec::with_capacity(self.num_iterations),
            outputs: Vec::with_capacity(self.num_iterations),
        };

        for iteration in 0..self.num_iterations {
            let coupling = softmax_outputs(&logits.view());
            let weighted = weighted_sum(predictions, &coupling.view());
            let mut squashed = Array2::zeros(weighted.raw_dim());
            for (j, row) in weighted.outer_iter().enumerate() {
                squashed.row_mut(j).assign(&squash(&row));
            }

            // Mise à jour des logits sauf à la dernière itération
            if iteration + 1 < self.num_iterations {
                for i in 0..input_caps {
                    for j in 0..output_caps {
                        logits[[i, j]] += predictions.slice(s![i, j, ..]).dot(&squashed.row(j));
                    }
                }
            }

            trace.coupling.push(coupling);
            trace.pre_activations.push(weighted);
            trace.outputs.push(squashed);
        }

        trace
    }

    /// Gradient par rapport aux prédictions, à travers toutes les itérations
    pub fn backward(
        &self,
        predictions: &ArrayView4<f32>,
        traces: &[RoutingTrace],
        grad_output: &ArrayView3<f32>,
    ) -> Array4<f32> {
        let grads: Vec<Array3<f32>> = traces
            .par_iter()
            .enumerate()
            .map(|(b, trace)| {
                self.backward_sample(
                    &predictions.index_axis(Axis(0), b),
                    trace,
                    &grad_output.index_axis(Axis(0), b),
                )
            })
            .collect();

        let mut grad_predictions = Array4::zeros(predictions.raw_dim());
        for (b, grad) in grads.into_iter().enumerate() {
            grad_predictions.index_axis_mut(Axis(0), b).assign(&grad);
        }
        grad_predictions
    }

    fn backward_sample(
        &self,
        predictions: &ArrayView3<f32>,
        trace: &RoutingTrace,
        grad_output: &ArrayView2<f32>,
    ) -> Array3<f32> {
        let (input_caps, output_caps, _) = predictions.dim();
        let iterations = trace.outputs.len();
        let mut grad_predictions = Array3::zeros(predictions.raw_dim());
        // dL/db pour l'itération suivante
        let mut grad_logits_next: Option<Array2<f32>> = None;

        for t in (0..iterations).rev() {
            let coupling = &trace.coupling[t];
            let weighted = &trace.pre_activations[t];
            let squashed = &trace.outputs[t];

            let mut grad_squashed = if t + 1 == iterations {
                grad_output.to_owned()
            } else {
                Array2::zeros(squashed.raw_dim())
            };

            // b(t+1)_ij = b(t)_ij + u_ij · v(t)_j
            if let Some(grad_next) = &grad_logits_next {
                for i in 0..input_caps {
                    for j in 0..output_caps {
                        let g = grad_next[[i, j]];
                        grad_squashed
                            .row_mut(j)
                            .scaled_add(g, &predictions.slice(s![i, j, ..]));
                        grad_predictions
                            .slice_mut(s![i, j, ..])
                            .scaled_add(g, &squashed.row(j));
                    }
                }
            }

            let mut grad_weighted = Array2::zeros(weighted.raw_dim());
            for j in 0..output_caps {
                grad_weighted
                    .row_mut(j)
                    .assign(&squash_backward(&weighted.row(j), &grad_squashed.row(j)));
            }

            let mut grad_coupling = Array2::zeros(coupling.raw_dim());
            for i in 0..input_caps {
                for j in 0..output_caps {
                    grad_predictions
                        .slice_mut(s![i, j, ..])
                        .scaled_add(coupling[[i, j]], &grad_weighted.row(j));
                    grad_coupling[[i, j]] = predictions.slice(s![i, j, ..]).dot(&grad_weighted.row(j));
                }
            }

            let mut grad_logits = softmax_backward(&coupling.view(), &grad_coupling.view());
            if let Some(grad_next) = grad_logits_next.take() {
                grad_logits += &grad_next;
            }
            grad_logits_next = Some(grad_logits);
        }

        grad_predictions
    }
}

/// Softmax sur l'axe des capsules de sortie
pub fn softmax_outputs(logits: &ArrayView2<f32>) -> Array2<f32> {
    let mut result = Array2::zeros(logits.raw_dim());
    for (i, row) in logits.outer_iter().enumerate() {
        // Max pour la stabilité numérique
        let max_val = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let exp_vals = row.mapv(|v| (v - max_val).exp());
        let exp_sum = exp_vals.sum();
        result.row_mut(i).assign(&(exp_vals / exp_sum));
    }
    result
}

fn softmax_backward(coupling: &ArrayView2<f32>, grad_coupling: &ArrayView2<f32>) -> Array2<f32> {
    let mut grad = Array2::zeros(coupling.raw_dim());
    for (i, (c_row, g_row)) in coupling.outer_iter().zip(grad_coupling.outer_iter()).enumerate() {
        let inner = c_row.dot(&g_row);
        for j in 0..c_row.len() {
            grad[[i, j]] = c_row[j] * (g_row[j] - inner);
        }
    }
    grad
}

/// s_j = Σ_i c_ij û_ij
fn weighted_sum(predictions: &ArrayView3<f32>, coupling: &ArrayView2<f32>) -> Array2<f32> {
    let (input_caps, output_caps, dim) = predictions.dim();
    let mut outputs = Array2::zeros((output_caps, dim));
    for i in 0..input_caps {
        for j in 0..output_caps {
            outputs
                .row_mut(j)
                .scaled_add(coupling[[i, j]], &predictions.slice(s![i, j, ..]));
        }
    }
    outputs
}
