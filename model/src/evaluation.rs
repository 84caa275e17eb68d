use log::info;
use ndarray::Axis;
use serde::Serialize;

use crate::error::{CapsError, CapsResult};
use crate::model::core::{argmax_rows, CapsNet};
use crate::train_data::data_loader::{AugmentingDataset, BatchLoader};

/// Noms des classes dans l'ordre des étiquettes
pub const CLASS_NAMES: [&str; 2] = ["benign", "malignant"];

/// Métriques par classe : lignes de la matrice de confusion = vérité,
/// colonnes = prédiction
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub accuracy: f32,
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub f1_score: Vec<f32>,
    pub support: Vec<usize>,
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl Metrics {
    pub fn compute(predictions: &[usize], targets: &[usize], num_classes: usize) -> CapsResult<Self> {
        let confusion_matrix = confusion_matrix(predictions, targets, num_classes)?;
        let total = predictions.len();
        let correct = (0..num_classes).map(|c| confusion_matrix[c][c]).sum::<usize>();
        let accuracy = if total > 0 { correct as f32 / total as f32 } else { 0.0 };

        let mut precision = Vec::new();
        let mut recall = Vec::new();
        let mut f1_score = Vec::new();
        let mut support = Vec::new();

        for c in 0..num_classes {
            let tp = confusion_matrix[c][c] as f32;
            let fp: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion_matrix[i][c] as f32)
                .sum();
            let fn_: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion_matrix[c][i] as f32)
                .sum();

            let prec = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
            let rec = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
            let f1 = if prec + rec > 0.0 { 2.0 * prec * rec / (prec + rec) } else { 0.0 };

            precision.push(prec);
            recall.push(rec);
            f1_score.push(f1);
            support.push(confusion_matrix[c].iter().sum());
        }

        Ok(Self {
            accuracy,
            precision,
            recall,
            f1_score,
            support,
            confusion_matrix,
        })
    }
}

pub fn confusion_matrix(
    predictions: &[usize],
    targets: &[usize],
    num_classes: usize,
) -> CapsResult<Vec<Vec<usize>>> {
    if predictions.len() != targets.len() {
        return Err(CapsError::Numerical(format!(
            "{} prédictions pour {} cibles",
            predictions.len(),
            targets.len()
        )));
    }
    let mut confusion = vec![vec![0; num_classes]; num_classes];
    for (&pred, &truth) in predictions.iter().zip(targets) {
        if pred >= num_classes || truth >= num_classes {
            return Err(CapsError::Numerical(format!("classe hors limites ({truth}, {pred})")));
        }
        confusion[truth][pred] += 1;
    }
    Ok(confusion)
}

/// Courbe ROC de la classe positive
#[derive(Debug, Clone, Serialize)]
pub struct RocCurve {
    pub fpr: Vec<f32>,
    pub tpr: Vec<f32>,
    /// Seuils décroissants ; le premier (+∞) correspond au point (0, 0)
    pub thresholds: Vec<f32>,
    pub auc: f32,
}

/// ROC sur les seuils distincts ; NaN si une des deux classes est absente
pub fn roc_curve(scores: &[f32], targets: &[usize]) -> CapsResult<RocCurve> {
    if scores.len() != targets.len() {
        return Err(CapsError::Numerical(format!(
            "{} scores pour {} cibles",
            scores.len(),
            targets.len()
        )));
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let positives = targets.iter().filter(|&&t| t == 1).count() as f32;
    let negatives = targets.len() as f32 - positives;

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thresholds = vec![f32::INFINITY];
    let (mut tp, mut fp) = (0.0f32, 0.0f32);

    for (k, &i) in order.iter().enumerate() {
        if targets[i] == 1 {
            tp += 1.0;
        } else {
            fp += 1.0;
        }
        // Un point par seuil distinct
        let last_of_run = order
            .get(k + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_run {
            fpr.push(fp / negatives);
            tpr.push(tp / positives);
            thresholds.push(scores[i]);
        }
    }

    let auc = fpr
        .windows(2)
        .zip(tpr.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
        .sum();

    Ok(RocCurve {
        fpr,
        tpr,
        thresholds,
        auc,
    })
}

/// Résultats d'évaluation sur un jeu de validation
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    /// Métriques binaires (classe positive = maligne)
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub metrics: Metrics,
    pub roc: RocCurve,
    pub predictions: Vec<usize>,
    pub targets: Vec<usize>,
}

impl EvaluationReport {
    pub fn from_scores(malignant_scores: &[f32], targets: &[usize]) -> CapsResult<Self> {
        let predictions: Vec<usize> = malignant_scores.iter().map(|&p| usize::from(p > 0.5)).collect();
        Self::build(predictions, malignant_scores, targets)
    }

    fn build(predictions: Vec<usize>, malignant_scores: &[f32], targets: &[usize]) -> CapsResult<Self> {
        let metrics = Metrics::compute(&predictions, targets, CLASS_NAMES.len())?;
        let roc = roc_curve(malignant_scores, targets)?;
        Ok(Self {
            precision: metrics.precision[1],
            recall: metrics.recall[1],
            f1: metrics.f1_score[1],
            metrics,
            roc,
            predictions,
            targets: targets.to_vec(),
        })
    }

    pub fn confusion_matrix(&self) -> &[Vec<usize>] {
        &self.metrics.confusion_matrix
    }
}

/// Évaluation en mode inférence, batch par batch
pub struct Evaluator {
    loader: BatchLoader,
}

impl Evaluator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            loader: BatchLoader::new(batch_size),
        }
    }

    pub fn evaluate(&self, model: &CapsNet, dataset: &AugmentingDataset) -> CapsResult<EvaluationReport> {
        if dataset.is_empty() {
            return Err(CapsError::EmptyDataset("aucune donnée à évaluer".into()));
        }
        let order: Vec<usize> = (0..dataset.len()).collect();
        let mut predictions = Vec::with_capacity(dataset.len());
        let mut scores = Vec::with_capacity(dataset.len());
        let mut targets = Vec::with_capacity(dataset.len());

        for batch in self.loader.iter(dataset, &order, 0) {
            let batch = batch?;
            let probabilities = model.predict_proba(&batch.images.view())?;
            predictions.extend(argmax_rows(&probabilities.view()));
            scores.extend(probabilities.index_axis(Axis(1), 1).iter().copied());
            targets.extend_from_slice(&batch.labels);
        }

        let report = EvaluationReport::build(predictions, &scores, &targets)?;
        info!(
            "📊 Évaluation: précision {:.4}, rappel {:.4}, F1 {:.4}, AUC {:.4}",
            report.precision, report.recall, report.f1, report.roc.auc
        );
        Ok(report)
    }
}

/// Tableau précision / rappel / F1 / effectif par classe
pub fn classification_report(metrics: &Metrics, class_names: &[&str]) -> String {
    let width = class_names.iter().map(|n| n.len()).max().unwrap_or(0).max(12);
    let mut out = String::new();
    out.push_str(&format!(
        "{:>width$} {:>10} {:>10} {:>10} {:>10}\n",
        "", "precision", "recall", "f1-score", "support"
    ));
    out.push('\n');
    for (c, name) in class_names.iter().enumerate().take(metrics.precision.len()) {
        out.push_str(&format!(
            "{:>width$} {:>10.4} {:>10.4} {:>10.4} {:>10}\n",
            name, metrics.precision[c], metrics.recall[c], metrics.f1_score[c], metrics.support[c]
        ));
    }
    out.push('\n');

    let total: usize = metrics.support.iter().sum();
    out.push_str(&format!(
        "{:>width$} {:>10} {:>10} {:>10.4} {:>10}\n",
        "accuracy", "", "", metrics.accuracy, total
    ));
    let columns = [&metrics.precision, &metrics.recall, &metrics.f1_score];
    let k = metrics.precision.len().max(1) as f32;
    let macro_avg = columns.map(|values| values.iter().sum::<f32>() / k);
    let weighted_avg = columns.map(|values| {
        if total == 0 {
            return 0.0;
        }
        let weighted: f32 = values
            .iter()
            .zip(&metrics.support)
            .map(|(v, &s)| v * s as f32)
            .sum();
        weighted / total as f32
    });
    for (label, avg) in [("macro avg", macro_avg), ("weighted avg", weighted_avg)] {
        out.push_str(&format!(
            "{:>width$} {:>10.4} {:>10.4} {:>10.4} {:>10}\n",
            label, avg[0], avg[1], avg[2], total
        ));
    }
    out
}
