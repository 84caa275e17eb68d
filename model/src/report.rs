//! Figures de diagnostic (SVG via plotters)
//!
//! Le backend SVG n'a besoin d'aucune police système.

use log::info;
use plotters::coord::Shift;
use plotters::prelude::*;
use std::error::Error;
use std::path::{Path, PathBuf};

use crate::error::{CapsError, CapsResult};
use crate::evaluation::{EvaluationReport, RocCurve, CLASS_NAMES};
use crate::model::core::TrainingHistory;

pub const TRAINING_METRICS_FILE: &str = "training_metrics.svg";
pub const CONFUSION_MATRIX_FILE: &str = "confusion_matrix.svg";
pub const ROC_CURVE_FILE: &str = "roc_curve.svg";

type DrawResult = Result<(), Box<dyn Error>>;

/// Chemins des trois figures produites
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub training_metrics: PathBuf,
    pub confusion_matrix: PathBuf,
    pub roc_curve: PathBuf,
}

/// Écrit les trois figures dans `dir`
pub fn write_reports(dir: &Path, history: &TrainingHistory, evaluation: &EvaluationReport) -> CapsResult<ReportPaths> {
    std::fs::create_dir_all(dir)?;
    let paths = ReportPaths {
        training_metrics: dir.join(TRAINING_METRICS_FILE),
        confusion_matrix: dir.join(CONFUSION_MATRIX_FILE),
        roc_curve: dir.join(ROC_CURVE_FILE),
    };
    plot_training_history(&paths.training_metrics, history)?;
    plot_confusion_matrix(&paths.confusion_matrix, evaluation.confusion_matrix(), &CLASS_NAMES)?;
    plot_roc_curve(&paths.roc_curve, &evaluation.roc)?;
    info!("🖼️  Figures écrites dans {}", dir.display());
    Ok(paths)
}

pub fn plot_training_history(path: &Path, history: &TrainingHistory) -> CapsResult<()> {
    draw_training_history(path, history).map_err(CapsError::plot)
}

pub fn plot_confusion_matrix(path: &Path, matrix: &[Vec<usize>], class_names: &[&str]) -> CapsResult<()> {
    draw_confusion_matrix(path, matrix, class_names).map_err(CapsError::plot)
}

pub fn plot_roc_curve(path: &Path, roc: &RocCurve) -> CapsResult<()> {
    draw_roc_curve(path, roc).map_err(CapsError::plot)
}

fn value_range(series: &[&[f32]]) -> (f32, f32) {
    let (min, max) = series
        .iter()
        .flat_map(|s| s.iter())
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !min.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((max - min) * 0.1).max(1e-6);
    (min - pad, max + pad)
}

/// Un panneau : plusieurs courbes par époque
fn draw_panel(
    area: &DrawingArea<SVGBackend<'_>, Shift>,
    title: &str,
    epochs: usize,
    curves: &[(&str, &[f32], RGBColor)],
) -> DrawResult {
    let values: Vec<&[f32]> = curves.iter().map(|(_, v, _)| *v).collect();
    let (lo, hi) = value_range(&values);

    let mut chart = ChartBuilder::on(area)
        .caption(title, ("sans-serif", 18))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(0usize..epochs.max(2) - 1, lo..hi)?;
    chart.configure_mesh().x_desc("Époque").draw()?;

    for &(label, series, color) in curves {
        chart
            .draw_series(LineSeries::new(
                series.iter().enumerate().map(|(e, &v)| (e, v)),
                color.stroke_width(2),
            ))?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    Ok(())
}

fn draw_training_history(path: &Path, history: &TrainingHistory) -> DrawResult {
    let root = SVGBackend::new(path, (1500, 450)).into_drawing_area();
    root.fill(&WHITE)?;

    if history.is_empty() {
        root.draw(&Text::new(
            "Aucune époque",
            (750, 225),
            ("sans-serif", 20).into_font().color(&BLACK),
        ))?;
        root.present()?;
        return Ok(());
    }

    let panels = root.split_evenly((1, 3));
    let epochs = history.len();
    let (train_loss, val_loss) = (history.train_loss(), history.val_loss());
    let (train_acc, val_acc) = (history.train_accuracy(), history.val_accuracy());
    let learning_rate = history.learning_rate();

    draw_panel(
        &panels[0],
        "Perte",
        epochs,
        &[("train", train_loss.as_slice(), BLUE), ("validation", val_loss.as_slice(), RED)],
    )?;
    draw_panel(
        &panels[1],
        "Exactitude",
        epochs,
        &[("train", train_acc.as_slice(), BLUE), ("validation", val_acc.as_slice(), RED)],
    )?;
    draw_panel(
        &panels[2],
        "Taux d'apprentissage",
        epochs,
        &[("lr", learning_rate.as_slice(), GREEN)],
    )?;

    root.present()?;
    Ok(())
}

/// Dégradé blanc → bleu
fn heatmap_color(value: f64) -> RGBColor {
    let v = value.clamp(0.0, 1.0);
    RGBColor(
        (255.0 * (1.0 - 0.8 * v)) as u8,
        (255.0 * (1.0 - 0.6 * v)) as u8,
        255,
    )
}

fn draw_confusion_matrix(path: &Path, matrix: &[Vec<usize>], class_names: &[&str]) -> DrawResult {
    let root = SVGBackend::new(path, (600, 550)).into_drawing_area();
    root.fill(&WHITE)?;

    let n = matrix.len().max(1);
    let max_count = matrix.iter().flatten().copied().max().unwrap_or(0).max(1) as f64;
    let name = |i: usize| class_names.get(i).map_or_else(|| i.to_string(), |s| s.to_string());

    let mut chart = ChartBuilder::on(&root)
        .caption("Matrice de confusion", ("sans-serif", 22))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(100)
        .build_cartesian_2d(0f64..n as f64, 0f64..n as f64)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(n * 2 + 1)
        .y_labels(n * 2 + 1)
        .x_desc("Prédiction")
        .y_desc("Vérité")
        .x_label_formatter(&|x| cell_label(*x, n, &name, false))
        .y_label_formatter(&|y| cell_label(*y, n, &name, true))
        .draw()?;

    // La ligne 0 (vérité) est affichée en haut
    for (row, counts) in matrix.iter().enumerate() {
        for (col, &count) in counts.iter().enumerate() {
            let y = (n - 1 - row) as f64;
            let x = col as f64;
            chart.draw_series(std::iter::once(Rectangle::new(
                [(x, y), (x + 1.0, y + 1.0)],
                heatmap_color(count as f64 / max_count).filled(),
            )))?;
            chart.draw_series(std::iter::once(Text::new(
                count.to_string(),
                (x + 0.45, y + 0.55),
                ("sans-serif", 26).into_font().color(&BLACK),
            )))?;
        }
    }

    root.present()?;
    Ok(())
}

/// Libellé au centre d'une case, vide ailleurs
fn cell_label(coord: f64, n: usize, name: &dyn Fn(usize) -> String, flipped: bool) -> String {
    let shifted = coord - 0.5;
    let index = shifted.round();
    if (shifted - index).abs() > 1e-6 || index < 0.0 || index as usize >= n {
        return String::new();
    }
    let index = index as usize;
    name(if flipped { n - 1 - index } else { index })
}

fn draw_roc_curve(path: &Path, roc: &RocCurve) -> DrawResult {
    let root = SVGBackend::new(path, (600, 550)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Courbe ROC (classe maligne)", ("sans-serif", 22))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0f32..1f32, 0f32..1.02f32)?;
    chart
        .configure_mesh()
        .x_desc("Taux de faux positifs")
        .y_desc("Taux de vrais positifs")
        .draw()?;

    chart.draw_series(LineSeries::new(vec![(0.0, 0.0), (1.0, 1.0)], BLACK.mix(0.4)))?;

    let points: Vec<(f32, f32)> = roc
        .fpr
        .iter()
        .zip(&roc.tpr)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect();
    chart
        .draw_series(LineSeries::new(points, RED.stroke_width(2)))?
        .label(format!("AUC = {:.3}", roc.auc))
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::LowerRight)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}
