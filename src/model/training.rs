//! Candidate training: split, fit, calibrate, score.
//!
//! The classifier itself sits behind [`ClassifierTrainer`]; the default is a
//! standardized L2 logistic regression fitted by batch gradient descent.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::artifact::{CalibratorBlob, ClassifierBlob, LogisticModel, ModelArtifact};
use super::calibration::IsotonicCurve;
use super::corpus::TrainingExample;
use crate::error::TrainingError;

/// Held-out metrics recorded alongside an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    /// ROC AUC of the raw classifier score.
    pub auc: f64,
    /// Log-loss of the calibrated probability.
    pub log_loss: f64,
    pub brier: f64,
    pub holdout_rows: usize,
}

pub trait ClassifierTrainer: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(&self, version: u64, rows: &[Vec<f64>], labels: &[bool]) -> Result<ClassifierBlob, TrainingError>;
}

#[derive(Debug, Clone)]
pub struct LogisticTrainer {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl Default for LogisticTrainer {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 500,
            l2: 1e-3,
        }
    }
}

impl ClassifierTrainer for LogisticTrainer {
    fn name(&self) -> &'static str {
        "logistic"
    }

    fn fit(&self, version: u64, rows: &[Vec<f64>], labels: &[bool]) -> Result<ClassifierBlob, TrainingError> {
        let dim = check_rows(rows)?;
        if !labels.iter().any(|y| *y) || labels.iter().all(|y| *y) {
            return Err(TrainingError::SingleClass);
        }
        let n = rows.len() as f64;

        let mut means = vec![0.0; dim];
        for r in rows {
            for (m, v) in means.iter_mut().zip(r) {
                *m += v / n;
            }
        }
        let mut scales = vec![0.0; dim];
        for r in rows {
            for ((s, v), m) in scales.iter_mut().zip(r).zip(&means) {
                *s += (v - m).powi(2) / n;
            }
        }
        for s in scales.iter_mut() {
            *s = s.sqrt();
            // constant column: leave unscaled, its weight stays ~0
            if *s < 1e-9 {
                *s = 1.0;
            }
        }
        let z: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| r.iter().zip(&means).zip(&scales).map(|((v, m), s)| (v - m) / s).collect())
            .collect();

        let mut w = vec![0.0; dim];
        let mut b = 0.0;
        let mut grad = vec![0.0; dim];
        for _ in 0..self.epochs {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_b = 0.0;
            for (x, y) in z.iter().zip(labels) {
                let margin = b + x.iter().zip(&w).map(|(xi, wi)| xi * wi).sum::<f64>();
                let err = super::artifact::sigmoid(margin) - if *y { 1.0 } else { 0.0 };
                for (g, xi) in grad.iter_mut().zip(x) {
                    *g += err * xi;
                }
                grad_b += err;
            }
            for (wi, g) in w.iter_mut().zip(&grad) {
                *wi -= self.learning_rate * (g / n + self.l2 * *wi);
            }
            b -= self.learning_rate * grad_b / n;
        }

        Ok(ClassifierBlob::Logistic(LogisticModel {
            version,
            weights: w,
            bias: b,
            means,
            scales,
        }))
    }
}

fn check_rows(rows: &[Vec<f64>]) -> Result<usize, TrainingError> {
    let dim = rows.first().map(Vec::len).unwrap_or(0);
    for r in rows {
        if r.len() != dim {
            return Err(TrainingError::RaggedRows(dim, r.len()));
        }
    }
    Ok(dim)
}

#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub holdout_fraction: f64,
    pub min_rows: usize,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.2,
            min_rows: 50,
            seed: 42,
        }
    }
}

/// Train a classifier on one split, calibrate on the other and score the
/// result. The returned artifact is not yet published.
pub fn build_candidate(
    trainer: &dyn ClassifierTrainer,
    examples: &[TrainingExample],
    split: &SplitConfig,
    version: u64,
) -> Result<ModelArtifact, TrainingError> {
    if examples.len() < split.min_rows.max(2) {
        return Err(TrainingError::InsufficientData {
            rows: examples.len(),
            min: split.min_rows.max(2),
        });
    }
    let rows: Vec<Vec<f64>> = examples.iter().map(|e| e.features.clone()).collect();
    check_rows(&rows)?;

    let mut order: Vec<usize> = (0..examples.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(split.seed));
    let n_hold = ((examples.len() as f64 * split.holdout_fraction).round() as usize)
        .clamp(1, examples.len() - 1);
    let (hold_idx, train_idx) = order.split_at(n_hold);

    let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<bool>) {
        idx.iter().map(|&i| (rows[i].clone(), examples[i].radiant_win)).unzip()
    };
    let (train_x, train_y) = pick(train_idx);
    let (hold_x, hold_y) = pick(hold_idx);

    let classifier = trainer.fit(version, &train_x, &train_y)?;
    let mut raw = Vec::with_capacity(hold_x.len());
    for x in &hold_x {
        // dims were checked above; a failure here means the trainer is broken
        let s = classifier.score(x).map_err(|_| TrainingError::RaggedRows(classifier.input_dim(), x.len()))?;
        raw.push(s);
    }

    let pairs: Vec<(f64, bool)> = raw.iter().copied().zip(hold_y.iter().copied()).collect();
    let calibrator = match IsotonicCurve::fit(&pairs) {
        Some(curve) => CalibratorBlob::Isotonic { version, curve },
        None => CalibratorBlob::Identity { version },
    };
    let calibrated: Vec<f64> = raw.iter().map(|r| calibrator.map(*r)).collect();

    let metrics = ValidationMetrics {
        auc: roc_auc(&raw, &hold_y).unwrap_or(0.5),
        log_loss: log_loss(&calibrated, &hold_y),
        brier: brier(&calibrated, &hold_y),
        holdout_rows: hold_y.len(),
    };

    Ok(ModelArtifact {
        version,
        classifier,
        calibrator,
        trained_at: Utc::now(),
        training_rows: train_y.len(),
        validation_score: Some(metrics.auc),
        metrics: Some(metrics),
    })
}

/// Mann-Whitney ROC AUC with average ranks for ties. `None` if only one
/// class is present.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let pos = labels.iter().filter(|y| **y).count();
    let neg = labels.len() - pos;
    if pos == 0 || neg == 0 {
        return None;
    }
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    idx.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < idx.len() {
        let mut j = i;
        while j + 1 < idx.len() && scores[idx[j + 1]] == scores[idx[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for k in &idx[i..=j] {
            if labels[*k] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }
    let (p, n) = (pos as f64, neg as f64);
    Some((rank_sum_pos - p * (p + 1.0) / 2.0) / (p * n))
}

pub fn log_loss(probs: &[f64], labels: &[bool]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let sum: f64 = probs
        .iter()
        .zip(labels)
        .map(|(p, y)| {
            let p = p.clamp(1e-15, 1.0 - 1e-15);
            if *y { -p.ln() } else { -(1.0 - p).ln() }
        })
        .sum();
    sum / probs.len() as f64
}

pub fn brier(probs: &[f64], labels: &[bool]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let sum: f64 = probs
        .iter()
        .zip(labels)
        .map(|(p, y)| (p - if *y { 1.0 } else { 0.0 }).powi(2))
        .sum();
    sum / probs.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::types::MatchId;

    /// Radiant wins iff the first feature is positive, with a noisy second one.
    fn separable(n: usize) -> Vec<TrainingExample> {
        (0..n)
            .map(|i| {
                let lead = (i as f64 / n as f64) * 2.0 - 1.0;
                TrainingExample {
                    match_id: MatchId::new(format!("m{i}")),
                    features: vec![lead * 10_000.0, ((i * 7) % 5) as f64],
                    radiant_win: lead > 0.0,
                    collected_at: Utc::now(),
                }
            })
            .collect()
    }

    #[test]
    fn test_auc_known_values() {
        assert_eq!(roc_auc(&[0.1, 0.4, 0.35, 0.8], &[false, false, true, true]), Some(0.75));
        assert_eq!(roc_auc(&[0.5, 0.5], &[false, true]), Some(0.5));
        assert_eq!(roc_auc(&[0.1, 0.2], &[true, true]), None);
    }

    #[test]
    fn test_losses() {
        assert_eq!(brier(&[1.0, 0.0], &[true, false]), 0.0);
        assert!((brier(&[0.5], &[true]) - 0.25).abs() < 1e-12);
        assert!((log_loss(&[0.5], &[false]) - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn test_logistic_learns_direction() {
        let ex = separable(100);
        let rows: Vec<Vec<f64>> = ex.iter().map(|e| e.features.clone()).collect();
        let labels: Vec<bool> = ex.iter().map(|e| e.radiant_win).collect();
        let blob = LogisticTrainer::default().fit(3, &rows, &labels).unwrap();
        assert_eq!(blob.version(), 3);
        let hi = blob.score(&[8_000.0, 2.0]).unwrap();
        let lo = blob.score(&[-8_000.0, 2.0]).unwrap();
        assert!(hi > 0.8 && lo < 0.2, "hi={hi} lo={lo}");
    }

    #[test]
    fn test_single_class_rejected() {
        let rows = vec![vec![1.0], vec![2.0]];
        let err = LogisticTrainer::default().fit(1, &rows, &[true, true]).unwrap_err();
        assert!(matches!(err, TrainingError::SingleClass));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let mut ex = separable(60);
        ex[10].features.push(1.0);
        let err = build_candidate(&LogisticTrainer::default(), &ex, &SplitConfig::default(), 1).unwrap_err();
        assert!(matches!(err, TrainingError::RaggedRows(2, 3)));
    }

    #[test]
    fn test_candidate_is_scored_and_stamped() {
        let ex = separable(100);
        let split = SplitConfig::default();
        let a = build_candidate(&LogisticTrainer::default(), &ex, &split, 9).unwrap();
        assert!(a.is_consistent());
        assert_eq!(a.training_rows, 80);
        let m = a.metrics.unwrap();
        assert_eq!(m.holdout_rows, 20);
        assert!(a.validation_score.unwrap() > 0.9);
        // same seed, same split, same model
        let b = build_candidate(&LogisticTrainer::default(), &ex, &split, 9).unwrap();
        assert_eq!(a.classifier, b.classifier);
    }

    #[test]
    fn test_too_few_rows() {
        let split = SplitConfig { min_rows: 50, ..Default::default() };
        let err = build_candidate(&LogisticTrainer::default(), &separable(10), &split, 1).unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientData { rows: 10, min: 50 }));
    }
}
