//! Probability calibration.
//!
//! Isotonic regression fitted with pool-adjacent-violators, evaluated as a
//! piecewise-linear curve through the pooled block means. The curve is
//! non-decreasing by construction, so `raw_a <= raw_b` always maps to
//! `cal_a <= cal_b`.

use serde::{Deserialize, Serialize};

const MIN_P: f64 = 0.001;
const MAX_P: f64 = 0.999;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicCurve {
    /// (raw threshold, calibrated probability), strictly increasing in x and
    /// non-decreasing in y.
    knots: Vec<(f64, f64)>,
}

impl IsotonicCurve {
    /// Fit on (raw score, outcome) pairs. Non-finite scores are ignored.
    /// Returns `None` when nothing usable remains.
    pub fn fit(samples: &[(f64, bool)]) -> Option<Self> {
        let mut sorted: Vec<(f64, f64)> = samples
            .iter()
            .filter(|(x, _)| x.is_finite())
            .map(|&(x, y)| (x, if y { 1.0 } else { 0.0 }))
            .collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Blocks of (sum_x, sum_y, weight). Ties in x share one block.
        let mut blocks: Vec<(f64, f64, f64)> = Vec::with_capacity(sorted.len());
        let mut last_x = f64::NAN;
        for (x, y) in sorted {
            match blocks.last_mut() {
                Some(b) if x == last_x => {
                    b.0 += x;
                    b.1 += y;
                    b.2 += 1.0;
                }
                _ => blocks.push((x, y, 1.0)),
            }
            last_x = x;
            // pool while the previous block mean exceeds the last one
            while blocks.len() > 1 {
                let n = blocks.len();
                let (prev, cur) = (blocks[n - 2], blocks[n - 1]);
                if prev.1 / prev.2 <= cur.1 / cur.2 {
                    break;
                }
                blocks.pop();
                blocks[n - 2] = (prev.0 + cur.0, prev.1 + cur.1, prev.2 + cur.2);
            }
        }

        let knots = blocks
            .into_iter()
            .map(|(sx, sy, w)| (sx / w, (sy / w).clamp(MIN_P, MAX_P)))
            .collect();
        Some(Self { knots })
    }

    pub fn knots(&self) -> &[(f64, f64)] {
        &self.knots
    }

    pub fn calibrate(&self, raw: f64) -> f64 {
        let (first, last) = match (self.knots.first(), self.knots.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return clamp_probability(raw),
        };
        if !raw.is_finite() {
            return 0.5;
        }
        if raw <= first.0 {
            return first.1;
        }
        if raw >= last.0 {
            return last.1;
        }
        let i = self.knots.partition_point(|(x, _)| *x < raw);
        let (x1, y1) = self.knots[i];
        let (x0, y0) = self.knots[i - 1];
        if x1 == x0 {
            return y1;
        }
        let ratio = (raw - x0) / (x1 - x0);
        (y0 + ratio * (y1 - y0)).clamp(MIN_P, MAX_P)
    }
}

pub fn clamp_probability(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(MIN_P, MAX_P)
    } else {
        0.5
    }
}
