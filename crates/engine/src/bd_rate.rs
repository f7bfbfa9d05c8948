//! Bjøntegaard-Delta bitrate (BD-Rate) calculation
//!
//! Fits a cubic log-bitrate curve `log10(kbps) = f(metric)` through each codec's
//! RD points, integrates both fits over the metric range they share, and turns
//! the difference of the average log-bitrates into a percentage.
//!
//! A negative result means the comparison codec needs less bitrate than the
//! reference codec for the same quality.

use crate::config::Metric;
use crate::rd::{CodecResult, MIN_BD_RATE_POINTS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Relative distance under which two metric values count as the same x
const DUPLICATE_TOLERANCE: f64 = 1e-12;

/// Why a BD-Rate could not be computed for one metric
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BdRateError {
    #[error("{codec} has {usable} usable {metric} points, at least 4 required")]
    InsufficientData {
        codec: String,
        metric: Metric,
        usable: usize,
    },

    #[error("{codec} reports {metric} = {value} for more than one point")]
    NonMonotonicMetric {
        codec: String,
        metric: Metric,
        value: f64,
    },

    #[error("{metric} ranges do not overlap ({low} >= {high})")]
    NoOverlap { metric: Metric, low: f64, high: f64 },

    #[error("{codec} {metric} curve could not be fitted")]
    DegenerateFit { codec: String, metric: Metric },
}

impl BdRateError {
    /// Failure class, independent of which curve triggered it
    pub fn kind(&self) -> &'static str {
        match self {
            BdRateError::InsufficientData { .. } => "insufficient_data",
            BdRateError::NonMonotonicMetric { .. } => "non_monotonic_metric",
            BdRateError::NoOverlap { .. } => "no_overlap",
            BdRateError::DegenerateFit { .. } => "degenerate_fit",
        }
    }
}

/// BD-Rate comparison of two codecs, one entry per requested metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BdRateResult {
    pub reference_codec: String,
    pub comparison_codec: String,
    /// Percent bitrate delta of the comparison codec against the reference
    pub per_metric: BTreeMap<Metric, f64>,
    pub failures: BTreeMap<Metric, BdRateError>,
}

/// Key under which a comparison is stored in job results
pub fn pair_key(reference: &str, comparison: &str) -> String {
    format!("{}_vs_{}", comparison, reference)
}

/// Compare two codecs on every requested metric
///
/// Each metric is computed independently; a failure on one does not affect
/// the others.
pub fn compare(
    reference: &CodecResult,
    comparison: &CodecResult,
    metrics: &BTreeSet<Metric>,
) -> BdRateResult {
    let mut per_metric = BTreeMap::new();
    let mut failures = BTreeMap::new();

    for &metric in metrics {
        match compute(reference, comparison, metric) {
            Ok(delta) => {
                per_metric.insert(metric, delta);
            }
            Err(e) => {
                failures.insert(metric, e);
            }
        }
    }

    BdRateResult {
        reference_codec: reference.codec_id.clone(),
        comparison_codec: comparison.codec_id.clone(),
        per_metric,
        failures,
    }
}

/// Percent bitrate delta of `curve_b` relative to `curve_a` for one metric
pub fn compute(
    curve_a: &CodecResult,
    curve_b: &CodecResult,
    metric: Metric,
) -> Result<f64, BdRateError> {
    let mut pairs_a = usable_pairs(curve_a, metric);
    let mut pairs_b = usable_pairs(curve_b, metric);

    // Each stage checks both curves before the next stage runs, so swapping
    // the curves never changes which failure is reported.
    require_points(curve_a, metric, &pairs_a)?;
    require_points(curve_b, metric, &pairs_b)?;

    sort_distinct(curve_a, metric, &mut pairs_a)?;
    sort_distinct(curve_b, metric, &mut pairs_b)?;

    let low = pairs_a[0].0.max(pairs_b[0].0);
    let high = pairs_a[pairs_a.len() - 1].0.min(pairs_b[pairs_b.len() - 1].0);
    if low >= high {
        return Err(BdRateError::NoOverlap { metric, low, high });
    }

    let fit_a = Cubic::fit(&pairs_a).ok_or_else(|| BdRateError::DegenerateFit {
        codec: curve_a.codec_id.clone(),
        metric,
    })?;
    let fit_b = Cubic::fit(&pairs_b).ok_or_else(|| BdRateError::DegenerateFit {
        codec: curve_b.codec_id.clone(),
        metric,
    })?;

    let avg_a = fit_a.average(low, high);
    let avg_b = fit_b.average(low, high);

    Ok((10f64.powf(avg_b - avg_a) - 1.0) * 100.0)
}

/// (metric value, log10 bitrate) pairs for points carrying the metric
fn usable_pairs(curve: &CodecResult, metric: Metric) -> Vec<(f64, f64)> {
    curve
        .points
        .iter()
        .filter_map(|p| {
            let x = p.metric(metric)?;
            if x.is_finite() && p.bitrate_kbps.is_finite() && p.bitrate_kbps > 0.0 {
                Some((x, p.bitrate_kbps.log10()))
            } else {
                None
            }
        })
        .collect()
}

fn require_points(
    curve: &CodecResult,
    metric: Metric,
    pairs: &[(f64, f64)],
) -> Result<(), BdRateError> {
    if pairs.len() < MIN_BD_RATE_POINTS {
        return Err(BdRateError::InsufficientData {
            codec: curve.codec_id.clone(),
            metric,
            usable: pairs.len(),
        });
    }
    Ok(())
}

fn sort_distinct(
    curve: &CodecResult,
    metric: Metric,
    pairs: &mut [(f64, f64)],
) -> Result<(), BdRateError> {
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    for window in pairs.windows(2) {
        let (a, b) = (window[0].0, window[1].0);
        let scale = a.abs().max(b.abs()).max(1.0);
        if (b - a).abs() <= DUPLICATE_TOLERANCE * scale {
            return Err(BdRateError::NonMonotonicMetric {
                codec: curve.codec_id.clone(),
                metric,
                value: a,
            });
        }
    }
    Ok(())
}

/// Cubic polynomial in the normalized variable `t = (x - center) / scale`
#[derive(Debug, Clone, PartialEq)]
struct Cubic {
    coeffs: [f64; 4],
    center: f64,
    scale: f64,
}

impl Cubic {
    /// Interpolate exactly through four points, least-squares through more
    ///
    /// `pairs` must hold at least four distinct x values.
    fn fit(pairs: &[(f64, f64)]) -> Option<Self> {
        let n = pairs.len() as f64;
        let center = pairs.iter().map(|p| p.0).sum::<f64>() / n;
        let scale = pairs
            .iter()
            .map(|p| (p.0 - center).abs())
            .fold(0.0, f64::max);
        if scale == 0.0 {
            return None;
        }

        let rows: Vec<[f64; 4]> = pairs
            .iter()
            .map(|p| {
                let t = (p.0 - center) / scale;
                [1.0, t, t * t, t * t * t]
            })
            .collect();

        let (matrix, rhs) = if pairs.len() == 4 {
            let mut matrix = [[0.0; 4]; 4];
            let mut rhs = [0.0; 4];
            for (i, row) in rows.iter().enumerate() {
                matrix[i] = *row;
                rhs[i] = pairs[i].1;
            }
            (matrix, rhs)
        } else {
            // Normal equations: (V^T V) c = V^T y
            let mut matrix = [[0.0; 4]; 4];
            let mut rhs = [0.0; 4];
            for (row, pair) in rows.iter().zip(pairs) {
                for i in 0..4 {
                    rhs[i] += row[i] * pair.1;
                    for j in 0..4 {
                        matrix[i][j] += row[i] * row[j];
                    }
                }
            }
            (matrix, rhs)
        };

        let coeffs = solve4(matrix, rhs)?;
        Some(Self {
            coeffs,
            center,
            scale,
        })
    }

    /// Antiderivative of the polynomial in `t`
    fn antiderivative(&self, t: f64) -> f64 {
        let [c0, c1, c2, c3] = self.coeffs;
        t * (c0 + t * (c1 / 2.0 + t * (c2 / 3.0 + t * c3 / 4.0)))
    }

    /// Mean of f(x) over [low, high]
    fn average(&self, low: f64, high: f64) -> f64 {
        let t_low = (low - self.center) / self.scale;
        let t_high = (high - self.center) / self.scale;
        (self.antiderivative(t_high) - self.antiderivative(t_low)) / (t_high - t_low)
    }
}

/// Gaussian elimination with partial pivoting
fn solve4(mut a: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < f64::MIN_POSITIVE {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..4 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; 4];
    for row in (0..4).rev() {
        let tail: f64 = ((row + 1)..4).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }

    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}
