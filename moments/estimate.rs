//! # Closed-form class moments
//!
//! Computes per-class means and covariances from a sample matrix that is
//! fully resident in memory. Hard labels and the unlabeled pool use the
//! centered two-pass formula on the selected rows. Soft labels use a
//! weighted decomposition:
//!
//! 1. Rescale the class weights `g` to mean one.
//! 2. Weighted mean `μ` is the average over all rows of `x ⊙ g`.
//! 3. Auxiliary mean `u` is the average of `x ⊙ √g`.
//! 4. `G0` is the biased covariance of the rows `x ⊙ √g`.
//! 5. The weighted covariance is `G0 - μμᵀ + uuᵀ`.
//! 6. Only then is the unbiased correction applied.
//!
//! The correction in step 6 must come last because the `μμᵀ` and `uuᵀ`
//! terms are already expressed on the biased scale.

use crate::accumulate::outer_product;
use crate::types::{
    ClassEstimate, ClassMoments, EstimateOptions, GroupAssignment, MomentError, MomentEstimates,
    Normalization,
};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// Class counts at or above this are estimated on the rayon pool.
const PARALLEL_CLASS_THRESHOLD: usize = 8;

/// Estimates per-class means (and covariances unless disabled) for an
/// in-memory sample matrix.
pub fn estimate(
    samples: ArrayView2<'_, f64>,
    assignment: &GroupAssignment<'_>,
    options: &EstimateOptions,
) -> Result<MomentEstimates, MomentError> {
    let (n_rows, n_features) = samples.dim();

    match *assignment {
        GroupAssignment::Unlabeled => {
            log::info!(
                "Estimating pooled moments over {n_rows} samples and {n_features} features ({})",
                options.normalization.describe()
            );
            let pooled = subset_moments(samples, options);
            Ok(MomentEstimates::new(
                options.normalization,
                n_features,
                true,
                vec![pooled],
            ))
        }
        GroupAssignment::Hard { labels, classes } => {
            if labels.len() != n_rows {
                return Err(MomentError::ShapeMismatch {
                    context: "hard labels",
                    expected: n_rows,
                    found: labels.len(),
                });
            }
            options.check_class_count(classes)?;
            log::info!(
                "Estimating moments for {classes} classes over {n_rows} samples ({})",
                options.normalization.describe()
            );

            let members = group_rows(labels, classes);
            let estimates = map_classes(classes, |class| {
                let indices = &members[class];
                if indices.is_empty() {
                    return ClassEstimate::Empty;
                }
                let subset = samples.select(Axis(0), indices);
                subset_moments(subset.view(), options)
            });
            Ok(MomentEstimates::new(
                options.normalization,
                n_features,
                false,
                estimates,
            ))
        }
        GroupAssignment::Soft(weights) => {
            if weights.nrows() != n_rows {
                return Err(MomentError::ShapeMismatch {
                    context: "soft label weights",
                    expected: n_rows,
                    found: weights.nrows(),
                });
            }
            if weights.ncols() == 0 {
                log::warn!(
                    "Soft label matrix has no target columns; falling back to pooled moments"
                );
                return estimate(samples, &GroupAssignment::Unlabeled, options);
            }
            validate_weights(weights)?;
            log::info!(
                "Estimating weighted moments for {} classes over {n_rows} samples ({})",
                weights.ncols(),
                options.normalization.describe()
            );

            let estimates = map_classes(weights.ncols(), |class| {
                weighted_moments(samples, weights.column(class), options)
            });
            Ok(MomentEstimates::new(
                options.normalization,
                n_features,
                false,
                estimates,
            ))
        }
    }
}

/// Row indices per class, in row order. Label `0` and labels above
/// `classes` are dropped.
fn group_rows(labels: ArrayView1<'_, u32>, classes: usize) -> Vec<Vec<usize>> {
    let mut members = vec![Vec::new(); classes];
    let mut excluded = 0usize;
    for (row, &label) in labels.iter().enumerate() {
        match (label as usize).checked_sub(1) {
            Some(class) if class < classes => members[class].push(row),
            _ => excluded += 1,
        }
    }
    if excluded > 0 {
        log::debug!("{excluded} rows carried no usable class label and were excluded");
    }
    members
}

fn map_classes<F>(n_classes: usize, per_class: F) -> Vec<ClassEstimate>
where
    F: Fn(usize) -> ClassEstimate + Sync + Send,
{
    let use_parallel =
        n_classes >= PARALLEL_CLASS_THRESHOLD && rayon::current_num_threads() > 1;
    if use_parallel {
        (0..n_classes).into_par_iter().map(&per_class).collect()
    } else {
        (0..n_classes).map(per_class).collect()
    }
}

/// Mean and centered covariance of every row in `rows`.
fn subset_moments(rows: ArrayView2<'_, f64>, options: &EstimateOptions) -> ClassEstimate {
    let count = rows.nrows();
    let mean = match rows.mean_axis(Axis(0)) {
        Some(mean) if count > 0 => mean,
        _ => return ClassEstimate::Empty,
    };
    let weight = count as f64;
    if !options.covariances {
        return ClassEstimate::Estimated(ClassMoments {
            weight,
            mean,
            covariance: None,
        });
    }

    let denominator = match options.normalization {
        Normalization::Biased => weight,
        Normalization::Unbiased if count == 1 => {
            return ClassEstimate::Degenerate { weight, mean };
        }
        Normalization::Unbiased => weight - 1.0,
    };

    let centered = &rows - &mean;
    let covariance = centered.t().dot(&centered) / denominator;
    ClassEstimate::Estimated(ClassMoments {
        weight,
        mean,
        covariance: Some(covariance),
    })
}

fn validate_weights(weights: ArrayView2<'_, f64>) -> Result<(), MomentError> {
    for ((row, col), &weight) in weights.indexed_iter() {
        if !weight.is_finite() || weight < 0.0 {
            return Err(MomentError::InvalidArgument(format!(
                "soft label weight at row {}, class {} must be finite and non-negative, got {weight}",
                row + 1,
                col + 1
            )));
        }
    }
    Ok(())
}

/// Weighted mean and covariance of all rows under the class weights `raw`.
fn weighted_moments(
    samples: ArrayView2<'_, f64>,
    raw: ArrayView1<'_, f64>,
    options: &EstimateOptions,
) -> ClassEstimate {
    let n_rows = samples.nrows();
    let total = raw.sum();
    if n_rows == 0 || total <= 0.0 {
        return ClassEstimate::Empty;
    }
    let m = n_rows as f64;

    // Mean-one weights: g = raw / mean(raw).
    let g: Array1<f64> = &raw * (m / total);
    let weighted = &samples * &g.view().insert_axis(Axis(1));
    let mean = weighted.sum_axis(Axis(0)) / m;
    if !options.covariances {
        return ClassEstimate::Estimated(ClassMoments {
            weight: total,
            mean,
            covariance: None,
        });
    }

    let root = g.mapv(f64::sqrt);
    let scaled = &samples * &root.view().insert_axis(Axis(1));
    let aux = scaled.sum_axis(Axis(0)) / m;
    let centered = &scaled - &aux;
    let mut covariance = centered.t().dot(&centered) / m;
    covariance -= &outer_product(mean.view(), mean.view());
    covariance += &outer_product(aux.view(), aux.view());

    if options.normalization == Normalization::Unbiased {
        let support = raw.iter().filter(|&&w| w > 0.0).count();
        if support < 2 {
            return ClassEstimate::Degenerate {
                weight: total,
                mean,
            };
        }
        // Reliability-weight correction V1² / (V1² - V2); V1 = Σg = m.
        let v1_sq = m * m;
        let v2 = g.dot(&g);
        covariance *= v1_sq / (v1_sq - v2);
    }

    ClassEstimate::Estimated(ClassMoments {
        weight: total,
        mean,
        covariance: Some(covariance),
    })
}
