use crate::types::{
    ClassEstimate, ClassMoments, EstimateOptions, MomentError, MomentEstimates, Normalization,
};
use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// How merged rows are bucketed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grouping {
    /// Every row lands in a single bucket and labels are ignored.
    Pooled,
    /// Rows are bucketed by hard label. With a declared count, labels above it
    /// are excluded; without one, buckets grow to the largest label seen.
    Classes(Option<usize>),
}

/// Running sums for one bucket, taken about a shift point `c` fixed by the
/// first row the bucket receives. The sums of `x - c` and `(x - c)(x - c)ᵀ`
/// are plain additions, so merging blocks in any partition yields the same
/// totals, and a large common offset in the data cancels before squaring.
#[derive(Clone, Debug)]
struct MomentSums {
    count: usize,
    shift: Option<Array1<f64>>,
    sum: Array1<f64>,
    outer: Array2<f64>,
}

impl MomentSums {
    fn new(n_features: usize) -> Self {
        Self {
            count: 0,
            shift: None,
            sum: Array1::zeros(n_features),
            outer: Array2::zeros((n_features, n_features)),
        }
    }

    fn add_rows(&mut self, rows: ArrayView2<'_, f64>) {
        if rows.nrows() == 0 {
            return;
        }
        let shift = self
            .shift
            .get_or_insert_with(|| rows.row(0).to_owned());
        let shifted = &rows - &*shift;
        self.count += rows.nrows();
        self.sum += &shifted.sum_axis(Axis(0));
        general_mat_mul(1.0, &shifted.t(), &shifted, 1.0, &mut self.outer);
    }

    fn finish(&self, options: &EstimateOptions) -> ClassEstimate {
        let shift = match &self.shift {
            Some(shift) if self.count > 0 => shift,
            _ => return ClassEstimate::Empty,
        };
        let count = self.count as f64;
        let shifted_mean = &self.sum / count;
        let mean = &shifted_mean + shift;
        if !options.covariances {
            return ClassEstimate::Estimated(ClassMoments {
                weight: count,
                mean,
                covariance: None,
            });
        }

        let scale = match options.normalization {
            Normalization::Biased => 1.0,
            Normalization::Unbiased if self.count == 1 => {
                return ClassEstimate::Degenerate {
                    weight: count,
                    mean,
                };
            }
            Normalization::Unbiased => count / (count - 1.0),
        };

        let mut covariance = &self.outer / count;
        covariance -= &outer_product(shifted_mean.view(), shifted_mean.view());
        if scale != 1.0 {
            covariance *= scale;
        }
        ClassEstimate::Estimated(ClassMoments {
            weight: count,
            mean,
            covariance: Some(covariance),
        })
    }
}

/// `a ⊗ b` as a dense matrix.
pub(crate) fn outer_product(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> Array2<f64> {
    let column = a.insert_axis(Axis(1));
    let row = b.insert_axis(Axis(0));
    column.dot(&row)
}

/// Per-class count, sum and sum of outer products, fed one block at a time.
#[derive(Clone, Debug)]
pub struct ClassAccumulator {
    grouping: Grouping,
    n_features: Option<usize>,
    buckets: Vec<MomentSums>,
    class_limit: Option<usize>,
    rows_merged: usize,
    rows_excluded: usize,
}

impl ClassAccumulator {
    /// `n_features` may be left open; the first merged block then fixes it.
    pub fn new(grouping: Grouping, n_features: Option<usize>) -> Self {
        let mut accumulator = Self {
            grouping,
            n_features,
            buckets: Vec::new(),
            class_limit: None,
            rows_merged: 0,
            rows_excluded: 0,
        };
        if let Some(k) = n_features {
            accumulator.ensure_buckets(accumulator.initial_buckets(), k);
        }
        accumulator
    }

    /// Fails any merge whose labels would grow the class count past `limit`.
    pub fn with_class_limit(mut self, limit: usize) -> Self {
        self.class_limit = Some(limit);
        self
    }

    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    pub fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    pub fn rows_merged(&self) -> usize {
        self.rows_merged
    }

    /// Rows skipped because their label was `0` or above the declared count.
    pub fn rows_excluded(&self) -> usize {
        self.rows_excluded
    }

    /// Number of classes `finish` will report.
    pub fn n_classes(&self) -> usize {
        match self.grouping {
            Grouping::Pooled => 1,
            Grouping::Classes(Some(declared)) => declared,
            Grouping::Classes(None) => self.buckets.len(),
        }
    }

    fn initial_buckets(&self) -> usize {
        match self.grouping {
            Grouping::Pooled => 1,
            Grouping::Classes(declared) => declared.unwrap_or(0),
        }
    }

    fn ensure_buckets(&mut self, wanted: usize, n_features: usize) {
        if self.buckets.len() < wanted {
            self.buckets
                .resize_with(wanted, || MomentSums::new(n_features));
        }
    }

    fn bind_features(&mut self, found: usize) -> Result<usize, MomentError> {
        match self.n_features {
            Some(expected) if expected != found => Err(MomentError::ShapeMismatch {
                context: "block feature columns",
                expected,
                found,
            }),
            Some(expected) => Ok(expected),
            None => {
                self.n_features = Some(found);
                self.ensure_buckets(self.initial_buckets(), found);
                Ok(found)
            }
        }
    }

    /// Adds a block of rows. `labels` is required for class grouping and
    /// ignored when pooled.
    pub fn merge(
        &mut self,
        block: ArrayView2<'_, f64>,
        labels: Option<ArrayView1<'_, u32>>,
    ) -> Result<(), MomentError> {
        let n_features = self.bind_features(block.ncols())?;
        let rows = block.nrows();

        match self.grouping {
            Grouping::Pooled => {
                self.buckets[0].add_rows(block);
            }
            Grouping::Classes(declared) => {
                let labels = labels.ok_or(MomentError::ShapeMismatch {
                    context: "block labels",
                    expected: rows,
                    found: 0,
                })?;
                if labels.len() != rows {
                    return Err(MomentError::ShapeMismatch {
                        context: "block labels",
                        expected: rows,
                        found: labels.len(),
                    });
                }

                let mut members: Vec<Vec<usize>> = Vec::new();
                for (row, &label) in labels.iter().enumerate() {
                    let class = label as usize;
                    let excluded = class == 0 || declared.is_some_and(|limit| class > limit);
                    if excluded {
                        self.rows_excluded += 1;
                        continue;
                    }
                    if let Some(limit) = self.class_limit.filter(|limit| class > *limit) {
                        return Err(MomentError::InvalidArgument(format!(
                            "label {label} at block row {} exceeds the limit of {limit} classes",
                            row + 1
                        )));
                    }
                    if members.len() < class {
                        members.resize_with(class, Vec::new);
                    }
                    members[class - 1].push(row);
                }

                self.ensure_buckets(members.len(), n_features);
                for (bucket, indices) in self.buckets.iter_mut().zip(&members) {
                    if indices.is_empty() {
                        continue;
                    }
                    let subset = block.select(Axis(0), indices);
                    bucket.add_rows(subset.view());
                }
            }
        }

        self.rows_merged += rows;
        Ok(())
    }

    /// Derives means and covariances from the running sums, consuming the
    /// accumulator.
    pub fn finish(self, options: &EstimateOptions) -> MomentEstimates {
        if self.rows_excluded > 0 {
            log::debug!(
                "{} of {} rows carried no usable class label and were excluded",
                self.rows_excluded,
                self.rows_merged
            );
        }
        let n_classes = self.n_classes();
        let mut classes: Vec<ClassEstimate> = self
            .buckets
            .iter()
            .take(n_classes)
            .map(|bucket| bucket.finish(options))
            .collect();
        classes.resize(n_classes, ClassEstimate::Empty);

        MomentEstimates::new(
            options.normalization,
            self.n_features.unwrap_or(0),
            self.grouping == Grouping::Pooled,
            classes,
        )
    }
}
