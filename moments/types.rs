//! Shared vocabulary for the moment engine: normalization modes, group
//! assignments, per-class results and the error taxonomy.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;

/// Divisor applied to second-moment sums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Divide by `count - 1` (flag `0`).
    #[default]
    Unbiased,
    /// Divide by `count` (flag `1`).
    Biased,
}

impl Normalization {
    /// Interprets the legacy numeric selector: `0` is unbiased, `1` is biased.
    pub fn from_flag(flag: i64) -> Result<Self, MomentError> {
        match flag {
            0 => Ok(Self::Unbiased),
            1 => Ok(Self::Biased),
            other => Err(MomentError::InvalidArgument(format!(
                "normalization flag must be 0 or 1, got {other}"
            ))),
        }
    }

    pub fn flag(self) -> i64 {
        match self {
            Self::Unbiased => 0,
            Self::Biased => 1,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Unbiased => "unbiased (count - 1)",
            Self::Biased => "biased (count)",
        }
    }
}

/// How rows of a sample matrix map onto classes.
#[derive(Debug, Clone, Copy)]
pub enum GroupAssignment<'a> {
    /// All rows form a single pooled group.
    Unlabeled,
    /// One label per row. Label `i` in `1..=classes` selects class `i`;
    /// `0` and labels above `classes` exclude the row.
    Hard {
        labels: ArrayView1<'a, u32>,
        classes: usize,
    },
    /// Rows × classes matrix of non-negative membership weights.
    Soft(ArrayView2<'a, f64>),
}

impl<'a> GroupAssignment<'a> {
    /// Hard assignment whose class count is the largest label present.
    pub fn hard(labels: ArrayView1<'a, u32>) -> Self {
        let classes = labels.iter().copied().max().unwrap_or(0) as usize;
        Self::Hard { labels, classes }
    }

    pub fn hard_with_classes(labels: ArrayView1<'a, u32>, classes: usize) -> Self {
        Self::Hard { labels, classes }
    }

    /// Number of classes the result will report; `0` means pooled.
    pub fn n_classes(&self) -> usize {
        match self {
            Self::Unlabeled => 0,
            Self::Hard { classes, .. } => *classes,
            Self::Soft(weights) => weights.ncols(),
        }
    }
}

/// Largest class count either path will allocate for unless told otherwise.
pub const DEFAULT_MAX_CLASSES: usize = 65_536;

/// Options shared by the in-memory and chunked paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstimateOptions {
    pub normalization: Normalization,
    /// When false only means are computed.
    pub covariances: bool,
    /// Upper bound on the declared or inferred number of hard-label classes.
    pub max_classes: usize,
}

impl Default for EstimateOptions {
    fn default() -> Self {
        Self::new(Normalization::Unbiased)
    }
}

impl EstimateOptions {
    pub fn new(normalization: Normalization) -> Self {
        Self {
            normalization,
            covariances: true,
            max_classes: DEFAULT_MAX_CLASSES,
        }
    }

    pub fn means_only(normalization: Normalization) -> Self {
        Self {
            covariances: false,
            ..Self::new(normalization)
        }
    }

    pub fn with_max_classes(mut self, max_classes: usize) -> Self {
        self.max_classes = max_classes;
        self
    }

    /// Rejects class counts above `max_classes` before anything is allocated.
    pub fn check_class_count(&self, classes: usize) -> Result<(), MomentError> {
        if classes > self.max_classes {
            return Err(MomentError::InvalidArgument(format!(
                "{classes} classes exceed the limit of {}; check the label column for stray values",
                self.max_classes
            )));
        }
        Ok(())
    }
}

/// First and second moments of one class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMoments {
    /// Sample count for hard labels, total membership weight for soft labels.
    pub weight: f64,
    pub mean: Array1<f64>,
    pub covariance: Option<Array2<f64>>,
}

/// Per-class outcome. Absent and degenerate classes are explicit states so
/// that callers cannot mistake them for numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassEstimate {
    Estimated(ClassMoments),
    /// No sample was assigned to the class.
    Empty,
    /// Unbiased covariance was requested but the class holds a single
    /// effective sample, so `count - 1` is zero.
    Degenerate { weight: f64, mean: Array1<f64> },
}

impl ClassEstimate {
    pub fn mean(&self) -> Option<ArrayView1<'_, f64>> {
        match self {
            Self::Estimated(moments) => Some(moments.mean.view()),
            Self::Degenerate { mean, .. } => Some(mean.view()),
            Self::Empty => None,
        }
    }

    pub fn covariance(&self) -> Option<ArrayView2<'_, f64>> {
        match self {
            Self::Estimated(moments) => moments.covariance.as_ref().map(|cov| cov.view()),
            _ => None,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::Estimated(moments) => moments.weight,
            Self::Degenerate { weight, .. } => *weight,
            Self::Empty => 0.0,
        }
    }

    pub fn is_estimated(&self) -> bool {
        matches!(self, Self::Estimated(_))
    }

    pub fn status(&self) -> ClassStatus {
        match self {
            Self::Estimated(_) => ClassStatus::Estimated,
            Self::Empty => ClassStatus::Empty,
            Self::Degenerate { .. } => ClassStatus::Degenerate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassStatus {
    Estimated,
    Empty,
    Degenerate,
}

/// Class metadata carried alongside the statistics without interpretation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassLayout {
    pub names: Vec<String>,
    #[serde(default)]
    pub priors: Option<Vec<f64>>,
}

impl ClassLayout {
    /// Names `1..=classes`.
    pub fn numbered(classes: usize) -> Self {
        Self {
            names: (1..=classes).map(|label| label.to_string()).collect(),
            priors: None,
        }
    }

    /// The single entry of an unlabeled result.
    pub fn pooled() -> Self {
        Self {
            names: vec!["pooled".to_string()],
            priors: None,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Result of either estimation path.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentEstimates {
    pub normalization: Normalization,
    pub n_features: usize,
    /// True when the statistics describe one unlabeled pool.
    pub pooled: bool,
    pub layout: ClassLayout,
    pub classes: Vec<ClassEstimate>,
}

impl MomentEstimates {
    pub(crate) fn new(
        normalization: Normalization,
        n_features: usize,
        pooled: bool,
        classes: Vec<ClassEstimate>,
    ) -> Self {
        let layout = if pooled {
            ClassLayout::pooled()
        } else {
            ClassLayout::numbered(classes.len())
        };
        Self {
            normalization,
            n_features,
            pooled,
            layout,
            classes,
        }
    }

    /// Replaces the class names and priors. The layout must describe exactly
    /// as many classes as were estimated.
    pub fn with_layout(mut self, layout: ClassLayout) -> Result<Self, MomentError> {
        if layout.len() != self.classes.len() {
            return Err(MomentError::ShapeMismatch {
                context: "class layout",
                expected: self.classes.len(),
                found: layout.len(),
            });
        }
        if let Some(priors) = &layout.priors {
            if priors.len() != layout.len() {
                return Err(MomentError::ShapeMismatch {
                    context: "class priors",
                    expected: layout.len(),
                    found: priors.len(),
                });
            }
        }
        self.layout = layout;
        Ok(self)
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class(&self, index: usize) -> Option<&ClassEstimate> {
        self.classes.get(index)
    }

    pub fn has_covariances(&self) -> bool {
        self.classes.iter().any(|class| class.covariance().is_some())
    }

    /// Class-by-feature matrix of means; classes without a mean are NaN rows.
    pub fn mean_matrix(&self) -> Array2<f64> {
        let mut means = Array2::from_elem((self.classes.len(), self.n_features), f64::NAN);
        for (mut row, class) in means.axis_iter_mut(Axis(0)).zip(&self.classes) {
            if let Some(mean) = class.mean() {
                row.assign(&mean);
            }
        }
        means
    }

    /// Feature × feature × class tensor of covariances. Empty and degenerate
    /// classes are NaN slices. `None` when only means were requested.
    pub fn covariance_tensor(&self) -> Option<Array3<f64>> {
        if !self.has_covariances() {
            return None;
        }
        let k = self.n_features;
        let mut tensor = Array3::from_elem((k, k, self.classes.len()), f64::NAN);
        for (index, class) in self.classes.iter().enumerate() {
            if let Some(cov) = class.covariance() {
                tensor.index_axis_mut(Axis(2), index).assign(&cov);
            }
        }
        Some(tensor)
    }
}

/// Failures that abort an estimation. Per-class empty or degenerate states
/// are reported through [`ClassEstimate`] instead.
#[derive(Debug, Error)]
pub enum MomentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("block source error: {0}")]
    Source(Box<dyn Error + Send + Sync + 'static>),
}
