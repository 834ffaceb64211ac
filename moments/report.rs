use crate::types::{
    ClassEstimate, ClassLayout, ClassMoments, ClassStatus, MomentEstimates, Normalization,
};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// The on-disk form keeps vectors and matrices as nested lists so the TOML
// stays readable by hand.

/// Statistics of one class as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassReport {
    pub name: String,
    pub status: ClassStatus,
    /// Sample count, or total membership weight for soft labels.
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariance: Option<Vec<Vec<f64>>>,
}

/// Self-contained artifact describing a finished estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentsReport {
    pub normalization: Normalization,
    pub pooled: bool,
    pub feature_names: Vec<String>,
    pub classes: Vec<ClassReport>,
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to read or write report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML report file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Report has {found} feature names but the statistics have {expected} features.")]
    MismatchedFeatureCount { expected: usize, found: usize },
    #[error("Report has {found} class {what} but the statistics have {expected} classes.")]
    MismatchedClassCount {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Class '{class}' is malformed: {reason}")]
    MalformedClass { class: String, reason: String },
}

fn matrix_to_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn rows_to_matrix(rows: &[Vec<f64>], n: usize, class: &str) -> Result<Array2<f64>, ReportError> {
    if rows.len() != n || rows.iter().any(|row| row.len() != n) {
        return Err(ReportError::MalformedClass {
            class: class.to_string(),
            reason: format!("covariance must be {n}x{n}"),
        });
    }
    Ok(Array2::from_shape_fn((n, n), |(i, j)| rows[i][j]))
}

impl MomentsReport {
    pub fn from_estimates(
        estimates: &MomentEstimates,
        feature_names: &[String],
    ) -> Result<Self, ReportError> {
        if feature_names.len() != estimates.n_features {
            return Err(ReportError::MismatchedFeatureCount {
                expected: estimates.n_features,
                found: feature_names.len(),
            });
        }
        let n_classes = estimates.classes.len();
        if estimates.layout.names.len() != n_classes {
            return Err(ReportError::MismatchedClassCount {
                what: "names",
                expected: n_classes,
                found: estimates.layout.names.len(),
            });
        }
        let priors = estimates.layout.priors.as_deref();
        if let Some(priors) = priors.filter(|priors| priors.len() != n_classes) {
            return Err(ReportError::MismatchedClassCount {
                what: "priors",
                expected: n_classes,
                found: priors.len(),
            });
        }
        let classes = estimates
            .classes
            .iter()
            .enumerate()
            .map(|(index, class)| ClassReport {
                name: estimates.layout.names[index].clone(),
                status: class.status(),
                weight: class.weight(),
                prior: priors.map(|priors| priors[index]),
                mean: class.mean().map(|mean| mean.to_vec()),
                covariance: class.covariance().map(|cov| matrix_to_rows(&cov.to_owned())),
            })
            .collect();

        Ok(Self {
            normalization: estimates.normalization,
            pooled: estimates.pooled,
            feature_names: feature_names.to_vec(),
            classes,
        })
    }

    /// Rebuilds the in-memory estimates, validating every dimension.
    pub fn to_estimates(&self) -> Result<MomentEstimates, ReportError> {
        let n = self.feature_names.len();
        let mut classes = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            let mean = match &class.mean {
                Some(mean) if mean.len() == n => Some(Array1::from_vec(mean.clone())),
                Some(_) => {
                    return Err(ReportError::MalformedClass {
                        class: class.name.clone(),
                        reason: format!("mean must have {n} entries"),
                    });
                }
                None => None,
            };
            let estimate = match (class.status, mean) {
                (ClassStatus::Empty, _) => ClassEstimate::Empty,
                (ClassStatus::Degenerate, Some(mean)) => ClassEstimate::Degenerate {
                    weight: class.weight,
                    mean,
                },
                (ClassStatus::Estimated, Some(mean)) => {
                    let covariance = match &class.covariance {
                        Some(rows) => Some(rows_to_matrix(rows, n, &class.name)?),
                        None => None,
                    };
                    ClassEstimate::Estimated(ClassMoments {
                        weight: class.weight,
                        mean,
                        covariance,
                    })
                }
                (_, None) => {
                    return Err(ReportError::MalformedClass {
                        class: class.name.clone(),
                        reason: "missing mean".to_string(),
                    });
                }
            };
            classes.push(estimate);
        }

        // Priors are all-or-nothing; a partial set cannot be represented.
        let priors = if self.classes.iter().all(|class| class.prior.is_none()) {
            None
        } else if let Some(missing) = self.classes.iter().find(|class| class.prior.is_none()) {
            return Err(ReportError::MalformedClass {
                class: missing.name.clone(),
                reason: "prior missing while other classes have one".to_string(),
            });
        } else {
            Some(self.classes.iter().filter_map(|class| class.prior).collect())
        };
        Ok(MomentEstimates {
            normalization: self.normalization,
            n_features: n,
            pooled: self.pooled,
            layout: ClassLayout {
                names: self.classes.iter().map(|class| class.name.clone()).collect(),
                priors,
            },
            classes,
        })
    }

    /// Saves the report to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a report from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let toml_string = fs::read_to_string(path)?;
        let report = toml::from_str(&toml_string)?;
        Ok(report)
    }
}
