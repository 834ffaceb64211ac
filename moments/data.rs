//! # Tabular Input
//!
//! Reads tab-separated files with a header row into the `ndarray`
//! structures used by the estimators. Two entry points share one schema:
//!
//! - [`load_table`] materializes the whole file through the `polars` CSV
//!   reader, refusing files longer than a caller-supplied row limit.
//! - [`TsvBlockSource`] streams the same file a block of rows at a time for
//!   the chunked path.
//!
//! Feature columns default to every column not used for labels. All values
//! must be present, numeric and finite; hard labels must be non-negative
//! integers, with `0` meaning "unlabeled".

use crate::chunked::{LabelKind, SampleBlock, SampleBlockSource, SourceShape};
use crate::types::{ClassLayout, GroupAssignment};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Which columns carry class membership.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LabelColumns {
    #[default]
    None,
    /// One integer label column.
    Hard(String),
    /// One weight column per class.
    Soft(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableSchema {
    /// Feature columns in output order. Empty selects every non-label column.
    pub features: Vec<String>,
    pub labels: LabelColumns,
}

impl TableSchema {
    fn label_column_names(&self) -> Vec<&str> {
        match &self.labels {
            LabelColumns::None => Vec::new(),
            LabelColumns::Hard(name) => vec![name.as_str()],
            LabelColumns::Soft(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// Resolves the feature list against the header of a file.
    fn resolve_features(&self, header: &[String]) -> Result<Vec<String>, DataError> {
        let features: Vec<String> = if self.features.is_empty() {
            let labels = self.label_column_names();
            header
                .iter()
                .filter(|name| !labels.contains(&name.as_str()))
                .cloned()
                .collect()
        } else {
            self.features.clone()
        };
        if features.is_empty() {
            return Err(DataError::NoFeatureColumns);
        }
        Ok(features)
    }
}

/// Class membership as loaded from the file.
#[derive(Debug, Clone, PartialEq)]
pub enum TableLabels {
    None,
    Hard(Array1<u32>),
    Soft {
        columns: Vec<String>,
        weights: Array2<f64>,
    },
}

/// A fully materialized, validated table.
#[derive(Debug, Clone)]
pub struct LabeledTable {
    /// Shape: [n_rows, n_features].
    pub samples: Array2<f64>,
    pub feature_names: Vec<String>,
    pub labels: TableLabels,
}

impl LabeledTable {
    pub fn n_rows(&self) -> usize {
        self.samples.nrows()
    }

    /// Group assignment for the estimator. `classes` overrides the class
    /// count inferred from hard labels and is ignored otherwise.
    pub fn assignment(&self, classes: Option<usize>) -> GroupAssignment<'_> {
        match &self.labels {
            TableLabels::None => GroupAssignment::Unlabeled,
            TableLabels::Hard(labels) => match classes {
                Some(classes) => GroupAssignment::hard_with_classes(labels.view(), classes),
                None => GroupAssignment::hard(labels.view()),
            },
            TableLabels::Soft { weights, .. } => GroupAssignment::Soft(weights.view()),
        }
    }

    /// Class names matching [`Self::assignment`]. Soft classes are named
    /// after their weight columns.
    pub fn class_layout(&self, classes: Option<usize>) -> ClassLayout {
        match &self.labels {
            TableLabels::None => ClassLayout::pooled(),
            TableLabels::Soft { columns, .. } if columns.is_empty() => ClassLayout::pooled(),
            TableLabels::Soft { columns, .. } => ClassLayout {
                names: columns.clone(),
                priors: None,
            },
            TableLabels::Hard(_) => ClassLayout::numbered(self.assignment(classes).n_classes()),
        }
    }
}

/// Errors raised while reading or validating tabular input.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error while streaming the input file: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error(
        "Invalid class label '{value}' in column '{column}' at data row {row}; labels must be non-negative integers."
    )]
    InvalidLabel {
        column: String,
        row: usize,
        value: String,
    },
    #[error("No feature columns remain after removing the label columns.")]
    NoFeatureColumns,
    #[error(
        "Input has more than {limit} rows, which exceeds the in-memory limit. Use the chunked path instead."
    )]
    TooManyRows { limit: usize },
    #[error("Malformed record at line {line}: {message}")]
    MalformedRecord { line: usize, message: String },
}

fn label_from_value(value: f64) -> Option<u32> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Some(value as u32)
    } else {
        None
    }
}

/// Loads and validates a whole table. Files with more than `max_rows` data
/// rows are rejected without reading past the limit.
pub fn load_table(
    path: &Path,
    schema: &TableSchema,
    max_rows: usize,
) -> Result<LabeledTable, DataError> {
    internal::load_table(path, schema, max_rows)
}

mod internal {
    use super::*;

    fn validate_is_finite(values: &[f64], column_name: &str) -> Result<(), DataError> {
        if values.iter().any(|&v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(())
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        Ok(values)
    }

    fn extract_label_column(df: &DataFrame, column_name: &str) -> Result<Vec<u32>, DataError> {
        let values = extract_numeric_column(df, column_name)?;
        values
            .iter()
            .enumerate()
            .map(|(row, &value)| {
                label_from_value(value).ok_or_else(|| DataError::InvalidLabel {
                    column: column_name.to_string(),
                    row: row + 1,
                    value: value.to_string(),
                })
            })
            .collect()
    }

    pub(super) fn load_table(
        path: &Path,
        schema: &TableSchema,
        max_rows: usize,
    ) -> Result<LabeledTable, DataError> {
        log::info!("Loading table from '{}'", path.display());

        // One row past the limit is enough to detect an oversized file.
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_n_rows(Some(max_rows.saturating_add(1)))
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        if df.height() > max_rows {
            return Err(DataError::TooManyRows { limit: max_rows });
        }

        let header: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let features = schema.resolve_features(&header)?;
        for name in features.iter().map(String::as_str).chain(schema.label_column_names()) {
            if !header.iter().any(|column| column == name) {
                return Err(DataError::ColumnNotFound(name.to_string()));
            }
        }

        let n_rows = df.height();
        let mut samples = Array2::zeros((n_rows, features.len()));
        for (index, name) in features.iter().enumerate() {
            let column = extract_numeric_column(&df, name)?;
            validate_is_finite(&column, name)?;
            samples
                .column_mut(index)
                .assign(&Array1::from_vec(column));
        }

        let labels = match &schema.labels {
            LabelColumns::None => TableLabels::None,
            LabelColumns::Hard(name) => {
                TableLabels::Hard(Array1::from_vec(extract_label_column(&df, name)?))
            }
            LabelColumns::Soft(names) => {
                let mut weights = Array2::zeros((n_rows, names.len()));
                for (index, name) in names.iter().enumerate() {
                    let column = extract_numeric_column(&df, name)?;
                    validate_is_finite(&column, name)?;
                    if let Some((row, value)) =
                        column.iter().enumerate().find(|(_, value)| **value < 0.0)
                    {
                        return Err(DataError::ColumnWrongType {
                            column_name: name.clone(),
                            expected_type: "non-negative f64 values",
                            found_type: format!("negative value {value} at row {}", row + 1),
                        });
                    }
                    weights.column_mut(index).assign(&Array1::from_vec(column));
                }
                TableLabels::Soft {
                    columns: names.clone(),
                    weights,
                }
            }
        };

        log::info!(
            "Loaded {n_rows} rows with {} feature columns",
            features.len()
        );
        Ok(LabeledTable {
            samples,
            feature_names: features,
            labels,
        })
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<File>, DataError> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?)
}

/// Streams a tab-separated table as row blocks.
pub struct TsvBlockSource {
    path: PathBuf,
    reader: csv::Reader<File>,
    record: csv::StringRecord,
    feature_names: Vec<String>,
    feature_indices: Vec<usize>,
    label_column: Option<(usize, String)>,
    label_kind: LabelKind,
    classes: Option<usize>,
    line: usize,
}

impl TsvBlockSource {
    pub fn open(path: &Path, schema: &TableSchema) -> Result<Self, DataError> {
        let mut reader = open_reader(path)?;
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let position = |name: &str| {
            header
                .iter()
                .position(|column| column == name)
                .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
        };

        let feature_names = schema.resolve_features(&header)?;
        let feature_indices = feature_names
            .iter()
            .map(|name| position(name))
            .collect::<Result<Vec<_>, _>>()?;
        let (label_column, label_kind) = match &schema.labels {
            LabelColumns::None => (None, LabelKind::Unlabeled),
            LabelColumns::Hard(name) => (Some((position(name)?, name.clone())), LabelKind::Hard),
            LabelColumns::Soft(names) => {
                for name in names {
                    position(name)?;
                }
                (None, LabelKind::Soft)
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            record: csv::StringRecord::new(),
            feature_names,
            feature_indices,
            label_column,
            label_kind,
            classes: None,
            line: 1,
        })
    }

    /// Declares the class count so classes missing from the file are reported.
    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = Some(classes);
        self
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn field(&self, index: usize) -> Result<&str, DataError> {
        self.record
            .get(index)
            .map(str::trim)
            .ok_or_else(|| DataError::MalformedRecord {
                line: self.line,
                message: format!("missing field {}", index + 1),
            })
    }
}

impl SampleBlockSource for TsvBlockSource {
    type Error = DataError;

    fn shape_hint(&self) -> SourceShape {
        SourceShape {
            rows: None,
            classes: self.classes,
            features: Some(self.feature_indices.len()),
            labels: self.label_kind,
        }
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.reader = open_reader(&self.path)?;
        self.line = 1;
        Ok(())
    }

    fn next_block(&mut self, max_rows: usize) -> Result<Option<SampleBlock>, Self::Error> {
        let n_features = self.feature_indices.len();
        let mut values = Vec::with_capacity(max_rows.min(1 << 16) * n_features);
        let mut labels = Vec::new();
        let mut rows = 0usize;

        while rows < max_rows && self.reader.read_record(&mut self.record)? {
            self.line += 1;
            for (position, &index) in self.feature_indices.iter().enumerate() {
                let text = self.field(index)?;
                let value: f64 = text.parse().map_err(|_| DataError::ColumnWrongType {
                    column_name: self.feature_names[position].clone(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("'{text}' at line {}", self.line),
                })?;
                if !value.is_finite() {
                    return Err(DataError::NonFiniteValuesFound(
                        self.feature_names[position].clone(),
                    ));
                }
                values.push(value);
            }
            if let Some((index, column)) = &self.label_column {
                let text = self.field(*index)?;
                let label = text
                    .parse::<f64>()
                    .ok()
                    .and_then(label_from_value)
                    .ok_or_else(|| DataError::InvalidLabel {
                        column: column.clone(),
                        row: self.line - 1,
                        value: text.to_string(),
                    })?;
                labels.push(label);
            }
            rows += 1;
        }

        if rows == 0 {
            return Ok(None);
        }
        let samples = Array2::from_shape_vec((rows, n_features), values).map_err(|err| {
            DataError::MalformedRecord {
                line: self.line,
                message: err.to_string(),
            }
        })?;
        let labels = self.label_column.as_ref().map(|_| Array1::from_vec(labels));
        Ok(Some(SampleBlock { samples, labels }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::{ChunkOptions, estimate_chunked};
    use crate::estimate::estimate;
    use crate::types::{EstimateOptions, MomentError};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    const LABELED: &str = "x\ty\tclass\n1\t2\t1\n3\t4\t1\n5\t6\t2\n7\t8\t2";

    fn hard_schema() -> TableSchema {
        TableSchema {
            features: Vec::new(),
            labels: LabelColumns::Hard("class".to_string()),
        }
    }

    #[test]
    fn load_hard_labeled_table() {
        let file = create_test_tsv(LABELED).unwrap();
        let table = load_table(file.path(), &hard_schema(), 100).unwrap();

        assert_eq!(table.feature_names, vec!["x", "y"]);
        assert_eq!(table.samples.shape(), &[4, 2]);
        assert_abs_diff_eq!(table.samples[[2, 1]], 6.0, epsilon = 1e-12);
        assert_eq!(table.labels, TableLabels::Hard(array![1u32, 1, 2, 2]));
        assert_eq!(table.class_layout(None).names, vec!["1", "2"]);
        assert_eq!(table.assignment(Some(3)).n_classes(), 3);
    }

    #[test]
    fn explicit_feature_order_is_respected() {
        let file = create_test_tsv(LABELED).unwrap();
        let schema = TableSchema {
            features: vec!["y".to_string()],
            labels: LabelColumns::None,
        };
        let table = load_table(file.path(), &schema, 100).unwrap();
        assert_eq!(table.samples.column(0), array![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(table.labels, TableLabels::None);
        assert_eq!(table.class_layout(None).names, vec!["pooled"]);
    }

    #[test]
    fn soft_weight_columns_become_classes() {
        let content = "x\tw_a\tw_b\n1\t1\t0\n2\t0.5\t0.5\n3\t0\t1";
        let file = create_test_tsv(content).unwrap();
        let schema = TableSchema {
            features: Vec::new(),
            labels: LabelColumns::Soft(vec!["w_a".to_string(), "w_b".to_string()]),
        };
        let table = load_table(file.path(), &schema, 100).unwrap();
        assert_eq!(table.feature_names, vec!["x"]);
        assert_eq!(table.class_layout(None).names, vec!["w_a", "w_b"]);
        match &table.labels {
            TableLabels::Soft { weights, .. } => {
                assert_eq!(weights.shape(), &[3, 2]);
                assert_abs_diff_eq!(weights[[1, 1]], 0.5, epsilon = 1e-12);
            }
            other => panic!("expected soft labels, got {other:?}"),
        }
    }

    #[test]
    fn row_limit_guards_materialization() {
        let file = create_test_tsv(LABELED).unwrap();
        match load_table(file.path(), &hard_schema(), 3) {
            Err(DataError::TooManyRows { limit }) => assert_eq!(limit, 3),
            other => panic!("expected TooManyRows, got {other:?}"),
        }
        assert!(load_table(file.path(), &hard_schema(), 4).is_ok());
    }

    #[test]
    fn missing_columns_and_bad_labels_are_reported() {
        let file = create_test_tsv(LABELED).unwrap();
        let schema = TableSchema {
            features: vec!["x".to_string(), "z".to_string()],
            labels: LabelColumns::None,
        };
        match load_table(file.path(), &schema, 100) {
            Err(DataError::ColumnNotFound(name)) => assert_eq!(name, "z"),
            other => panic!("expected ColumnNotFound(z), got {other:?}"),
        }

        let bad = create_test_tsv("x\tclass\n1\t1\n2\t1.5").unwrap();
        match load_table(bad.path(), &hard_schema(), 100) {
            Err(DataError::InvalidLabel { row, .. }) => assert_eq!(row, 2),
            other => panic!("expected InvalidLabel, got {other:?}"),
        }
    }

    #[test]
    fn streamed_blocks_reproduce_the_loaded_table() {
        let file = create_test_tsv(LABELED).unwrap();
        let table = load_table(file.path(), &hard_schema(), 100).unwrap();
        let mut source = TsvBlockSource::open(file.path(), &hard_schema()).unwrap();
        assert_eq!(source.feature_names(), &["x".to_string(), "y".to_string()]);

        let options = EstimateOptions::default();
        let streamed = estimate_chunked(&mut source, &ChunkOptions::new(options, 3)).unwrap();
        let loaded = estimate(table.samples.view(), &table.assignment(None), &options).unwrap();
        for (s, l) in streamed.classes.iter().zip(&loaded.classes) {
            for (a, b) in s.mean().unwrap().iter().zip(l.mean().unwrap().iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
            for (a, b) in s
                .covariance()
                .unwrap()
                .iter()
                .zip(l.covariance().unwrap().iter())
            {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
            }
        }

        // A second pass starts from the top again.
        let again = estimate_chunked(&mut source, &ChunkOptions::new(options, 1)).unwrap();
        assert_eq!(again.n_classes(), 2);
    }

    #[test]
    fn streamed_soft_source_is_refused() {
        let content = "x\tw_a\n1\t1\n2\t0.5";
        let file = create_test_tsv(content).unwrap();
        let schema = TableSchema {
            features: Vec::new(),
            labels: LabelColumns::Soft(vec!["w_a".to_string()]),
        };
        let mut source = TsvBlockSource::open(file.path(), &schema).unwrap();
        assert!(matches!(
            estimate_chunked(&mut source, &ChunkOptions::default()),
            Err(MomentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn streamed_parse_failure_aborts_with_source_error() {
        let file = create_test_tsv("x\tclass\n1\t1\noops\t2").unwrap();
        let mut source = TsvBlockSource::open(file.path(), &hard_schema()).unwrap();
        match estimate_chunked(&mut source, &ChunkOptions::new(EstimateOptions::default(), 1)) {
            Err(MomentError::Source(err)) => assert!(err.to_string().contains("oops")),
            other => panic!("expected Source error, got {other:?}"),
        }
    }

    #[test]
    fn layouts_match_estimates_for_unlabeled_and_fully_excluded_tables() {
        let file = create_test_tsv("x\ty\tclass\n1\t2\t0\n3\t4\t0\n5\t6\t0").unwrap();
        let table = load_table(file.path(), &hard_schema(), 100).unwrap();
        let layout = table.class_layout(None);
        assert!(layout.is_empty());
        let est = estimate(
            table.samples.view(),
            &table.assignment(None),
            &EstimateOptions::default(),
        )
        .unwrap()
        .with_layout(layout)
        .unwrap();
        assert_eq!(est.n_classes(), 0);

        let pooled = load_table(file.path(), &TableSchema::default(), 100).unwrap();
        let layout = pooled.class_layout(None);
        assert_eq!(layout.names, vec!["pooled"]);
        let est = estimate(
            pooled.samples.view(),
            &pooled.assignment(None),
            &EstimateOptions::default(),
        )
        .unwrap()
        .with_layout(layout)
        .unwrap();
        assert!(est.pooled);
    }
}
