use crate::accumulate::{ClassAccumulator, Grouping};
use crate::progress::{AccumulationObserver, AccumulationStage, NoopAccumulationProgress};
use crate::types::{EstimateOptions, MomentError, MomentEstimates};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use std::cmp::min;
use std::convert::Infallible;
use std::error::Error;

pub const DEFAULT_MAX_BLOCK_ROWS: usize = 4_096;

/// Kind of class membership a source attaches to its rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelKind {
    Unlabeled,
    Hard,
    /// Fractional weights. Sources may declare them, but the chunked path
    /// refuses them.
    Soft,
}

/// What a source knows about its data before the first block is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceShape {
    pub rows: Option<usize>,
    pub classes: Option<usize>,
    pub features: Option<usize>,
    pub labels: LabelKind,
}

/// One block of rows and, for hard-labeled sources, one label per row.
#[derive(Clone, Debug)]
pub struct SampleBlock {
    pub samples: Array2<f64>,
    pub labels: Option<Array1<u32>>,
}

pub trait SampleBlockSource {
    type Error;

    fn shape_hint(&self) -> SourceShape;
    /// Rewinds to the first row.
    fn reset(&mut self) -> Result<(), Self::Error>;
    /// Returns at most `max_rows` rows, or `None` once the source is exhausted.
    fn next_block(&mut self, max_rows: usize) -> Result<Option<SampleBlock>, Self::Error>;
}

/// Block source over a matrix already held in memory.
pub struct DenseSampleSource<'a> {
    samples: ArrayView2<'a, f64>,
    labels: Option<ArrayView1<'a, u32>>,
    classes: Option<usize>,
    cursor: usize,
}

impl<'a> DenseSampleSource<'a> {
    pub fn new(
        samples: ArrayView2<'a, f64>,
        labels: Option<ArrayView1<'a, u32>>,
    ) -> Result<Self, MomentError> {
        if let Some(labels) = labels {
            if labels.len() != samples.nrows() {
                return Err(MomentError::ShapeMismatch {
                    context: "DenseSampleSource labels",
                    expected: samples.nrows(),
                    found: labels.len(),
                });
            }
        }
        Ok(Self {
            samples,
            labels,
            classes: None,
            cursor: 0,
        })
    }

    /// Declares the class count instead of letting it follow the labels.
    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = Some(classes);
        self
    }
}

impl<'a> SampleBlockSource for DenseSampleSource<'a> {
    type Error = Infallible;

    fn shape_hint(&self) -> SourceShape {
        SourceShape {
            rows: Some(self.samples.nrows()),
            classes: self.classes,
            features: Some(self.samples.ncols()),
            labels: if self.labels.is_some() {
                LabelKind::Hard
            } else {
                LabelKind::Unlabeled
            },
        }
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.cursor = 0;
        Ok(())
    }

    fn next_block(&mut self, max_rows: usize) -> Result<Option<SampleBlock>, Self::Error> {
        let remaining = self.samples.nrows().saturating_sub(self.cursor);
        if remaining == 0 || max_rows == 0 {
            return Ok(None);
        }
        let start = self.cursor;
        let end = start + min(max_rows, remaining);
        self.cursor = end;
        Ok(Some(SampleBlock {
            samples: self.samples.slice(s![start..end, ..]).to_owned(),
            labels: self.labels.map(|labels| labels.slice(s![start..end]).to_owned()),
        }))
    }
}

/// Settings for [`estimate_chunked`]. `max_block_rows` bounds how many rows
/// the source may materialize per block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkOptions {
    pub estimate: EstimateOptions,
    pub max_block_rows: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            estimate: EstimateOptions::default(),
            max_block_rows: DEFAULT_MAX_BLOCK_ROWS,
        }
    }
}

impl ChunkOptions {
    pub fn new(estimate: EstimateOptions, max_block_rows: usize) -> Self {
        Self {
            estimate,
            max_block_rows,
        }
    }
}

fn source_error<E>(err: E) -> MomentError
where
    E: Error + Send + Sync + 'static,
{
    MomentError::Source(Box::new(err))
}

/// Streams every block of `source` through a [`ClassAccumulator`] and
/// finalizes the class moments.
pub fn estimate_chunked<S>(
    source: &mut S,
    options: &ChunkOptions,
) -> Result<MomentEstimates, MomentError>
where
    S: SampleBlockSource,
    S::Error: Error + Send + Sync + 'static,
{
    let mut progress = NoopAccumulationProgress;
    estimate_chunked_with_progress(source, options, &mut progress)
}

pub fn estimate_chunked_with_progress<S, P>(
    source: &mut S,
    options: &ChunkOptions,
    progress: &mut P,
) -> Result<MomentEstimates, MomentError>
where
    S: SampleBlockSource,
    S::Error: Error + Send + Sync + 'static,
    P: AccumulationObserver + ?Sized,
{
    if options.max_block_rows == 0 {
        return Err(MomentError::InvalidArgument(
            "max_block_rows must be positive".to_string(),
        ));
    }

    let shape = source.shape_hint();
    let grouping = match shape.labels {
        LabelKind::Soft => {
            return Err(MomentError::InvalidArgument(
                "soft label weights are not supported for chunked sources; \
                 load the full matrix and use the in-memory estimator"
                    .to_string(),
            ));
        }
        LabelKind::Unlabeled => Grouping::Pooled,
        LabelKind::Hard => {
            if let Some(declared) = shape.classes {
                options.estimate.check_class_count(declared)?;
            }
            Grouping::Classes(shape.classes)
        }
    };

    source.reset().map_err(source_error)?;
    let mut accumulator = ClassAccumulator::new(grouping, shape.features)
        .with_class_limit(options.estimate.max_classes);

    log::info!(
        "Accumulating chunked moments (blocks of at most {} rows, {})",
        options.max_block_rows,
        options.estimate.normalization.describe()
    );
    progress.on_stage_start(AccumulationStage::BlockAccumulation, shape.rows);

    let mut blocks = 0usize;
    while let Some(block) = source
        .next_block(options.max_block_rows)
        .map_err(source_error)?
    {
        let rows = block.samples.nrows();
        if rows > options.max_block_rows {
            return Err(MomentError::ShapeMismatch {
                context: "block rows exceed the requested maximum",
                expected: options.max_block_rows,
                found: rows,
            });
        }
        accumulator.merge(
            block.samples.view(),
            block.labels.as_ref().map(|labels| labels.view()),
        )?;
        blocks += 1;
        log::debug!(
            "Merged block {blocks} ({rows} rows, {} rows total)",
            accumulator.rows_merged()
        );
        progress.on_stage_advance(
            AccumulationStage::BlockAccumulation,
            accumulator.rows_merged(),
        );
    }
    progress.on_stage_finish(AccumulationStage::BlockAccumulation);

    if let Some(expected) = shape.rows {
        if expected != accumulator.rows_merged() {
            log::warn!(
                "Source announced {expected} rows but delivered {}",
                accumulator.rows_merged()
            );
        }
    }

    progress.on_stage_start(
        AccumulationStage::Finalization,
        Some(accumulator.rows_merged()),
    );
    let rows = accumulator.rows_merged();
    let estimates = accumulator.finish(&options.estimate);
    progress.on_stage_finish(AccumulationStage::Finalization);

    log::info!(
        "Chunked moments complete: {rows} rows in {blocks} blocks, {} classes",
        estimates.n_classes()
    );
    Ok(estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::estimate;
    use crate::progress::{ProgressEvent, RecordingProgress};
    use crate::types::{ClassEstimate, GroupAssignment, Normalization};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::collections::VecDeque;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("scripted read failure")]
    struct ScriptedFailure;

    /// Replays a fixed sequence of blocks or failures.
    struct ScriptedSource {
        shape: SourceShape,
        script: VecDeque<Result<SampleBlock, ScriptedFailure>>,
    }

    impl SampleBlockSource for ScriptedSource {
        type Error = ScriptedFailure;

        fn shape_hint(&self) -> SourceShape {
            self.shape
        }

        fn reset(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn next_block(&mut self, max_rows: usize) -> Result<Option<SampleBlock>, Self::Error> {
            let _ = max_rows;
            self.script.pop_front().transpose()
        }
    }

    fn hard_shape() -> SourceShape {
        SourceShape {
            rows: None,
            classes: None,
            features: None,
            labels: LabelKind::Hard,
        }
    }

    fn scenario_matrix() -> Array2<f64> {
        array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]]
    }

    fn assert_estimates_close(a: &MomentEstimates, b: &MomentEstimates, tol: f64) {
        assert_eq!(a.n_classes(), b.n_classes());
        for (x, y) in a.classes.iter().zip(&b.classes) {
            assert_eq!(x.status(), y.status());
            if let (Some(mx), Some(my)) = (x.mean(), y.mean()) {
                for (p, q) in mx.iter().zip(my.iter()) {
                    assert_abs_diff_eq!(*p, *q, epsilon = tol);
                }
            }
            if let (Some(cx), Some(cy)) = (x.covariance(), y.covariance()) {
                for (p, q) in cx.iter().zip(cy.iter()) {
                    assert_abs_diff_eq!(*p, *q, epsilon = tol);
                }
            }
        }
    }

    #[test]
    fn dense_source_matches_in_memory_estimate_for_every_block_size() {
        let x = scenario_matrix();
        let labels = array![1u32, 1, 2, 2];
        for normalization in [Normalization::Unbiased, Normalization::Biased] {
            let expected = estimate(
                x.view(),
                &GroupAssignment::hard(labels.view()),
                &EstimateOptions::new(normalization),
            )
            .unwrap();
            for block_rows in 1..=5 {
                let mut source = DenseSampleSource::new(x.view(), Some(labels.view())).unwrap();
                let options = ChunkOptions::new(EstimateOptions::new(normalization), block_rows);
                let chunked = estimate_chunked(&mut source, &options).unwrap();
                assert_estimates_close(&chunked, &expected, 1e-12);
            }
        }
    }

    #[test]
    fn unlabeled_dense_source_pools_all_rows() {
        let x = scenario_matrix();
        let mut source = DenseSampleSource::new(x.view(), None).unwrap();
        let est = estimate_chunked(&mut source, &ChunkOptions::new(EstimateOptions::default(), 3))
            .unwrap();
        assert!(est.pooled);
        let cov = est.class(0).unwrap().covariance().unwrap();
        for value in cov.iter() {
            assert_abs_diff_eq!(*value, 20.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn declared_classes_absent_from_blocks_stay_empty() {
        let x = scenario_matrix();
        let labels = array![1u32, 3, 1, 3];
        let mut source = DenseSampleSource::new(x.view(), Some(labels.view()))
            .unwrap()
            .with_classes(4);
        let est = estimate_chunked(&mut source, &ChunkOptions::new(EstimateOptions::default(), 1))
            .unwrap();
        assert_eq!(est.n_classes(), 4);
        assert_eq!(est.class(1), Some(&ClassEstimate::Empty));
        assert_eq!(est.class(3), Some(&ClassEstimate::Empty));
        assert_eq!(est.class(2).unwrap().mean().unwrap(), array![5.0, 6.0]);
    }

    #[test]
    fn soft_sources_are_rejected_before_reading() {
        let mut source = ScriptedSource {
            shape: SourceShape {
                labels: LabelKind::Soft,
                ..hard_shape()
            },
            script: VecDeque::from(vec![Err(ScriptedFailure)]),
        };
        match estimate_chunked(&mut source, &ChunkOptions::default()) {
            Err(MomentError::InvalidArgument(msg)) => assert!(msg.contains("soft")),
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
        assert_eq!(source.script.len(), 1);
    }

    #[test]
    fn read_failure_discards_partial_results() {
        let mut source = ScriptedSource {
            shape: hard_shape(),
            script: VecDeque::from(vec![
                Ok(SampleBlock {
                    samples: array![[1.0, 2.0]],
                    labels: Some(array![1u32]),
                }),
                Err(ScriptedFailure),
            ]),
        };
        match estimate_chunked(&mut source, &ChunkOptions::default()) {
            Err(MomentError::Source(err)) => {
                assert_eq!(err.to_string(), "scripted read failure")
            }
            other => panic!("expected Source error, got {other:?}"),
        }
    }

    #[test]
    fn feature_drift_across_blocks_is_a_shape_mismatch() {
        let mut source = ScriptedSource {
            shape: hard_shape(),
            script: VecDeque::from(vec![
                Ok(SampleBlock {
                    samples: array![[1.0, 2.0]],
                    labels: Some(array![1u32]),
                }),
                Ok(SampleBlock {
                    samples: array![[1.0, 2.0, 3.0]],
                    labels: Some(array![1u32]),
                }),
            ]),
        };
        assert!(matches!(
            estimate_chunked(&mut source, &ChunkOptions::default()),
            Err(MomentError::ShapeMismatch { expected: 2, found: 3, .. })
        ));
    }

    #[test]
    fn oversized_blocks_violate_the_row_limit() {
        let mut source = ScriptedSource {
            shape: hard_shape(),
            script: VecDeque::from(vec![Ok(SampleBlock {
                samples: scenario_matrix(),
                labels: Some(array![1u32, 1, 2, 2]),
            })]),
        };
        assert!(matches!(
            estimate_chunked(&mut source, &ChunkOptions::new(EstimateOptions::default(), 2)),
            Err(MomentError::ShapeMismatch { expected: 2, found: 4, .. })
        ));
    }

    #[test]
    fn offset_data_streams_to_the_in_memory_covariance() {
        let x = Array2::from_shape_fn((1000, 2), |(r, c)| 1e8 + ((r * 7 + c * 3) % 13) as f64);
        let options = EstimateOptions::new(Normalization::Unbiased);
        let expected = estimate(x.view(), &GroupAssignment::Unlabeled, &options).unwrap();
        let mut source = DenseSampleSource::new(x.view(), None).unwrap();
        let chunked = estimate_chunked(&mut source, &ChunkOptions::new(options, 64)).unwrap();
        assert_estimates_close(&chunked, &expected, 1e-6);
    }

    #[test]
    fn class_limit_applies_to_declared_and_inferred_counts() {
        let x = scenario_matrix();
        let labels = array![1u32, 2, 9, 1];
        let options = ChunkOptions::new(EstimateOptions::default().with_max_classes(4), 2);

        let mut declared = DenseSampleSource::new(x.view(), Some(labels.view()))
            .unwrap()
            .with_classes(100);
        assert!(matches!(
            estimate_chunked(&mut declared, &options),
            Err(MomentError::InvalidArgument(_))
        ));

        let mut inferred = DenseSampleSource::new(x.view(), Some(labels.view())).unwrap();
        assert!(matches!(
            estimate_chunked(&mut inferred, &options),
            Err(MomentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_block_limit_is_invalid() {
        let x = scenario_matrix();
        let mut source = DenseSampleSource::new(x.view(), None).unwrap();
        assert!(matches!(
            estimate_chunked(&mut source, &ChunkOptions::new(EstimateOptions::default(), 0)),
            Err(MomentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn dense_source_rejects_mismatched_labels() {
        let x = scenario_matrix();
        let labels = array![1u32, 2];
        assert!(matches!(
            DenseSampleSource::new(x.view(), Some(labels.view())),
            Err(MomentError::ShapeMismatch { expected: 4, found: 2, .. })
        ));
    }

    #[test]
    fn progress_reports_cumulative_rows() {
        let x = scenario_matrix();
        let mut source = DenseSampleSource::new(x.view(), None).unwrap();
        let mut progress = RecordingProgress::default();
        estimate_chunked_with_progress(
            &mut source,
            &ChunkOptions::new(EstimateOptions::default(), 3),
            &mut progress,
        )
        .unwrap();

        assert_eq!(
            progress.events,
            vec![
                ProgressEvent::Start(AccumulationStage::BlockAccumulation, Some(4)),
                ProgressEvent::Advance(AccumulationStage::BlockAccumulation, 3),
                ProgressEvent::Advance(AccumulationStage::BlockAccumulation, 4),
                ProgressEvent::Finish(AccumulationStage::BlockAccumulation),
                ProgressEvent::Start(AccumulationStage::Finalization, Some(4)),
                ProgressEvent::Finish(AccumulationStage::Finalization),
            ]
        );
    }
}
