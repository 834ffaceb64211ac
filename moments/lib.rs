#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod accumulate;
pub mod chunked;
pub mod config;
pub mod data;
pub mod estimate;
pub mod progress;
pub mod report;
pub mod types;

pub use accumulate::{ClassAccumulator, Grouping};
pub use chunked::{
    ChunkOptions, DenseSampleSource, LabelKind, SampleBlock, SampleBlockSource, SourceShape,
    estimate_chunked, estimate_chunked_with_progress,
};
pub use estimate::estimate;
pub use types::{
    ClassEstimate, ClassLayout, ClassMoments, ClassStatus, EstimateOptions, GroupAssignment,
    MomentError, MomentEstimates, Normalization,
};
