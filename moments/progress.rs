use std::fmt;

/// Stages reported while accumulating a chunked source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccumulationStage {
    BlockAccumulation,
    Finalization,
}

impl AccumulationStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::BlockAccumulation => "block accumulation",
            Self::Finalization => "moment finalization",
        }
    }
}

impl fmt::Display for AccumulationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress of a chunked estimation.
pub trait AccumulationObserver {
    /// `total_rows` is the source's row hint, when it has one.
    fn on_stage_start(&mut self, stage: AccumulationStage, total_rows: Option<usize>) {
        let _ = (stage, total_rows);
    }
    fn on_stage_advance(&mut self, stage: AccumulationStage, processed_rows: usize) {
        let _ = (stage, processed_rows);
    }
    fn on_stage_finish(&mut self, stage: AccumulationStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopAccumulationProgress;

impl AccumulationObserver for NoopAccumulationProgress {}

/// Records every event; useful for asserting on driver behavior.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    pub events: Vec<ProgressEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Start(AccumulationStage, Option<usize>),
    Advance(AccumulationStage, usize),
    Finish(AccumulationStage),
}

impl AccumulationObserver for RecordingProgress {
    fn on_stage_start(&mut self, stage: AccumulationStage, total_rows: Option<usize>) {
        self.events.push(ProgressEvent::Start(stage, total_rows));
    }
    fn on_stage_advance(&mut self, stage: AccumulationStage, processed_rows: usize) {
        self.events.push(ProgressEvent::Advance(stage, processed_rows));
    }
    fn on_stage_finish(&mut self, stage: AccumulationStage) {
        self.events.push(ProgressEvent::Finish(stage));
    }
}
