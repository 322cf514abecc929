use std::path::Path;

use tracing::Span;
use tracing::info_span;

use crate::telemetry::ctx::{OpMarker, PhaseSpan};

#[derive(Copy, Clone, Debug)]
pub struct Upload;

#[derive(Copy, Clone, Debug)]
pub enum Phase { Collect, Dispatch, Work, Persist, Report }

impl PhaseSpan for Phase {
    fn name(&self) -> &'static str { match self {
        Phase::Collect => "collect",
        Phase::Dispatch => "dispatch",
        Phase::Work => "work",
        Phase::Persist => "persist",
        Phase::Report => "report",
    }}
    fn span(&self) -> Span { match self {
        Phase::Collect => info_span!("collect"),
        Phase::Dispatch => info_span!("dispatch"),
        Phase::Work => info_span!("work"),
        Phase::Persist => info_span!("persist"),
        Phase::Report => info_span!("report"),
    }}
}

impl OpMarker for Upload {
    const NAME: &'static str = "upload";
    type Phase = Phase;
    fn root_span() -> Span { info_span!("upload") }
}

/// Span for one worker task; attached with `Instrument`, never entered across awaits.
pub fn worker_span(worker: usize) -> Span { info_span!("worker", worker) }

/// Span for one item inside a worker.
pub fn item_span(item: &Path) -> Span { info_span!("item", item = %item.display()) }
