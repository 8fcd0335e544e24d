//! Per-item results of a batch of compactions

use crate::engine::CompactionReport;
use crate::error::CompactorError;
use std::fmt;

#[derive(Debug)]
pub enum Outcome {
    Compacted(CompactionReport),
    /// No buffer to compact into this target
    Skipped(String),
    Failed {
        target: String,
        error: CompactorError,
    },
}

impl Outcome {
    pub fn target(&self) -> &str {
        match self {
            Outcome::Compacted(report) => &report.target,
            Outcome::Skipped(target) => target,
            Outcome::Failed { target, .. } => target,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// Results in request order. One failure never stops the others.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<Outcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Compacted(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Skipped(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &CompactorError)> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Failed { target, error } => Some((target.as_str(), error)),
            _ => None,
        })
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} compacted, {} skipped, {} failed",
            self.succeeded(),
            self.skipped(),
            self.failed()
        )
    }
}
