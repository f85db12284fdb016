//! Cutoff bookkeeping across sync passes.

use chrono::{DateTime, TimeDelta, Utc};

/// Picks the exclusive lower bound for each pass.
///
/// A pass looks back to where the previous successful pass started, less a
/// skew allowance for store clocks running behind ours. Before the first
/// success it looks back a fixed interval from now. The cutoff never moves
/// backwards, and a failed pass leaves it where it was so the same window is
/// fetched again.
///
/// Clock skew beyond the allowance between this process and either store
/// can still hide or repeat updates.
#[derive(Debug, Clone)]
pub struct CutoffTracker {
    initial_lookback: TimeDelta,
    skew_allowance: TimeDelta,
    last_success_start: Option<DateTime<Utc>>,
    last_cutoff: Option<DateTime<Utc>>,
}

impl CutoffTracker {
    /// Create a tracker with no pass history.
    pub fn new(initial_lookback: TimeDelta, skew_allowance: TimeDelta) -> Self {
        Self {
            initial_lookback,
            skew_allowance,
            last_success_start: None,
            last_cutoff: None,
        }
    }

    /// Cutoff for a pass starting at `now`.
    pub fn next_cutoff(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = self
            .last_success_start
            .unwrap_or_else(|| now - self.initial_lookback);
        let candidate = base - self.skew_allowance;

        let cutoff = match self.last_cutoff {
            Some(previous) if previous > candidate => previous,
            _ => candidate,
        };
        self.last_cutoff = Some(cutoff);
        cutoff
    }

    /// Record that the pass which started at `started_at` completed.
    pub fn pass_succeeded(&mut self, started_at: DateTime<Utc>) {
        self.last_success_start = Some(match self.last_success_start {
            Some(previous) if previous > started_at => previous,
            _ => started_at,
        });
    }

    /// Most recently issued cutoff.
    pub fn last_cutoff(&self) -> Option<DateTime<Utc>> {
        self.last_cutoff
    }
}
