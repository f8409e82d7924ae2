use std::fmt;

use common::models::AttemptStatus;

/// What happened to each eligible user for one signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub signal_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Users that already had a ledger row, from an earlier run or a racing one.
    pub already_handled: usize,
    /// Units never started because shutdown was requested.
    pub deferred: usize,
}

impl FanoutReport {
    pub fn new(signal_id: impl Into<String>) -> Self {
        Self {
            signal_id: signal_id.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Recorded(AttemptStatus::Success) => self.succeeded += 1,
            UnitOutcome::Recorded(AttemptStatus::Failed) => self.failed += 1,
            UnitOutcome::Recorded(AttemptStatus::Skipped) => self.skipped += 1,
            UnitOutcome::AlreadyHandled => self.already_handled += 1,
            UnitOutcome::Deferred => self.deferred += 1,
        }
    }

    /// True when every eligible user has a ledger row.
    pub fn is_complete(&self) -> bool {
        self.deferred == 0
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.already_handled + self.deferred
    }
}

impl fmt::Display for FanoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signal {}: {} ok, {} failed, {} skipped, {} already handled",
            self.signal_id, self.succeeded, self.failed, self.skipped, self.already_handled
        )?;
        if self.deferred > 0 {
            write!(f, ", {} deferred", self.deferred)?;
        }
        Ok(())
    }
}

/// Result of one per-user unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Recorded(AttemptStatus),
    AlreadyHandled,
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tallies_and_summary() {
        let mut report = FanoutReport::new("sig-1");
        report.record(UnitOutcome::Recorded(AttemptStatus::Success));
        report.record(UnitOutcome::Recorded(AttemptStatus::Failed));
        report.record(UnitOutcome::AlreadyHandled);

        assert!(report.is_complete());
        assert_eq!(report.total(), 3);
        assert_eq!(
            report.to_string(),
            "Signal sig-1: 1 ok, 1 failed, 0 skipped, 1 already handled"
        );

        report.record(UnitOutcome::Deferred);
        assert!(!report.is_complete());
        assert!(report.to_string().ends_with(", 1 deferred"));
    }
}
