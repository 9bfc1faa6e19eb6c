//! Ingestion statistics tracking.
//!
//! Each worker keeps its own [`IngestStats`]; the coordinator merges them
//! once every worker has finished.

use super::transaction::RecordOutcome;
use std::fmt;
use std::time::Duration;

/// Counts of what happened to the records one worker processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Users committed, including partially committed ones
    pub users_committed: usize,
    /// Addresses committed alongside those users
    pub addresses_committed: usize,
    /// Users whose own insert failed
    pub users_rejected: usize,
    /// Users rolled back because one of their addresses failed
    pub users_rolled_back: usize,
    /// Users committed without the address that failed (and those after it)
    pub partial_commits: usize,
    /// Transactions that failed at commit time
    pub commit_failures: usize,
}

impl IngestStats {
    pub fn record(&mut self, outcome: &RecordOutcome) {
        match *outcome {
            RecordOutcome::Committed { addresses } => {
                self.users_committed += 1;
                self.addresses_committed += addresses;
            }
            RecordOutcome::UserRejected => self.users_rejected += 1,
            RecordOutcome::AddressRejected {
                committed_addresses,
                rolled_back: true,
            } => {
                debug_assert_eq!(committed_addresses, 0);
                self.users_rolled_back += 1;
            }
            RecordOutcome::AddressRejected {
                committed_addresses,
                rolled_back: false,
            } => {
                self.users_committed += 1;
                self.partial_commits += 1;
                self.addresses_committed += committed_addresses;
            }
            RecordOutcome::CommitFailed => self.commit_failures += 1,
        }
    }

    /// Merge another worker's counts into this one.
    pub fn merge(&mut self, other: IngestStats) {
        self.users_committed += other.users_committed;
        self.addresses_committed += other.addresses_committed;
        self.users_rejected += other.users_rejected;
        self.users_rolled_back += other.users_rolled_back;
        self.partial_commits += other.partial_commits;
        self.commit_failures += other.commit_failures;
    }

    /// Records that did not make it into the store in full.
    pub fn failures(&self) -> usize {
        self.users_rejected + self.users_rolled_back + self.partial_commits + self.commit_failures
    }
}

/// Result of a complete ingestion run.
#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub dispatched: usize,
    pub workers: usize,
    pub stats: IngestStats,
    pub elapsed: Duration,
}

impl fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Ingestion finished in {:.2?} with {} workers:",
            self.elapsed, self.workers
        )?;
        writeln!(f, "  records dispatched: {}", self.dispatched)?;
        writeln!(f, "  users committed: {}", self.stats.users_committed)?;
        writeln!(f, "  addresses committed: {}", self.stats.addresses_committed)?;
        writeln!(f, "  users rejected: {}", self.stats.users_rejected)?;
        writeln!(f, "  users rolled back: {}", self.stats.users_rolled_back)?;
        writeln!(f, "  partial commits: {}", self.stats.partial_commits)?;
        write!(f, "  commit failures: {}", self.stats.commit_failures)
    }
}
