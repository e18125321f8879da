//! Commit phase state machine shared by transactions and audits.

use std::fmt;

use topo_common::error::{TopoError, TopoResult};

/// Phase of one commit or audit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TransactionPhase {
    /// No cycle in progress.
    #[default]
    End,
    /// Cycle admitted, candidate scan running.
    Start,
    /// Candidate scanned, participants known.
    StartSuccess,
    /// Vote instructions being built.
    VoteBegin,
    /// Waiting for driver votes.
    VoteWaitResult,
    /// Every driver voted success.
    VoteSuccess,
    /// Global commit instructions being built.
    GlobalCommitBegin,
    /// Waiting for driver global-commit results.
    GlobalCommitWaitResult,
    /// Every driver reported its global-commit result.
    GlobalCommitResult,
    /// Every driver committed successfully.
    GlobalCommitSuccess,
}

impl TransactionPhase {
    /// The only phase a cycle may move to from `self`.
    #[must_use]
    pub const fn successor(self) -> Self {
        match self {
            Self::End => Self::Start,
            Self::Start => Self::StartSuccess,
            Self::StartSuccess => Self::VoteBegin,
            Self::VoteBegin => Self::VoteWaitResult,
            Self::VoteWaitResult => Self::VoteSuccess,
            Self::VoteSuccess => Self::GlobalCommitBegin,
            Self::GlobalCommitBegin => Self::GlobalCommitWaitResult,
            Self::GlobalCommitWaitResult => Self::GlobalCommitResult,
            Self::GlobalCommitResult => Self::GlobalCommitSuccess,
            Self::GlobalCommitSuccess => Self::End,
        }
    }

    /// Moves to `next`, which must be the successor of the current phase.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` for any other target; the phase is unchanged then.
    pub fn advance(&mut self, next: Self) -> TopoResult<()> {
        if self.successor() != next {
            return Err(TopoError::InvalidState("commit phase transition is out of order"));
        }
        *self = next;
        Ok(())
    }

    /// Checks that the cycle currently sits in `expected`.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidState` with `message` otherwise.
    pub fn expect(self, expected: Self, message: &'static str) -> TopoResult<()> {
        if self == expected {
            Ok(())
        } else {
            Err(TopoError::InvalidState(message))
        }
    }

    /// Uppercase label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::End => "END",
            Self::Start => "START",
            Self::StartSuccess => "START_SUCCESS",
            Self::VoteBegin => "VOTE_BEGIN",
            Self::VoteWaitResult => "VOTE_WAIT_RESULT",
            Self::VoteSuccess => "VOTE_SUCCESS",
            Self::GlobalCommitBegin => "GLOBAL_COMMIT_BEGIN",
            Self::GlobalCommitWaitResult => "GLOBAL_COMMIT_WAIT_RESULT",
            Self::GlobalCommitResult => "GLOBAL_COMMIT_RESULT",
            Self::GlobalCommitSuccess => "GLOBAL_COMMIT_SUCCESS",
        }
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Protocol step a driver result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitPhase {
    /// Vote round.
    Vote,
    /// Global commit round.
    GlobalCommit,
}

/// Result one driver reported for one protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOutcome {
    /// Driver succeeded.
    Success,
    /// Driver reported failure.
    Failure,
    /// Driver did not answer within the TC's deadline.
    Timeout,
}

impl DriverOutcome {
    /// Returns whether the outcome lets the cycle continue.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Aggregated state of one result-collection round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundProgress {
    /// Some participants have not reported yet.
    Waiting,
    /// Every participant reported success; the cycle moved on.
    Succeeded,
    /// A participant failed or timed out; the cycle was aborted.
    Aborted,
}

/// Phase the TC was in when it decided to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortPhase {
    /// Abort after a failed start.
    Start,
    /// Abort during the vote round.
    Vote,
    /// Abort during the global commit round.
    GlobalCommit,
}

impl AbortPhase {
    /// Returns whether the marker describes `phase`.
    #[must_use]
    pub const fn covers(self, phase: TransactionPhase) -> bool {
        match self {
            Self::Start => matches!(
                phase,
                TransactionPhase::Start | TransactionPhase::StartSuccess
            ),
            Self::Vote => matches!(
                phase,
                TransactionPhase::VoteBegin
                    | TransactionPhase::VoteWaitResult
                    | TransactionPhase::VoteSuccess
            ),
            Self::GlobalCommit => matches!(
                phase,
                TransactionPhase::GlobalCommitBegin
                    | TransactionPhase::GlobalCommitWaitResult
                    | TransactionPhase::GlobalCommitResult
                    | TransactionPhase::GlobalCommitSuccess
            ),
        }
    }
}
