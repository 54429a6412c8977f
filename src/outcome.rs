//! Per-rank outcomes and their reduction to one verdict
//!
//! Every active rank resolves its own result for a test phase into a `RankOutcome`. The
//! outcomes of a group are gathered at the group leader in a single collective call, where they
//! are reduced to an `AggregatedVerdict`: the phase failed if any rank failed or errored,
//! otherwise it takes the leader's outcome. Every rank that did not pass contributes a
//! `Rank <i>: <detail>` block to the verdict detail, in ascending rank order.
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::topology::{Communicator, GroupHandle, Rank, Role};

/// Group rank gathering and reducing outcomes
const LEADER: Rank = 0;

/// Result kind of a test phase
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The phase completed without failure
    Passed,
    /// An assertion in the test failed
    Failed,
    /// The test machinery itself failed
    Errored,
    /// The phase did not run on this rank
    Skipped,
}

impl Outcome {
    /// Whether this outcome fails the test
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Errored)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Errored => "errored",
            Outcome::Skipped => "skipped",
        })
    }
}

/// One rank's result for one test phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankOutcome {
    outcome: Outcome,
    detail: String,
}

impl RankOutcome {
    /// A passing outcome
    pub fn passed() -> RankOutcome {
        RankOutcome {
            outcome: Outcome::Passed,
            detail: String::new(),
        }
    }

    /// A failed assertion, with its message
    pub fn failed(detail: impl Into<String>) -> RankOutcome {
        RankOutcome {
            outcome: Outcome::Failed,
            detail: detail.into(),
        }
    }

    /// An error outside of the test's assertions
    pub fn errored(detail: impl Into<String>) -> RankOutcome {
        RankOutcome {
            outcome: Outcome::Errored,
            detail: detail.into(),
        }
    }

    /// A phase that did not run, with the reason
    pub fn skipped(reason: impl Into<String>) -> RankOutcome {
        RankOutcome {
            outcome: Outcome::Skipped,
            detail: reason.into(),
        }
    }

    /// The result kind
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Diagnostic text, empty for passing outcomes
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

/// The verdict of one test phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedVerdict {
    /// Reduced outcome
    pub outcome: Outcome,
    /// Labeled details of every rank that did not pass
    pub detail: String,
}

impl AggregatedVerdict {
    /// Reduce the outcomes of a whole group, indexed by group rank.
    ///
    /// The first entry is the leader's outcome.
    pub fn combine(outcomes: &[RankOutcome]) -> AggregatedVerdict {
        let failed = outcomes.iter().any(|o| o.outcome.is_failure());
        let outcome = if failed {
            Outcome::Failed
        } else {
            outcomes.first().map_or(Outcome::Passed, |leader| leader.outcome)
        };
        let detail = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.outcome != Outcome::Passed)
            .map(|(rank, o)| format!("Rank {}: {}", rank, o.detail))
            .collect::<Vec<_>>()
            .join("\n");
        AggregatedVerdict { outcome, detail }
    }

    /// A verdict taken over unchanged from a single rank
    pub fn from_local(local: RankOutcome) -> AggregatedVerdict {
        AggregatedVerdict {
            outcome: local.outcome,
            detail: local.detail,
        }
    }

    /// A failure that every rank reaches on its own, e.g. an invalid group size.
    pub fn synthetic_failure(detail: impl Into<String>) -> AggregatedVerdict {
        AggregatedVerdict {
            outcome: Outcome::Failed,
            detail: detail.into(),
        }
    }
}

/// Gathers outcomes of an active group at its leader
pub struct OutcomeAggregator;

impl OutcomeAggregator {
    /// Reduce `local` across `group`.
    ///
    /// Must be called by every member of the active group, and only by them. The leader
    /// returns the group verdict; contributors get their own outcome back unmodified, which is
    /// not authoritative.
    ///
    /// This is a collective operation on `group`.
    pub fn reduce<C: Communicator>(
        group: &GroupHandle<C>,
        local: RankOutcome,
    ) -> Result<AggregatedVerdict> {
        let encoded = serde_json::to_vec(&local)?;
        let gathered = group.communicator().gather_bytes(LEADER, &encoded)?;

        match (group.role(), gathered) {
            (Role::Leader, Some(buffers)) => {
                let outcomes = buffers
                    .iter()
                    .map(|bytes| serde_json::from_slice::<RankOutcome>(bytes))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let verdict = AggregatedVerdict::combine(&outcomes);
                debug!(
                    ranks = outcomes.len(),
                    outcome = %verdict.outcome,
                    "reduced outcomes"
                );
                Ok(verdict)
            }
            _ => Ok(AggregatedVerdict::from_local(local)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalUniverse;
    use crate::topology::GroupFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn all_passed_mirrors_leader() {
        let verdict = AggregatedVerdict::combine(&[RankOutcome::passed(), RankOutcome::passed()]);
        assert_eq!(verdict.outcome, Outcome::Passed);
        assert_eq!(verdict.detail, "");
    }

    #[test]
    fn any_failure_fails_the_verdict() {
        let verdict = AggregatedVerdict::combine(&[
            RankOutcome::passed(),
            RankOutcome::errored("boom"),
            RankOutcome::passed(),
            RankOutcome::failed("assertion `left == right` failed"),
        ]);
        assert_eq!(verdict.outcome, Outcome::Failed);
        assert_eq!(
            verdict.detail,
            "Rank 1: boom\nRank 3: assertion `left == right` failed"
        );
    }

    #[test]
    fn skips_are_labeled_but_do_not_fail() {
        let verdict = AggregatedVerdict::combine(&[
            RankOutcome::passed(),
            RankOutcome::skipped("not on this rank"),
        ]);
        assert_eq!(verdict.outcome, Outcome::Passed);
        assert_eq!(verdict.detail, "Rank 1: not on this rank");

        let verdict = AggregatedVerdict::combine(&[RankOutcome::skipped("nothing to do")]);
        assert_eq!(verdict.outcome, Outcome::Skipped);
    }

    #[test]
    fn outcomes_serialize_lowercase() {
        let json = serde_json::to_string(&RankOutcome::failed("x")).unwrap();
        assert_eq!(json, r#"{"outcome":"failed","detail":"x"}"#);
    }

    #[test]
    fn leader_reduces_and_contributors_keep_their_outcome() {
        let verdicts = LocalUniverse::new(3)
            .run(|world| {
                let group = GroupFactory::new(&world).split(3).unwrap();
                let local = if group.rank() == 2 {
                    RankOutcome::failed("rank two disagrees")
                } else {
                    RankOutcome::passed()
                };
                let verdict = OutcomeAggregator::reduce(&group, local).unwrap();
                group.free().unwrap();
                verdict
            })
            .unwrap();
        assert_eq!(
            verdicts[0],
            AggregatedVerdict {
                outcome: Outcome::Failed,
                detail: "Rank 2: rank two disagrees".into(),
            }
        );
        assert_eq!(verdicts[1].outcome, Outcome::Passed);
        assert_eq!(verdicts[2].outcome, Outcome::Failed);
    }
}
