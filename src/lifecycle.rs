//! Running one test in lockstep across all ranks
//!
//! For an MPI test every rank walks through the same sequence of collectives on the world
//! group, whether or not it runs the body:
//!
//! 1. setup: barrier, split off the test's group, decide participation, reduce the setup
//!    outcome within the active group, barrier;
//! 2. call: run the body on active ranks, reduce within the active group, barrier;
//! 3. teardown: run the teardown hook on active ranks, reduce within the active group,
//!    barrier, free the group.
//!
//! Spectator ranks skip the reductions; they hold the complementary group and free it in the
//! last step like everyone else. A test requesting an invalid group size fails on every rank
//! after the first barrier; the ranks meet once more and never split.
//!
//! Failures inside a test body, including panics, are resolved into outcomes on the spot so
//! that no rank ever leaves the collective sequence early.
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info_span, warn};

use crate::context::{Skip, TestContext};
use crate::environment::HarnessConfig;
use crate::error::Result;
use crate::outcome::{AggregatedVerdict, Outcome, OutcomeAggregator, RankOutcome};
use crate::participation::{Decision, ParticipationGate, ParticipationRecord, SPECTATOR_REASON};
use crate::registry::{GroupRegistry, TestId};
use crate::suite::{TestBody, TestCase};
use crate::topology::{is_leader, Communicator, GroupFactory, Rank};

/// Phases of a test invocation, each reported on its own
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Group creation and participation
    Setup,
    /// The test body
    Call,
    /// Teardown hook and group release
    Teardown,
}

impl Phase {
    /// Outcome of a failure in this phase: assertions fail the call, anything going wrong
    /// around it is an error.
    ///
    /// A body that returns an error or panics is `failed`, not `errored`; both count as a
    /// failure when the group's outcomes are combined.
    fn failure(self, detail: String) -> RankOutcome {
        match self {
            Phase::Call => RankOutcome::failed(detail),
            Phase::Setup | Phase::Teardown => RankOutcome::errored(detail),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Setup => "setup",
            Phase::Call => "call",
            Phase::Teardown => "teardown",
        })
    }
}

/// Verdict of one phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PhaseVerdict {
    /// The phase
    pub phase: Phase,
    /// Its verdict
    pub verdict: AggregatedVerdict,
}

/// Everything this rank knows about one test invocation
///
/// Only the report on world rank 0 is authoritative.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TestReport {
    /// The test
    pub test: TestId,
    /// Participation of this rank, `None` if no group was split off
    pub participation: Option<ParticipationRecord>,
    /// Verdicts in phase order
    pub verdicts: SmallVec<[PhaseVerdict; 3]>,
}

impl TestReport {
    fn new(test: TestId) -> TestReport {
        TestReport {
            test,
            participation: None,
            verdicts: SmallVec::new(),
        }
    }

    fn push(&mut self, phase: Phase, verdict: AggregatedVerdict) {
        debug!(%phase, outcome = %verdict.outcome, "phase finished");
        self.verdicts.push(PhaseVerdict { phase, verdict });
    }

    /// The verdict of `phase`, if it ran
    pub fn verdict(&self, phase: Phase) -> Option<&AggregatedVerdict> {
        self.verdicts
            .iter()
            .find(|v| v.phase == phase)
            .map(|v| &v.verdict)
    }

    fn deciding(&self) -> Option<&AggregatedVerdict> {
        self.verdicts
            .iter()
            .map(|v| &v.verdict)
            .find(|v| v.outcome.is_failure())
            .or_else(|| self.verdict(Phase::Call))
            .or_else(|| self.verdict(Phase::Setup))
    }

    /// Overall outcome: the first failing phase, else the call, else the setup
    pub fn outcome(&self) -> Outcome {
        self.deciding().map_or(Outcome::Passed, |v| v.outcome)
    }

    /// Detail of the phase deciding `outcome`
    pub fn detail(&self) -> &str {
        self.deciding().map_or("", |v| v.detail.as_str())
    }
}

/// Drives tests through the collective protocol
///
/// Owns the world group and every group split off for a test.
pub struct LifecycleCoordinator<C: Communicator> {
    world: C,
    config: HarnessConfig,
    gate: ParticipationGate,
    registry: GroupRegistry,
}

impl<C: Communicator> LifecycleCoordinator<C> {
    /// A coordinator on `world`
    pub fn new(world: C, config: HarnessConfig) -> LifecycleCoordinator<C> {
        let gate = ParticipationGate::new(world.rank(), world.size());
        LifecycleCoordinator {
            world,
            config,
            gate,
            registry: GroupRegistry::new(),
        }
    }

    /// The world group
    pub fn world(&self) -> &C {
        &self.world
    }

    /// The group leases of this coordinator
    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    /// Rank of this process in the world group
    pub fn global_rank(&self) -> Rank {
        self.world.rank()
    }

    /// Whether this process holds the authoritative reports
    pub fn is_leader(&self) -> bool {
        is_leader(self.world.rank())
    }

    /// Run one test.
    ///
    /// Every rank must call this for the same tests in the same order. Errors are transport
    /// failures; test failures are part of the returned report.
    pub fn run(&self, test: &TestCase<C>) -> Result<TestReport> {
        let span = info_span!("test", test = %test.id(), rank = self.global_rank());
        let _entered = span.enter();

        if let Err(reason) = self.config.mode.admits(test.marker().is_some()) {
            debug!(reason, "not run in this mode");
            let mut report = TestReport::new(test.id().clone());
            report.push(
                Phase::Setup,
                AggregatedVerdict::from_local(RankOutcome::skipped(reason)),
            );
            return Ok(report);
        }

        match test.marker() {
            Some(_) => self.run_collective(test),
            None => Ok(self.run_ordinary(test)),
        }
    }

    fn run_ordinary(&self, test: &TestCase<C>) -> TestReport {
        let mut report = TestReport::new(test.id().clone());
        let mut ctx = TestContext::new(None, self.global_rank(), self.world.size());
        let outcome = execute(Phase::Call, test.body(), &mut ctx);
        report.push(Phase::Call, AggregatedVerdict::from_local(outcome));
        if let Some(teardown) = test.teardown() {
            let outcome = execute(Phase::Teardown, teardown, &mut ctx);
            report.push(Phase::Teardown, AggregatedVerdict::from_local(outcome));
        }
        report
    }

    fn run_collective(&self, test: &TestCase<C>) -> Result<TestReport> {
        let requested = test.requested_size();
        let mut report = TestReport::new(test.id().clone());

        self.world.barrier()?;
        let size = match self.gate.resolve(requested) {
            Ok(size) => size,
            Err(err) if err.is_recoverable() => {
                warn!(%err, "not splitting");
                report.push(
                    Phase::Setup,
                    AggregatedVerdict::synthetic_failure(err.to_string()),
                );
                self.world.barrier()?;
                return Ok(report);
            }
            Err(err) => return Err(err),
        };

        let group = GroupFactory::new(&self.world).split(size)?;
        let guard = self.registry.acquire(test.id().clone(), group)?;
        let (decision, record) = self.gate.enter(requested, size, guard.handle());
        report.participation = Some(record);
        // body and teardown share the hand-out of the group
        let mut ctx = TestContext::new(decision.group(), self.global_rank(), self.world.size());

        let setup = self.phase(&decision, Phase::Setup, None, &mut ctx)?;
        report.push(Phase::Setup, setup);
        self.world.barrier()?;

        let call = self.phase(&decision, Phase::Call, Some(test.body()), &mut ctx)?;
        report.push(Phase::Call, call);
        self.world.barrier()?;

        let teardown = self.phase(&decision, Phase::Teardown, test.teardown(), &mut ctx)?;
        report.push(Phase::Teardown, teardown);
        self.world.barrier()?;

        guard.release()?;
        Ok(report)
    }

    /// Run one phase and reduce it within the active group. Spectators only report a skip.
    fn phase(
        &self,
        decision: &Decision<'_, C>,
        phase: Phase,
        body: Option<&TestBody<C>>,
        ctx: &mut TestContext<'_, C>,
    ) -> Result<AggregatedVerdict> {
        match decision.group() {
            Some(group) => {
                let outcome = match body {
                    Some(body) => execute(phase, body, ctx),
                    None => RankOutcome::passed(),
                };
                OutcomeAggregator::reduce(group, outcome)
            }
            None => Ok(AggregatedVerdict::from_local(RankOutcome::skipped(
                SPECTATOR_REASON,
            ))),
        }
    }
}

/// Run `body`, resolving every way it can end into an outcome.
fn execute<C: Communicator>(
    phase: Phase,
    body: &TestBody<C>,
    ctx: &mut TestContext<'_, C>,
) -> RankOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(Ok(())) => RankOutcome::passed(),
        Ok(Err(err)) => match err.downcast_ref::<Skip>() {
            Some(skip) => RankOutcome::skipped(skip.reason()),
            None => phase.failure(format!("{err:#}")),
        },
        Err(payload) => phase.failure(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "test panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::RunMode;
    use crate::local::{LocalCommunicator, LocalUniverse};
    use pretty_assertions::assert_eq;

    fn mpi_harness(world: LocalCommunicator) -> LifecycleCoordinator<LocalCommunicator> {
        LifecycleCoordinator::new(world, HarnessConfig::new(RunMode::Mpi))
    }

    #[test]
    fn panic_messages_are_kept() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "test panicked");
    }

    #[test]
    fn report_outcome_prefers_failures() {
        let mut report = TestReport::new(TestId::new("t"));
        report.push(Phase::Setup, AggregatedVerdict::from_local(RankOutcome::passed()));
        report.push(
            Phase::Call,
            AggregatedVerdict::from_local(RankOutcome::skipped("later")),
        );
        assert_eq!(report.outcome(), Outcome::Skipped);
        report.push(
            Phase::Teardown,
            AggregatedVerdict::from_local(RankOutcome::errored("teardown broke")),
        );
        assert_eq!(report.outcome(), Outcome::Errored);
        assert_eq!(report.detail(), "teardown broke");
    }

    #[test]
    fn body_panic_becomes_failure_and_protocol_completes() {
        let universe = LocalUniverse::new(2);
        let reports = universe
            .run(|world| {
                let coordinator = mpi_harness(world);
                let test: TestCase<LocalCommunicator> = TestCase::new("test_panics", |ctx| {
                    let group = ctx.communicator()?;
                    assert_eq!(group.rank(), 1, "only rank one passes");
                    Ok(())
                })
                .mpi_np(2);
                let report = coordinator.run(&test).unwrap();
                assert_eq!(coordinator.registry().outstanding(), 0);
                report
            })
            .unwrap();
        let verdict = reports[0].verdict(Phase::Call).unwrap();
        assert_eq!(verdict.outcome, Outcome::Failed);
        assert!(verdict.detail.starts_with("Rank 0: "));
        assert!(verdict.detail.contains("only rank one passes"));
        assert!(!verdict.detail.contains("Rank 1"));
        assert!(universe.ledger().is_balanced());
    }

    #[test]
    fn teardown_failures_are_errors() {
        let reports = LocalUniverse::new(2)
            .run(|world| {
                let coordinator = mpi_harness(world);
                let test: TestCase<LocalCommunicator> = TestCase::new("test_teardown", |_| Ok(()))
                    .mpi()
                    .with_teardown(|ctx| {
                        if ctx.global_rank() == 1 {
                            anyhow::bail!("could not clean up");
                        }
                        Ok(())
                    });
                coordinator.run(&test).unwrap()
            })
            .unwrap();
        let leader = &reports[0];
        assert_eq!(leader.verdict(Phase::Call).unwrap().outcome, Outcome::Passed);
        let teardown = leader.verdict(Phase::Teardown).unwrap();
        assert_eq!(teardown.outcome, Outcome::Failed);
        assert_eq!(teardown.detail, "Rank 1: could not clean up");
        assert_eq!(leader.outcome(), Outcome::Failed);
    }

    #[test]
    fn body_can_skip_itself() {
        let reports = LocalUniverse::new(2)
            .run(|world| {
                let coordinator = mpi_harness(world);
                let test: TestCase<LocalCommunicator> =
                    TestCase::new("test_skip", |ctx| Err(ctx.skip("not today"))).mpi();
                coordinator.run(&test).unwrap()
            })
            .unwrap();
        let call = reports[0].verdict(Phase::Call).unwrap();
        assert_eq!(call.outcome, Outcome::Skipped);
        assert_eq!(call.detail, "Rank 0: not today\nRank 1: not today");
    }

    #[test]
    fn communicator_is_handed_out_once() {
        let results = LocalUniverse::new(1)
            .run(|world| {
                let coordinator = mpi_harness(world);
                let test: TestCase<LocalCommunicator> = TestCase::new("test_twice", |ctx| {
                    ctx.communicator()?;
                    ctx.communicator()?;
                    Ok(())
                })
                .mpi();
                coordinator.run(&test).unwrap()
            })
            .unwrap();
        let call = results[0].verdict(Phase::Call).unwrap();
        assert_eq!(call.outcome, Outcome::Failed);
        assert!(call.detail.contains("already taken"));
    }

    #[test]
    fn ordinary_tests_have_no_group() {
        let results = LocalUniverse::new(1)
            .run(|world| {
                let coordinator =
                    LifecycleCoordinator::new(world, HarnessConfig::new(RunMode::Ordinary));
                let test: TestCase<LocalCommunicator> = TestCase::new("test_plain", |ctx| {
                    ctx.communicator()?;
                    Ok(())
                });
                coordinator.run(&test).unwrap()
            })
            .unwrap();
        assert_eq!(results[0].outcome(), Outcome::Failed);
        assert!(results[0].detail().contains("no active communication group"));
        assert_eq!(results[0].participation, None);
    }

    #[test]
    fn group_is_handed_out_once_per_invocation() {
        let reports = LocalUniverse::new(2)
            .run(|world| {
                let coordinator = mpi_harness(world);
                let taken_twice: TestCase<LocalCommunicator> = TestCase::new("test_body_takes", |ctx| {
                    ctx.communicator()?;
                    Ok(())
                })
                .mpi()
                .with_teardown(|ctx| {
                    ctx.communicator()?;
                    Ok(())
                });
                let teardown_only: TestCase<LocalCommunicator> =
                    TestCase::new("test_teardown_takes", |_| Ok(()))
                        .mpi()
                        .with_teardown(|ctx| {
                            anyhow::ensure!(ctx.communicator()?.size() == 2);
                            Ok(())
                        });
                (
                    coordinator.run(&taken_twice).unwrap(),
                    coordinator.run(&teardown_only).unwrap(),
                )
            })
            .unwrap();
        let (taken_twice, teardown_only) = &reports[0];
        assert_eq!(
            taken_twice.verdict(Phase::Call).unwrap().outcome,
            Outcome::Passed
        );
        let teardown = taken_twice.verdict(Phase::Teardown).unwrap();
        assert_eq!(teardown.outcome, Outcome::Failed);
        assert!(teardown.detail.contains("already taken"));
        assert_eq!(teardown_only.outcome(), Outcome::Passed);
    }

    #[test]
    fn invalid_size_is_reported_without_a_split() {
        let universe = LocalUniverse::new(2);
        let reports = universe
            .run(|world| {
                let coordinator = mpi_harness(world);
                let test: TestCase<LocalCommunicator> =
                    TestCase::new("test_empty", |_| Ok(())).mpi_np(0);
                let report = coordinator.run(&test).unwrap();
                assert_eq!(coordinator.registry().outstanding(), 0);
                report
            })
            .unwrap();
        for report in &reports {
            assert_eq!(report.outcome(), Outcome::Failed);
            assert!(report.detail().starts_with("np (0) must be between 1"));
            assert_eq!(report.participation, None);
        }
        assert_eq!(universe.ledger().created(), 0);
    }
}
