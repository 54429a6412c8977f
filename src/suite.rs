//! Test declarations and suite runs
use std::fmt;

use serde::Serialize;
use tracing::info;

use crate::context::TestContext;
use crate::environment::HarnessConfig;
use crate::error::Result;
use crate::lifecycle::{LifecycleCoordinator, TestReport};
use crate::outcome::Outcome;
use crate::registry::TestId;
use crate::topology::Communicator;

/// Body (or teardown hook) of a test
pub type TestBody<C> = Box<dyn Fn(&mut TestContext<'_, C>) -> anyhow::Result<()>>;

/// Marks a test as an MPI test
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MpiMarker {
    /// Number of ranks the test runs on, `None` for all of them
    pub np: Option<i64>,
}

/// A test as handed over by test discovery
pub struct TestCase<C: Communicator> {
    id: TestId,
    marker: Option<MpiMarker>,
    body: TestBody<C>,
    teardown: Option<TestBody<C>>,
}

impl<C: Communicator> TestCase<C> {
    /// An ordinary test named `name`
    pub fn new<F>(name: impl Into<String>, body: F) -> TestCase<C>
    where
        F: Fn(&mut TestContext<'_, C>) -> anyhow::Result<()> + 'static,
    {
        TestCase {
            id: TestId::new(name),
            marker: None,
            body: Box::new(body),
            teardown: None,
        }
    }

    /// Mark as an MPI test running on all ranks
    pub fn mpi(mut self) -> TestCase<C> {
        self.marker = Some(MpiMarker { np: None });
        self
    }

    /// Mark as an MPI test running on the first `np` ranks
    pub fn mpi_np(mut self, np: i64) -> TestCase<C> {
        self.marker = Some(MpiMarker { np: Some(np) });
        self
    }

    /// Run `teardown` on the active ranks after the body
    pub fn with_teardown<F>(mut self, teardown: F) -> TestCase<C>
    where
        F: Fn(&mut TestContext<'_, C>) -> anyhow::Result<()> + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }

    /// The test identity
    pub fn id(&self) -> &TestId {
        &self.id
    }

    /// The MPI marker, if any
    pub fn marker(&self) -> Option<&MpiMarker> {
        self.marker.as_ref()
    }

    /// The group size requested by the marker, `None` for all ranks or unmarked tests
    pub fn requested_size(&self) -> Option<i64> {
        self.marker.and_then(|marker| marker.np)
    }

    pub(crate) fn body(&self) -> &TestBody<C> {
        &self.body
    }

    pub(crate) fn teardown(&self) -> Option<&TestBody<C>> {
        self.teardown.as_ref()
    }
}

impl<C: Communicator> fmt::Debug for TestCase<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("marker", &self.marker)
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

/// Reports of all tests of a suite run, in run order
#[derive(Clone, Debug, Default, Serialize)]
pub struct SuiteReport {
    /// One report per test
    pub reports: Vec<TestReport>,
}

impl SuiteReport {
    fn count(&self, matches: impl Fn(Outcome) -> bool) -> usize {
        self.reports
            .iter()
            .filter(|report| matches(report.outcome()))
            .count()
    }

    /// Number of passed tests
    pub fn passed(&self) -> usize {
        self.count(|outcome| outcome == Outcome::Passed)
    }

    /// Number of failed or errored tests
    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failure)
    }

    /// Number of skipped tests
    pub fn skipped(&self) -> usize {
        self.count(|outcome| outcome == Outcome::Skipped)
    }

    /// The report of test `name`
    pub fn report(&self, name: &str) -> Option<&TestReport> {
        self.reports.iter().find(|report| report.test.name() == name)
    }
}

/// Runs suites through one coordinator
pub struct Harness<C: Communicator> {
    coordinator: LifecycleCoordinator<C>,
}

impl<C: Communicator> Harness<C> {
    /// A harness on `world`
    pub fn new(world: C, config: HarnessConfig) -> Harness<C> {
        Harness {
            coordinator: LifecycleCoordinator::new(world, config),
        }
    }

    /// The coordinator driving each test
    pub fn coordinator(&self) -> &LifecycleCoordinator<C> {
        &self.coordinator
    }

    /// Run `tests` in order.
    ///
    /// Every rank must pass the same tests in the same order.
    pub fn run(&self, tests: &[TestCase<C>]) -> Result<SuiteReport> {
        let mut suite = SuiteReport::default();
        for test in tests {
            suite.reports.push(self.coordinator.run(test)?);
        }
        if self.coordinator.is_leader() {
            info!(
                passed = suite.passed(),
                failed = suite.failed(),
                skipped = suite.skipped(),
                "suite finished"
            );
        }
        Ok(suite)
    }
}
