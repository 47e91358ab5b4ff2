//! Error types shared by the compiler, the coordinator and the dispatcher.

use crate::executor::BuildError;
use crate::model::SourceLocation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single failed check, as produced inside the container.
///
/// This is also the persisted wire format, hence the capitalised field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("expected {path:?} {kind} {expected:?}, got {actual:?}")]
pub struct CheckFailure {
    #[serde(rename = "Kind")]
    pub kind: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Expected", default)]
    pub expected: String,
    #[serde(rename = "Actual", default)]
    pub actual: String,
}

fn prefix(location: &Option<SourceLocation>) -> String {
    match location {
        Some(loc) => format!("{loc}: "),
        None => String::new(),
    }
}

/// Everything that can make a single test fail.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// A check ran and the expectation did not hold.
    #[error("{}{test:?}: {context}: {failure}", prefix(.location))]
    Check {
        test: String,
        context: String,
        location: Option<SourceLocation>,
        failure: CheckFailure,
    },
    /// The test could not be checked as declared: bad spec values, a step
    /// that exited non-zero, or results that could not be read back.
    #[error("{}{test:?}: {message}", prefix(.location))]
    System {
        test: String,
        location: Option<SourceLocation>,
        message: String,
    },
    /// The executor failed to build part of the test's graph.
    #[error("{}{test:?}: {context}: {source}", prefix(.location))]
    Build {
        test: String,
        context: String,
        location: Option<SourceLocation>,
        #[source]
        source: BuildError,
    },
    /// The task running the test panicked.
    #[error("panic running test {test:?}: {message}\n{trace}")]
    Panic {
        test: String,
        message: String,
        trace: String,
    },
    /// The run was cancelled before the test finished.
    #[error("{test:?}: cancelled before results were available")]
    Cancelled { test: String },
    /// The artifact under test could not be built, so nothing was tested.
    #[error("pre-test artifact failed to build: {source}")]
    Artifact {
        #[source]
        source: BuildError,
    },
    /// A runner setting made the suite impossible to run.
    #[error("{0}")]
    Config(String),
}

impl TestError {
    /// Name of the test the error belongs to; suite-wide errors have none.
    pub fn test(&self) -> Option<&str> {
        match self {
            TestError::Check { test, .. }
            | TestError::System { test, .. }
            | TestError::Build { test, .. }
            | TestError::Panic { test, .. }
            | TestError::Cancelled { test } => Some(test),
            TestError::Artifact { .. } | TestError::Config(_) => None,
        }
    }

    /// Where in the test document the error points.
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            TestError::Check { location, .. }
            | TestError::System { location, .. }
            | TestError::Build { location, .. } => location.as_ref(),
            _ => None,
        }
    }

    /// The decoded check failure, for [`TestError::Check`].
    pub fn check_failure(&self) -> Option<&CheckFailure> {
        match self {
            TestError::Check { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Every failure of every test in a suite.
///
/// Each error stays individually inspectable; `Display` lists all of them.
#[derive(Debug, Default)]
pub struct SuiteError {
    errors: Vec<TestError>,
}

impl SuiteError {
    pub fn new(errors: Vec<TestError>) -> Self {
        Self { errors }
    }

    /// Every error, in test declaration order.
    pub fn errors(&self) -> &[TestError] {
        &self.errors
    }

    /// Take the errors out.
    pub fn into_errors(self) -> Vec<TestError> {
        self.errors
    }

    /// Whether the suite had no errors at all.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of errors across all tests.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Names of the tests that contributed at least one error.
    pub fn failed_tests(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.errors.iter().filter_map(TestError::test).collect();
        names.dedup();
        names
    }

    /// Source locations of every located error.
    pub fn locations(&self) -> Vec<&SourceLocation> {
        self.errors.iter().filter_map(TestError::location).collect()
    }
}

impl From<Vec<TestError>> for SuiteError {
    fn from(errors: Vec<TestError>) -> Self {
        Self::new(errors)
    }
}

impl fmt::Display for SuiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SuiteError {}
