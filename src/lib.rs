//! Compile declarative package tests into build-graph operations, run them
//! against a freshly built artifact, and report every failure back at the
//! spec line that declared it.
//!
//! The same binary serves as the check dispatcher inside test containers;
//! see [`checks`].

pub mod checks;
pub mod compile;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod graph;
pub mod guard;
pub mod model;
pub mod panics;
pub mod report;

pub use coordinator::{SuiteOutcome, TestReport, TestRunner, TestState};
pub use error::{CheckFailure, SuiteError, TestError};
pub use executor::{BuildError, CancelToken, Executor, FsView};
pub use graph::{Graph, NodeId};
pub use model::{CheckOutput, FileCheckOutput, Located, SourceLocation, TestSpec, TestStep};
