//! Persisted check failures and how they map back onto a test.
//!
//! Each check that fails in reporting mode appends a [`FailureRecord`] to
//! its own file under [`FAILURES_DIR`]. Once a test's validation state has
//! been evaluated, the coordinator reads that directory and resolves every
//! failure to the spec field that declared it.

use crate::error::{CheckFailure, TestError};
use crate::executor::FsView;
use crate::model::{CheckOutput, FailureKind, SourceLocation, TestSpec};
use serde::{Deserialize, Serialize};
use std::io;

/// Directory, inside a validation state, that holds failure records.
pub const FAILURES_DIR: &str = "/tmp/internal/pkgcheck/failures";

/// Failures of one step stream or one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// `stdout`/`stderr` for step records, the checked path otherwise.
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "StepIndex", default)]
    pub step_index: Option<usize>,
    #[serde(rename = "Checks", default)]
    pub checks: Vec<CheckFailure>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("error decoding {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a concatenated stream of JSON records.
pub fn decode_records(data: &[u8]) -> serde_json::Result<Vec<FailureRecord>> {
    serde_json::Deserializer::from_slice(data)
        .into_iter::<FailureRecord>()
        .collect()
}

/// Every record in a validation state, in file name order.
///
/// A missing directory means nothing failed.
pub fn read_failures(view: &dyn FsView) -> Result<Vec<FailureRecord>, ReportError> {
    let mut names = match view.read_dir(FAILURES_DIR) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ReportError::Io {
                path: FAILURES_DIR.to_string(),
                source,
            });
        }
    };
    names.sort();

    let mut records = Vec::new();
    for name in names {
        let path = format!("{FAILURES_DIR}/{name}");
        let data = view.read(&path).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        let decoded =
            decode_records(&data).map_err(|source| ReportError::Decode { path, source })?;
        records.extend(decoded);
    }
    Ok(records)
}

/// Turn one record into located errors for `test`.
///
/// A record that does not correspond to anything the test declared means
/// the compiler and the dispatcher disagree, and is reported as such.
pub fn attribute(test: &TestSpec, record: &FailureRecord) -> Vec<TestError> {
    let fallback = test.location.as_ref();

    if let Some(index) = record.step_index {
        let Some(step) = test.steps.get(index) else {
            return vec![bug(
                test,
                format!(
                    "failure recorded for step {index} but the test has {} steps",
                    test.steps.len()
                ),
            )];
        };
        let output: &CheckOutput = match record.filename.as_str() {
            "stdout" => &step.stdout,
            "stderr" => &step.stderr,
            other => {
                return vec![bug(test, format!("failure recorded for unknown stream {other:?}"))];
            }
        };
        let context = format!("step {index}: {}", record.filename);
        return record
            .checks
            .iter()
            .map(|failure| {
                let location = kind(failure)
                    .and_then(|k| output.location_for(k, &failure.expected))
                    .or(step.command.location.as_ref())
                    .or(fallback);
                check_error(test, &context, location, failure)
            })
            .collect();
    }

    let Some(file) = test.files.get(&record.filename) else {
        return vec![bug(
            test,
            format!("failure recorded for undeclared file {:?}", record.filename),
        )];
    };
    record
        .checks
        .iter()
        .map(|failure| {
            let location = kind(failure)
                .and_then(|k| file.location_for(k, &failure.expected))
                .or(fallback);
            check_error(test, &record.filename, location, failure)
        })
        .collect()
}

fn kind(failure: &CheckFailure) -> Option<FailureKind> {
    failure.kind.parse().ok()
}

fn check_error(
    test: &TestSpec,
    context: &str,
    location: Option<&SourceLocation>,
    failure: &CheckFailure,
) -> TestError {
    TestError::Check {
        test: test.name.clone(),
        context: context.to_string(),
        location: location.cloned(),
        failure: failure.clone(),
    }
}

fn bug(test: &TestSpec, message: String) -> TestError {
    TestError::System {
        test: test.name.clone(),
        location: test.location.clone(),
        message: format!("bug: {message}"),
    }
}
