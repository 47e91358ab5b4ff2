//! Runs every test of a suite against one artifact.
//!
//! Each test is compiled, then evaluated in its own task. A task never
//! stops at the first failure: every recorded check failure is decoded and
//! attributed. Results are joined into one [`SuiteError`], and the suite
//! hands back either the pristine artifact or a state that fails the build
//! with the joined error text.

use crate::checks::Command;
use crate::compile::{
    CompileContext, CompileError, CompiledTest, DISPATCHER_PATH, DISPATCHER_SOURCE_PATH,
    compile_test,
};
use crate::config::{BrokenArtifactPolicy, RunnerConfig};
use crate::error::{SuiteError, TestError};
use crate::executor::{BuildError, CancelToken, Executor};
use crate::graph::{ExecOp, Graph, Mount, Node, NodeId, Op};
use crate::guard::FinalState;
use crate::model::TestSpec;
use crate::panics;
use crate::report::{attribute, read_failures};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Where the joined error text is placed for the failing state.
pub const ERRORS_PATH: &str = "/errors.txt";

/// Where a test is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    /// Not started, or the suite was skipped.
    Pending,
    Compiling,
    /// Its validation state is being evaluated.
    Evaluating,
    Passed,
    /// At least one check, step or build error.
    Failed,
    /// Compiling or evaluating it panicked.
    Panicked,
    Cancelled,
}

impl TestState {
    /// Whether the test will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TestState::Passed | TestState::Failed | TestState::Panicked | TestState::Cancelled
        )
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestState::Pending => "pending",
            TestState::Compiling => "compiling",
            TestState::Evaluating => "evaluating",
            TestState::Passed => "passed",
            TestState::Failed => "failed",
            TestState::Panicked => "panicked",
            TestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Final state of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub name: String,
    pub state: TestState,
    /// Number of errors the test contributed to the suite error.
    pub errors: usize,
}

impl TestReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: TestState::Pending,
            errors: 0,
        }
    }

    fn advance(&mut self, state: TestState) {
        debug!(test = %self.name, from = %self.state, to = %state, "test state");
        self.state = state;
    }
}

/// Everything a suite run produced.
#[derive(Debug)]
pub struct SuiteOutcome {
    /// The input graph with every compiled node appended.
    pub graph: Graph,
    pub state: FinalState,
    /// Single node standing for `state`.
    pub output: NodeId,
    /// One report per declared test, in declaration order.
    pub reports: Vec<TestReport>,
    pub error: Option<SuiteError>,
}

impl SuiteOutcome {
    /// Whether no test contributed an error.
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    /// The output node, or every error of the suite.
    pub fn into_result(self) -> Result<NodeId, SuiteError> {
        match self.error {
            None => Ok(self.output),
            Some(e) => Err(e),
        }
    }
}

/// Runs a suite of tests through an [`Executor`].
pub struct TestRunner {
    executor: Arc<dyn Executor>,
    config: RunnerConfig,
    build_args: BTreeMap<String, String>,
}

impl TestRunner {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            config: RunnerConfig::default(),
            build_args: BTreeMap::new(),
        }
    }

    /// Use `config` instead of the defaults.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build arguments of the surrounding build, e.g. `build-arg:PKGCHECK_SKIP_TESTS`.
    pub fn with_build_args(mut self, args: BTreeMap<String, String>) -> Self {
        self.build_args = args;
        self
    }

    /// Run `tests` against `artifact`, a node of `graph`.
    pub async fn run(
        &self,
        mut graph: Graph,
        artifact: NodeId,
        tests: &[TestSpec],
        cancel: &CancelToken,
    ) -> SuiteOutcome {
        panics::install_hook();
        let mut reports: Vec<TestReport> = tests.iter().map(|t| TestReport::new(&t.name)).collect();

        let mut config = self.config.clone();
        if let Err(e) = config.apply_build_args(&self.build_args) {
            let dispatcher = graph.source(config.dispatcher_source.clone());
            let errors = vec![TestError::Config(e.to_string())];
            return failed(graph, dispatcher, reports, errors);
        }
        if config.skip_tests || tests.is_empty() {
            info!(tests = tests.len(), skip = config.skip_tests, "not running tests");
            return untouched(graph, artifact, reports);
        }

        let pre = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.executor.evaluate(&graph, artifact) => Some(r),
        };
        let dispatcher = graph.source(config.dispatcher_source.clone());
        match pre {
            None => {
                let errors = cancel_all(&mut reports);
                return failed(graph, dispatcher, reports, errors);
            }
            Some(Err(source)) => match config.on_broken_artifact {
                BrokenArtifactPolicy::Fail => {
                    warn!(error = %source, "artifact failed to build, not running tests");
                    let errors = vec![TestError::Artifact { source }];
                    return failed(graph, dispatcher, reports, errors);
                }
                BrokenArtifactPolicy::Skip => {
                    warn!(error = %source, "artifact failed to build, returning it untested");
                    return untouched(graph, artifact, reports);
                }
            },
            Some(Ok(_)) => {}
        }

        let mut errors: Vec<Vec<TestError>> = tests.iter().map(|_| Vec::new()).collect();
        let mut panicked = Vec::new();
        let mut compiled = Vec::with_capacity(tests.len());
        for (index, test) in tests.iter().enumerate() {
            reports[index].advance(TestState::Compiling);
            let ctx = CompileContext {
                base: artifact,
                dispatcher,
                group: config.group_for(&test.name),
            };
            match compile_recovering(&mut graph, &ctx, test, compile_test) {
                Ok(c) => compiled.push((index, c)),
                Err(e) => {
                    if matches!(e, TestError::Panic { .. }) {
                        panicked.push(index);
                    }
                    errors[index].push(e);
                }
            }
        }
        let validations: Vec<NodeId> = compiled
            .iter()
            .filter(|(_, c)| !c.is_noop())
            .map(|(_, c)| c.validation)
            .collect();

        let graph = Arc::new(graph);
        let collected: Arc<Mutex<Vec<(usize, Vec<TestError>)>>> = Arc::default();
        let mut set = JoinSet::new();
        let mut owners = HashMap::new();
        for (index, compiled) in compiled {
            reports[index].advance(TestState::Evaluating);
            let test = tests[index].clone();
            let executor = Arc::clone(&self.executor);
            let graph = Arc::clone(&graph);
            let cancel = cancel.clone();
            let collected = Arc::clone(&collected);
            let handle = set.spawn(async move {
                panics::register_current_task();
                let found = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => vec![TestError::Cancelled { test: test.name.clone() }],
                    found = evaluate(executor.as_ref(), &graph, &compiled, &test) => found,
                };
                collected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, found));
            });
            owners.insert(handle.id(), index);
        }

        while let Some(joined) = set.join_next_with_id().await {
            let e = match joined {
                Ok((id, ())) => {
                    panics::forget(id);
                    continue;
                }
                Err(e) => e,
            };
            let Some(&index) = owners.get(&e.id()) else {
                continue;
            };
            let test = tests[index].name.clone();
            let error = if e.is_panic() {
                let trace = panics::take_trace(e.id())
                    .unwrap_or_else(|| "<no stack trace captured>".to_string());
                let message = panics::panic_message(e.into_panic().as_ref());
                warn!(test = %test, panic = %message, "test task panicked");
                panicked.push(index);
                TestError::Panic {
                    test,
                    message,
                    trace,
                }
            } else {
                panics::forget(e.id());
                TestError::Cancelled { test }
            };
            errors[index].push(error);
        }

        let graph = Arc::unwrap_or_clone(graph);
        let collected = std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner));
        for (index, found) in collected {
            errors[index].extend(found);
        }

        for (index, report) in reports.iter_mut().enumerate() {
            let found = &errors[index];
            report.errors = found.len();
            let state = if found.is_empty() {
                TestState::Passed
            } else if panicked.contains(&index) {
                TestState::Panicked
            } else if found.iter().all(|e| matches!(e, TestError::Cancelled { .. })) {
                TestState::Cancelled
            } else {
                TestState::Failed
            };
            report.advance(state);
        }

        let errors: Vec<TestError> = errors.into_iter().flatten().collect();
        if !errors.is_empty() {
            return failed(graph, dispatcher, reports, errors);
        }
        info!(tests = tests.len(), "all tests passed");
        let state = if validations.is_empty() {
            FinalState::untouched(artifact)
        } else {
            FinalState::guard(artifact, validations)
        };
        finish(graph, state, reports, None)
    }
}

/// Compile one test, recovering a panic as that test's error.
fn compile_recovering<F>(
    graph: &mut Graph,
    ctx: &CompileContext,
    test: &TestSpec,
    compile: F,
) -> Result<CompiledTest, TestError>
where
    F: FnOnce(&mut Graph, &CompileContext, &TestSpec) -> Result<CompiledTest, CompileError>,
{
    match panics::catch(|| compile(graph, ctx, test)) {
        Ok(Ok(compiled)) => Ok(compiled),
        Ok(Err(e)) => Err(TestError::System {
            test: test.name.clone(),
            location: e.location().cloned().or(test.location.clone()),
            message: e.to_string(),
        }),
        Err(caught) => {
            warn!(test = %test.name, panic = %caught.message, "compiling test panicked");
            Err(TestError::Panic {
                test: test.name.clone(),
                message: caught.message,
                trace: caught.trace,
            })
        }
    }
}

/// Evaluate one test and collect everything that went wrong with it.
async fn evaluate(
    executor: &dyn Executor,
    graph: &Graph,
    compiled: &CompiledTest,
    test: &TestSpec,
) -> Vec<TestError> {
    if compiled.is_noop() {
        return Vec::new();
    }
    let view = match executor.evaluate(graph, compiled.validation).await {
        Ok(v) => v,
        Err(e) => return vec![build_error(graph, compiled, test, e)],
    };
    let records = match read_failures(view.as_ref()) {
        Ok(r) => r,
        Err(e) => {
            return vec![TestError::System {
                test: test.name.clone(),
                location: test.location.clone(),
                message: format!("could not read check results: {e}"),
            }];
        }
    };
    debug!(test = %test.name, records = records.len(), "decoded check results");
    records.iter().flat_map(|r| attribute(test, r)).collect()
}

/// Attribute an executor failure to the node that caused it.
///
/// A process that ran and exited non-zero is the test's fault; anything
/// else is the executor's.
fn build_error(graph: &Graph, compiled: &CompiledTest, test: &TestSpec, err: BuildError) -> TestError {
    let node = err.node.and_then(|id| graph.get(id).map(|n| (id, n)));
    let location = node
        .and_then(|(_, n)| n.locations.first().cloned())
        .or(test.location.clone());

    match (node, err.exit_code) {
        (Some((id, n)), Some(code)) if matches!(n.op, Op::Exec(_)) => {
            let name = n.name.as_deref().unwrap_or_default();
            let what = match compiled.step_index(id) {
                Some(i) => format!("step {i} {name:?}"),
                None => format!("check {name:?}"),
            };
            TestError::System {
                test: test.name.clone(),
                location,
                message: format!("{what} exited with code {code}: {err}"),
            }
        }
        (Some((id, n)), _) => TestError::Build {
            test: test.name.clone(),
            context: n.name.clone().unwrap_or_else(|| format!("node {id}")),
            location,
            source: err,
        },
        (None, _) => TestError::Build {
            test: test.name.clone(),
            context: "validation".to_string(),
            location,
            source: err,
        },
    }
}

fn cancel_all(reports: &mut [TestReport]) -> Vec<TestError> {
    reports
        .iter_mut()
        .map(|r| {
            r.advance(TestState::Cancelled);
            r.errors = 1;
            TestError::Cancelled {
                test: r.name.clone(),
            }
        })
        .collect()
}

fn untouched(graph: Graph, artifact: NodeId, reports: Vec<TestReport>) -> SuiteOutcome {
    finish(graph, FinalState::untouched(artifact), reports, None)
}

/// A state whose evaluation fails with the joined error text.
///
/// It does not build on the artifact, so it fails the same way whether or
/// not the artifact itself can be built.
fn failed(
    mut graph: Graph,
    dispatcher: NodeId,
    reports: Vec<TestReport>,
    errors: Vec<TestError>,
) -> SuiteOutcome {
    let suite = SuiteError::new(errors);
    warn!(failed = ?suite.failed_tests(), errors = suite.len(), "test suite failed");

    let text = suite.to_string();
    let errors_file = graph.add(Node::new(Op::File {
        path: ERRORS_PATH.to_string(),
        contents: text,
        mode: 0o644,
    }));
    let mut exec = ExecOp::new(
        errors_file,
        vec![
            DISPATCHER_PATH.to_string(),
            Command::ReportErrors.name().to_string(),
            ERRORS_PATH.to_string(),
        ],
    );
    exec.mounts.push(Mount {
        target: DISPATCHER_PATH.to_string(),
        source: dispatcher,
        source_path: Some(DISPATCHER_SOURCE_PATH.to_string()),
        readonly: true,
    });
    let report = graph.add(
        Node::new(Op::Exec(exec))
            .named(format!("{} test error(s)", suite.len()))
            .with_locations(suite.locations().into_iter().cloned()),
    );

    let state = FinalState {
        forced: Vec::new(),
        passthrough: report,
    };
    finish(graph, state, reports, Some(suite))
}

fn finish(
    mut graph: Graph,
    state: FinalState,
    reports: Vec<TestReport>,
    error: Option<SuiteError>,
) -> SuiteOutcome {
    let output = state.into_node(&mut graph);
    SuiteOutcome {
        graph,
        state,
        output,
        reports,
        error,
    }
}
