//! Compiles one test into build-graph operations.
//!
//! Steps are chained: each runs on the state the previous one left behind.
//! Every check becomes its own dispatcher invocation, parented on the state
//! it inspects. Siblings are fanned back in with [`Graph::merge_at_path`],
//! never chained to each other, so they all run and none waits on another.

use crate::checks::{
    self, Command, Invocation, REPORT_ENV, REPORT_STEP_ENV, REPORT_TARGET_ENV, StepPlan,
};
use crate::graph::{ExecOp, Graph, Mount, Node, NodeId, Op};
use crate::model::{CheckOutput, SourceLocation, TestSpec, TestStep};
use crate::report::FAILURES_DIR;

/// Where the dispatcher executable is mounted in every container.
pub const DISPATCHER_PATH: &str = "/tmp/internal/pkgcheck/frontend";
/// Path of the dispatcher inside its source.
pub const DISPATCHER_SOURCE_PATH: &str = "/pkgcheck";
/// Where a step's plan is mounted.
pub const STEP_PLAN_PATH: &str = "/tmp/internal/pkgcheck/step/step.json";
/// Per-step capture directory; step `i` writes `<dir>/<i>/{stdout,stderr}`.
pub const STEP_OUTPUT_DIR: &str = "/tmp/internal/pkgcheck/step/output";

const PLAN_FILE: &str = "/step.json";

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("step {index}: invalid command {command:?}: {reason}")]
    Command {
        index: usize,
        command: String,
        location: Option<SourceLocation>,
        reason: &'static str,
    },
    #[error("step {index}: could not encode step plan: {source}")]
    Plan {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl CompileError {
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            CompileError::Command { location, .. } => location.as_ref(),
            CompileError::Plan { .. } => None,
        }
    }
}

/// Inputs shared by every test compiled against one artifact.
#[derive(Debug, Clone)]
pub struct CompileContext {
    /// The artifact under test.
    pub base: NodeId,
    /// Filesystem holding the dispatcher at [`DISPATCHER_SOURCE_PATH`].
    pub dispatcher: NodeId,
    /// Progress group for every node of the test.
    pub group: String,
}

/// The compiled form of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTest {
    pub name: String,
    /// Evaluating this runs every step and check of the test.
    pub validation: NodeId,
    /// Step nodes, in step order.
    pub steps: Vec<NodeId>,
    /// Every check node.
    pub checks: Vec<NodeId>,
}

impl CompiledTest {
    /// Whether the test declares nothing to run.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty() && self.checks.is_empty()
    }

    /// Step index of a node, if it is one of this test's steps.
    pub fn step_index(&self, node: NodeId) -> Option<usize> {
        self.steps.iter().position(|s| *s == node)
    }
}

pub fn compile_test(
    graph: &mut Graph,
    ctx: &CompileContext,
    test: &TestSpec,
) -> Result<CompiledTest, CompileError> {
    let mut compiler = TestCompiler::new(graph, ctx, test);
    let mut state = ctx.base;

    for (index, step) in test.steps.iter().enumerate() {
        let ran = compiler.step(state, index, step)?;
        state = compiler.stream_checks(ran, index, step);
    }

    let mut per_file = Vec::with_capacity(test.files.len());
    for (path, check) in &test.files {
        let invocations = checks::compile_file_checks(path, check);
        let fallback = check.location.as_ref().or(test.location.as_ref());
        let nodes = compiler.check_nodes(state, &invocations, path, None, fallback);
        per_file.push(compiler.graph.merge_at_path(state, nodes, "/"));
    }
    let validation = compiler.graph.merge_at_path(state, per_file, "/");

    tracing::debug!(
        test = %test.name,
        steps = compiler.steps.len(),
        checks = compiler.checks.len(),
        node = %validation,
        "compiled test"
    );
    Ok(CompiledTest {
        name: test.name.clone(),
        validation,
        steps: compiler.steps,
        checks: compiler.checks,
    })
}

struct TestCompiler<'a> {
    graph: &'a mut Graph,
    ctx: &'a CompileContext,
    test: &'a TestSpec,
    mounts: Vec<Mount>,
    steps: Vec<NodeId>,
    checks: Vec<NodeId>,
}

impl<'a> TestCompiler<'a> {
    fn new(graph: &'a mut Graph, ctx: &'a CompileContext, test: &'a TestSpec) -> Self {
        let mut mounts = vec![Mount {
            target: DISPATCHER_PATH.to_string(),
            source: ctx.dispatcher,
            source_path: Some(DISPATCHER_SOURCE_PATH.to_string()),
            readonly: true,
        }];
        for m in &test.mounts {
            let source = graph.source(m.source.clone());
            mounts.push(Mount {
                target: m.dest.clone(),
                source,
                source_path: m.path.clone(),
                readonly: false,
            });
        }
        Self {
            graph,
            ctx,
            test,
            mounts,
            steps: Vec::new(),
            checks: Vec::new(),
        }
    }

    fn exec(&self, root: NodeId, args: Vec<String>) -> ExecOp {
        let mut exec = ExecOp::new(root, args);
        exec.env = self.test.env.clone();
        exec.cwd = self.test.dir.clone();
        exec.mounts = self.mounts.clone();
        exec
    }

    fn step(&mut self, state: NodeId, index: usize, step: &TestStep) -> Result<NodeId, CompileError> {
        let command = &step.command;
        let reason = match shlex::split(&command.value) {
            None => Some("unbalanced quoting"),
            Some(words) if words.is_empty() => Some("empty command"),
            Some(_) => None,
        };
        if let Some(reason) = reason {
            return Err(CompileError::Command {
                index,
                command: command.value.clone(),
                location: command.location.clone().or(self.test.location.clone()),
                reason,
            });
        }

        let capture = |check: &CheckOutput, stream: &str| {
            (!check.is_empty()).then(|| stream_path(index, stream))
        };
        let plan = StepPlan {
            command: command.value.clone(),
            env: step.env.clone(),
            stdin: step.stdin.clone(),
            dir: self.test.dir.clone(),
            stdout: capture(&step.stdout, "stdout"),
            stderr: capture(&step.stderr, "stderr"),
        };
        let contents =
            serde_json::to_string(&plan).map_err(|source| CompileError::Plan { index, source })?;
        let plan_file = self.graph.add(
            Node::new(Op::File {
                path: PLAN_FILE.to_string(),
                contents,
                mode: 0o600,
            })
            .in_group(self.ctx.group.clone()),
        );

        let mut exec = self.exec(
            state,
            vec![
                DISPATCHER_PATH.to_string(),
                Command::StepRunner.name().to_string(),
                STEP_PLAN_PATH.to_string(),
            ],
        );
        exec.mounts.push(Mount {
            target: STEP_PLAN_PATH.to_string(),
            source: plan_file,
            source_path: Some(PLAN_FILE.to_string()),
            readonly: true,
        });

        let node = self.graph.add(
            Node::new(Op::Exec(exec))
                .named(command.value.clone())
                .in_group(self.ctx.group.clone())
                .at(command.location.clone().or(self.test.location.clone())),
        );
        self.steps.push(node);
        Ok(node)
    }

    fn stream_checks(&mut self, state: NodeId, index: usize, step: &TestStep) -> NodeId {
        let test = self.test;
        let fallback = step.command.location.as_ref().or(test.location.as_ref());
        let mut nodes = Vec::new();
        for (stream, check) in [("stdout", &step.stdout), ("stderr", &step.stderr)] {
            let invocations = checks::compile_output_checks(&stream_path(index, stream), check);
            nodes.extend(self.check_nodes(state, &invocations, stream, Some(index), fallback));
        }
        self.graph.merge_at_path(state, nodes, "/")
    }

    /// One exec per invocation, each parented directly on `state`.
    fn check_nodes(
        &mut self,
        state: NodeId,
        invocations: &[Invocation],
        target: &str,
        step: Option<usize>,
        fallback: Option<&SourceLocation>,
    ) -> Vec<NodeId> {
        let mut nodes = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let seq = self.checks.len();
            let args: Vec<String> = std::iter::once(DISPATCHER_PATH.to_string())
                .chain(invocation.argv())
                .collect();

            let mut exec = self.exec(state, args);
            let report = format!("{FAILURES_DIR}/{seq:04}-{}.json", invocation.command);
            exec.env.insert(REPORT_ENV.to_string(), report);
            exec.env.insert(REPORT_TARGET_ENV.to_string(), target.to_string());
            if let Some(step) = step {
                exec.env.insert(REPORT_STEP_ENV.to_string(), step.to_string());
            }

            let name = display_name(invocation, target);
            let node = self.graph.add(
                Node::new(Op::Exec(exec))
                    .named(name)
                    .in_group(self.ctx.group.clone())
                    .at(invocation.location.clone().or(fallback.cloned())),
            );
            self.checks.push(node);
            nodes.push(node);
        }
        nodes
    }
}

fn stream_path(index: usize, stream: &str) -> String {
    format!("{STEP_OUTPUT_DIR}/{index}/{stream}")
}

/// `<command> <args>` with internal capture paths shown as the stream name.
fn display_name(invocation: &Invocation, target: &str) -> String {
    let args: Vec<&str> = invocation
        .args
        .iter()
        .map(|a| {
            if a.starts_with(STEP_OUTPUT_DIR) {
                target
            } else {
                a.as_str()
            }
        })
        .collect();
    format!("{} {}", invocation.command, args.join(" "))
}
