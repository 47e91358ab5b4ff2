//! Check registry and in-container dispatcher.
//!
//! Every check kind is a [`Command`] with a stable wire name. A kind is
//! compiled on the host into dispatcher [`Invocation`]s and executed inside
//! the test container by the same binary.
//!
//! Exit codes:
//! - `0` pass (or a failure that was recorded to the report file)
//! - `1` bad arguments; the compiler and the dispatcher disagree
//! - `2` the check could not be performed (stat error, bad regex, bad octal)
//! - `3` the check failed
//! - `70` unknown command

mod content;
mod metadata;
mod step;

pub use content::{MAX_PREVIEW, preview};
pub use step::StepPlan;

use crate::error::CheckFailure;
use crate::model::{CheckOutput, FileCheckOutput, SourceLocation};
use crate::report::FailureRecord;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const EXIT_PASS: u8 = 0;
pub const EXIT_USAGE: u8 = 1;
pub const EXIT_PRECONDITION: u8 = 2;
pub const EXIT_FAILED: u8 = 3;
pub const EXIT_UNKNOWN: u8 = 70;

/// Directory every logical path is resolved under. Defaults to `/`.
pub const ROOT_ENV: &str = "PKGCHECK_ROOT";
/// Logical path of the record file a failure is appended to.
pub const REPORT_ENV: &str = "PKGCHECK_REPORT";
/// `Filename` of the record: the checked path, or `stdout`/`stderr`.
pub const REPORT_TARGET_ENV: &str = "PKGCHECK_REPORT_TARGET";
/// `StepIndex` of the record, for stream checks.
pub const REPORT_STEP_ENV: &str = "PKGCHECK_REPORT_STEP";

/// Internal paths are reported by their base name.
pub const INTERNAL_PREFIX: &str = "/tmp/internal/pkgcheck";

/// A dispatcher command, identified on the command line by its wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `check-file-exists`: the path must exist.
    FileExists,
    /// `check-file-not-exists`: the path must not exist.
    FileNotExists,
    /// `check-file-isdir`: the path must (or, with `--not=true`, must not) be a directory.
    FileIsDir,
    /// `check-file-perms`: permission bits must equal an octal mode.
    FilePerms,
    /// `check-link-target`: the symlink must point at the given target, verbatim.
    LinkTarget,
    /// `check-file-contains`: the contents must contain a substring.
    FileContains,
    /// `check-file-matches`: the contents must match a regular expression.
    FileMatches,
    /// `check-file-starts-with`: the contents must start with a prefix.
    FileStartsWith,
    /// `check-file-ends-with`: the contents must end with a suffix.
    FileEndsWith,
    /// `check-file-equals`: the contents must equal a value exactly.
    FileEquals,
    /// `check-file-empty`: the file must have no contents.
    FileEmpty,
    /// `step-runner`: run one test step from its JSON plan.
    StepRunner,
    /// `report-errors`: copy an error report to stderr and fail.
    ReportErrors,
}

impl Command {
    /// Every command, in a stable order.
    pub const ALL: [Command; 13] = [
        Command::FileExists,
        Command::FileNotExists,
        Command::FileIsDir,
        Command::FilePerms,
        Command::LinkTarget,
        Command::FileContains,
        Command::FileMatches,
        Command::FileStartsWith,
        Command::FileEndsWith,
        Command::FileEquals,
        Command::FileEmpty,
        Command::StepRunner,
        Command::ReportErrors,
    ];

    /// The wire name used on the dispatcher command line.
    pub fn name(self) -> &'static str {
        match self {
            Command::FileExists => "check-file-exists",
            Command::FileNotExists => "check-file-not-exists",
            Command::FileIsDir => "check-file-isdir",
            Command::FilePerms => "check-file-perms",
            Command::LinkTarget => "check-link-target",
            Command::FileContains => "check-file-contains",
            Command::FileMatches => "check-file-matches",
            Command::FileStartsWith => "check-file-starts-with",
            Command::FileEndsWith => "check-file-ends-with",
            Command::FileEquals => "check-file-equals",
            Command::FileEmpty => "check-file-empty",
            Command::StepRunner => "step-runner",
            Command::ReportErrors => "report-errors",
        }
    }

    fn execute(self, args: &[String], env: &CheckEnv) -> Outcome {
        match self {
            Command::FileExists => metadata::exists(args, env, true),
            Command::FileNotExists => metadata::exists(args, env, false),
            Command::FileIsDir => metadata::is_dir(args, env),
            Command::FilePerms => metadata::perms(args, env),
            Command::LinkTarget => metadata::link_target(args, env),
            Command::FileContains
            | Command::FileMatches
            | Command::FileStartsWith
            | Command::FileEndsWith
            | Command::FileEquals
            | Command::FileEmpty => content::execute(self, args, env),
            Command::StepRunner => step::execute(args, env),
            Command::ReportErrors => report_errors(args, env),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown command: {s}"))
    }
}

/// One dispatcher call produced by compiling a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    /// Arguments after the command name.
    pub args: Vec<String>,
    /// Where the check was declared.
    pub location: Option<SourceLocation>,
}

impl Invocation {
    fn new(command: Command, args: Vec<String>, location: Option<&SourceLocation>) -> Self {
        Self {
            command,
            args,
            location: location.cloned(),
        }
    }

    /// The command name followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.name().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Compile every check declared for a file path.
pub fn compile_file_checks(path: &str, check: &FileCheckOutput) -> Vec<Invocation> {
    let mut out = vec![metadata::compile_exists(path, check)];
    if check.expects_absent() {
        return out;
    }
    out.extend(metadata::compile_is_dir(path, check));
    out.extend(metadata::compile_perms(path, check));
    out.extend(metadata::compile_link_target(path, check));
    out.extend(compile_output_checks(path, &check.output));
    out
}

/// Compile the content checks of a stream or file.
pub fn compile_output_checks(path: &str, check: &CheckOutput) -> Vec<Invocation> {
    if check.is_empty() {
        return Vec::new();
    }
    content::compile(path, check)
}

/// What a dispatcher command concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The expectation held.
    Pass,
    /// The expectation did not hold.
    Failed(CheckFailure),
    /// The arguments did not fit the command.
    Usage(String),
    /// The check could not be performed.
    Precondition(String),
    /// Exit with this code; used to propagate a step's own status.
    Exit(u8),
}

/// Process environment of one dispatcher invocation.
#[derive(Debug, Clone, Default)]
pub struct CheckEnv {
    pub root: Sysroot,
    /// Set in reporting mode.
    pub report: Option<ReportSink>,
}

impl CheckEnv {
    /// Read `PKGCHECK_ROOT` and the reporting variables; empty values count as unset.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v: &String| !v.is_empty());
        let root = var(ROOT_ENV).map(Sysroot::new).unwrap_or_default();
        let report = var(REPORT_ENV).map(|path| ReportSink {
            path,
            target: var(REPORT_TARGET_ENV).unwrap_or_default(),
            step: var(REPORT_STEP_ENV).and_then(|s| s.parse().ok()),
        });
        Self { root, report }
    }
}

/// Maps logical (in-container) paths onto the host filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sysroot(PathBuf);

impl Sysroot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self(root.into())
    }

    /// The host path of an absolute in-container path.
    pub fn resolve(&self, logical: &str) -> PathBuf {
        if self.0 == Path::new("/") {
            return PathBuf::from(logical);
        }
        self.0.join(logical.trim_start_matches('/'))
    }
}

impl Default for Sysroot {
    fn default() -> Self {
        Self(PathBuf::from("/"))
    }
}

/// Where a failed check records itself instead of failing the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSink {
    /// Logical path of the record file.
    pub path: String,
    /// `Filename` of the record.
    pub target: String,
    /// `StepIndex` of the record.
    pub step: Option<usize>,
}

impl ReportSink {
    fn append(&self, root: &Sysroot, failure: &CheckFailure) -> std::io::Result<()> {
        let path = root.resolve(&self.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = FailureRecord {
            filename: self.target.clone(),
            step_index: self.step,
            checks: vec![failure.clone()],
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        f.write_all(&line)
    }
}

/// Run a dispatcher command line (without the program name).
pub fn dispatch(args: &[String]) -> u8 {
    let Some((name, rest)) = args.split_first() else {
        eprintln!("usage: pkgcheck <command> [args...]");
        return EXIT_USAGE;
    };

    let command = match name.parse::<Command>() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pkgcheck: {e}");
            return EXIT_UNKNOWN;
        }
    };

    let env = CheckEnv::from_env();
    tracing::debug!(command = %command, args = ?rest, "dispatching");
    let outcome = command.execute(rest, &env);
    finish(outcome, &env)
}

fn finish(outcome: Outcome, env: &CheckEnv) -> u8 {
    match outcome {
        Outcome::Pass => EXIT_PASS,
        Outcome::Failed(failure) => {
            eprintln!("{failure}");
            let Some(sink) = &env.report else {
                return EXIT_FAILED;
            };
            match sink.append(&env.root, &failure) {
                Ok(()) => EXIT_PASS,
                Err(e) => {
                    eprintln!("error recording check failure: {e}");
                    EXIT_PRECONDITION
                }
            }
        }
        Outcome::Usage(msg) => {
            eprintln!("{msg}");
            EXIT_USAGE
        }
        Outcome::Precondition(msg) => {
            eprintln!("{msg}");
            EXIT_PRECONDITION
        }
        Outcome::Exit(code) => code,
    }
}

/// Copy an error report to stderr and fail.
fn report_errors(args: &[String], env: &CheckEnv) -> Outcome {
    let [path] = args else {
        return Outcome::Usage("expected 1 argument: <errors-file>".to_string());
    };
    match std::fs::read(env.root.resolve(path)) {
        Ok(dt) => {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(&dt);
            let _ = stderr.write_all(b"\n");
            Outcome::Exit(1)
        }
        Err(e) => Outcome::Usage(format!("error reading {path}: {e}")),
    }
}

fn filter_path(p: &str) -> String {
    if p.starts_with(INTERNAL_PREFIX) {
        return Path::new(p)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| p.to_string());
    }
    p.to_string()
}
