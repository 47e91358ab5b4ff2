//! Package test model.
//!
//! These values are produced upstream from a parsed spec document and are
//! only ever read here. Every user-facing field can carry the location it was
//! parsed from so that a failed check points back at the document line that
//! declared it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A position in the test document a value was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLocation {
    pub filename: String,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl SourceLocation {
    pub fn new(filename: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.line)
    }
}

/// A value tagged with the location it was declared at.
///
/// Serializes as the bare value; provenance never crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Located<T> {
    pub value: T,
    #[serde(skip)]
    pub location: Option<SourceLocation>,
}

impl<T> Located<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            location: None,
        }
    }

    pub fn at(value: T, location: SourceLocation) -> Self {
        Self {
            value,
            location: Some(location),
        }
    }
}

impl<T> From<T> for Located<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Located<String> {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

/// The kind recorded in a [`crate::error::CheckFailure`].
///
/// Each kind names the spec field that produced the check, which is what
/// failure attribution keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotExist,
    Permissions,
    IsDir,
    LinkTarget,
    Empty,
    Equals,
    Contains,
    Matches,
    StartsWith,
    EndsWith,
}

impl FailureKind {
    pub const ALL: [FailureKind; 10] = [
        FailureKind::NotExist,
        FailureKind::Permissions,
        FailureKind::IsDir,
        FailureKind::LinkTarget,
        FailureKind::Empty,
        FailureKind::Equals,
        FailureKind::Contains,
        FailureKind::Matches,
        FailureKind::StartsWith,
        FailureKind::EndsWith,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NotExist => "not_exist",
            FailureKind::Permissions => "permissions",
            FailureKind::IsDir => "is_dir",
            FailureKind::LinkTarget => "link_target",
            FailureKind::Empty => "empty",
            FailureKind::Equals => "equals",
            FailureKind::Contains => "contains",
            FailureKind::Matches => "matches",
            FailureKind::StartsWith => "starts_with",
            FailureKind::EndsWith => "ends_with",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown check kind: {s}"))
    }
}

/// Assertions on a byte stream: a captured stdout/stderr or a file's contents.
///
/// All set fields are checked independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutput {
    /// Exact contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Located<String>>,
    /// Substrings that must all appear.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contains: Vec<Located<String>>,
    /// Regular expressions that must all match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<Located<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_with: Option<Located<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_with: Option<Located<String>>,
    /// Only a `true` value produces a check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty: Option<Located<bool>>,
}

impl CheckOutput {
    /// Whether there is nothing to check.
    pub fn is_empty(&self) -> bool {
        self.equals.is_none()
            && self.contains.is_empty()
            && self.matches.is_empty()
            && self.starts_with.is_none()
            && self.ends_with.is_none()
            && !self.expects_empty()
    }

    pub fn expects_empty(&self) -> bool {
        self.empty.as_ref().is_some_and(|e| e.value)
    }

    pub fn with_equals(mut self, value: impl Into<Located<String>>) -> Self {
        self.equals = Some(value.into());
        self
    }

    pub fn with_contains(mut self, value: impl Into<Located<String>>) -> Self {
        self.contains.push(value.into());
        self
    }

    pub fn with_matches(mut self, value: impl Into<Located<String>>) -> Self {
        self.matches.push(value.into());
        self
    }

    pub fn with_starts_with(mut self, value: impl Into<Located<String>>) -> Self {
        self.starts_with = Some(value.into());
        self
    }

    pub fn with_ends_with(mut self, value: impl Into<Located<String>>) -> Self {
        self.ends_with = Some(value.into());
        self
    }

    pub fn with_empty(mut self) -> Self {
        self.empty = Some(Located::new(true));
        self
    }

    /// Location of the field that produced a failure of `kind`.
    ///
    /// List fields are disambiguated by the failure's expected value.
    pub fn location_for(&self, kind: FailureKind, expected: &str) -> Option<&SourceLocation> {
        match kind {
            FailureKind::Equals => self.equals.as_ref()?.location.as_ref(),
            FailureKind::Contains => in_list(&self.contains, expected),
            FailureKind::Matches => in_list(&self.matches, expected),
            FailureKind::StartsWith => self.starts_with.as_ref()?.location.as_ref(),
            FailureKind::EndsWith => self.ends_with.as_ref()?.location.as_ref(),
            FailureKind::Empty => self.empty.as_ref()?.location.as_ref(),
            _ => None,
        }
    }
}

/// Location of the list entry whose value is `expected`.
fn in_list<'a>(list: &'a [Located<String>], expected: &str) -> Option<&'a SourceLocation> {
    list.iter()
        .find(|v| v.value == expected)
        .and_then(|v| v.location.as_ref())
}

/// Assertions on a path in the post-test filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheckOutput {
    #[serde(flatten)]
    pub output: CheckOutput,
    /// Expected permission bits (e.g. `0o755`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Located<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dir: Option<Located<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_exist: Option<Located<bool>>,
    /// Expected symlink target, compared verbatim with `readlink`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<Located<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_follow_symlinks: Option<Located<bool>>,
    /// Location of the whole entry, used when a field has none of its own.
    #[serde(skip)]
    pub location: Option<SourceLocation>,
}

impl FileCheckOutput {
    pub fn expects_absent(&self) -> bool {
        self.not_exist.as_ref().is_some_and(|v| v.value)
    }

    pub fn expects_dir(&self) -> bool {
        self.is_dir.as_ref().is_some_and(|v| v.value)
    }

    pub fn no_follow(&self) -> bool {
        self.no_follow_symlinks.as_ref().is_some_and(|v| v.value)
    }

    pub fn with_output(mut self, output: CheckOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_not_exist(mut self, value: bool) -> Self {
        self.not_exist = Some(Located::new(value));
        self
    }

    pub fn with_is_dir(mut self, value: bool) -> Self {
        self.is_dir = Some(Located::new(value));
        self
    }

    pub fn with_permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(Located::new(mode));
        self
    }

    pub fn with_link_target(mut self, target: impl Into<String>) -> Self {
        self.link_target = Some(Located::new(target.into()));
        self
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Location of the field that produced a failure of `kind`, falling back
    /// to the whole entry.
    pub fn location_for(&self, kind: FailureKind, expected: &str) -> Option<&SourceLocation> {
        let field = match kind {
            FailureKind::NotExist => self.not_exist.as_ref().and_then(|v| v.location.as_ref()),
            FailureKind::Permissions => {
                self.permissions.as_ref().and_then(|v| v.location.as_ref())
            }
            FailureKind::IsDir => self.is_dir.as_ref().and_then(|v| v.location.as_ref()),
            FailureKind::LinkTarget => self.link_target.as_ref().and_then(|v| v.location.as_ref()),
            _ => self.output.location_for(kind, expected),
        };
        field.or(self.location.as_ref())
    }
}

/// An external source attached to every operation of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMount {
    /// Mount point inside the container.
    pub dest: String,
    /// Name of the source, resolved by the build-graph executor.
    pub source: String,
    /// Sub-path of the source to mount, if not its root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A command run inside the test container, with checks on its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    /// Split into words like a shell would, but never interpreted by one.
    pub command: Located<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdout: CheckOutput,
    #[serde(default)]
    pub stderr: CheckOutput,
}

impl TestStep {
    pub fn new(command: impl Into<Located<String>>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
            stdin: None,
            stdout: CheckOutput::default(),
            stderr: CheckOutput::default(),
        }
    }

    pub fn with_stdout(mut self, check: CheckOutput) -> Self {
        self.stdout = check;
        self
    }

    pub fn with_stderr(mut self, check: CheckOutput) -> Self {
        self.stderr = check;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A named test run against the built artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    /// Working directory for steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<TestMount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Run in order; each step sees what the previous one left behind.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<TestStep>,
    /// Checked after all steps, in no particular order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileCheckOutput>,
    #[serde(skip)]
    pub location: Option<SourceLocation>,
}

impl TestSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: None,
            mounts: Vec::new(),
            env: BTreeMap::new(),
            steps: Vec::new(),
            files: BTreeMap::new(),
            location: None,
        }
    }

    pub fn with_step(mut self, step: TestStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, check: FileCheckOutput) -> Self {
        self.files.insert(path.into(), check);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }
}
