//! Checks on the bytes of a file or captured stream.
//!
//! Files are memory-mapped so a multi-gigabyte payload costs nothing to
//! inspect. Only a bounded preview of the contents ever reaches a report.

use super::{CheckEnv, Command, Invocation, Outcome, filter_path};
use crate::error::CheckFailure;
use crate::model::{CheckOutput, FailureKind, Located};
use memmap2::Mmap;
use regex::bytes::Regex;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;

/// Bytes of file contents shown in a failure before truncating.
pub const MAX_PREVIEW: usize = 1024;

/// A read-only view of a file's contents.
enum MappedFile {
    Empty,
    Mapped(Mmap),
}

impl MappedFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // Mapping a zero-length file fails on some platforms.
        if file.metadata()?.len() == 0 {
            return Ok(MappedFile::Empty);
        }
        // SAFETY: the file is opened read-only and checks run after every
        // step has exited, so nothing truncates it while it is mapped.
        let map = unsafe { Mmap::map(&file)? };
        Ok(MappedFile::Mapped(map))
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MappedFile::Empty => &[],
            MappedFile::Mapped(m) => &m[..],
        }
    }
}

/// Render file contents for a failure message.
pub fn preview(data: &[u8]) -> String {
    if data.contains(&0) {
        return "<binary data>".to_string();
    }
    if data.len() > MAX_PREVIEW {
        return format!(
            "{}<...truncated to {MAX_PREVIEW} bytes out of {} bytes>",
            String::from_utf8_lossy(&data[..MAX_PREVIEW]),
            data.len()
        );
    }
    String::from_utf8_lossy(data).into_owned()
}

pub(super) fn compile(path: &str, check: &CheckOutput) -> Vec<Invocation> {
    let with_value = |command: Command, value: &Located<String>| {
        Invocation::new(
            command,
            vec![path.to_string(), value.value.clone()],
            value.location.as_ref(),
        )
    };

    let mut out = Vec::new();
    out.extend(check.equals.iter().map(|v| with_value(Command::FileEquals, v)));
    out.extend(check.contains.iter().map(|v| with_value(Command::FileContains, v)));
    out.extend(check.matches.iter().map(|v| with_value(Command::FileMatches, v)));
    out.extend(check.starts_with.iter().map(|v| with_value(Command::FileStartsWith, v)));
    out.extend(check.ends_with.iter().map(|v| with_value(Command::FileEndsWith, v)));
    if check.expects_empty() {
        let location = check.empty.as_ref().and_then(|e| e.location.as_ref());
        out.push(Invocation::new(
            Command::FileEmpty,
            vec![path.to_string()],
            location,
        ));
    }
    out
}

fn kind_of(command: Command) -> FailureKind {
    match command {
        Command::FileEquals => FailureKind::Equals,
        Command::FileContains => FailureKind::Contains,
        Command::FileMatches => FailureKind::Matches,
        Command::FileStartsWith => FailureKind::StartsWith,
        Command::FileEndsWith => FailureKind::EndsWith,
        _ => FailureKind::Empty,
    }
}

pub(super) fn execute(command: Command, args: &[String], env: &CheckEnv) -> Outcome {
    let (path, expected) = match (command, args) {
        (Command::FileEmpty, [path]) => (path, ""),
        (Command::FileEmpty, _) => {
            return Outcome::Usage("expected 1 argument: <file-path>".to_string());
        }
        (_, [path, value]) => (path, value.as_str()),
        _ => return Outcome::Usage("expected 2 arguments: <file-path> <value>".to_string()),
    };

    let pattern = match command {
        Command::FileMatches => match Regex::new(expected) {
            Ok(re) => Some(re),
            Err(e) => {
                return Outcome::Precondition(format!(
                    "error compiling regex pattern {expected:?}: {e}"
                ));
            }
        },
        _ => None,
    };

    let data = match MappedFile::open(&env.root.resolve(path)) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Outcome::Pass,
        Err(e) => return Outcome::Precondition(format!("error opening file {path}: {e}")),
    };

    let needle = expected.as_bytes();
    let ok = match command {
        Command::FileEquals => *data == *needle,
        Command::FileContains => contains(&data, needle),
        Command::FileMatches => pattern.is_some_and(|re| re.is_match(&data)),
        Command::FileStartsWith => data.starts_with(needle),
        Command::FileEndsWith => data.ends_with(needle),
        _ => data.is_empty(),
    };
    if ok {
        return Outcome::Pass;
    }

    Outcome::Failed(CheckFailure {
        kind: kind_of(command).to_string(),
        path: filter_path(path),
        expected: expected.to_string(),
        actual: preview(&data),
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::Sysroot;
    use std::fs;
    use tempfile::TempDir;

    fn env_with(files: &[(&str, &str)]) -> (TempDir, CheckEnv) {
        let dir = TempDir::new().unwrap();
        for (name, body) in files {
            let p = dir.path().join(name.trim_start_matches('/'));
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, body).unwrap();
        }
        let env = CheckEnv {
            root: Sysroot::new(dir.path()),
            report: None,
        };
        (dir, env)
    }

    fn run(command: Command, args: &[&str], env: &CheckEnv) -> Outcome {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        execute(command, &args, env)
    }

    #[test]
    fn preview_bounds() {
        assert_eq!(preview(b"hello"), "hello");
        assert_eq!(preview(b"a\0b"), "<binary data>");
        let big = vec![b'x'; 2000];
        let p = preview(&big);
        assert!(p.starts_with(&"x".repeat(1024)));
        assert!(p.ends_with("<...truncated to 1024 bytes out of 2000 bytes>"));
    }

    #[test]
    fn each_content_check_passes_and_fails() {
        let (_dir, env) = env_with(&[("/etc/motd", "welcome to the box\n")]);
        let cases = [
            (Command::FileEquals, "welcome to the box\n", "welcome"),
            (Command::FileContains, "the box", "a crate"),
            (Command::FileMatches, "^welcome.*box", "^box"),
            (Command::FileStartsWith, "welcome", "box"),
            (Command::FileEndsWith, "box\n", "welcome"),
        ];
        for (command, good, bad) in cases {
            assert_eq!(run(command, &["/etc/motd", good], &env), Outcome::Pass, "{command}");
            match run(command, &["/etc/motd", bad], &env) {
                Outcome::Failed(f) => {
                    assert_eq!(f.kind, kind_of(command).as_str());
                    assert_eq!(f.expected, bad);
                    assert_eq!(f.actual, "welcome to the box\n");
                }
                other => panic!("{command}: {other:?}"),
            }
        }
    }

    #[test]
    fn empty_check() {
        let (_dir, env) = env_with(&[("/a", ""), ("/b", "data")]);
        assert_eq!(run(Command::FileEmpty, &["/a"], &env), Outcome::Pass);
        match run(Command::FileEmpty, &["/b"], &env) {
            Outcome::Failed(f) => {
                assert_eq!(f.kind, "empty");
                assert_eq!(f.actual, "data");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn bad_regex_is_precondition() {
        let (_dir, env) = env_with(&[("/a", "x")]);
        assert!(matches!(
            run(Command::FileMatches, &["/a", "(unclosed"], &env),
            Outcome::Precondition(_)
        ));
    }

    #[test]
    fn wrong_arity_is_usage() {
        let (_dir, env) = env_with(&[("/a", "x")]);
        assert!(matches!(run(Command::FileContains, &["/a"], &env), Outcome::Usage(_)));
        assert!(matches!(run(Command::FileEmpty, &["/a", "x"], &env), Outcome::Usage(_)));
    }

    #[test]
    fn internal_capture_paths_report_base_name() {
        let (_dir, env) = env_with(&[("/tmp/internal/pkgcheck/step/output/0/stdout", "hi\n")]);
        match run(
            Command::FileEquals,
            &["/tmp/internal/pkgcheck/step/output/0/stdout", "bye\n"],
            &env,
        ) {
            Outcome::Failed(f) => assert_eq!(f.path, "stdout"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn compile_order_and_locations() {
        let check = CheckOutput::default()
            .with_ends_with("z")
            .with_contains("a")
            .with_contains("b")
            .with_empty();
        let commands: Vec<Command> = compile("/f", &check).into_iter().map(|i| i.command).collect();
        assert_eq!(
            commands,
            vec![
                Command::FileContains,
                Command::FileContains,
                Command::FileEndsWith,
                Command::FileEmpty,
            ]
        );
    }
}
