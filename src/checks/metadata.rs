//! Checks on file metadata: existence, type, permissions and symlink target.
//!
//! A missing path passes every check here except existence, which owns
//! reporting it. That keeps a missing file down to a single failure.

use super::{CheckEnv, Command, Invocation, Outcome, filter_path};
use crate::error::CheckFailure;
use crate::model::{FailureKind, FileCheckOutput};
use clap::{ArgAction, Parser};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const NO_FOLLOW_FLAG: &str = "--no-follow-symlinks";

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true)]
struct PathArgs {
    #[arg(long = "no-follow-symlinks", action = ArgAction::Set, default_value_t = false)]
    no_follow_symlinks: bool,
    path: String,
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true)]
struct IsDirArgs {
    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    not: bool,
    #[arg(long = "no-follow-symlinks", action = ArgAction::Set, default_value_t = false)]
    no_follow_symlinks: bool,
    path: String,
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true)]
struct PermsArgs {
    #[arg(long = "no-follow-symlinks", action = ArgAction::Set, default_value_t = false)]
    no_follow_symlinks: bool,
    path: String,
    octal: String,
}

fn parse<T: Parser>(args: &[String]) -> Result<T, Outcome> {
    T::try_parse_from(args).map_err(|e| Outcome::Usage(e.to_string()))
}

fn stat(path: &Path, no_follow: bool) -> io::Result<fs::Metadata> {
    if no_follow {
        fs::symlink_metadata(path)
    } else {
        fs::metadata(path)
    }
}

fn no_follow_arg(check: &FileCheckOutput) -> String {
    format!("{NO_FOLLOW_FLAG}={}", check.no_follow())
}

fn failure(kind: FailureKind, path: &str, expected: String, actual: String) -> Outcome {
    Outcome::Failed(CheckFailure {
        kind: kind.to_string(),
        path: filter_path(path),
        expected,
        actual,
    })
}

pub(super) fn compile_exists(path: &str, check: &FileCheckOutput) -> Invocation {
    let command = if check.expects_absent() {
        Command::FileNotExists
    } else {
        Command::FileExists
    };
    Invocation::new(
        command,
        vec![no_follow_arg(check), path.to_string()],
        check.location_for(FailureKind::NotExist, ""),
    )
}

pub(super) fn compile_is_dir(path: &str, check: &FileCheckOutput) -> Option<Invocation> {
    if check.expects_absent() {
        return None;
    }
    Some(Invocation::new(
        Command::FileIsDir,
        vec![
            format!("--not={}", !check.expects_dir()),
            no_follow_arg(check),
            path.to_string(),
        ],
        check.location_for(FailureKind::IsDir, ""),
    ))
}

pub(super) fn compile_perms(path: &str, check: &FileCheckOutput) -> Option<Invocation> {
    let mode = check.permissions.as_ref()?.value & 0o777;
    if mode == 0 || check.expects_absent() {
        return None;
    }
    Some(Invocation::new(
        Command::FilePerms,
        vec![no_follow_arg(check), path.to_string(), format!("{mode:o}")],
        check.location_for(FailureKind::Permissions, ""),
    ))
}

pub(super) fn compile_link_target(path: &str, check: &FileCheckOutput) -> Option<Invocation> {
    let target = check.link_target.as_ref()?;
    if target.value.is_empty() || check.expects_absent() {
        return None;
    }
    Some(Invocation::new(
        Command::LinkTarget,
        vec![path.to_string(), target.value.clone()],
        target.location.as_ref().or(check.location.as_ref()),
    ))
}

pub(super) fn exists(args: &[String], env: &CheckEnv, want: bool) -> Outcome {
    let args: PathArgs = match parse(args) {
        Ok(a) => a,
        Err(o) => return o,
    };

    let found = match stat(&env.root.resolve(&args.path), args.no_follow_symlinks) {
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            return Outcome::Precondition(format!("error checking file existence: {e}"));
        }
    };
    if found == want {
        return Outcome::Pass;
    }
    failure(
        FailureKind::NotExist,
        &args.path,
        format!("exists={want}"),
        format!("exists={found}"),
    )
}

pub(super) fn is_dir(args: &[String], env: &CheckEnv) -> Outcome {
    let args: IsDirArgs = match parse(args) {
        Ok(a) => a,
        Err(o) => return o,
    };

    let meta = match stat(&env.root.resolve(&args.path), args.no_follow_symlinks) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Outcome::Pass,
        Err(e) => return Outcome::Precondition(format!("error reading {}: {e}", args.path)),
    };
    let want = !args.not;
    let actual = meta.is_dir();
    if actual == want {
        return Outcome::Pass;
    }
    failure(
        FailureKind::IsDir,
        &args.path,
        format!("is_dir={want}"),
        format!("is_dir={actual}"),
    )
}

pub(super) fn perms(args: &[String], env: &CheckEnv) -> Outcome {
    let args: PermsArgs = match parse(args) {
        Ok(a) => a,
        Err(o) => return o,
    };
    let want = match u32::from_str_radix(&args.octal, 8) {
        Ok(m) => m & 0o777,
        Err(e) => {
            return Outcome::Precondition(format!("error parsing perms {:?}: {e}", args.octal));
        }
    };

    let meta = match stat(&env.root.resolve(&args.path), args.no_follow_symlinks) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Outcome::Pass,
        Err(e) => return Outcome::Precondition(format!("error reading {}: {e}", args.path)),
    };
    let actual = meta.permissions().mode() & 0o777;
    if actual == want {
        return Outcome::Pass;
    }
    failure(
        FailureKind::Permissions,
        &args.path,
        mode_string(want),
        mode_string(actual),
    )
}

pub(super) fn link_target(args: &[String], env: &CheckEnv) -> Outcome {
    let [path, want] = args else {
        return Outcome::Usage("expected 2 arguments: <file-path> <link-target>".to_string());
    };

    let actual = match fs::read_link(env.root.resolve(path)) {
        Ok(target) => target.to_string_lossy().into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Outcome::Pass,
        // EINVAL: the path exists but is not a symlink.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => "<not a symlink>".to_string(),
        Err(e) => return Outcome::Precondition(format!("error reading link {path}: {e}")),
    };
    if &actual == want {
        return Outcome::Pass;
    }
    failure(FailureKind::LinkTarget, path, want.clone(), actual)
}

/// Permission bits rendered like `ls -l`, e.g. `-rwxr-xr-x`.
pub(super) fn mode_string(mode: u32) -> String {
    const RWX: [u8; 3] = *b"rwx";
    let mut out = String::with_capacity(10);
    out.push('-');
    for bit in (0..9).rev() {
        if mode & (1 << bit) != 0 {
            out.push(RWX[2 - bit % 3] as char);
        } else {
            out.push('-');
        }
    }
    out
}
