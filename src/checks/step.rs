//! The step runner: executes one test step inside the container.
//!
//! The host serializes a [`StepPlan`] into the step's container. The runner
//! splits the command into words, runs it, tees its output to the capture
//! files the stream checks read, and exits with the child's status.

use super::{CheckEnv, EXIT_PRECONDITION, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    pub command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    /// Where to capture stdout, if anything checks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

pub(super) fn execute(args: &[String], env: &CheckEnv) -> Outcome {
    let [plan_path] = args else {
        return Outcome::Usage("usage: step-runner <step-json-path>".to_string());
    };

    let plan: StepPlan = match fs::read(env.root.resolve(plan_path))
        .map_err(|e| e.to_string())
        .and_then(|dt| serde_json::from_slice(&dt).map_err(|e| e.to_string()))
    {
        Ok(p) => p,
        Err(e) => return Outcome::Usage(format!("error reading test step: {e}")),
    };

    match run(&plan, env) {
        Ok(code) => Outcome::Exit(code),
        Err(e) => Outcome::Precondition(format!("error running test step {:?}: {e}", plan.command)),
    }
}

fn run(plan: &StepPlan, env: &CheckEnv) -> io::Result<u8> {
    let words = shlex::split(&plan.command)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unbalanced quoting"))?;
    let Some((program, rest)) = words.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .envs(&plan.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &plan.dir {
        cmd.current_dir(env.root.resolve(dir));
    }
    let stdin = plan.stdin.as_deref().filter(|s| !s.is_empty());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let stdout_capture = capture_file(plan.stdout.as_deref(), env)?;
    let stderr_capture = capture_file(plan.stderr.as_deref(), env)?;

    let mut child = cmd.spawn()?;
    let child_in = child.stdin.take();
    let child_out = child.stdout.take();
    let child_err = child.stderr.take();

    let copied = thread::scope(|s| -> io::Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        let feeder = s.spawn(move || -> io::Result<()> {
            if let (Some(mut pipe), Some(input)) = (child_in, stdin) {
                pipe.write_all(input.as_bytes())?;
            }
            Ok(())
        });
        let out_tx = done_tx.clone();
        let out = s.spawn(move || {
            let _ = out_tx.send(tee(child_out, io::stdout(), stdout_capture));
        });
        let err = s.spawn(move || {
            let _ = done_tx.send(tee(child_err, io::stderr(), stderr_capture));
        });

        let mut copied: io::Result<()> = Ok(());
        for result in done_rx {
            if let Err(e) = result
                && copied.is_ok()
            {
                // Nothing drains that stream any more.
                let _ = child.kill();
                copied = Err(e);
            }
        }
        for handle in [out, err] {
            handle
                .join()
                .map_err(|_| io::Error::other("output copier panicked"))?;
        }
        // A child that exits without reading stdin closes the pipe on us.
        let fed = match feeder.join() {
            Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
            Ok(_) => Ok(()),
            Err(_) => Err(io::Error::other("stdin feeder panicked")),
        };
        copied.and(fed)
    });
    if let Err(e) = copied {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }

    let status = child.wait()?;
    if let Some(code) = status.code() {
        return Ok(u8::try_from(code).unwrap_or(EXIT_PRECONDITION));
    }
    let signal = status.signal().unwrap_or_default();
    eprintln!("step {:?} killed by signal {signal}", plan.command);
    Ok(128u8.saturating_add(u8::try_from(signal).unwrap_or(0)))
}

fn capture_file(path: Option<&str>, env: &CheckEnv) -> io::Result<Option<File>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let path = env.root.resolve(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path).map(Some)
}

fn tee(from: Option<impl Read>, mut to: impl Write, mut capture: Option<File>) -> io::Result<()> {
    let Some(mut from) = from else {
        return Ok(());
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        to.write_all(&buf[..n])?;
        if let Some(f) = capture.as_mut() {
            f.write_all(&buf[..n])?;
        }
    }
    to.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::Sysroot;
    use tempfile::TempDir;

    fn with_plan(plan: &StepPlan) -> (TempDir, CheckEnv, Vec<String>) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("step.json"), serde_json::to_vec(plan).unwrap()).unwrap();
        let env = CheckEnv {
            root: Sysroot::new(dir.path()),
            report: None,
        };
        (dir, env, vec!["/step.json".to_string()])
    }

    #[test]
    fn captures_stdout() {
        let plan = StepPlan {
            command: "echo hi".to_string(),
            stdout: Some("/out/stdout".to_string()),
            ..Default::default()
        };
        let (dir, env, args) = with_plan(&plan);
        assert_eq!(execute(&args, &env), Outcome::Exit(0));
        assert_eq!(fs::read_to_string(dir.path().join("out/stdout")).unwrap(), "hi\n");
    }

    #[test]
    fn propagates_exit_code() {
        let plan = StepPlan {
            command: "sh -c 'exit 7'".to_string(),
            ..Default::default()
        };
        let (_dir, env, args) = with_plan(&plan);
        assert_eq!(execute(&args, &env), Outcome::Exit(7));
    }

    #[test]
    fn feeds_stdin_and_env() {
        let plan = StepPlan {
            command: "sh -c 'cat; printf %s \"$GREETING\" >&2'".to_string(),
            stdin: Some("from stdin".to_string()),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            stdout: Some("/o".to_string()),
            stderr: Some("/e".to_string()),
            ..Default::default()
        };
        let (dir, env, args) = with_plan(&plan);
        assert_eq!(execute(&args, &env), Outcome::Exit(0));
        assert_eq!(fs::read_to_string(dir.path().join("o")).unwrap(), "from stdin");
        assert_eq!(fs::read_to_string(dir.path().join("e")).unwrap(), "hello");
    }

    #[test]
    fn command_words_are_not_shell_interpreted() {
        let plan = StepPlan {
            command: "echo $HOME '>' x".to_string(),
            stdout: Some("/o".to_string()),
            ..Default::default()
        };
        let (dir, env, args) = with_plan(&plan);
        assert_eq!(execute(&args, &env), Outcome::Exit(0));
        assert_eq!(fs::read_to_string(dir.path().join("o")).unwrap(), "$HOME > x\n");
    }

    #[test]
    fn unbalanced_quotes_are_precondition() {
        let plan = StepPlan {
            command: "echo 'oops".to_string(),
            ..Default::default()
        };
        let (_dir, env, args) = with_plan(&plan);
        assert!(matches!(execute(&args, &env), Outcome::Precondition(_)));
    }

    #[test]
    fn capture_write_failure_stops_the_child() {
        let full = std::path::Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let plan = StepPlan {
            command: "sh -c 'echo x; exec sleep 30'".to_string(),
            stdout: Some(full.display().to_string()),
            ..Default::default()
        };
        let plan_path = dir.path().join("step.json");
        fs::write(&plan_path, serde_json::to_vec(&plan).unwrap()).unwrap();

        let started = std::time::Instant::now();
        let outcome = execute(&[plan_path.display().to_string()], &CheckEnv::default());
        assert!(matches!(outcome, Outcome::Precondition(_)), "{outcome:?}");
        assert!(started.elapsed() < std::time::Duration::from_secs(20));
    }

    #[test]
    fn missing_plan_is_usage() {
        let env = CheckEnv::default();
        assert!(matches!(
            execute(&["/definitely/not/here.json".to_string()], &env),
            Outcome::Usage(_)
        ));
    }
}
