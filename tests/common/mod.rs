//! A local stand-in for the build-graph executor.
//!
//! Every node is materialised as a directory under a temp dir. Execs run
//! the real dispatcher binary on the host with `PKGCHECK_ROOT` pointing at
//! the node's directory. Evaluation is lazy (only what the requested node
//! reaches) and memoized per node.

#![allow(dead_code)]

use async_trait::async_trait;
use pkgcheck::graph::{Graph, NodeId, Op};
use pkgcheck::{BuildError, Executor, FsView};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const DISPATCHER_SOURCE: &str = "pkgcheck-frontend";
pub const ARTIFACT: &str = "artifact";

pub fn dispatcher_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pkgcheck"))
}

pub struct DirView(pub PathBuf);

impl DirView {
    fn host(&self, path: &str) -> PathBuf {
        self.0.join(path.trim_start_matches('/'))
    }
}

impl FsView for DirView {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.host(path))
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<String>> {
        fs::read_dir(self.host(path))?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect()
    }
}

#[derive(Default)]
struct State {
    done: HashMap<NodeId, PathBuf>,
    executed: Vec<NodeId>,
    next: usize,
}

pub struct LocalExecutor {
    work: TempDir,
    sources: HashMap<String, PathBuf>,
    state: Mutex<State>,
}

impl LocalExecutor {
    /// An executor whose `artifact` source is a copy of `files`.
    pub fn with_artifact(files: &[(&str, &str)]) -> Self {
        let work = TempDir::new().unwrap();
        let artifact = work.path().join("sources").join(ARTIFACT);
        fs::create_dir_all(&artifact).unwrap();
        for (path, contents) in files {
            let p = artifact.join(path.trim_start_matches('/'));
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, contents).unwrap();
        }

        let frontend = work.path().join("sources").join(DISPATCHER_SOURCE);
        fs::create_dir_all(&frontend).unwrap();
        symlink(env!("CARGO_BIN_EXE_pkgcheck"), frontend.join("pkgcheck")).unwrap();

        let sources = HashMap::from([
            (ARTIFACT.to_string(), artifact),
            (DISPATCHER_SOURCE.to_string(), frontend),
        ]);
        Self {
            work,
            sources,
            state: Mutex::new(State::default()),
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.sources[ARTIFACT]
    }

    /// Exec nodes that actually ran, in execution order.
    pub fn executed(&self) -> Vec<NodeId> {
        self.state.lock().unwrap().executed.clone()
    }

    fn materialise(&self, state: &mut State, graph: &Graph, id: NodeId) -> Result<PathBuf, BuildError> {
        let err = |e: io::Error| BuildError::new(e.to_string()).at(id);
        let mut fresh = || {
            state.next += 1;
            let dir = self.work.path().join("nodes").join(state.next.to_string());
            fs::create_dir_all(&dir).map(|_| dir)
        };

        match &graph.node(id).op {
            Op::Source { name } => self
                .sources
                .get(name)
                .cloned()
                .ok_or_else(|| BuildError::new(format!("unknown source {name:?}")).at(id)),
            Op::File {
                path,
                contents,
                mode,
            } => {
                let dir = fresh().map_err(err)?;
                let p = dir.join(path.trim_start_matches('/'));
                fs::create_dir_all(p.parent().unwrap()).map_err(err)?;
                fs::write(&p, contents).map_err(err)?;
                fs::set_permissions(&p, fs::Permissions::from_mode(*mode)).map_err(err)?;
                Ok(dir)
            }
            Op::Merge { base, inputs, path } => {
                let dir = fresh().map_err(err)?;
                copy_any(&state.done[base], &dir).map_err(err)?;
                let at = dir.join(path.trim_start_matches('/'));
                for input in inputs {
                    copy_any(&state.done[input], &at).map_err(err)?;
                }
                Ok(dir)
            }
            Op::Passthrough { output, .. } => Ok(state.done[output].clone()),
            Op::Exec(exec) => {
                let dir = fresh().map_err(err)?;
                copy_any(&state.done[&exec.root], &dir).map_err(err)?;
                for m in &exec.mounts {
                    let mut src = state.done[&m.source].clone();
                    if let Some(sub) = &m.source_path {
                        src = src.join(sub.trim_start_matches('/'));
                    }
                    copy_any(&src, &dir.join(m.target.trim_start_matches('/'))).map_err(err)?;
                }

                let program = dir.join(exec.args[0].trim_start_matches('/'));
                let output = Command::new(program)
                    .args(&exec.args[1..])
                    .envs(&exec.env)
                    .env("PKGCHECK_ROOT", &dir)
                    .output()
                    .map_err(err)?;
                state.executed.push(id);

                for m in &exec.mounts {
                    remove_any(&dir.join(m.target.trim_start_matches('/'))).map_err(err)?;
                }
                if !output.status.success() {
                    let code = output.status.code().unwrap_or(-1);
                    return Err(BuildError::new(format!(
                        "process {:?} did not complete successfully: exit code: {code}: {}",
                        exec.args,
                        String::from_utf8_lossy(&output.stderr).trim_end()
                    ))
                    .at(id)
                    .with_exit_code(code));
                }
                Ok(dir)
            }
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn evaluate(&self, graph: &Graph, node: NodeId) -> Result<Arc<dyn FsView>, BuildError> {
        let mut state = self.state.lock().unwrap();
        for id in graph.reachable(node) {
            if state.done.contains_key(&id) {
                continue;
            }
            let dir = self.materialise(&mut state, graph, id)?;
            state.done.insert(id, dir);
        }
        Ok(Arc::new(DirView(state.done[&node].clone())))
    }
}

fn copy_any(from: &Path, to: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(from)?;
    if meta.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_any(&entry.path(), &to.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(to);
    if meta.file_type().is_symlink() {
        symlink(fs::read_link(from)?, to)
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
