//! Worker hosting: OS processes or threads.
//!
//! In process mode the orchestrator writes each [`WorkerManifest`] to the run
//! directory and starts `worker_program` with [`WORKER_ENV`] pointing at it.
//! The program must call [`run_worker_from_env`] before doing anything else
//! (the `vrloop` binary does). Nothing from the parent's heap reaches the
//! child; every queue is re-opened by path.

use crate::config::{RuntimeConfig, SpawnMode, THREAD_POOL_VARS};
use crate::error::VrError;
use crate::pipeline::error::{DagError, DagResult};
use crate::pipeline::node::NodeRegistry;
use crate::pipeline::worker::{run_worker, WorkerManifest};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Environment variable carrying the manifest path of a worker process.
pub const WORKER_ENV: &str = "VRLOOP_WORKER";

/// Run the worker described by [`WORKER_ENV`], if set.
///
/// Returns `None` when this process is not a worker.
pub fn run_worker_from_env(registry: &NodeRegistry) -> Option<crate::Result<()>> {
    let path = std::env::var_os(WORKER_ENV)?;
    Some(load_manifest(Path::new(&path)).and_then(|m| run_worker(&m, registry)))
}

fn load_manifest(path: &Path) -> crate::Result<WorkerManifest> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| VrError::Io(e).with_context(format!("reading worker manifest {:?}", path)))?;
    Ok(serde_json::from_str(&text)?)
}

/// How a join attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Exited; `true` when it reported success.
    Exited(bool),
    TimedOut,
}

/// A running worker.
pub enum WorkerHandle {
    Process {
        name: String,
        child: Child,
    },
    Thread {
        name: String,
        done: Receiver<bool>,
        join: Option<JoinHandle<()>>,
        /// Result already taken off `done`.
        exited: Option<bool>,
    },
}

impl WorkerHandle {
    pub fn spawn(
        manifest: WorkerManifest,
        runtime: &RuntimeConfig,
        registry: &NodeRegistry,
        manifest_dir: &Path,
    ) -> DagResult<Self> {
        match runtime.spawn_mode {
            SpawnMode::Process => Self::spawn_process(&manifest, runtime, manifest_dir),
            SpawnMode::Thread => Self::spawn_thread(manifest, registry.clone()),
        }
    }

    fn spawn_process(
        manifest: &WorkerManifest,
        runtime: &RuntimeConfig,
        manifest_dir: &Path,
    ) -> DagResult<Self> {
        let spawn_err = |message: String| DagError::Spawn {
            node: manifest.name.clone(),
            message,
        };

        std::fs::create_dir_all(manifest_dir)?;
        let path = manifest_dir.join(format!("{:03}-{}.json", manifest.slot, manifest.name));
        let json = serde_json::to_string(manifest).map_err(|e| spawn_err(e.to_string()))?;
        std::fs::write(&path, json)?;

        let program = match &runtime.worker_program {
            Some(p) => p.clone(),
            None => std::env::current_exe().map_err(|e| spawn_err(e.to_string()))?,
        };
        let mut command = Command::new(&program);
        command.args(&runtime.worker_args).env(WORKER_ENV, &path);
        if runtime.pin_threads {
            for var in THREAD_POOL_VARS {
                command.env(var, "1");
            }
        }
        let child = command
            .spawn()
            .map_err(|e| spawn_err(format!("{:?}: {}", program, e)))?;
        tracing::debug!(worker = %manifest.name, pid = child.id(), "worker process spawned");
        Ok(WorkerHandle::Process {
            name: manifest.name.clone(),
            child,
        })
    }

    fn spawn_thread(manifest: WorkerManifest, registry: NodeRegistry) -> DagResult<Self> {
        let name = manifest.name.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let join = std::thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || {
                let ok = match catch_unwind(AssertUnwindSafe(|| run_worker(&manifest, &registry))) {
                    Ok(result) => result.is_ok(),
                    Err(_) => false,
                };
                let _ = tx.send(ok);
            })
            .map_err(|e| DagError::Spawn {
                node: name.clone(),
                message: e.to_string(),
            })?;
        Ok(WorkerHandle::Thread {
            name,
            done: rx,
            join: Some(join),
            exited: None,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            WorkerHandle::Process { name, .. } | WorkerHandle::Thread { name, .. } => name,
        }
    }

    /// Wait up to `timeout` for the worker to exit.
    pub fn join(&mut self, timeout: Duration) -> JoinOutcome {
        match self {
            WorkerHandle::Process { child, .. } => {
                let deadline = Instant::now() + timeout;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => return JoinOutcome::Exited(status.success()),
                        Ok(None) if Instant::now() >= deadline => return JoinOutcome::TimedOut,
                        Ok(None) => std::thread::sleep(Duration::from_millis(5)),
                        Err(e) => {
                            tracing::warn!("waiting on worker failed: {}", e);
                            return JoinOutcome::Exited(false);
                        }
                    }
                }
            }
            WorkerHandle::Thread {
                done, join, exited, ..
            } => {
                let outcome = match exited.take() {
                    Some(ok) => JoinOutcome::Exited(ok),
                    None => match done.recv_timeout(timeout) {
                        Ok(ok) => JoinOutcome::Exited(ok),
                        Err(RecvTimeoutError::Timeout) => return JoinOutcome::TimedOut,
                        Err(RecvTimeoutError::Disconnected) => JoinOutcome::Exited(false),
                    },
                };
                if let Some(handle) = join.take() {
                    let _ = handle.join();
                }
                if let JoinOutcome::Exited(ok) = outcome {
                    *exited = Some(ok);
                }
                outcome
            }
        }
    }

    /// Exit status if the worker has already ended, without blocking.
    ///
    /// `Some(false)` covers a crashed process (signal, abort) as well as a
    /// worker that returned an error.
    pub fn try_exited(&mut self) -> Option<bool> {
        match self {
            WorkerHandle::Process { name, child } => match child.try_wait() {
                Ok(Some(status)) => Some(status.success()),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(worker = %name, "waiting on worker failed: {}", e);
                    Some(false)
                }
            },
            WorkerHandle::Thread { done, exited, .. } => {
                if exited.is_none() {
                    match done.try_recv() {
                        Ok(ok) => *exited = Some(ok),
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => *exited = Some(false),
                    }
                }
                *exited
            }
        }
    }

    /// Forcefully end the worker. Threads cannot be killed and are detached.
    pub fn terminate(&mut self) {
        match self {
            WorkerHandle::Process { name, child } => {
                tracing::warn!(worker = %name, "terminating worker after grace period");
                if let Err(e) = child.kill() {
                    tracing::warn!(worker = %name, "kill failed: {}", e);
                }
                let _ = child.wait();
            }
            WorkerHandle::Thread { name, join, .. } => {
                tracing::warn!(worker = %name, "worker thread did not exit; detaching");
                join.take();
            }
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHandle::Process { name, child } => f
                .debug_struct("Process")
                .field("name", name)
                .field("pid", &child.id())
                .finish(),
            WorkerHandle::Thread { name, .. } => {
                f.debug_struct("Thread").field("name", name).finish()
            }
        }
    }
}

/// Directory for manifests under a run directory.
pub fn manifest_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("workers")
}
