// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::HashMap;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;

use protocol::{ModelName, Stage, WorkerConfig};
use thiserror::Error;
use tracing::{info, warn};

/// Handle to a worker process managed by [`ProcessManager`].
///
/// Each worker owns the device memory of a single model stage. The handle
/// records the model and stage it serves, the OS process identifier, and
/// the base url it answers on, so that it can be rendered against and
/// terminated later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    pub model: ModelName,
    pub stage: Stage,
    /// OS process identifier for the worker.
    pub pid: u32,
    /// Base url of the worker's HTTP interface.
    pub endpoint: String,
}

/// Errors that can occur when managing worker processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failure to spawn a new worker process.
    #[error("failed to spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Failure to kill or reap a worker process.
    #[error("failed to terminate worker pid={pid}: {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Process manager for model worker processes.
///
/// - It knows how to spawn a worker from a [`WorkerConfig`].
/// - It tracks workers by PID and by model.
/// - It terminates workers individually or per model, reaping each one so
///   that its device memory is released by the time termination returns.
///
/// Readiness probing and rendering live in [`crate::worker`]; this module
/// only deals with OS processes.
#[derive(Debug, Default)]
pub struct ProcessManager {
    /// Map of worker PIDs to the corresponding child handles.
    workers: Mutex<HashMap<u32, Child>>,
    /// Map from model to the worker PIDs serving it.
    by_model: Mutex<HashMap<ModelName, Vec<u32>>>,
}

impl ProcessManager {
    /// Create a new, empty process manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker for one stage of `model`.
    ///
    /// `extra_env` is applied after the config's own `env` entries, so
    /// host-provided variables win. Worker stdout and stderr are inherited so
    /// they land in the host's log stream without anyone having to drain a
    /// pipe.
    pub fn spawn_worker(
        &self,
        config: &WorkerConfig,
        model: ModelName,
        stage: Stage,
        extra_env: &[(String, String)],
    ) -> Result<WorkerHandle, ProcessError> {
        info!(
            "model_runtime::process: spawning {} worker for model={} -> {} {:?}",
            stage, model, config.command, config.args
        );

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        for var in &config.env {
            command.env(&var.key, &var.value);
        }
        for (k, v) in extra_env {
            command.env(k, v);
        }

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        let pid = child.id();

        if let Ok(mut map) = self.workers.lock() {
            map.insert(pid, child);
        } else {
            warn!(
                "model_runtime::process: workers map lock poisoned when tracking pid={}",
                pid
            );
        }

        if let Ok(mut map) = self.by_model.lock() {
            map.entry(model)
                .and_modify(|pids| pids.push(pid))
                .or_insert_with(|| vec![pid]);
        } else {
            warn!(
                "model_runtime::process: by_model map lock poisoned when tracking pid={} for model={}",
                pid, model
            );
        }

        Ok(WorkerHandle {
            model,
            stage,
            pid,
            endpoint: config.endpoint.clone(),
        })
    }

    /// Check whether a tracked worker has already exited.
    ///
    /// Returns `None` while the worker is running or when the PID is unknown.
    pub fn exit_status(&self, pid: u32) -> Option<ExitStatus> {
        let mut map = self.workers.lock().ok()?;
        let child = map.get_mut(&pid)?;
        child.try_wait().ok().flatten()
    }

    /// Stop tracking a worker and hand its child back to the caller.
    ///
    /// Never blocks on the process itself, so it is safe to call from
    /// `Drop` impls and async code. The caller becomes responsible for
    /// killing and reaping the child, e.g. with [`kill_and_reap`].
    pub fn detach(&self, pid: u32) -> Option<Child> {
        let child = match self.workers.lock() {
            Ok(mut map) => map.remove(&pid),
            Err(_) => {
                warn!(
                    "model_runtime::process: workers map lock poisoned when terminating pid={}",
                    pid
                );
                None
            }
        };

        if let Ok(mut by_model) = self.by_model.lock() {
            by_model.retain(|_model, pids| {
                pids.retain(|p| *p != pid);
                !pids.is_empty()
            });
        }

        child
    }

    /// Kill and reap a worker by PID.
    ///
    /// Unknown PIDs are treated as already gone. This blocks until the
    /// process has been reaped; async callers should run it on a blocking
    /// thread.
    pub fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
        let Some(child) = self.detach(pid) else {
            info!(
                "model_runtime::process: no tracked worker for pid={}; nothing to terminate",
                pid
            );
            return Ok(());
        };

        kill_and_reap(child)
    }

    /// Terminate every worker associated with `model`.
    ///
    /// All workers are attempted; the first error, if any, is returned.
    pub fn terminate_workers_for_model(&self, model: ModelName) -> Result<(), ProcessError> {
        let pids = self.pids_for_model(model);
        if pids.is_empty() {
            info!(
                "model_runtime::process: no tracked workers for model={}; nothing to terminate",
                model
            );
            return Ok(());
        }

        info!(
            "model_runtime::process: terminating {} worker(s) for model={}: {:?}",
            pids.len(),
            model,
            pids
        );

        let mut first_err = None;
        for pid in pids {
            if let Err(e) = self.terminate(pid) {
                warn!("model_runtime::process: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// PIDs currently tracked for `model`.
    pub fn pids_for_model(&self, model: ModelName) -> Vec<u32> {
        match self.by_model.lock() {
            Ok(map) => map.get(&model).cloned().unwrap_or_default(),
            Err(_) => {
                warn!(
                    "model_runtime::process: by_model map lock poisoned when listing workers for model={}",
                    model
                );
                Vec::new()
            }
        }
    }

    /// Number of tracked workers across all models.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Kill a detached worker and wait for it to exit. Blocks until reaped.
pub fn kill_and_reap(mut child: Child) -> Result<(), ProcessError> {
    let pid = child.id();
    info!("model_runtime::process: terminating worker pid={}", pid);
    child
        .kill()
        .map_err(|source| ProcessError::Terminate { pid, source })?;
    child
        .wait()
        .map_err(|source| ProcessError::Terminate { pid, source })?;
    Ok(())
}
