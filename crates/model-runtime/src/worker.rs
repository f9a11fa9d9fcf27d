// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Backend that runs every model stage in its own worker process.
//!
//! Loading a model means spawning its worker(s) and waiting for them to
//! report ready; evicting means killing and reaping them, which hands the
//! device memory back to the driver. Rendering is a JSON call over HTTP
//! following the contract in [`protocol::worker`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use protocol::worker::{OutputType, WorkerRenderRequest, WorkerRenderResponse};
use protocol::{ModelConfig, ModelName, Stage, WorkerConfig};
use tracing::{info, warn};

use crate::process::{kill_and_reap, ProcessManager, WorkerHandle};
use crate::{BackendError, Image, ModelBackend, RenderParams, ResourceHandle};

/// Lower bound on how long one `/health` request may take. A worker that
/// accepts the connection but never answers must not stall the readiness
/// loop past its deadline.
const HEALTH_CHECK_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);

/// Tuning knobs for [`WorkerBackend`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Delay between readiness probes of a freshly spawned worker.
    pub ready_poll_interval: Duration,
    /// Upper bound on how long a single worker may take to report ready.
    pub ready_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            ready_poll_interval: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(600),
        }
    }
}

pub struct WorkerBackend {
    models: HashMap<ModelName, ModelConfig>,
    processes: Arc<ProcessManager>,
    client: reqwest::Client,
    options: WorkerOptions,
}

impl WorkerBackend {
    pub fn new(models: HashMap<ModelName, ModelConfig>, options: WorkerOptions) -> Self {
        Self {
            models,
            processes: Arc::new(ProcessManager::new()),
            client: reqwest::Client::new(),
            options,
        }
    }

    pub fn processes(&self) -> Arc<ProcessManager> {
        self.processes.clone()
    }

    /// Spawn one stage and wait for it to come up. The worker is registered
    /// with `guard` before probing so a failed or cancelled probe kills it.
    async fn start_stage(
        &self,
        model: ModelName,
        stage: Stage,
        config: &WorkerConfig,
        guard: &mut SpawnGuard,
    ) -> Result<WorkerHandle, BackendError> {
        let env = vec![
            ("EASEL_MODEL".to_string(), model.to_string()),
            ("EASEL_STAGE".to_string(), stage.to_string()),
            (
                "EASEL_MODEL_REPO".to_string(),
                model.repository(stage).to_string(),
            ),
            ("EASEL_WORKER_ENDPOINT".to_string(), config.endpoint.clone()),
        ];
        let worker = self.processes.spawn_worker(config, model, stage, &env)?;
        guard.track(worker.pid);

        self.wait_ready(&worker).await?;
        Ok(worker)
    }

    async fn wait_ready(&self, worker: &WorkerHandle) -> Result<(), BackendError> {
        let url = format!("{}/health", worker.endpoint.trim_end_matches('/'));
        let started = Instant::now();
        let check_timeout = self
            .options
            .ready_poll_interval
            .max(HEALTH_CHECK_TIMEOUT_FLOOR);
        let not_ready = |reason: String| BackendError::NotReady {
            model: worker.model,
            stage: worker.stage,
            endpoint: worker.endpoint.clone(),
            reason,
        };

        loop {
            if let Some(status) = self.processes.exit_status(worker.pid) {
                return Err(not_ready(format!("worker exited early with {status}")));
            }

            match self.client.get(&url).timeout(check_timeout).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        "model_runtime::worker: {} {} ready on {} after {:?}",
                        worker.model,
                        worker.stage,
                        worker.endpoint,
                        started.elapsed()
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    info!(
                        "model_runtime::worker: {} {} not ready yet (HTTP {})",
                        worker.model,
                        worker.stage,
                        resp.status()
                    );
                }
                Err(e) if e.is_timeout() => {
                    info!(
                        "model_runtime::worker: {} {} health check timed out after {:?}",
                        worker.model, worker.stage, check_timeout
                    );
                }
                Err(_) => {
                    // nothing listening yet
                }
            }

            if started.elapsed() >= self.options.ready_timeout {
                return Err(not_ready(format!(
                    "no healthy response within {:?}",
                    self.options.ready_timeout
                )));
            }
            tokio::time::sleep(self.options.ready_poll_interval).await;
        }
    }

    async fn call_render(
        &self,
        worker: &WorkerHandle,
        request: &WorkerRenderRequest,
    ) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/render", worker.endpoint.trim_end_matches('/'));
        let resp = self.client.post(&url).json(request).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Worker {
                status: status.as_u16(),
                body,
            });
        }

        let payload: WorkerRenderResponse = resp.json().await?;
        if payload.images.is_empty() {
            return Err(BackendError::Decode(format!(
                "{} {} worker returned no outputs",
                worker.model, worker.stage
            )));
        }
        Ok(payload.images)
    }
}

fn request_for(params: &RenderParams, num_images: u32, output_type: OutputType) -> WorkerRenderRequest {
    WorkerRenderRequest {
        prompt: params.prompt.clone(),
        width: params.width,
        height: params.height,
        num_inference_steps: params.num_inference_steps,
        guidance_scale: params.guidance_scale,
        num_images,
        max_sequence_length: params.max_sequence_length,
        denoising_end: None,
        denoising_start: None,
        output_type,
        latent: None,
    }
}

fn decode_image(encoded: &str) -> Result<Image, BackendError> {
    STANDARD
        .decode(encoded)
        .map(Image::new)
        .map_err(|e| BackendError::Decode(format!("invalid base64 image: {e}")))
}

#[async_trait]
impl ModelBackend for WorkerBackend {
    type Stage = WorkerHandle;

    async fn construct(
        &self,
        model: ModelName,
    ) -> Result<ResourceHandle<WorkerHandle>, BackendError> {
        let config = self
            .models
            .get(&model)
            .ok_or(BackendError::NotConfigured(model))?;

        let mut guard = SpawnGuard::new(self.processes.clone());

        let handle = if model.is_two_stage() {
            let refiner_config = config.refiner.as_ref().ok_or_else(|| {
                BackendError::Misconfigured {
                    model,
                    reason: "two-stage model has no refiner worker".to_string(),
                }
            })?;
            let base = self
                .start_stage(model, Stage::Base, &config.worker, &mut guard)
                .await?;
            let refiner = self
                .start_stage(model, Stage::Refiner, refiner_config, &mut guard)
                .await?;
            ResourceHandle::TwoStage { base, refiner }
        } else {
            let worker = self
                .start_stage(model, Stage::Single, &config.worker, &mut guard)
                .await?;
            ResourceHandle::Simple(worker)
        };

        guard.disarm();
        Ok(handle)
    }

    async fn destruct(
        &self,
        model: ModelName,
        handle: ResourceHandle<WorkerHandle>,
    ) -> Result<(), BackendError> {
        let processes = self.processes.clone();
        let stages = handle.into_stages();

        let failures = tokio::task::spawn_blocking(move || {
            stages
                .into_iter()
                .filter_map(|(stage, worker)| {
                    processes
                        .terminate(worker.pid)
                        .err()
                        .map(|e| format!("{stage}: {e}"))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| BackendError::Message(format!("teardown task for {model} failed: {e}")))?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Teardown { model, failures })
        }
    }

    async fn render(
        &self,
        model: ModelName,
        handle: &ResourceHandle<WorkerHandle>,
        params: &RenderParams,
    ) -> Result<Vec<Image>, BackendError> {
        match handle {
            ResourceHandle::Simple(worker) => {
                let request = request_for(params, params.num_images, OutputType::Image);
                let encoded = self.call_render(worker, &request).await?;
                encoded.iter().map(|e| decode_image(e)).collect()
            }
            ResourceHandle::TwoStage { base, refiner } => {
                // the refiner consumes one latent at a time, so two-stage
                // models run the whole pipeline once per requested image.
                let mut images = Vec::with_capacity(params.num_images as usize);
                for index in 0..params.num_images {
                    let mut base_request = request_for(params, 1, OutputType::Latent);
                    base_request.denoising_end = params.denoising_end;
                    let latent = self
                        .call_render(base, &base_request)
                        .await?
                        .swap_remove(0);

                    let mut refine_request = request_for(params, 1, OutputType::Image);
                    refine_request.denoising_start = params.denoising_start;
                    refine_request.latent = Some(latent);
                    let encoded = self.call_render(refiner, &refine_request).await?;

                    images.push(decode_image(&encoded[0])?);
                    info!(
                        "model_runtime::worker: {} refined image {}/{}",
                        model,
                        index + 1,
                        params.num_images
                    );
                }
                Ok(images)
            }
        }
    }
}

/// Kills every worker it tracks when dropped, unless disarmed.
///
/// `construct` holds one of these while workers come up, so an error or a
/// dropped future never leaves an orphan process holding device memory.
struct SpawnGuard {
    processes: Arc<ProcessManager>,
    pids: Vec<u32>,
    armed: bool,
}

impl SpawnGuard {
    fn new(processes: Arc<ProcessManager>) -> Self {
        Self {
            processes,
            pids: Vec::new(),
            armed: true,
        }
    }

    fn track(&mut self, pid: u32) {
        self.pids.push(pid);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Untracking is immediate; the kill and reap block, so inside a
        // runtime they go to the blocking pool rather than stall this
        // executor thread.
        let children: Vec<_> = self
            .pids
            .drain(..)
            .filter_map(|pid| {
                warn!(
                    "model_runtime::worker: cleaning up worker pid={} from unfinished load",
                    pid
                );
                self.processes.detach(pid)
            })
            .collect();
        if children.is_empty() {
            return;
        }

        let reap = move || {
            for child in children {
                if let Err(e) = kill_and_reap(child) {
                    warn!("model_runtime::worker: {e}");
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(reap);
            }
            Err(_) => reap(),
        }
    }
}
