// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Scripted in-memory backend for exercising the lifecycle without workers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use model_runtime::{BackendError, Image, ModelBackend, RenderParams, ResourceHandle};
use protocol::ModelName;
use tokio::sync::{Notify, Semaphore};

#[derive(Default)]
struct Script {
    fail_construct: HashSet<ModelName>,
    fail_destruct: HashSet<ModelName>,
    fail_render: HashSet<ModelName>,
    construct_delay: Duration,
    render_delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

pub struct FakeBackend {
    script: Mutex<Script>,
    next_id: AtomicU64,
    constructed: Mutex<Vec<(ModelName, ResourceHandle<u64>)>>,
    destructed: Mutex<Vec<(ModelName, ResourceHandle<u64>)>>,
    renders: AtomicUsize,
    rendering: AtomicUsize,
    busy_destructs: AtomicUsize,
    pub construct_started: Notify,
    pub render_started: Notify,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            next_id: AtomicU64::new(1),
            constructed: Mutex::new(Vec::new()),
            destructed: Mutex::new(Vec::new()),
            renders: AtomicUsize::new(0),
            rendering: AtomicUsize::new(0),
            busy_destructs: AtomicUsize::new(0),
            construct_started: Notify::new(),
            render_started: Notify::new(),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn fail_construct(&self, model: ModelName, fail: bool) {
        let mut script = self.script();
        if fail {
            script.fail_construct.insert(model);
        } else {
            script.fail_construct.remove(&model);
        }
    }

    pub fn fail_destruct(&self, model: ModelName) {
        self.script().fail_destruct.insert(model);
    }

    pub fn fail_render(&self, model: ModelName) {
        self.script().fail_render.insert(model);
    }

    pub fn set_construct_delay(&self, delay: Duration) {
        self.script().construct_delay = delay;
    }

    pub fn set_render_delay(&self, delay: Duration) {
        self.script().render_delay = delay;
    }

    /// Park every construct call until `release_constructs` lets it go.
    pub fn hold_constructs(&self) {
        self.script().gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_constructs(&self, n: usize) {
        if let Some(gate) = &self.script().gate {
            gate.add_permits(n);
        }
    }

    pub fn constructs(&self) -> Vec<ModelName> {
        self.constructed
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| *m)
            .collect()
    }

    pub fn constructed_handles(&self) -> Vec<(ModelName, ResourceHandle<u64>)> {
        self.constructed.lock().unwrap().clone()
    }

    pub fn destructs(&self) -> Vec<(ModelName, ResourceHandle<u64>)> {
        self.destructed.lock().unwrap().clone()
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    /// Destruct calls that arrived while a render was still running.
    pub fn destructs_during_render(&self) -> usize {
        self.busy_destructs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for FakeBackend {
    type Stage = u64;

    async fn construct(&self, model: ModelName) -> Result<ResourceHandle<u64>, BackendError> {
        self.construct_started.notify_one();
        let (delay, gate, fail) = {
            let script = self.script();
            (
                script.construct_delay,
                script.gate.clone(),
                script.fail_construct.contains(&model),
            )
        };

        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BackendError::Message(format!("{model} weights unavailable")));
        }

        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let handle = if model.is_two_stage() {
            ResourceHandle::TwoStage {
                base: id,
                refiner: id + 1,
            }
        } else {
            ResourceHandle::Simple(id)
        };
        self.constructed
            .lock()
            .unwrap()
            .push((model, handle.clone()));
        Ok(handle)
    }

    async fn destruct(
        &self,
        model: ModelName,
        handle: ResourceHandle<u64>,
    ) -> Result<(), BackendError> {
        if self.rendering.load(Ordering::SeqCst) > 0 {
            self.busy_destructs.fetch_add(1, Ordering::SeqCst);
        }
        self.destructed.lock().unwrap().push((model, handle));
        if self.script().fail_destruct.contains(&model) {
            return Err(BackendError::Message(format!("{model} device reset failed")));
        }
        Ok(())
    }

    async fn render(
        &self,
        model: ModelName,
        _handle: &ResourceHandle<u64>,
        params: &RenderParams,
    ) -> Result<Vec<Image>, BackendError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        self.rendering.fetch_add(1, Ordering::SeqCst);
        self.render_started.notify_one();

        let (delay, fail) = {
            let script = self.script();
            (script.render_delay, script.fail_render.contains(&model))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.rendering.fetch_sub(1, Ordering::SeqCst);

        if fail {
            return Err(BackendError::Message("sampler produced NaNs".into()));
        }
        Ok((0..params.num_images)
            .map(|i| Image::new(format!("{model}#{i}").into_bytes()))
            .collect())
    }
}
