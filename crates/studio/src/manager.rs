// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Single-slot lifecycle manager.
//!
//! At most one model is meant to be resident at a time. A request for a
//! model other than the active one evicts the active model before loading
//! the requested one, so peak device memory is bounded by the largest model
//! rather than the sum. Loads of the same model are mutually exclusive: the
//! first caller builds the handle, concurrent callers are turned away with
//! [`GenerateError::Busy`] (or wait, under [`BusyPolicy::Wait`]).
//!
//! No lock is ever held across a construct, destruct or render call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use model_runtime::{Image, ModelBackend, ResourceHandle};
use protocol::{GenerateParams, LifecycleEvent, ModelName, ModelState, StatusReport};
use tracing::{debug, error, info, warn};

use crate::drain::FlightTracker;
use crate::error::{GenerateError, UnloadError};
use crate::events::EventBus;
use crate::invoker::Invoker;
use crate::registry::Registry;

/// What a request does when another request is already loading its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Return `Busy` straight away.
    FailFast,
    /// Re-check every `poll_interval` until the model is resident or
    /// `timeout` passes.
    Wait {
        timeout: Duration,
        poll_interval: Duration,
    },
}

/// How concurrent requests for different models are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPolicy {
    /// Exclusion is per model only. Two different cold models requested at
    /// once may both load; the later install wins the slot and the other
    /// stays resident until it is next requested or unloaded.
    PerModel,
    /// All switches go through one lock, so only one model is ever resident.
    ///
    /// A request that finds another switch holding the lock is subject to
    /// the [`BusyPolicy`]: `FailFast` answers `Busy` at once, `Wait` queues
    /// for at most its timeout. Requests for the already active model skip
    /// the lock.
    Serialized,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub load_timeout: Duration,
    pub render_timeout: Duration,
    /// How long teardown waits for renders still holding the handle.
    pub drain_timeout: Duration,
    pub teardown_timeout: Duration,
    pub busy_policy: BusyPolicy,
    pub switch_policy: SwitchPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(900),
            render_timeout: Duration::from_secs(600),
            drain_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(120),
            busy_policy: BusyPolicy::FailFast,
            switch_policy: SwitchPolicy::PerModel,
        }
    }
}

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Names the active model without owning its handle.
#[derive(Default)]
struct ActiveSlot {
    current: Mutex<Option<ModelName>>,
}

impl ActiveSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ModelName>> {
        self.current.lock().unwrap_or_else(|poisoned| {
            warn!("studio::manager: active slot lock poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn get(&self) -> Option<ModelName> {
        *self.lock()
    }

    fn set(&self, model: ModelName) -> Option<ModelName> {
        self.lock().replace(model)
    }

    /// Clear the slot only if it still names `model`.
    fn clear_if(&self, model: ModelName) -> bool {
        let mut current = self.lock();
        if *current == Some(model) {
            *current = None;
            true
        } else {
            false
        }
    }

    fn take(&self) -> Option<ModelName> {
        self.lock().take()
    }
}

/// Moves the registry entry back to `Absent` unless the load completed.
///
/// Covers load failures, timeouts and callers that stop polling mid-load.
struct LoadGuard<'a, S: Clone> {
    registry: &'a Registry<S>,
    model: ModelName,
    armed: bool,
}

impl<'a, S: Clone> LoadGuard<'a, S> {
    fn new(registry: &'a Registry<S>, model: ModelName) -> Self {
        Self {
            registry,
            model,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: Clone> Drop for LoadGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.registry.fail_load(self.model) {
            warn!("studio::manager: releasing load claim: {e}");
        }
    }
}

pub struct LifecycleManager<B: ModelBackend> {
    backend: Arc<B>,
    registry: Registry<B::Stage>,
    active: ActiveSlot,
    flights: Arc<FlightTracker>,
    invoker: Invoker<B>,
    events: EventBus,
    settings: LifecycleSettings,
    switch_lock: tokio::sync::Mutex<()>,
    /// Set by `shutdown`; no load may start or install afterwards.
    closed: AtomicBool,
    started: Instant,
}

impl<B: ModelBackend> LifecycleManager<B> {
    pub fn new(backend: Arc<B>, settings: LifecycleSettings, events: EventBus) -> Self {
        Self {
            invoker: Invoker::new(backend.clone(), settings.render_timeout),
            backend,
            registry: Registry::new(),
            active: ActiveSlot::default(),
            flights: Arc::new(FlightTracker::new()),
            events,
            settings,
            switch_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn active(&self) -> Option<ModelName> {
        self.active.get()
    }

    pub fn model_state(&self, model: ModelName) -> ModelState {
        self.registry.status(model)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            models: self.registry.snapshot(),
            active: self.active.get(),
            resident: self.registry.resident(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Make `model` active and render with it.
    pub async fn generate(
        &self,
        model: &str,
        params: &GenerateParams,
    ) -> Result<Vec<Image>, GenerateError> {
        let model: ModelName = model.parse()?;
        self.ensure_active(model).await?;
        self.serve(model, params).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_active_and_resident(&self, model: ModelName) -> bool {
        self.active.get() == Some(model) && self.registry.status(model) == ModelState::Resident
    }

    /// Make `model` the active, resident model, evicting whatever was active.
    pub async fn ensure_active(&self, model: ModelName) -> Result<(), GenerateError> {
        if self.is_closed() {
            return Err(GenerateError::ShuttingDown(model));
        }
        if self.is_active_and_resident(model) {
            debug!("studio::manager: {model} already active");
            return Ok(());
        }

        let _switch = self.switch_guard(model).await?;
        if self.is_closed() {
            return Err(GenerateError::ShuttingDown(model));
        }

        let current = self.active.get();
        if current == Some(model) && self.registry.status(model) == ModelState::Resident {
            debug!("studio::manager: {model} became active while queued");
            return Ok(());
        }

        if let Some(current) = current.filter(|c| *c != model) {
            self.evict(current).await;
        }

        self.acquire(model).await
    }

    /// Explicitly tear down `model`. Unlike eviction, teardown failures are
    /// reported to the caller.
    pub async fn unload(&self, model: &str) -> Result<(), UnloadError> {
        let model: ModelName = model.parse()?;
        let _switch = match self.settings.switch_policy {
            SwitchPolicy::Serialized => Some(self.switch_lock.lock().await),
            SwitchPolicy::PerModel => None,
        };

        if self.active.clear_if(model) {
            self.events.publish(LifecycleEvent::ActiveChanged {
                from: Some(model),
                to: None,
            });
        }

        let handle = self
            .registry
            .remove(model)
            .ok_or(UnloadError::NotResident(model))?;

        info!("studio::manager: unloading {model}");
        match self.release(model, handle).await {
            Ok(()) => {
                self.events.publish(LifecycleEvent::Evicted { model });
                info!("studio::manager: {model} unloaded");
                Ok(())
            }
            Err(reason) => {
                error!("studio::manager: teardown of {model} failed: {reason}");
                self.events.publish(LifecycleEvent::TeardownFailed {
                    model,
                    error: reason.clone(),
                });
                Err(UnloadError::TeardownFailed { model, reason })
            }
        }
    }

    /// Hold the switch lock under [`SwitchPolicy::Serialized`], honouring
    /// the busy policy while another switch owns it.
    async fn switch_guard(
        &self,
        model: ModelName,
    ) -> Result<Option<tokio::sync::MutexGuard<'_, ()>>, GenerateError> {
        if self.settings.switch_policy == SwitchPolicy::PerModel {
            return Ok(None);
        }

        let guard = match self.settings.busy_policy {
            BusyPolicy::FailFast => self.switch_lock.try_lock().ok(),
            BusyPolicy::Wait { timeout, .. } => {
                tokio::time::timeout(timeout, self.switch_lock.lock())
                    .await
                    .ok()
            }
        };

        match guard {
            Some(guard) => Ok(Some(guard)),
            None => {
                info!("studio::manager: another switch is in progress; turning {model} away");
                self.events.publish(LifecycleEvent::Busy { model });
                Err(GenerateError::Busy(model))
            }
        }
    }

    /// Tear down every model and refuse new loads. Used when the host is
    /// stopping.
    ///
    /// Loads already under way are allowed to finish (bounded by the load
    /// timeout) and are then torn down with everything else.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _switch = self.switch_lock.lock().await;

        let deadline = tokio::time::Instant::now() + self.settings.load_timeout;
        loop {
            let loading: Vec<ModelName> = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|(_, state)| *state == ModelState::Loading)
                .map(|(model, _)| model)
                .collect();
            if loading.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("studio::manager: shutting down with loads still in flight: {loading:?}");
                break;
            }
            debug!("studio::manager: waiting for in-flight loads: {loading:?}");
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        if let Some(previous) = self.active.take() {
            self.events.publish(LifecycleEvent::ActiveChanged {
                from: Some(previous),
                to: None,
            });
        }

        for model in self.registry.resident() {
            let Some(handle) = self.registry.remove(model) else {
                continue;
            };
            info!("studio::manager: shutting down {model}");
            match self.release(model, handle).await {
                Ok(()) => self.events.publish(LifecycleEvent::Evicted { model }),
                Err(reason) => {
                    warn!("studio::manager: teardown of {model} during shutdown failed: {reason}");
                    self.events.publish(LifecycleEvent::TeardownFailed {
                        model,
                        error: reason,
                    });
                }
            }
        }
    }

    async fn evict(&self, current: ModelName) {
        // Someone else already moved the slot on; their eviction is theirs.
        if !self.active.clear_if(current) {
            debug!("studio::manager: slot no longer names {current}; skipping eviction");
            return;
        }
        self.events.publish(LifecycleEvent::ActiveChanged {
            from: Some(current),
            to: None,
        });

        let Some(handle) = self.registry.remove(current) else {
            return;
        };

        info!("studio::manager: evicting {current}");
        match self.release(current, handle).await {
            Ok(()) => {
                self.events.publish(LifecycleEvent::Evicted { model: current });
                info!("studio::manager: {current} evicted");
            }
            Err(reason) => {
                warn!(
                    "studio::manager: teardown of {current} failed, continuing with switch: {reason}"
                );
                self.events.publish(LifecycleEvent::TeardownFailed {
                    model: current,
                    error: reason,
                });
            }
        }
    }

    /// Drain and destruct a handle that has already left the registry.
    ///
    /// The work runs on its own task: once the handle is out of the registry
    /// nothing else owns it, so the caller going away must not stop the
    /// teardown.
    async fn release(
        &self,
        model: ModelName,
        handle: ResourceHandle<B::Stage>,
    ) -> Result<(), String> {
        let backend = self.backend.clone();
        let flights = self.flights.clone();
        let drain_timeout = self.settings.drain_timeout;
        let teardown_timeout = self.settings.teardown_timeout;

        let teardown = tokio::spawn(async move {
            if let Err(e) = flights.drain(model, drain_timeout).await {
                warn!("studio::manager: {e}; tearing down regardless");
            }

            match tokio::time::timeout(teardown_timeout, backend.destruct(model, handle)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {teardown_timeout:?}")),
            }
        });

        teardown
            .await
            .map_err(|e| format!("teardown task for {model} failed: {e}"))?
    }

    async fn acquire(&self, model: ModelName) -> Result<(), GenerateError> {
        let deadline = match self.settings.busy_policy {
            BusyPolicy::Wait { timeout, .. } => Some(tokio::time::Instant::now() + timeout),
            BusyPolicy::FailFast => None,
        };

        loop {
            if self.is_closed() {
                return Err(GenerateError::ShuttingDown(model));
            }
            if self.registry.begin_load(model) {
                return self.load(model).await;
            }

            if self.registry.status(model) == ModelState::Resident {
                self.adopt(model);
                return Ok(());
            }

            match (self.settings.busy_policy, deadline) {
                (BusyPolicy::Wait { poll_interval, .. }, Some(deadline))
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(poll_interval).await;
                }
                _ => {
                    info!("studio::manager: {model} is loading elsewhere; turning request away");
                    self.events.publish(LifecycleEvent::Busy { model });
                    return Err(GenerateError::Busy(model));
                }
            }
        }
    }

    async fn load(&self, model: ModelName) -> Result<(), GenerateError> {
        let mut guard = LoadGuard::new(&self.registry, model);
        self.events.publish(LifecycleEvent::LoadStarted { model });
        info!("studio::manager: loading {model}");
        let started = Instant::now();

        let built = match tokio::time::timeout(
            self.settings.load_timeout,
            self.backend.construct(model),
        )
        .await
        {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.settings.load_timeout)),
        };

        let handle = match built {
            Ok(handle) => handle,
            Err(reason) => {
                drop(guard);
                error!("studio::manager: loading {model} failed: {reason}");
                self.events.publish(LifecycleEvent::LoadFailed {
                    model,
                    error: reason.clone(),
                });
                return Err(GenerateError::LoadFailed { model, reason });
            }
        };

        // Checked before install: shutdown waits for every `Loading` entry
        // to settle, so a handle installed here is still swept by it.
        if self.is_closed() {
            drop(guard);
            info!("studio::manager: shutting down; discarding freshly loaded {model}");
            if let Err(e) = self.release(model, handle).await {
                warn!("studio::manager: discarding {model} handle: {e}");
            }
            return Err(GenerateError::ShuttingDown(model));
        }

        if let Err(rejected) = self.registry.install(model, handle) {
            // Only the guard releases a claim, so this means the registry
            // was reset under us. Do not leak the fresh handle.
            let reason = rejected.to_string();
            error!("studio::manager: {reason}");
            if let Err(e) = self.release(model, rejected.handle).await {
                warn!("studio::manager: discarding orphaned {model} handle: {e}");
            }
            return Err(GenerateError::LoadFailed { model, reason });
        }
        guard.disarm();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!("studio::manager: {model} resident after {elapsed_ms} ms");
        self.events
            .publish(LifecycleEvent::Loaded { model, elapsed_ms });
        self.adopt(model);
        Ok(())
    }

    fn adopt(&self, model: ModelName) {
        let previous = self.active.set(model);
        if previous != Some(model) {
            self.events.publish(LifecycleEvent::ActiveChanged {
                from: previous,
                to: Some(model),
            });
        }
    }

    async fn serve(
        &self,
        model: ModelName,
        params: &GenerateParams,
    ) -> Result<Vec<Image>, GenerateError> {
        // Counted before the lease so a concurrent eviction either sees this
        // render in its drain or makes the lease fail.
        let _flight = self.flights.track(model);
        let Some(handle) = self.registry.lease(model) else {
            info!("studio::manager: {model} was evicted before it could be leased");
            self.events.publish(LifecycleEvent::Busy { model });
            return Err(GenerateError::Busy(model));
        };

        self.invoker
            .render(model, &handle, params)
            .await
            .inspect_err(|e| {
                warn!("studio::manager: {e}");
                self.events.publish(LifecycleEvent::RenderFailed {
                    model,
                    error: e.to_string(),
                });
            })
    }
}
