// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Per-model residency state.
//!
//! Every known model has exactly one entry, created up front. An entry is
//! `Resident` if and only if it holds a handle, and `Loading` while exactly
//! one caller owns the obligation to build that handle. The lock is only
//! ever held to flip a state bit; loading and teardown happen outside it,
//! bracketed by `begin_load` / `install` / `fail_load` or by `remove`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use model_runtime::ResourceHandle;
use protocol::{ModelName, ModelState};
use thiserror::Error;
use tracing::warn;

struct Entry<S> {
    state: ModelState,
    handle: Option<ResourceHandle<S>>,
}

impl<S> Entry<S> {
    fn absent() -> Self {
        Self {
            state: ModelState::Absent,
            handle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{model} is {state:?}, expected it to be loading")]
    NotLoading { model: ModelName, state: ModelState },
}

/// Returned by [`Registry::install`] when the entry was not `Loading`.
///
/// The rejected handle is handed back so the caller can tear it down.
pub struct InstallError<S> {
    pub model: ModelName,
    pub state: ModelState,
    pub handle: ResourceHandle<S>,
}

impl<S> fmt::Debug for InstallError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallError")
            .field("model", &self.model)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for InstallError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot install {}: entry is {:?}, not loading",
            self.model, self.state
        )
    }
}

impl<S> std::error::Error for InstallError<S> {}

/// Mutex-guarded map from model to residency state and handle.
pub struct Registry<S> {
    entries: Mutex<BTreeMap<ModelName, Entry<S>>>,
}

impl<S: Clone> Registry<S> {
    pub fn new() -> Self {
        let entries = ModelName::ALL
            .iter()
            .map(|m| (*m, Entry::absent()))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<ModelName, Entry<S>>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("studio::registry: lock poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    pub fn status(&self, model: ModelName) -> ModelState {
        self.entries()
            .get(&model)
            .map_or(ModelState::Absent, |e| e.state)
    }

    /// Claim the right to load `model`.
    ///
    /// Returns `true` and moves the entry to `Loading` only if it was
    /// `Absent`. Any other state leaves the entry untouched.
    pub fn begin_load(&self, model: ModelName) -> bool {
        let mut entries = self.entries();
        let entry = entries.entry(model).or_insert_with(Entry::absent);
        if entry.state != ModelState::Absent {
            return false;
        }
        entry.state = ModelState::Loading;
        true
    }

    /// Store the handle built by the caller that won `begin_load`.
    pub fn install(
        &self,
        model: ModelName,
        handle: ResourceHandle<S>,
    ) -> Result<(), InstallError<S>> {
        let mut entries = self.entries();
        let entry = entries.entry(model).or_insert_with(Entry::absent);
        if entry.state != ModelState::Loading {
            return Err(InstallError {
                model,
                state: entry.state,
                handle,
            });
        }
        entry.state = ModelState::Resident;
        entry.handle = Some(handle);
        Ok(())
    }

    /// Release a `Loading` claim after the load failed.
    pub fn fail_load(&self, model: ModelName) -> Result<(), RegistryError> {
        let mut entries = self.entries();
        let entry = entries.entry(model).or_insert_with(Entry::absent);
        if entry.state != ModelState::Loading {
            return Err(RegistryError::NotLoading {
                model,
                state: entry.state,
            });
        }
        entry.state = ModelState::Absent;
        Ok(())
    }

    /// Take the handle of a resident model, leaving the entry `Absent`.
    ///
    /// Returns `None` when the model is absent or still loading; removal
    /// during a load is ignored.
    pub fn remove(&self, model: ModelName) -> Option<ResourceHandle<S>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(&model)?;
        if entry.state != ModelState::Resident {
            return None;
        }
        entry.state = ModelState::Absent;
        entry.handle.take()
    }

    /// Short-lived copy of a resident handle for one render call.
    pub fn lease(&self, model: ModelName) -> Option<ResourceHandle<S>> {
        self.entries().get(&model).and_then(|e| e.handle.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<ModelName, ModelState> {
        self.entries()
            .iter()
            .map(|(model, entry)| (*model, entry.state))
            .collect()
    }

    /// Models that currently hold a handle.
    pub fn resident(&self) -> Vec<ModelName> {
        self.entries()
            .iter()
            .filter(|(_, e)| e.state == ModelState::Resident)
            .map(|(model, _)| *model)
            .collect()
    }
}

impl<S: Clone> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn starts_with_every_model_absent() {
        let registry: Registry<u32> = Registry::new();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), ModelName::ALL.len());
        assert!(snapshot.values().all(|s| *s == ModelState::Absent));
        assert!(registry.resident().is_empty());
    }

    #[test]
    fn load_install_remove_cycle() {
        let registry = Registry::new();
        let model = ModelName::FluxDev;

        assert!(registry.begin_load(model));
        assert_eq!(registry.status(model), ModelState::Loading);
        assert!(registry.lease(model).is_none());

        registry.install(model, ResourceHandle::Simple(7u32)).unwrap();
        assert_eq!(registry.status(model), ModelState::Resident);
        assert_eq!(registry.lease(model), Some(ResourceHandle::Simple(7)));
        assert_eq!(registry.resident(), vec![model]);

        assert_eq!(registry.remove(model), Some(ResourceHandle::Simple(7)));
        assert_eq!(registry.status(model), ModelState::Absent);
        assert!(registry.remove(model).is_none());
    }

    #[test]
    fn begin_load_refuses_loading_and_resident_entries() {
        let registry = Registry::new();
        let model = ModelName::StableXl;

        assert!(registry.begin_load(model));
        assert!(!registry.begin_load(model));

        registry
            .install(
                model,
                ResourceHandle::TwoStage {
                    base: 1u32,
                    refiner: 2u32,
                },
            )
            .unwrap();
        assert!(!registry.begin_load(model));
        assert_eq!(registry.status(model), ModelState::Resident);
    }

    #[test]
    fn fail_load_releases_the_claim_for_retry() {
        let registry: Registry<u32> = Registry::new();
        let model = ModelName::StableLarge;

        assert!(registry.begin_load(model));
        registry.fail_load(model).unwrap();
        assert_eq!(registry.status(model), ModelState::Absent);
        assert!(registry.begin_load(model));
    }

    #[test]
    fn fail_load_without_claim_is_rejected() {
        let registry: Registry<u32> = Registry::new();
        let err = registry.fail_load(ModelName::FluxSchnell).unwrap_err();
        assert_eq!(
            err,
            RegistryError::NotLoading {
                model: ModelName::FluxSchnell,
                state: ModelState::Absent,
            }
        );
    }

    #[test]
    fn install_without_claim_hands_the_handle_back() {
        let registry = Registry::new();
        let err = registry
            .install(ModelName::StableTurbo, ResourceHandle::Simple(3u32))
            .unwrap_err();
        assert_eq!(err.state, ModelState::Absent);
        assert_eq!(err.handle, ResourceHandle::Simple(3));
        assert_eq!(registry.status(ModelName::StableTurbo), ModelState::Absent);
    }

    #[test]
    fn remove_ignores_in_flight_loads() {
        let registry: Registry<u32> = Registry::new();
        let model = ModelName::StableMedium;
        assert!(registry.begin_load(model));
        assert!(registry.remove(model).is_none());
        assert_eq!(registry.status(model), ModelState::Loading);
    }

    #[test]
    fn begin_load_has_a_single_winner_across_threads() {
        let registry: Arc<Registry<u32>> = Arc::new(Registry::new());
        let barrier = Arc::new(Barrier::new(8));

        let winners: usize = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.begin_load(ModelName::StableLarge)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }
}
