// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod worker;

/// identifier for one of the image models this host knows how to serve.
///
/// the set is fixed at compile time; request paths that do not parse into a
/// `ModelName` are rejected before any lifecycle state is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelName {
    FluxDev,
    FluxSchnell,
    StableMedium,
    StableLarge,
    StableTurbo,
    StableXl,
}

impl ModelName {
    /// every known model, in a stable order.
    pub const ALL: [ModelName; 6] = [
        ModelName::FluxDev,
        ModelName::FluxSchnell,
        ModelName::StableMedium,
        ModelName::StableLarge,
        ModelName::StableTurbo,
        ModelName::StableXl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::FluxDev => "flux-dev",
            ModelName::FluxSchnell => "flux-schnell",
            ModelName::StableMedium => "stable-medium",
            ModelName::StableLarge => "stable-large",
            ModelName::StableTurbo => "stable-turbo",
            ModelName::StableXl => "stable-xl",
        }
    }

    /// whether the model is a base + refiner pipeline whose stages must be
    /// loaded and torn down together.
    pub fn is_two_stage(&self) -> bool {
        matches!(self, ModelName::StableXl)
    }

    /// whether the model takes a text-encoder sequence length hint.
    pub fn uses_sequence_length(&self) -> bool {
        matches!(self, ModelName::FluxDev | ModelName::FluxSchnell)
    }

    /// pixel multiple that output dimensions must be rounded down to.
    ///
    /// flux and sd3 pack 2x2 latent patches over an 8x vae, sdxl only needs
    /// the vae factor.
    pub fn spatial_stride(&self) -> u32 {
        match self {
            ModelName::StableXl => 8,
            _ => 16,
        }
    }

    /// default weight repository for a stage of this model.
    pub fn repository(&self, stage: Stage) -> &'static str {
        match (self, stage) {
            (ModelName::FluxDev, _) => "black-forest-labs/FLUX.1-dev",
            (ModelName::FluxSchnell, _) => "black-forest-labs/FLUX.1-schnell",
            (ModelName::StableMedium, _) => "stabilityai/stable-diffusion-3.5-medium",
            (ModelName::StableLarge, _) => "stabilityai/stable-diffusion-3.5-large",
            (ModelName::StableTurbo, _) => "stabilityai/stable-diffusion-3.5-large-turbo",
            (ModelName::StableXl, Stage::Refiner) => "stabilityai/stable-diffusion-xl-refiner-1.0",
            (ModelName::StableXl, _) => "stabilityai/stable-diffusion-xl-base-1.0",
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// returned when a string does not name a known model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown model: {0}")]
pub struct ParseModelNameError(pub String);

impl FromStr for ModelName {
    type Err = ParseModelNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelName::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ParseModelNameError(s.to_string()))
    }
}

/// role of a sub-resource within a model's handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// the only stage of a single-pipeline model.
    Single,
    Base,
    Refiner,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Single => "single",
            Stage::Base => "base",
            Stage::Refiner => "refiner",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// residency state of a model as tracked by the lifecycle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Absent,
    Loading,
    Resident,
}

/// generation parameters as accepted from callers.
///
/// every field has a default so an empty JSON body is a valid request. the
/// values are not trusted; the invoker clamps them before they reach a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateParams {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub num_images: u32,
    /// text-encoder sequence length; flux models only.
    pub max_sequence_length: u32,
    /// fraction of the schedule run by the base stage of two-stage models.
    pub denoising_end: f32,
    /// fraction of the schedule at which the refiner takes over.
    pub denoising_start: f32,
}

impl GenerateParams {
    pub const DEFAULT_PROMPT: &'static str = "A beautiful landscape";
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            prompt: Self::DEFAULT_PROMPT.to_string(),
            width: 768,
            height: 768,
            num_inference_steps: 40,
            guidance_scale: 4.5,
            num_images: 1,
            max_sequence_length: 512,
            denoising_end: 0.8,
            denoising_start: 0.8,
        }
    }
}

/// point-in-time view of the lifecycle state for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub models: BTreeMap<ModelName, ModelState>,
    /// model currently occupying the active slot, if any.
    pub active: Option<ModelName>,
    /// models whose handles are currently installed.
    pub resident: Vec<ModelName>,
    pub uptime_secs: u64,
}

/// lifecycle transitions published for logs and observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    LoadStarted {
        model: ModelName,
    },
    Loaded {
        model: ModelName,
        elapsed_ms: u64,
    },
    LoadFailed {
        model: ModelName,
        error: String,
    },
    Evicted {
        model: ModelName,
    },
    /// teardown of a model failed; the manager carried on regardless.
    TeardownFailed {
        model: ModelName,
        error: String,
    },
    ActiveChanged {
        from: Option<ModelName>,
        to: Option<ModelName>,
    },
    RenderFailed {
        model: ModelName,
        error: String,
    },
    /// a request was turned away because a load for the model is in flight.
    Busy {
        model: ModelName,
    },
}

/// a single environment variable entry for worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// how to launch and reach one worker process.
///
/// each worker owns the device memory of exactly one model stage and
/// exposes the HTTP contract described in [`worker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// command used to spawn the worker.
    pub command: String,
    /// arguments passed to the worker.
    #[serde(default)]
    pub args: Vec<String>,
    /// additional environment variables for the worker.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// base url the worker listens on, e.g. `http://127.0.0.1:9101`.
    pub endpoint: String,
}

/// configuration for a model as understood by the worker backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// human-readable name for operators.
    #[serde(default)]
    pub display_name: Option<String>,
    /// worker for the model, or for the base stage of two-stage models.
    pub worker: WorkerConfig,
    /// refiner worker; required for two-stage models, ignored otherwise.
    #[serde(default)]
    pub refiner: Option<WorkerConfig>,
}
