// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fmt;

use async_trait::async_trait;
use protocol::{ModelName, Stage};
use thiserror::Error;

pub mod process;
pub mod worker;

pub use process::{ProcessError, ProcessManager, WorkerHandle};
pub use worker::{WorkerBackend, WorkerOptions};

/// Owned reference to a loaded model's device-resident state.
///
/// `S` is the backend's opaque per-stage handle. Two-stage models hold a
/// base and a refiner which are always constructed and destroyed together;
/// callers treat the whole value as one indivisible unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceHandle<S> {
    Simple(S),
    TwoStage { base: S, refiner: S },
}

impl<S> ResourceHandle<S> {
    pub fn is_two_stage(&self) -> bool {
        matches!(self, ResourceHandle::TwoStage { .. })
    }

    /// Borrow every sub-resource along with its role.
    pub fn stages(&self) -> Vec<(Stage, &S)> {
        match self {
            ResourceHandle::Simple(s) => vec![(Stage::Single, s)],
            ResourceHandle::TwoStage { base, refiner } => {
                vec![(Stage::Base, base), (Stage::Refiner, refiner)]
            }
        }
    }

    /// Consume the handle, yielding every sub-resource for teardown.
    pub fn into_stages(self) -> Vec<(Stage, S)> {
        match self {
            ResourceHandle::Simple(s) => vec![(Stage::Single, s)],
            ResourceHandle::TwoStage { base, refiner } => {
                vec![(Stage::Base, base), (Stage::Refiner, refiner)]
            }
        }
    }
}

/// Raw encoded image as produced by a model.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    pub bytes: Vec<u8>,
}

impl Image {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Render parameters after normalisation, ready to hand to a model.
///
/// Optional fields are only set for models that understand them.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub num_images: u32,
    pub max_sequence_length: Option<u32>,
    pub denoising_end: Option<f32>,
    pub denoising_start: Option<f32>,
}

/// Errors surfaced by model backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no configuration found for model {0}")]
    NotConfigured(ModelName),

    #[error("model {model} is misconfigured: {reason}")]
    Misconfigured { model: ModelName, reason: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{model} {stage} worker at {endpoint} did not become ready: {reason}")]
    NotReady {
        model: ModelName,
        stage: Stage,
        endpoint: String,
        reason: String,
    },

    #[error("worker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("worker returned HTTP {status}: {body}")]
    Worker { status: u16, body: String },

    #[error("malformed worker payload: {0}")]
    Decode(String),

    #[error("teardown of {model} incomplete: {}", .failures.join("; "))]
    Teardown {
        model: ModelName,
        failures: Vec<String>,
    },

    #[error("{0}")]
    Message(String),
}

/// The collaborator that actually builds, destroys and runs models.
///
/// Every method is long-running. Implementations must not leave a partially
/// constructed handle behind when `construct` fails or is cancelled, and
/// `destruct` should release device memory before returning `Ok`.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    /// Opaque per-stage handle type.
    type Stage: Clone + fmt::Debug + Send + Sync + 'static;

    async fn construct(
        &self,
        model: ModelName,
    ) -> Result<ResourceHandle<Self::Stage>, BackendError>;

    async fn destruct(
        &self,
        model: ModelName,
        handle: ResourceHandle<Self::Stage>,
    ) -> Result<(), BackendError>;

    async fn render(
        &self,
        model: ModelName,
        handle: &ResourceHandle<Self::Stage>,
        params: &RenderParams,
    ) -> Result<Vec<Image>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_stage_handle_yields_both_stages_in_order() {
        let handle = ResourceHandle::TwoStage {
            base: 1u32,
            refiner: 2u32,
        };
        assert!(handle.is_two_stage());
        assert_eq!(
            handle.stages(),
            vec![(Stage::Base, &1), (Stage::Refiner, &2)]
        );
        assert_eq!(
            handle.into_stages(),
            vec![(Stage::Base, 1), (Stage::Refiner, 2)]
        );
    }

    #[test]
    fn teardown_error_lists_every_failure() {
        let err = BackendError::Teardown {
            model: ModelName::StableXl,
            failures: vec!["base: gone".into(), "refiner: stuck".into()],
        };
        assert_eq!(
            err.to_string(),
            "teardown of stable-xl incomplete: base: gone; refiner: stuck"
        );
    }
}
