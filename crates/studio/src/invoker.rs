// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Parameter normalisation and the timed render call.

use std::sync::Arc;
use std::time::Duration;

use model_runtime::{Image, ModelBackend, RenderParams, ResourceHandle};
use protocol::{GenerateParams, ModelName};
use tracing::debug;

use crate::error::GenerateError;

pub const MIN_DIMENSION: u32 = 256;
pub const MAX_DIMENSION: u32 = 2048;
pub const MAX_STEPS: u32 = 150;
pub const MAX_IMAGES: u32 = 4;
pub const MAX_GUIDANCE: f32 = 30.0;
pub const MAX_SEQUENCE_LENGTH: u32 = 512;

fn dimension(value: u32, stride: u32) -> u32 {
    let clamped = value.clamp(MIN_DIMENSION, MAX_DIMENSION);
    clamped - clamped % stride
}

// NaN and infinities fall back to the default rather than poisoning the
// schedule.
fn fraction(value: f32, lo: f32, hi: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        fallback
    }
}

/// Clamp caller parameters into ranges `model` accepts.
///
/// Pure: the same inputs always give the same output. Fields the model does
/// not understand are left as `None`.
pub fn normalize(model: ModelName, params: &GenerateParams) -> RenderParams {
    let defaults = GenerateParams::default();
    let stride = model.spatial_stride();

    let prompt = if params.prompt.trim().is_empty() {
        GenerateParams::DEFAULT_PROMPT.to_string()
    } else {
        params.prompt.clone()
    };

    let (denoising_end, denoising_start) = if model.is_two_stage() {
        (
            Some(fraction(params.denoising_end, 0.0, 1.0, defaults.denoising_end)),
            Some(fraction(
                params.denoising_start,
                0.0,
                1.0,
                defaults.denoising_start,
            )),
        )
    } else {
        (None, None)
    };

    RenderParams {
        prompt,
        width: dimension(params.width, stride),
        height: dimension(params.height, stride),
        num_inference_steps: params.num_inference_steps.clamp(1, MAX_STEPS),
        guidance_scale: fraction(
            params.guidance_scale,
            0.0,
            MAX_GUIDANCE,
            defaults.guidance_scale,
        ),
        num_images: params.num_images.clamp(1, MAX_IMAGES),
        max_sequence_length: model
            .uses_sequence_length()
            .then(|| params.max_sequence_length.clamp(1, MAX_SEQUENCE_LENGTH)),
        denoising_end,
        denoising_start,
    }
}

/// Runs one render against a leased handle under a deadline.
pub struct Invoker<B> {
    backend: Arc<B>,
    render_timeout: Duration,
}

impl<B: ModelBackend> Invoker<B> {
    pub fn new(backend: Arc<B>, render_timeout: Duration) -> Self {
        Self {
            backend,
            render_timeout,
        }
    }

    pub async fn render(
        &self,
        model: ModelName,
        handle: &ResourceHandle<B::Stage>,
        params: &GenerateParams,
    ) -> Result<Vec<Image>, GenerateError> {
        let params = normalize(model, params);
        debug!(
            "studio::invoker: rendering {} image(s) on {} at {}x{}, {} steps",
            params.num_images, model, params.width, params.height, params.num_inference_steps
        );

        match tokio::time::timeout(
            self.render_timeout,
            self.backend.render(model, handle, &params),
        )
        .await
        {
            Ok(Ok(images)) => Ok(images),
            Ok(Err(e)) => Err(GenerateError::RenderFailed {
                model,
                reason: e.to_string(),
            }),
            Err(_) => Err(GenerateError::RenderFailed {
                model,
                reason: format!("timed out after {:?}", self.render_timeout),
            }),
        }
    }
}
