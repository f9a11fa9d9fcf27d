// SPDX-License-Identifier: PolyForm-Shield-1.0

//! wire messages exchanged with model worker processes.
//!
//! a worker answers `GET /health` once its weights are resident and
//! `POST /render` with a [`WorkerRenderRequest`] body. binary payloads
//! (images and latents) travel as standard base64 strings.

use serde::{Deserialize, Serialize};

/// what the worker should hand back from a render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// encoded png images.
    Image,
    /// raw latents, fed to a refiner stage.
    Latent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRenderRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub num_images: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sequence_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoising_end: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoising_start: Option<f32>,
    pub output_type: OutputType,
    /// base64 latent produced by a base stage; refiner calls only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRenderResponse {
    /// base64 payloads, one per produced image or latent.
    pub images: Vec<String>,
}
