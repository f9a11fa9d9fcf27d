// SPDX-License-Identifier: PolyForm-Shield-1.0

//! In-flight render tracking so a model is only torn down once the renders
//! that leased its handle have finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::ModelName;
use thiserror::Error;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("timed out waiting for {in_flight} in-flight render(s) on {model}")]
    Timeout { model: ModelName, in_flight: u32 },
}

/// Per-model in-flight counters.
#[derive(Default)]
pub struct FlightTracker {
    in_flight: Mutex<HashMap<ModelName, Arc<AtomicU32>>>,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, model: ModelName) -> Arc<AtomicU32> {
        let mut map = self.in_flight.lock().unwrap_or_else(|poisoned| {
            warn!("studio::drain: lock poisoned; continuing with inner state");
            poisoned.into_inner()
        });
        map.entry(model)
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone()
    }

    /// Count one render against `model` until the guard is dropped.
    pub fn track(&self, model: ModelName) -> FlightGuard {
        let counter = self.counter(model);
        counter.fetch_add(1, Ordering::SeqCst);
        FlightGuard { counter }
    }

    pub fn in_flight_count(&self, model: ModelName) -> u32 {
        self.counter(model).load(Ordering::SeqCst)
    }

    /// Wait until no render holds `model`, or give up after `timeout`.
    pub async fn drain(&self, model: ModelName, timeout: Duration) -> Result<(), DrainError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let counter = self.counter(model);

        loop {
            let in_flight = counter.load(Ordering::SeqCst);
            if in_flight == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DrainError::Timeout { model, in_flight });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Decrements the owning model's in-flight count on drop.
pub struct FlightGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
