// Pipeline module - Stream pipeline controller
//
// Organized into specialized sub-modules:
// - accumulator: application stream requests and device selector
// - resolver: requests + module requirements -> concrete device and profiles
// - lifecycle: Idle/Configured/Streaming state machine and stream ownership
// - sync_queue: timestamp-matched frameset assembly with a single retained slot

pub mod accumulator;
pub mod lifecycle;
pub mod resolver;
pub mod sync_queue;

pub use accumulator::ConfigurationAccumulator;
pub use lifecycle::{LifecycleController, PipelineState, StartPlan};
pub use resolver::{resolve, ActiveConfiguration};
pub use sync_queue::{DeliveryStats, SynchronizedDeliveryQueue};

use colored::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

use crate::config::{validate_serial, validate_stream_request, PipelineConfig};
use crate::devices::{ComputationModule, DeviceBackend};
use crate::error::{PipelineError, Result};
use crate::types::{DeviceInfo, Frameset, StreamKey, StreamKind, StreamProfile, StreamRequest};

/// Configuration and lifecycle state, serialized by the pipeline's controller mutex
struct Controller {
    accumulator: ConfigurationAccumulator,
    modules: Vec<Arc<dyn ComputationModule>>,
    lifecycle: LifecycleController,
}

/// Application-facing pipeline.
///
/// All methods take `&self`; share it through an `Arc` so one thread can
/// `stop()` while another blocks in [`Pipeline::wait_for_frameset`].
pub struct Pipeline {
    backend: Arc<dyn DeviceBackend>,
    config: PipelineConfig,
    controller: Mutex<Controller>,
    queue: Arc<SynchronizedDeliveryQueue>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Pipeline {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self::with_config(backend, PipelineConfig::default())
    }

    pub fn with_config(backend: Arc<dyn DeviceBackend>, config: PipelineConfig) -> Self {
        Self {
            backend,
            config,
            controller: Mutex::new(Controller {
                accumulator: ConfigurationAccumulator::new(),
                modules: Vec::new(),
                lifecycle: LifecycleController::new(),
            }),
            queue: Arc::new(SynchronizedDeliveryQueue::new()),
        }
    }

    fn controller(&self) -> MutexGuard<'_, Controller> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.controller().lifecycle.state()
    }

    /// Counters of the synchronized delivery queue
    pub fn delivery_stats(&self) -> DeliveryStats {
        self.queue.stats()
    }

    // Configuration (Idle only)

    /// Request a stream; a request for the same kind and index replaces the previous one
    pub fn enable_stream(&self, request: StreamRequest) -> Result<()> {
        validate_stream_request(&request, &self.config)
            .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;

        let mut controller = self.controller();
        controller.lifecycle.ensure_idle("enable_stream")?;
        if let Some(previous) = controller.accumulator.enable_stream(request) {
            crate::pipeline_debug!("Request {} replaced {}", request, previous);
        }
        Ok(())
    }

    /// Restrict resolution to the device with this serial
    pub fn enable_device(&self, serial: &str) -> Result<()> {
        validate_serial(serial).map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;

        let mut controller = self.controller();
        controller.lifecycle.ensure_idle("enable_device")?;
        controller.accumulator.enable_device(serial);
        Ok(())
    }

    /// Drop the request for one stream. Returns whether one existed.
    pub fn disable_stream(&self, key: StreamKey) -> Result<bool> {
        let mut controller = self.controller();
        controller.lifecycle.ensure_idle("disable_stream")?;
        Ok(controller.accumulator.disable_stream(key))
    }

    /// Drop every request of a stream kind. Returns how many were removed.
    pub fn disable_stream_kind(&self, kind: StreamKind) -> Result<usize> {
        let mut controller = self.controller();
        controller.lifecycle.ensure_idle("disable_stream_kind")?;
        Ok(controller.accumulator.disable_stream_kind(kind))
    }

    /// Drop all stream requests. The device selector is kept.
    pub fn disable_all(&self) -> Result<()> {
        let mut controller = self.controller();
        controller.lifecycle.ensure_idle("disable_all")?;
        controller.accumulator.disable_all();
        Ok(())
    }

    pub fn attach_module(&self, module: Arc<dyn ComputationModule>) -> Result<()> {
        let mut controller = self.controller();
        controller.lifecycle.ensure_idle("attach_module")?;
        info!(
            "{}: Attached computation module '{}'",
            "PIPELINE_MODULE".on_blue().cyan(),
            module.name()
        );
        controller.modules.push(module);
        Ok(())
    }

    // Lifecycle

    /// Resolve the configuration without starting. Returns the selected device.
    pub fn commit(&self) -> Result<DeviceInfo> {
        let mut guard = self.controller();
        let controller = &mut *guard;
        let active = controller.lifecycle.commit(
            &controller.accumulator,
            &controller.modules,
            self.backend.as_ref(),
        )?;
        Ok(active.device().clone())
    }

    /// Start streaming, committing first when Idle
    pub fn start(&self) -> Result<()> {
        let mut guard = self.controller();
        let controller = &mut *guard;
        let ctx = lifecycle::TransitionContext {
            accumulator: &controller.accumulator,
            modules: &controller.modules,
            backend: self.backend.as_ref(),
            queue: &self.queue,
            config: &self.config,
        };
        controller.lifecycle.start(&ctx)
    }

    /// Stop streaming and release the device. The committed configuration is kept.
    pub fn stop(&self) {
        let tokens = self.controller().lifecycle.stop(&self.queue);
        // Released after the controller lock is dropped: releasing waits for
        // in-flight sample callbacks, which may call back into this pipeline
        lifecycle::release_ownership(self.backend.as_ref(), tokens);
    }

    /// Discard the committed configuration, requests, selector and modules
    pub fn reset(&self) -> Result<()> {
        let mut controller = self.controller();
        if controller.lifecycle.reset()? {
            controller.accumulator.clear();
            controller.modules.clear();
        }
        Ok(())
    }

    // Retrieval

    /// Block until a synchronized frameset is available.
    ///
    /// Fails with `Timeout` when nothing arrives in time and with
    /// `PipelineStopped` when the pipeline is not streaming or stops while waiting.
    pub fn wait_for_frameset(&self, timeout: Duration) -> Result<Frameset> {
        // The controller lock is not held here so stop() can interrupt the wait
        self.queue.wait_for_frameset(timeout)
    }

    /// [`Pipeline::wait_for_frameset`] with the configured default timeout
    pub fn wait_for_frameset_default(&self) -> Result<Frameset> {
        self.wait_for_frameset(Duration::from_millis(self.config.default_wait_timeout_ms))
    }

    /// Take the retained frameset if there is one, without blocking
    pub fn poll_for_frameset(&self) -> Result<Option<Frameset>> {
        self.queue.poll_for_frameset()
    }

    // Inspection

    pub fn get_active_device(&self) -> Result<DeviceInfo> {
        let controller = self.controller();
        controller
            .lifecycle
            .active()
            .map(|active| active.device().clone())
            .ok_or_else(|| {
                PipelineError::invalid_state("get_active_device", controller.lifecycle.state())
            })
    }

    pub fn get_active_streams(&self) -> Result<Vec<StreamProfile>> {
        let controller = self.controller();
        controller
            .lifecycle
            .active()
            .map(|active| active.profiles().to_vec())
            .ok_or_else(|| {
                PipelineError::invalid_state("get_active_streams", controller.lifecycle.state())
            })
    }

    /// The selected profile for one stream, `None` when it is not part of the configuration.
    /// Index 0 matches the first active stream of `kind`, whatever its index.
    pub fn get_active_stream(&self, kind: StreamKind, index: u32) -> Result<Option<StreamProfile>> {
        let key = StreamKey::new(kind, index);
        Ok(self
            .get_active_streams()?
            .into_iter()
            .find(|profile| profile.key() == key || (index == 0 && profile.kind == kind)))
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let controller = self
            .controller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if controller.lifecycle.state() == PipelineState::Streaming {
            info!(
                "{}: Pipeline dropped while streaming",
                "PIPELINE_STOP".on_yellow().white()
            );
            let tokens = controller.lifecycle.stop(&self.queue);
            lifecycle::release_ownership(self.backend.as_ref(), tokens);
        }
    }
}
