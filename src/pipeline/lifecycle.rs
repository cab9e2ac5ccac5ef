// Lifecycle controller
//
// State machine: Idle -> Configured -> Streaming -> Configured (stop) -> Idle (reset)
//
// The controller exclusively owns the ActiveConfiguration and the ownership
// tokens of the streams it acquired. Every transition is all-or-nothing:
// a failed commit leaves Idle, a failed start leaves Configured with nothing
// acquired.

use colored::*;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::accumulator::ConfigurationAccumulator;
use super::resolver::{resolve, ActiveConfiguration};
use super::sync_queue::SynchronizedDeliveryQueue;
use crate::config::PipelineConfig;
use crate::devices::{ComputationModule, DeviceBackend, OwnershipToken, SampleCallback};
use crate::error::{PipelineError, Result};
use crate::types::{Frame, ModuleRequirement};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Configured,
    Streaming,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Configured => "configured",
            PipelineState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// What `start()` has to do from the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPlan {
    /// Idle: resolve a configuration first, then acquire
    CommitThenAcquire,
    /// Configured: acquire the committed configuration
    Acquire,
    /// Streaming: nothing to do
    AlreadyStreaming,
}

/// Everything a transition needs from the surrounding pipeline
pub struct TransitionContext<'a> {
    pub accumulator: &'a ConfigurationAccumulator,
    pub modules: &'a [Arc<dyn ComputationModule>],
    pub backend: &'a dyn DeviceBackend,
    pub queue: &'a Arc<SynchronizedDeliveryQueue>,
    pub config: &'a PipelineConfig,
}

#[derive(Debug)]
pub struct LifecycleController {
    state: PipelineState,
    active: Option<ActiveConfiguration>,
    ownership: Vec<OwnershipToken>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            active: None,
            ownership: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn active(&self) -> Option<&ActiveConfiguration> {
        self.active.as_ref()
    }

    pub fn owned_stream_count(&self) -> usize {
        self.ownership.len()
    }

    /// Guard for configuration changes, which are only valid while Idle
    pub fn ensure_idle(&self, operation: &'static str) -> Result<()> {
        if self.state == PipelineState::Idle {
            Ok(())
        } else {
            Err(PipelineError::invalid_state(operation, self.state))
        }
    }

    /// The guarded transition `start()` takes from the current state
    pub fn start_plan(&self) -> StartPlan {
        match self.state {
            PipelineState::Idle => StartPlan::CommitThenAcquire,
            PipelineState::Configured => StartPlan::Acquire,
            PipelineState::Streaming => StartPlan::AlreadyStreaming,
        }
    }

    /// Idle -> Configured. No-op when already Configured.
    pub fn commit(
        &mut self,
        accumulator: &ConfigurationAccumulator,
        modules: &[Arc<dyn ComputationModule>],
        backend: &dyn DeviceBackend,
    ) -> Result<&ActiveConfiguration> {
        match self.state {
            PipelineState::Idle => {}
            PipelineState::Configured => {
                return self
                    .active
                    .as_ref()
                    .ok_or_else(|| PipelineError::invalid_state("commit", self.state));
            }
            PipelineState::Streaming => {
                return Err(PipelineError::invalid_state("commit", self.state));
            }
        }

        let requirements: Vec<ModuleRequirement> = modules
            .iter()
            .flat_map(|module| module.required_profiles())
            .collect();
        let devices = backend.enumerate_devices()?;
        let active = resolve(accumulator, &requirements, &devices)?;

        info!(
            "{}: Committed {} streams on '{}' ({} module requirements)",
            "PIPELINE_COMMIT".on_blue().cyan(),
            active.profiles().len(),
            active.device().serial,
            requirements.len()
        );
        for profile in active.profiles() {
            info!("  {}", profile);
        }

        self.state = PipelineState::Configured;
        Ok(self.active.insert(active))
    }

    /// Start streaming, committing first when Idle. No-op when already Streaming.
    pub fn start(&mut self, ctx: &TransitionContext<'_>) -> Result<()> {
        match self.start_plan() {
            StartPlan::AlreadyStreaming => return Ok(()),
            StartPlan::CommitThenAcquire => {
                self.commit(ctx.accumulator, ctx.modules, ctx.backend)?;
            }
            StartPlan::Acquire => {}
        }

        let active = self
            .active
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_state("start", self.state))?;
        let device = active.device();

        let mut tokens = Vec::with_capacity(active.profiles().len());
        for profile in active.profiles() {
            match ctx.backend.acquire_stream(device, profile) {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    warn!(
                        "{}: Failed to acquire {} on '{}': {}",
                        "PIPELINE_START".on_red().white(),
                        profile.key(),
                        device.serial,
                        e
                    );
                    release_ownership(ctx.backend, tokens);
                    return Err(e);
                }
            }
        }

        let tolerance_ms = ctx.config.sync_tolerance_ms(active.slowest_fps());
        let generation = ctx.queue.open(active.profiles(), tolerance_ms);

        for profile in active.profiles() {
            let callback = sample_callback(ctx.queue.clone(), generation, ctx.modules.to_vec());
            if let Err(e) = ctx.backend.register_sample_callback(device, profile, callback) {
                error!(
                    "{}: Failed to register sample callback for {}: {}",
                    "PIPELINE_START".on_red().white(),
                    profile.key(),
                    e
                );
                ctx.queue.close();
                release_ownership(ctx.backend, tokens);
                return Err(e);
            }
        }

        info!(
            "{}: Streaming {} streams from '{}'",
            "PIPELINE_START".on_green().white(),
            tokens.len(),
            device.serial
        );
        self.ownership = tokens;
        self.state = PipelineState::Streaming;
        Ok(())
    }

    /// Streaming -> Configured. No-op otherwise. The committed configuration is kept.
    ///
    /// Returns the ownership tokens of the stopped session. The caller hands them
    /// to [`release_ownership`] once it no longer holds any lock that sample
    /// callbacks may need, since releasing joins the device delivery context.
    pub fn stop(&mut self, queue: &SynchronizedDeliveryQueue) -> Vec<OwnershipToken> {
        if self.state != PipelineState::Streaming {
            return Vec::new();
        }

        // Closing first wakes blocked waiters before device teardown
        queue.close();
        self.state = PipelineState::Configured;
        let tokens = std::mem::take(&mut self.ownership);

        info!(
            "{}: Stopped, releasing {} streams",
            "PIPELINE_STOP".on_yellow().white(),
            tokens.len()
        );
        tokens
    }

    /// Configured -> Idle, discarding the active configuration.
    /// Returns true when a reset actually happened (false from Idle).
    pub fn reset(&mut self) -> Result<bool> {
        match self.state {
            PipelineState::Streaming => Err(PipelineError::invalid_state("reset", self.state)),
            PipelineState::Idle => Ok(false),
            PipelineState::Configured => {
                self.active = None;
                self.state = PipelineState::Idle;
                info!("{}: Configuration discarded", "PIPELINE_RESET".on_blue().cyan());
                Ok(true)
            }
        }
    }
}

/// Hand ownership back to the backend, continuing past individual failures
pub fn release_ownership(backend: &dyn DeviceBackend, tokens: Vec<OwnershipToken>) {
    for token in tokens {
        let description = token.to_string();
        if let Err(e) = backend.release(token) {
            warn!("Failed to release stream {}: {}", description, e);
        }
    }
}

/// Device-side callback feeding the delivery queue and attached modules
fn sample_callback(
    queue: Arc<SynchronizedDeliveryQueue>,
    generation: u64,
    modules: Vec<Arc<dyn ComputationModule>>,
) -> SampleCallback {
    Arc::new(move |frame: Frame| {
        static SAMPLE_LOG_COUNT: AtomicU64 = AtomicU64::new(0);
        let count = SAMPLE_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
        if count % 1000 == 0 {
            crate::pipeline_debug!(
                "Sample #{} from {} at {:.2}ms",
                count,
                frame.key(),
                frame.timestamp_ms
            );
        }

        if let Some(frameset) = queue.push_sample(generation, frame) {
            for module in &modules {
                module.on_frameset(&frameset);
            }
        }
    })
}
