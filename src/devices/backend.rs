// Device and computation-module capability interfaces
//
// The pipeline never talks to hardware directly. Live devices, recorded
// playback and the simulated backend all sit behind DeviceBackend, and
// attached computation modules behind ComputationModule.

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{DeviceInfo, Frame, Frameset, ModuleRequirement, StreamKey, StreamProfile};

/// Callback invoked on the device delivery context for every sample of a stream
pub type SampleCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Exclusive ownership of one stream on one device.
///
/// Tokens are not `Clone`: whoever holds the token owns the stream until it
/// hands the token back through [`DeviceBackend::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct OwnershipToken {
    id: Uuid,
    device_serial: String,
    stream: StreamKey,
}

impl OwnershipToken {
    pub fn new(device_serial: impl Into<String>, stream: StreamKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_serial: device_serial.into(),
            stream,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_serial(&self) -> &str {
        &self.device_serial
    }

    pub fn stream(&self) -> StreamKey {
        self.stream
    }
}

impl fmt::Display for OwnershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.device_serial, self.stream, self.id)
    }
}

/// Device/context collaborator the resolver and lifecycle controller depend on
#[cfg_attr(test, mockall::automock)]
pub trait DeviceBackend: Send + Sync {
    /// Connected devices in stable enumeration order
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Take exclusive ownership of a stream. Fails with `DeviceBusy` when
    /// another owner holds it.
    fn acquire_stream(&self, device: &DeviceInfo, profile: &StreamProfile) -> Result<OwnershipToken>;

    /// Give a stream back. Sample delivery for that stream stops.
    fn release(&self, token: OwnershipToken) -> Result<()>;

    /// Start delivering samples of an owned stream to `callback`
    fn register_sample_callback(
        &self,
        device: &DeviceInfo,
        profile: &StreamProfile,
        callback: SampleCallback,
    ) -> Result<()>;
}

/// Computation module attached to a pipeline (processing block)
#[cfg_attr(test, mockall::automock)]
pub trait ComputationModule: Send + Sync {
    fn name(&self) -> String;

    /// Stream shapes this module needs, queried at commit time
    fn required_profiles(&self) -> Vec<ModuleRequirement>;

    /// Called on the delivery context with every published frameset.
    /// May query the pipeline, but must not call `stop()` on it: stopping
    /// waits for the delivery context to finish.
    fn on_frameset(&self, _frameset: &Frameset) {}
}
