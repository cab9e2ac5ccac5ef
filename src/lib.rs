pub mod config;
pub mod devices;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod types;

// Re-export the application surface for binaries and integration tests
pub use config::{PipelineConfig, PipelineConfigFactory, DEFAULT_WAIT_TIMEOUT_MS};
pub use devices::{ComputationModule, DeviceBackend, OwnershipToken, SampleCallback, SimulatedBackend};
pub use error::{PipelineError, Result};
pub use pipeline::{ActiveConfiguration, DeliveryStats, Pipeline, PipelineState};
pub use types::{
    DeviceInfo, Frame, Frameset, ModuleRequirement, StreamFormat, StreamKey, StreamKind, StreamProfile,
    StreamRequest,
};
