// Devices module - Device capability interface and backends
//
// - backend: DeviceBackend / ComputationModule traits and ownership tokens
// - simulated: zero-hardware backend with manual and free-running sample delivery

pub mod backend;
pub mod simulated;

pub use backend::{ComputationModule, DeviceBackend, OwnershipToken, SampleCallback};
pub use simulated::SimulatedBackend;
