// Simulated device backend
//
// Zero-hardware implementation of DeviceBackend used by tests and the demo
// binary. It keeps a device catalog (built in code or loaded from JSON), an
// ownership registry that reports DeviceBusy like an exclusively opened
// sensor, and per-stream delivery:
// - manual injection (`inject_sample`) for deterministic timing in tests
// - optional free-running generator threads paced by each stream's frame rate

use anyhow::Context;
use colored::*;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::backend::{DeviceBackend, OwnershipToken, SampleCallback};
use crate::error::{PipelineError, Result};
use crate::types::{DeviceInfo, Frame, StreamFormat, StreamKey, StreamKind, StreamProfile};

type StreamSlot = (String, StreamKey);

/// Who currently owns a simulated stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Token(Uuid),
    /// Held by "another application"
    External,
}

struct RegisteredStream {
    profile: StreamProfile,
    callback: SampleCallback,
    payload: Arc<[u8]>,
    next_frame_number: u64,
}

/// Free-running sample generator for one stream
struct StreamGenerator {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamGenerator {
    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("Simulated stream generator panicked");
        }
    }
}

#[derive(Default)]
struct SimulatedState {
    owners: HashMap<StreamSlot, Owner>,
    streams: HashMap<StreamSlot, RegisteredStream>,
    generators: HashMap<StreamSlot, StreamGenerator>,
}

/// JSON device catalog: `{ "devices": [ { "serial": ..., "name": ..., "profiles": [...] } ] }`
#[derive(Debug, Deserialize)]
struct DeviceCatalog {
    devices: Vec<DeviceInfo>,
}

/// In-process device backend with no hardware behind it
pub struct SimulatedBackend {
    devices: Vec<DeviceInfo>,
    free_running: bool,
    epoch: Instant,
    state: Mutex<SimulatedState>,
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("devices", &self.devices.len())
            .field("free_running", &self.free_running)
            .finish()
    }
}

impl SimulatedBackend {
    /// Create a backend exposing the given devices, in this enumeration order
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            free_running: false,
            epoch: Instant::now(),
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Spawn a generator thread for every registered stream
    pub fn with_free_running(mut self, enabled: bool) -> Self {
        self.free_running = enabled;
        self
    }

    /// Load a device catalog from JSON text
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let catalog: DeviceCatalog =
            serde_json::from_str(json).context("Failed to parse device catalog")?;
        for device in &catalog.devices {
            validate_device(device)?;
        }
        Ok(Self::new(catalog.devices))
    }

    /// Load a device catalog from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device catalog {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("Invalid device catalog {}", path.display()))
    }

    /// A depth camera with depth/color/infrared streams and a color-only webcam
    pub fn default_catalog() -> Vec<DeviceInfo> {
        #[allow(clippy::too_many_arguments)]
        fn video(
            uid: u32,
            kind: StreamKind,
            index: u32,
            width: u32,
            height: u32,
            format: StreamFormat,
            fps: u32,
            is_default: bool,
        ) -> StreamProfile {
            StreamProfile {
                uid,
                kind,
                index,
                width,
                height,
                format,
                fps,
                is_default,
            }
        }

        vec![
            DeviceInfo {
                serial: "841612070098".to_string(),
                name: "Simulated Depth Camera".to_string(),
                profiles: vec![
                    video(1, StreamKind::Depth, 0, 640, 480, StreamFormat::Z16, 30, true),
                    video(2, StreamKind::Depth, 0, 1280, 720, StreamFormat::Z16, 30, false),
                    video(3, StreamKind::Depth, 0, 640, 480, StreamFormat::Z16, 90, false),
                    video(4, StreamKind::Color, 0, 640, 480, StreamFormat::Rgb8, 30, false),
                    video(5, StreamKind::Color, 0, 1280, 720, StreamFormat::Rgb8, 30, true),
                    video(6, StreamKind::Color, 0, 1920, 1080, StreamFormat::Rgb8, 30, false),
                    video(7, StreamKind::Color, 0, 1280, 720, StreamFormat::Bgr8, 30, false),
                    video(8, StreamKind::Infrared, 1, 640, 480, StreamFormat::Y8, 30, true),
                    video(9, StreamKind::Infrared, 2, 640, 480, StreamFormat::Y8, 30, true),
                ],
            },
            DeviceInfo {
                serial: "WEBCAM-0001".to_string(),
                name: "Simulated Webcam".to_string(),
                profiles: vec![
                    video(1, StreamKind::Color, 0, 640, 480, StreamFormat::Yuyv, 30, true),
                    video(2, StreamKind::Color, 0, 1280, 720, StreamFormat::Yuyv, 15, false),
                ],
            },
        ]
    }

    /// Mark a stream as owned by another application
    pub fn claim_externally(&self, serial: &str, stream: StreamKey) -> bool {
        let mut state = self.lock_state();
        let slot = (serial.to_string(), stream);
        if state.owners.contains_key(&slot) {
            return false;
        }
        state.owners.insert(slot, Owner::External);
        info!(
            "{} Stream {} on '{}' claimed by another client",
            "SIM_EXTERNAL".on_yellow().white(),
            stream,
            serial
        );
        true
    }

    /// Drop an ownership taken through [`claim_externally`](Self::claim_externally)
    pub fn release_external(&self, serial: &str, stream: StreamKey) -> bool {
        let mut state = self.lock_state();
        let slot = (serial.to_string(), stream);
        if state.owners.get(&slot) == Some(&Owner::External) {
            state.owners.remove(&slot);
            true
        } else {
            false
        }
    }

    /// True when any owner (pipeline or external) holds the stream
    pub fn is_owned(&self, serial: &str, stream: StreamKey) -> bool {
        self.lock_state()
            .owners
            .contains_key(&(serial.to_string(), stream))
    }

    /// Number of streams currently delivering to a registered callback
    pub fn registered_stream_count(&self) -> usize {
        self.lock_state().streams.len()
    }

    /// Deliver one sample with the stream's default payload.
    /// Returns false when nobody is registered for the stream.
    pub fn inject_sample(&self, serial: &str, stream: StreamKey, timestamp_ms: f64) -> bool {
        self.deliver(serial, stream, timestamp_ms, None)
    }

    /// Deliver one sample carrying `data`
    pub fn inject_sample_with_data(
        &self,
        serial: &str,
        stream: StreamKey,
        timestamp_ms: f64,
        data: Arc<[u8]>,
    ) -> bool {
        self.deliver(serial, stream, timestamp_ms, Some(data))
    }

    /// Milliseconds since this backend was created, the clock of generated samples
    pub fn clock_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    fn deliver(&self, serial: &str, stream: StreamKey, timestamp_ms: f64, data: Option<Arc<[u8]>>) -> bool {
        let (callback, frame) = {
            let mut state = self.lock_state();
            let Some(registered) = state.streams.get_mut(&(serial.to_string(), stream)) else {
                return false;
            };
            registered.next_frame_number += 1;
            let frame = Frame::new(
                registered.profile.clone(),
                registered.next_frame_number,
                timestamp_ms,
                data.unwrap_or_else(|| registered.payload.clone()),
            );
            (registered.callback.clone(), frame)
        };

        // The callback feeds the pipeline queue; never hold our lock across it
        callback(frame);
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_device(&self, serial: &str) -> anyhow::Result<&DeviceInfo> {
        self.devices
            .iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| anyhow::anyhow!("Device '{}' is not connected", serial))
    }

    fn spawn_generator(
        &self,
        serial: &str,
        profile: &StreamProfile,
        callback: SampleCallback,
        payload: Arc<[u8]>,
    ) -> anyhow::Result<StreamGenerator> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let epoch = self.epoch;
        let profile = profile.clone();
        let period_ms = profile.frame_interval_ms();
        let period = Duration::from_secs_f64(period_ms / 1000.0);

        let handle = std::thread::Builder::new()
            .name(format!("sim-{}-{}", serial, profile.key()))
            .spawn(move || {
                let mut frame_number = 0u64;
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            frame_number += 1;
                            // Timestamps snap to the frame grid so streams of the same
                            // rate share capture times, like a hardware-synced sensor
                            let elapsed_ms = epoch.elapsed().as_secs_f64() * 1000.0;
                            let timestamp_ms = (elapsed_ms / period_ms).floor() * period_ms;
                            callback(Frame::new(
                                profile.clone(),
                                frame_number,
                                timestamp_ms,
                                payload.clone(),
                            ));
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .context("Failed to spawn simulated stream generator")?;

        Ok(StreamGenerator { stop_tx, handle })
    }
}

impl DeviceBackend for SimulatedBackend {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        crate::pipeline_debug!("Enumerating {} simulated devices", self.devices.len());
        Ok(self.devices.clone())
    }

    fn acquire_stream(&self, device: &DeviceInfo, profile: &StreamProfile) -> Result<OwnershipToken> {
        let known = self.find_device(&device.serial)?;
        if known.find_profile(profile.uid).is_none() {
            return Err(anyhow::anyhow!(
                "Device '{}' has no profile with uid {}",
                device.serial,
                profile.uid
            )
            .into());
        }

        let mut state = self.lock_state();
        let slot = (device.serial.clone(), profile.key());
        if state.owners.contains_key(&slot) {
            warn!(
                "{} Stream {} on '{}' already owned",
                "SIM_BUSY".on_yellow().white(),
                profile.key(),
                device.serial
            );
            return Err(PipelineError::DeviceBusy {
                serial: device.serial.clone(),
                stream: profile.key(),
            });
        }

        let token = OwnershipToken::new(device.serial.clone(), profile.key());
        state.owners.insert(slot, Owner::Token(token.id()));
        Ok(token)
    }

    fn release(&self, token: OwnershipToken) -> Result<()> {
        let slot = (token.device_serial().to_string(), token.stream());
        let generator = {
            let mut state = self.lock_state();
            match state.owners.get(&slot) {
                Some(Owner::Token(id)) if *id == token.id() => {}
                _ => {
                    return Err(anyhow::anyhow!("Ownership token {} is not active", token).into());
                }
            }
            state.owners.remove(&slot);
            state.streams.remove(&slot);
            state.generators.remove(&slot)
        };

        // Joining outside the lock: the generator may be inside the callback
        if let Some(generator) = generator {
            generator.stop();
        }
        crate::pipeline_debug!("Released simulated stream {}", token);
        Ok(())
    }

    fn register_sample_callback(
        &self,
        device: &DeviceInfo,
        profile: &StreamProfile,
        callback: SampleCallback,
    ) -> Result<()> {
        let slot = (device.serial.clone(), profile.key());
        let payload: Arc<[u8]> = Arc::from(vec![0u8; profile.frame_size_bytes()]);

        let generator = if self.free_running {
            Some(self.spawn_generator(&device.serial, profile, callback.clone(), payload.clone())?)
        } else {
            None
        };

        let mut state = self.lock_state();
        if !matches!(state.owners.get(&slot), Some(Owner::Token(_))) {
            drop(state);
            if let Some(generator) = generator {
                generator.stop();
            }
            return Err(anyhow::anyhow!(
                "Stream {} on '{}' must be acquired before registering a callback",
                profile.key(),
                device.serial
            )
            .into());
        }

        state.streams.insert(
            slot.clone(),
            RegisteredStream {
                profile: profile.clone(),
                callback,
                payload,
                next_frame_number: 0,
            },
        );
        if let Some(generator) = generator {
            state.generators.insert(slot, generator);
        }
        Ok(())
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        let generators: Vec<StreamGenerator> = self
            .lock_state()
            .generators
            .drain()
            .map(|(_, generator)| generator)
            .collect();
        for generator in generators {
            generator.stop();
        }
    }
}

fn validate_device(device: &DeviceInfo) -> anyhow::Result<()> {
    crate::config::validate_serial(&device.serial)
        .with_context(|| format!("Device '{}' has an invalid serial", device.name))?;

    if device.profiles.is_empty() {
        return Err(anyhow::anyhow!("Device '{}' exposes no stream profiles", device.serial));
    }

    for profile in &device.profiles {
        if profile.width == 0 || profile.height == 0 || profile.fps == 0 || profile.format == StreamFormat::Any {
            return Err(anyhow::anyhow!(
                "Device '{}' profile {} is not fully specified",
                device.serial,
                profile
            ));
        }
        let duplicates = device.profiles.iter().filter(|p| p.uid == profile.uid).count();
        if duplicates > 1 {
            return Err(anyhow::anyhow!(
                "Device '{}' reuses profile uid {}",
                device.serial,
                profile.uid
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(SimulatedBackend::default_catalog())
    }

    #[test]
    fn test_default_catalog_is_valid() {
        for device in SimulatedBackend::default_catalog() {
            assert!(validate_device(&device).is_ok(), "{} should validate", device.serial);
        }
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let backend = backend();
        let devices = backend.enumerate_devices().unwrap();
        let device = &devices[0];
        let depth = device.profiles[0].clone();

        let token = backend.acquire_stream(device, &depth).unwrap();
        let second = backend.acquire_stream(device, &depth);
        assert!(matches!(second, Err(PipelineError::DeviceBusy { .. })));

        backend.release(token).unwrap();
        assert!(!backend.is_owned(&device.serial, depth.key()));
        assert!(backend.acquire_stream(device, &depth).is_ok());
    }

    #[test]
    fn test_external_claim_blocks_acquire() {
        let backend = backend();
        let devices = backend.enumerate_devices().unwrap();
        let device = &devices[0];
        let color = device.profiles[4].clone();

        assert!(backend.claim_externally(&device.serial, color.key()));
        assert!(matches!(
            backend.acquire_stream(device, &color),
            Err(PipelineError::DeviceBusy { .. })
        ));
        assert!(backend.release_external(&device.serial, color.key()));
        assert!(backend.acquire_stream(device, &color).is_ok());
    }

    #[test]
    fn test_register_requires_ownership() {
        let backend = backend();
        let devices = backend.enumerate_devices().unwrap();
        let device = &devices[0];
        let callback: SampleCallback = Arc::new(|_frame: Frame| {});

        assert!(backend
            .register_sample_callback(device, &device.profiles[0], callback)
            .is_err());
    }

    #[test]
    fn test_injection_reaches_callback_until_release() {
        let backend = backend();
        let devices = backend.enumerate_devices().unwrap();
        let device = &devices[0];
        let depth = device.profiles[0].clone();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();

        let token = backend.acquire_stream(device, &depth).unwrap();
        backend
            .register_sample_callback(
                device,
                &depth,
                Arc::new(move |frame: Frame| {
                    assert_eq!(frame.profile.uid, 1);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(backend.inject_sample(&device.serial, depth.key(), 0.0));
        assert!(backend.inject_sample(&device.serial, depth.key(), 33.3));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);

        backend.release(token).unwrap();
        assert!(!backend.inject_sample(&device.serial, depth.key(), 66.6));
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_free_running_generator_stops_on_release() {
        let backend = backend().with_free_running(true);
        let devices = backend.enumerate_devices().unwrap();
        let device = &devices[0];
        let depth = device.profiles[2].clone(); // 90 fps
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();

        let token = backend.acquire_stream(device, &depth).unwrap();
        backend
            .register_sample_callback(
                device,
                &depth,
                Arc::new(move |_frame: Frame| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        backend.release(token).unwrap();
        let after_release = delivered.load(Ordering::SeqCst);
        assert!(after_release > 0, "generator should have produced samples");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(delivered.load(Ordering::SeqCst), after_release);
    }

    #[test]
    fn test_catalog_json_validation() {
        let json = r#"{
            "devices": [{
                "serial": "CAM-1",
                "name": "Bench camera",
                "profiles": [
                    { "uid": 1, "kind": "depth", "index": 0, "width": 640, "height": 480,
                      "format": "z16", "fps": 30, "is_default": true }
                ]
            }]
        }"#;
        let backend = SimulatedBackend::from_json_str(json).unwrap();
        assert_eq!(backend.enumerate_devices().unwrap().len(), 1);

        let unspecified = json.replace("\"fps\": 30", "\"fps\": 0");
        assert!(SimulatedBackend::from_json_str(&unspecified).is_err());
    }
}
