// Core stream, device and frame types shared by the pipeline
//
// This module contains the data model the pipeline negotiates with:
// - StreamRequest: a possibly-partial application request (0 / Any = don't care)
// - StreamProfile: a fully concrete native stream shape exposed by a device
// - DeviceInfo: read-only view of a device and its native profile catalog
// - Frame / Frameset: samples delivered by the device and their synchronized bundles

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Semantic kind of a device stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Depth,
    Color,
    Infrared,
    Fisheye,
    Gyro,
    Accel,
    Pose,
    Confidence,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Depth => "depth",
            StreamKind::Color => "color",
            StreamKind::Infrared => "infrared",
            StreamKind::Fisheye => "fisheye",
            StreamKind::Gyro => "gyro",
            StreamKind::Accel => "accel",
            StreamKind::Pose => "pose",
            StreamKind::Confidence => "confidence",
        };
        f.write_str(name)
    }
}

/// Pixel format for image streams, data type for motion streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// Don't care
    #[default]
    Any,
    Z16,
    Disparity32,
    Y8,
    Y16,
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Yuyv,
    Uyvy,
    Raw10,
    MotionXyz32f,
    SixDof,
}

impl StreamFormat {
    /// Bytes used by a single pixel (or a single motion sample for motion formats)
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            StreamFormat::Any => 0,
            StreamFormat::Y8 | StreamFormat::Raw10 => 1,
            StreamFormat::Z16 | StreamFormat::Y16 | StreamFormat::Yuyv | StreamFormat::Uyvy => 2,
            StreamFormat::Rgb8 | StreamFormat::Bgr8 => 3,
            StreamFormat::Rgba8 | StreamFormat::Bgra8 | StreamFormat::Disparity32 => 4,
            StreamFormat::MotionXyz32f => 12,
            StreamFormat::SixDof => 64,
        }
    }
}

/// Identity of a stream within a device: (kind, index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub kind: StreamKind,
    pub index: u32,
}

impl StreamKey {
    pub fn new(kind: StreamKind, index: u32) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.index)
    }
}

/// Application stream request. Numeric fields set to 0 and `StreamFormat::Any`
/// mean "don't care"; an index of 0 matches any index of the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRequest {
    pub kind: StreamKind,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub format: StreamFormat,
    #[serde(default)]
    pub fps: u32,
}

impl StreamRequest {
    /// Request a stream kind with every other field left as "don't care"
    pub fn any(kind: StreamKind) -> Self {
        Self {
            kind,
            index: 0,
            width: 0,
            height: 0,
            format: StreamFormat::Any,
            fps: 0,
        }
    }

    /// Request a video stream of an explicit shape
    pub fn video(kind: StreamKind, width: u32, height: u32, format: StreamFormat, fps: u32) -> Self {
        Self {
            kind,
            index: 0,
            width,
            height,
            format,
            fps,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.kind, self.index)
    }

    /// True when the index is left to the device
    pub fn has_wildcard_index(&self) -> bool {
        self.index == 0
    }

    /// Check every specified (non "don't care") field against a native profile
    pub fn matches(&self, profile: &StreamProfile) -> bool {
        self.kind == profile.kind
            && (self.index == 0 || self.index == profile.index)
            && (self.width == 0 || self.width == profile.width)
            && (self.height == 0 || self.height == profile.height)
            && (self.format == StreamFormat::Any || self.format == profile.format)
            && (self.fps == 0 || self.fps == profile.fps)
    }
}

impl fmt::Display for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field(value: u32) -> String {
            if value == 0 {
                "*".to_string()
            } else {
                value.to_string()
            }
        }
        write!(
            f,
            "{}[{}] {}x{} {:?} @{}fps",
            self.kind,
            field(self.index),
            field(self.width),
            field(self.height),
            self.format,
            field(self.fps)
        )
    }
}

/// Fully concrete stream shape as exposed by a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamProfile {
    /// Unique identifier of the native stream profile within its device
    pub uid: u32,
    pub kind: StreamKind,
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub format: StreamFormat,
    pub fps: u32,
    /// Device-preferred profile for this stream
    #[serde(default)]
    pub is_default: bool,
}

impl StreamProfile {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.kind, self.index)
    }

    /// Nominal time between two frames of this stream
    pub fn frame_interval_ms(&self) -> f64 {
        1000.0 / self.fps.max(1) as f64
    }

    pub fn frame_size_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} {:?} @{}fps (uid {})",
            self.key(),
            self.width,
            self.height,
            self.format,
            self.fps,
            self.uid
        )
    }
}

/// Read-only description of a device and its native stream catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub name: String,
    /// Native profiles in device enumeration order
    pub profiles: Vec<StreamProfile>,
}

impl DeviceInfo {
    /// True when at least one native profile satisfies the request
    pub fn supports(&self, request: &StreamRequest) -> bool {
        self.profiles.iter().any(|profile| request.matches(profile))
    }

    /// Preferred profile for each native stream key, in enumeration order
    pub fn default_profiles(&self) -> Vec<StreamProfile> {
        let mut keys: Vec<StreamKey> = Vec::new();
        for profile in &self.profiles {
            if !keys.contains(&profile.key()) {
                keys.push(profile.key());
            }
        }

        keys.into_iter()
            .filter_map(|key| {
                let candidates: Vec<&StreamProfile> =
                    self.profiles.iter().filter(|p| p.key() == key).collect();
                preferred_profile(&candidates).cloned()
            })
            .collect()
    }

    pub fn find_profile(&self, uid: u32) -> Option<&StreamProfile> {
        self.profiles.iter().find(|p| p.uid == uid)
    }
}

/// Device-preferred candidate: the first default-flagged profile, else the first one
pub(crate) fn preferred_profile<'a>(candidates: &[&'a StreamProfile]) -> Option<&'a StreamProfile> {
    candidates
        .iter()
        .find(|p| p.is_default)
        .or_else(|| candidates.first())
        .copied()
}

/// Shape constraint contributed by an attached computation module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleRequirement {
    pub module: String,
    pub request: StreamRequest,
}

impl ModuleRequirement {
    pub fn new(module: impl Into<String>, request: StreamRequest) -> Self {
        Self {
            module: module.into(),
            request,
        }
    }
}

/// A single sample delivered by a device stream
#[derive(Debug, Clone)]
pub struct Frame {
    pub profile: StreamProfile,
    pub frame_number: u64,
    /// Device capture timestamp in milliseconds
    pub timestamp_ms: f64,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn new(profile: StreamProfile, frame_number: u64, timestamp_ms: f64, data: Arc<[u8]>) -> Self {
        Self {
            profile,
            frame_number,
            timestamp_ms,
            data,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.profile.key()
    }
}

/// Time-aligned bundle of one frame per active stream
#[derive(Debug, Clone)]
pub struct Frameset {
    frames: Vec<Frame>,
}

impl Frameset {
    pub(crate) fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    /// Latest capture timestamp among the bundled frames
    pub fn timestamp_ms(&self) -> f64 {
        self.frames
            .iter()
            .map(|f| f.timestamp_ms)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// First frame of the given kind
    pub fn first_of(&self, kind: StreamKind) -> Option<&Frame> {
        self.frames.iter().find(|f| f.profile.kind == kind)
    }

    pub fn get(&self, key: StreamKey) -> Option<&Frame> {
        self.frames.iter().find(|f| f.key() == key)
    }

    pub fn depth_frame(&self) -> Option<&Frame> {
        self.first_of(StreamKind::Depth)
    }

    pub fn color_frame(&self) -> Option<&Frame> {
        self.first_of(StreamKind::Color)
    }
}

impl IntoIterator for Frameset {
    type Item = Frame;
    type IntoIter = std::vec::IntoIter<Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl<'a> IntoIterator for &'a Frameset {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(uid: u32, kind: StreamKind, index: u32, w: u32, h: u32, fps: u32, is_default: bool) -> StreamProfile {
        StreamProfile {
            uid,
            kind,
            index,
            width: w,
            height: h,
            format: StreamFormat::Z16,
            fps,
            is_default,
        }
    }

    #[test]
    fn test_request_matching_respects_dont_care() {
        let p = profile(1, StreamKind::Depth, 0, 640, 480, 30, true);

        assert!(StreamRequest::any(StreamKind::Depth).matches(&p));
        assert!(StreamRequest::video(StreamKind::Depth, 640, 0, StreamFormat::Any, 30).matches(&p));
        assert!(!StreamRequest::video(StreamKind::Depth, 1280, 720, StreamFormat::Any, 0).matches(&p));
        assert!(!StreamRequest::video(StreamKind::Depth, 0, 0, StreamFormat::Rgb8, 0).matches(&p));
        assert!(!StreamRequest::any(StreamKind::Color).matches(&p));
        assert!(!StreamRequest::any(StreamKind::Depth).with_index(2).matches(&p));
    }

    #[test]
    fn test_default_profiles_prefer_flagged_then_first() {
        let device = DeviceInfo {
            serial: "100".to_string(),
            name: "Test".to_string(),
            profiles: vec![
                profile(1, StreamKind::Depth, 0, 1280, 720, 30, false),
                profile(2, StreamKind::Depth, 0, 640, 480, 30, true),
                profile(3, StreamKind::Infrared, 1, 640, 480, 30, false),
                profile(4, StreamKind::Infrared, 1, 848, 480, 60, false),
            ],
        };

        let defaults = device.default_profiles();
        assert_eq!(defaults.len(), 2);
        assert_eq!(defaults[0].uid, 2);
        assert_eq!(defaults[1].uid, 3);
    }

    #[test]
    fn test_frameset_lookup() {
        let depth = profile(1, StreamKind::Depth, 0, 640, 480, 30, true);
        let mut color = profile(2, StreamKind::Color, 0, 1280, 720, 30, true);
        color.format = StreamFormat::Rgb8;
        let data: Arc<[u8]> = Arc::from(vec![0u8; 4]);

        let frameset = Frameset::new(vec![
            Frame::new(depth, 1, 10.0, data.clone()),
            Frame::new(color, 1, 12.5, data),
        ]);

        assert_eq!(frameset.len(), 2);
        assert_eq!(frameset.depth_frame().map(|f| f.profile.uid), Some(1));
        assert_eq!(frameset.color_frame().map(|f| f.profile.uid), Some(2));
        assert!(frameset.first_of(StreamKind::Gyro).is_none());
        assert!((frameset.timestamp_ms() - 12.5).abs() < f64::EPSILON);
    }
}
