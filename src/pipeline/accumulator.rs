// Configuration accumulator
//
// Holds the application's stream requests (keyed by stream kind + index,
// last write wins) and an optional device serial selector. Stream selection
// and device selection are independent: clearing one never touches the other.
// The pipeline only lets this change while it is Idle.

use std::collections::BTreeMap;

use crate::types::{StreamKey, StreamKind, StreamRequest};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationAccumulator {
    requests: BTreeMap<StreamKey, StreamRequest>,
    device_serial: Option<String>,
}

impl ConfigurationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a request; returns the request it replaced
    pub fn enable_stream(&mut self, request: StreamRequest) -> Option<StreamRequest> {
        self.requests.insert(request.key(), request)
    }

    pub fn enable_device(&mut self, serial: impl Into<String>) {
        self.device_serial = Some(serial.into());
    }

    /// Remove the request with this exact key
    pub fn disable_stream(&mut self, key: StreamKey) -> bool {
        self.requests.remove(&key).is_some()
    }

    /// Remove every request of a kind, whatever its index
    pub fn disable_stream_kind(&mut self, kind: StreamKind) -> usize {
        let before = self.requests.len();
        self.requests.retain(|key, _| key.kind != kind);
        before - self.requests.len()
    }

    /// Clear all stream requests. The device selector is kept.
    pub fn disable_all(&mut self) {
        self.requests.clear();
    }

    /// Clear requests and the device selector
    pub fn clear(&mut self) {
        self.requests.clear();
        self.device_serial = None;
    }

    /// Requests in key order
    pub fn requests(&self) -> impl Iterator<Item = &StreamRequest> {
        self.requests.values()
    }

    pub fn request(&self, key: StreamKey) -> Option<&StreamRequest> {
        self.requests.get(&key)
    }

    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn device_serial(&self) -> Option<&str> {
        self.device_serial.as_deref()
    }
}
