// Synchronized delivery queue
//
// Bridges the device delivery context (producer) and the application
// (consumer). Different streams deliver on independent cadences, so samples
// are held per stream until every active stream has one within the
// synchronization tolerance of the newest arrival:
// 1. Keep the most recent unconsumed sample per active stream
// 2. On arrival, check that every other stream's sample is within tolerance
// 3. If so, bundle one sample per stream into a Frameset and clear the slots
// 4. Publish into a single retained slot; an unconsumed Frameset is dropped
//
// Publishing and retrieval happen under one mutex; waiters sleep on a condvar
// that is signalled both on publish and on close.

use colored::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::types::{Frame, Frameset, StreamKey, StreamProfile};

/// Delivery counters for the current and past streaming sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub samples_received: u64,
    /// Samples replaced by a newer sample of the same stream before bundling
    pub samples_superseded: u64,
    /// Samples for unknown streams, a closed queue or a previous session
    pub samples_ignored: u64,
    pub framesets_published: u64,
    /// Framesets overwritten in the retained slot before anyone retrieved them
    pub framesets_dropped: u64,
    pub framesets_consumed: u64,
}

struct StreamSlot {
    key: StreamKey,
    latest: Option<Frame>,
}

struct QueueState {
    open: bool,
    /// Bumped on every open/close so stale producers and waiters notice
    generation: u64,
    tolerance_ms: f64,
    slots: Vec<StreamSlot>,
    retained: Option<Frameset>,
    stats: DeliveryStats,
}

pub struct SynchronizedDeliveryQueue {
    state: Mutex<QueueState>,
    frameset_ready: Condvar,
}

impl std::fmt::Debug for SynchronizedDeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("SynchronizedDeliveryQueue")
            .field("open", &state.open)
            .field("generation", &state.generation)
            .field("streams", &state.slots.len())
            .field("retained", &state.retained.is_some())
            .finish()
    }
}

impl Default for SynchronizedDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SynchronizedDeliveryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                open: false,
                generation: 0,
                tolerance_ms: 0.0,
                slots: Vec::new(),
                retained: None,
                stats: DeliveryStats::default(),
            }),
            frameset_ready: Condvar::new(),
        }
    }

    /// Start accepting samples for `profiles`. Returns the session generation
    /// producers must present with every sample.
    pub fn open(&self, profiles: &[StreamProfile], tolerance_ms: f64) -> u64 {
        let generation = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.open = true;
            state.tolerance_ms = tolerance_ms;
            state.slots = profiles
                .iter()
                .map(|p| StreamSlot {
                    key: p.key(),
                    latest: None,
                })
                .collect();
            state.retained = None;
            state.generation
        };

        info!(
            "{}: Delivery queue open for {} streams (tolerance {:.2}ms, session {})",
            "SYNC_QUEUE".on_yellow().green(),
            profiles.len(),
            tolerance_ms,
            generation
        );
        generation
    }

    /// Stop accepting samples, discard anything buffered and wake every waiter
    pub fn close(&self) {
        let discarded = {
            let mut state = self.lock_state();
            if !state.open {
                return;
            }
            state.open = false;
            state.generation += 1;
            let buffered = state.slots.iter().filter(|s| s.latest.is_some()).count();
            state.slots.clear();
            buffered + usize::from(state.retained.take().is_some())
        };
        self.frameset_ready.notify_all();

        info!(
            "{}: Delivery queue closed ({} buffered items discarded)",
            "SYNC_QUEUE".on_yellow().green(),
            discarded
        );
    }

    pub fn is_open(&self) -> bool {
        self.lock_state().open
    }

    pub fn stats(&self) -> DeliveryStats {
        self.lock_state().stats
    }

    /// Feed one sample from the device delivery context.
    ///
    /// Returns the published frameset when this sample completed one.
    pub fn push_sample(&self, generation: u64, frame: Frame) -> Option<Frameset> {
        let published = {
            let mut state = self.lock_state();
            state.stats.samples_received += 1;

            if !state.open || state.generation != generation {
                state.stats.samples_ignored += 1;
                return None;
            }

            let key = frame.key();
            let Some(position) = state.slots.iter().position(|slot| slot.key == key) else {
                state.stats.samples_ignored += 1;
                log_ignored_stream(key);
                return None;
            };

            let timestamp_ms = frame.timestamp_ms;
            if state.slots[position].latest.replace(frame).is_some() {
                state.stats.samples_superseded += 1;
            }

            let tolerance_ms = state.tolerance_ms;
            let aligned = state.slots.iter().all(|slot| {
                slot.latest
                    .as_ref()
                    .is_some_and(|f| (f.timestamp_ms - timestamp_ms).abs() <= tolerance_ms)
            });
            if !aligned {
                return None;
            }

            let frames: Vec<Frame> = state
                .slots
                .iter_mut()
                .filter_map(|slot| slot.latest.take())
                .collect();
            let frameset = Frameset::new(frames);

            state.stats.framesets_published += 1;
            if state.retained.replace(frameset.clone()).is_some() {
                state.stats.framesets_dropped += 1;
                log_dropped_frameset(state.stats.framesets_dropped);
            }
            frameset
        };

        self.frameset_ready.notify_all();
        crate::pipeline_debug!(
            "Published frameset of {} frames at {:.2}ms",
            published.len(),
            published.timestamp_ms()
        );
        Some(published)
    }

    /// Block until a frameset is retained, the timeout elapses or the queue closes.
    /// A timeout too large to represent as a deadline waits without one.
    pub fn wait_for_frameset(&self, timeout: Duration) -> Result<Frameset> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock_state();
        let generation = state.generation;

        loop {
            if !state.open || state.generation != generation {
                return Err(PipelineError::PipelineStopped);
            }

            if let Some(frameset) = state.retained.take() {
                state.stats.framesets_consumed += 1;
                return Ok(frameset);
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PipelineError::Timeout {
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    self.frameset_ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .frameset_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Take the retained frameset if there is one, without blocking
    pub fn poll_for_frameset(&self) -> Result<Option<Frameset>> {
        let mut state = self.lock_state();
        if !state.open {
            return Err(PipelineError::PipelineStopped);
        }

        let frameset = state.retained.take();
        if frameset.is_some() {
            state.stats.framesets_consumed += 1;
        }
        Ok(frameset)
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_ignored_stream(key: StreamKey) {
    static IGNORED_LOG_COUNT: AtomicU64 = AtomicU64::new(0);
    let count = IGNORED_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count % 1000 == 0 {
        warn!(
            "{}: Ignoring sample for inactive stream {} (#{})",
            "SYNC_QUEUE".on_yellow().green(),
            key,
            count + 1
        );
    }
}

fn log_dropped_frameset(total_dropped: u64) {
    static DROP_LOG_COUNT: AtomicU64 = AtomicU64::new(0);
    let count = DROP_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < 5 || count % 500 == 0 {
        info!(
            "{}: Consumer behind, unconsumed frameset dropped ({} total)",
            "SYNC_QUEUE".on_yellow().green(),
            total_dropped
        );
    }
}
