//! Pipeline counters
//!
//! Lossy paths (overflow, per-utterance failures, ignored events) are silent
//! to chat users, so they are counted here for operators.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide readout counters
#[derive(Debug, Default)]
pub struct ReadoutMetrics {
    events_received: AtomicU64,
    events_ignored: AtomicU64,
    utterances_enqueued: AtomicU64,
    utterances_displaced: AtomicU64,
    utterances_rejected: AtomicU64,
    synthesis_failures: AtomicU64,
    synthesis_timeouts: AtomicU64,
    decode_failures: AtomicU64,
    frames_sent: AtomicU64,
    utterances_completed: AtomicU64,
    utterances_interrupted: AtomicU64,
    sessions_joined: AtomicU64,
    sessions_left: AtomicU64,
    connect_failures: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_ignored: u64,
    pub utterances_enqueued: u64,
    pub utterances_displaced: u64,
    pub utterances_rejected: u64,
    pub synthesis_failures: u64,
    pub synthesis_timeouts: u64,
    pub decode_failures: u64,
    pub frames_sent: u64,
    pub utterances_completed: u64,
    pub utterances_interrupted: u64,
    pub sessions_joined: u64,
    pub sessions_left: u64,
    pub connect_failures: u64,
}

impl MetricsSnapshot {
    /// Admissions lost to a full queue, whichever policy dropped them
    pub fn queue_full_total(&self) -> u64 {
        self.utterances_displaced + self.utterances_rejected
    }
}

impl ReadoutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self) {
        self.utterances_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_displaced(&self) {
        self.utterances_displaced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.utterances_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_synthesis_failure(&self) {
        self.synthesis_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_synthesis_timeout(&self) {
        self.synthesis_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.utterances_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_interrupted(&self) {
        self.utterances_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_joined(&self) {
        self.sessions_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_left(&self) {
        self.sessions_left.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            utterances_enqueued: self.utterances_enqueued.load(Ordering::Relaxed),
            utterances_displaced: self.utterances_displaced.load(Ordering::Relaxed),
            utterances_rejected: self.utterances_rejected.load(Ordering::Relaxed),
            synthesis_failures: self.synthesis_failures.load(Ordering::Relaxed),
            synthesis_timeouts: self.synthesis_timeouts.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            utterances_completed: self.utterances_completed.load(Ordering::Relaxed),
            utterances_interrupted: self.utterances_interrupted.load(Ordering::Relaxed),
            sessions_joined: self.sessions_joined.load(Ordering::Relaxed),
            sessions_left: self.sessions_left.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}
