//! Per-session pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Counters touched from the dispatch loop and the fault supervisor
///
/// Each counter sits on its own cache line; the hot ones are bumped once per
/// frame. Every update is mirrored to the `metrics` facade.
#[derive(Default)]
pub(crate) struct PipelineStats {
    frames_received: CachePadded<AtomicU64>,
    frames_delivered: CachePadded<AtomicU64>,
    frames_dropped: CachePadded<AtomicU64>,
    incomplete_buffers: CachePadded<AtomicU64>,
    out_of_order: CachePadded<AtomicU64>,
    faults: CachePadded<AtomicU64>,
    reconnects: CachePadded<AtomicU64>,
}

impl PipelineStats {
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cynlr_camera_frames_received").increment(1);
    }

    pub fn frame_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cynlr_camera_frames_delivered").increment(1);
    }

    pub fn frames_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("cynlr_camera_frames_dropped").increment(count);
    }

    pub fn incomplete_buffer(&self) {
        self.incomplete_buffers.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cynlr_camera_incomplete_buffers").increment(1);
    }

    pub fn out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cynlr_camera_out_of_order").increment(1);
    }

    pub fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cynlr_camera_faults").increment(1);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cynlr_camera_reconnects").increment(1);
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            incomplete_buffers: self.incomplete_buffers.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a session's counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Buffers the transport handed to the dispatcher
    pub frames_received: u64,
    /// Frames published to consumers
    pub frames_delivered: u64,
    /// Sequence numbers that never arrived
    pub frames_dropped: u64,
    pub incomplete_buffers: u64,
    pub out_of_order: u64,
    pub faults: u64,
    pub reconnects: u64,
}

impl SessionStats {
    /// Share of expected frames that were lost
    pub fn drop_rate(&self) -> f64 {
        let expected = self.frames_delivered + self.frames_dropped;
        if expected == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / expected as f64
        }
    }
}
